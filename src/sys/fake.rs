use std::cell::RefCell;
use std::io;

use libc::EFAULT;

use super::{SysResult, Syscall};

type SyscallFn = Box<dyn Fn(Syscall<'_>) -> SysResult>;

thread_local! {
    pub(crate) static TEST_SYSCALL: RefCell<SyscallFn> = RefCell::new(Box::new(unexpected_syscall));
}

fn unexpected_syscall(_call: Syscall<'_>) -> SysResult {
    Err((-1, io::Error::from_raw_os_error(EFAULT)))
}

pub(crate) fn override_syscall<F>(f: F)
where
    F: Fn(Syscall<'_>) -> SysResult + 'static,
{
    TEST_SYSCALL.with(|test_impl| *test_impl.borrow_mut() = Box::new(f));
}
