mod bpf;

#[cfg(test)]
mod fake;

use std::io;

use libc::c_long;

pub(crate) use bpf::*;
#[cfg(test)]
pub(crate) use fake::*;
pub use bpf::{NameError, PinError};

pub(crate) type SysResult = Result<c_long, (c_long, io::Error)>;

pub(crate) enum Syscall<'a> {
    ProgLoad {
        attr: &'a bpf_prog_load_attr,
    },
    MapCreate {
        attr: &'a bpf_map_create_attr,
    },
    MapElem {
        cmd: u32,
        attr: &'a bpf_map_elem_attr,
    },
    ProgTestRun {
        attr: &'a mut bpf_prog_test_run_attr,
    },
    ObjPin {
        attr: &'a bpf_obj_attr,
    },
}

fn syscall(call: Syscall<'_>) -> SysResult {
    #[cfg(not(test))]
    return unsafe { syscall_impl(call) };

    #[cfg(test)]
    return TEST_SYSCALL.with(|test_impl| test_impl.borrow()(call));
}

#[cfg(not(test))]
unsafe fn syscall_impl(call: Syscall<'_>) -> SysResult {
    use std::mem::size_of;

    use libc::SYS_bpf;

    use Syscall::*;
    let ret = match call {
        ProgLoad { attr } => libc::syscall(
            SYS_bpf,
            BPF_PROG_LOAD,
            attr as *const bpf_prog_load_attr,
            size_of::<bpf_prog_load_attr>(),
        ),
        MapCreate { attr } => libc::syscall(
            SYS_bpf,
            BPF_MAP_CREATE,
            attr as *const bpf_map_create_attr,
            size_of::<bpf_map_create_attr>(),
        ),
        MapElem { cmd, attr } => libc::syscall(
            SYS_bpf,
            cmd,
            attr as *const bpf_map_elem_attr,
            size_of::<bpf_map_elem_attr>(),
        ),
        ProgTestRun { attr } => libc::syscall(
            SYS_bpf,
            BPF_PROG_TEST_RUN,
            attr as *mut bpf_prog_test_run_attr,
            size_of::<bpf_prog_test_run_attr>(),
        ),
        ObjPin { attr } => libc::syscall(
            SYS_bpf,
            BPF_OBJ_PIN,
            attr as *const bpf_obj_attr,
            size_of::<bpf_obj_attr>(),
        ),
    };

    if ret < 0 {
        return Err((ret, io::Error::last_os_error()));
    }

    Ok(ret)
}
