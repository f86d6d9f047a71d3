#![allow(non_camel_case_types)]

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use libc::EAGAIN;
use thiserror::Error;

use super::{syscall, SysResult, Syscall};

pub(crate) const BPF_MAP_CREATE: u32 = 0;
pub(crate) const BPF_MAP_LOOKUP_ELEM: u32 = 1;
pub(crate) const BPF_MAP_UPDATE_ELEM: u32 = 2;
pub(crate) const BPF_MAP_DELETE_ELEM: u32 = 3;
pub(crate) const BPF_MAP_GET_NEXT_KEY: u32 = 4;
pub(crate) const BPF_PROG_LOAD: u32 = 5;
pub(crate) const BPF_OBJ_PIN: u32 = 6;
pub(crate) const BPF_PROG_TEST_RUN: u32 = 10;

pub(crate) const BPF_OBJ_NAME_LEN: usize = 16;

const BPF_FS_MAGIC: u64 = 0xcafe4a11;

/// A NUL-terminated object name made up of `[A-Za-z0-9_]` characters,
/// 15 characters at most.
pub(crate) type bpf_obj_name = [u8; BPF_OBJ_NAME_LEN];

/// The error type returned when a map or program name is rejected.
#[derive(Debug, Clone, Error)]
pub enum NameError {
    #[error("name `{name}` is longer than {max} characters")]
    Overlong { name: String, max: usize },

    #[error("invalid character `{ch}` in name `{name}`")]
    InvalidCharacter { name: String, ch: char },
}

pub(crate) fn new_obj_name(name: &str) -> Result<bpf_obj_name, NameError> {
    if let Some(ch) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(NameError::InvalidCharacter {
            name: name.to_string(),
            ch,
        });
    }
    if name.len() > BPF_OBJ_NAME_LEN - 1 {
        return Err(NameError::Overlong {
            name: name.to_string(),
            max: BPF_OBJ_NAME_LEN - 1,
        });
    }

    let mut result = [0u8; BPF_OBJ_NAME_LEN];
    result[..name.len()].copy_from_slice(name.as_bytes());
    Ok(result)
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct bpf_prog_load_attr {
    pub prog_type: u32,
    pub insn_cnt: u32,
    pub insns: u64,
    pub license: u64,
    pub log_level: u32,
    pub log_size: u32,
    pub log_buf: u64,
    pub kern_version: u32,
    pub prog_flags: u32,
    pub prog_name: bpf_obj_name,
    pub prog_ifindex: u32,
    pub expected_attach_type: u32,
}

impl Default for bpf_prog_load_attr {
    fn default() -> bpf_prog_load_attr {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct bpf_map_create_attr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
    pub numa_node: u32,
    pub map_name: bpf_obj_name,
}

impl Default for bpf_map_create_attr {
    fn default() -> bpf_map_create_attr {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct bpf_map_elem_attr {
    pub map_fd: u32,
    pub padding: u32,
    pub key: u64,
    // value, or the next-key buffer for BPF_MAP_GET_NEXT_KEY
    pub value: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct bpf_prog_test_run_attr {
    pub prog_fd: u32,
    pub retval: u32,
    pub data_size_in: u32,
    pub data_size_out: u32,
    pub data_in: u64,
    pub data_out: u64,
    pub repeat: u32,
    pub duration: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct bpf_obj_attr {
    pub pathname: u64,
    pub bpf_fd: u32,
    pub padding: u32,
}

pub(crate) fn bpf_prog_load(attr: &bpf_prog_load_attr) -> SysResult {
    loop {
        match syscall(Syscall::ProgLoad { attr }) {
            // The verifier can be interrupted by a signal and returns EAGAIN
            Err((_, io_error)) if io_error.raw_os_error() == Some(EAGAIN) => continue,
            result => return result,
        }
    }
}

pub(crate) fn bpf_create_map(attr: &bpf_map_create_attr) -> SysResult {
    syscall(Syscall::MapCreate { attr })
}

pub(crate) fn bpf_map_lookup_elem(fd: RawFd, key: u64, value: u64) -> SysResult {
    let attr = bpf_map_elem_attr {
        map_fd: fd as u32,
        key,
        value,
        ..Default::default()
    };
    syscall(Syscall::MapElem {
        cmd: BPF_MAP_LOOKUP_ELEM,
        attr: &attr,
    })
}

pub(crate) fn bpf_map_update_elem(fd: RawFd, key: u64, value: u64, flags: u64) -> SysResult {
    let attr = bpf_map_elem_attr {
        map_fd: fd as u32,
        key,
        value,
        flags,
        ..Default::default()
    };
    syscall(Syscall::MapElem {
        cmd: BPF_MAP_UPDATE_ELEM,
        attr: &attr,
    })
}

pub(crate) fn bpf_map_delete_elem(fd: RawFd, key: u64) -> SysResult {
    let attr = bpf_map_elem_attr {
        map_fd: fd as u32,
        key,
        ..Default::default()
    };
    syscall(Syscall::MapElem {
        cmd: BPF_MAP_DELETE_ELEM,
        attr: &attr,
    })
}

pub(crate) fn bpf_map_get_next_key(fd: RawFd, key: u64, next_key: u64) -> SysResult {
    let attr = bpf_map_elem_attr {
        map_fd: fd as u32,
        key,
        value: next_key,
        ..Default::default()
    };
    syscall(Syscall::MapElem {
        cmd: BPF_MAP_GET_NEXT_KEY,
        attr: &attr,
    })
}

pub(crate) fn bpf_prog_test_run(attr: &mut bpf_prog_test_run_attr) -> SysResult {
    syscall(Syscall::ProgTestRun { attr })
}

/// The error type returned when pinning an object fails.
#[derive(Debug, Error)]
pub enum PinError {
    #[error("`{path}` is not on a bpf filesystem")]
    NotOnBpfFs { path: PathBuf },

    #[error("invalid pin path `{path}`")]
    InvalidPath { path: PathBuf },

    #[error("the BPF_OBJ_PIN syscall failed with code {code}")]
    SyscallFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },
}

pub(crate) fn bpf_pin_object(path: &Path, fd: RawFd) -> Result<(), PinError> {
    let invalid_path = || PinError::InvalidPath {
        path: path.to_path_buf(),
    };
    let dir = path.parent().ok_or_else(invalid_path)?;
    if !is_bpffs(dir).map_err(|_| invalid_path())? {
        return Err(PinError::NotOnBpfFs {
            path: path.to_path_buf(),
        });
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| invalid_path())?;
    let attr = bpf_obj_attr {
        pathname: c_path.as_ptr() as u64,
        bpf_fd: fd as u32,
        ..Default::default()
    };
    syscall(Syscall::ObjPin { attr: &attr })
        .map(|_| ())
        .map_err(|(code, io_error)| PinError::SyscallFailed { code, io_error })
}

fn is_bpffs(dir: &Path) -> io::Result<bool> {
    let c_dir = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut stat = unsafe { mem::zeroed::<libc::statfs>() };
    if unsafe { libc::statfs(c_dir.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_type as u64 == BPF_FS_MAGIC)
}
