//! Kernel feature detection.
//!
//! Probes are pure: they create a small temporary object and close it. The
//! results are memoized for the lifetime of the process.

use std::mem;

use libc::close;

use crate::sys::{bpf_create_map, bpf_map_create_attr, new_obj_name};

lazy_static! {
    pub(crate) static ref FEATURES: Features = Features::probe();
}

#[derive(Debug)]
pub(crate) struct Features {
    // names on maps and programs, kernel 4.15
    pub(crate) obj_name: bool,
}

impl Features {
    fn probe() -> Features {
        Features {
            obj_name: probe_obj_name(),
        }
    }
}

fn probe_obj_name() -> bool {
    let name = match new_obj_name("feature_test") {
        Ok(name) => name,
        Err(_) => return false,
    };

    let attr = bpf_map_create_attr {
        map_type: crate::obj::MapType::Array as u32,
        key_size: mem::size_of::<u32>() as u32,
        value_size: mem::size_of::<u32>() as u32,
        max_entries: 1,
        map_name: name,
        ..Default::default()
    };

    match bpf_create_map(&attr) {
        Ok(fd) => {
            unsafe { close(fd as i32) };
            true
        }
        Err(_) => false,
    }
}
