#![deny(clippy::all)]

//! A pure Rust library to load, link and run eBPF programs.
//!
//! The crate parses object files produced by clang, resolves the symbolic
//! references they carry against maps and `.text` sub-programs, and submits
//! the resulting instruction streams to the kernel through the `bpf(2)`
//! syscall.

#[macro_use]
extern crate lazy_static;

pub mod asm;
mod collection;
pub mod editor;
mod features;
pub mod maps;
mod obj;
pub mod programs;
mod sys;

pub use collection::{Collection, CollectionError};
pub use maps::{Map, MapError};
pub use obj::{
    CollectionSpec, KernelVersion, MapSpec, MapType, ParseError, ProgramSpec, ProgramType,
    RelocationError,
};
pub use programs::{Program, ProgramError, DEFAULT_VERIFIER_LOG_SIZE};
pub use sys::{NameError, PinError};

/// A marker trait for types that can be passed to and from the kernel as map
/// keys and values.
///
/// # Safety
///
/// Implementors must be plain old data: any bit pattern read back from the
/// kernel must be a valid value.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! unsafe_impl_pod {
    ($($struct_name:ident),+ $(,)?) => {
        $(
            unsafe impl Pod for $struct_name { }
        )+
    }
}

unsafe_impl_pod!(i8, u8, i16, u16, i32, u32, i64, u64);
