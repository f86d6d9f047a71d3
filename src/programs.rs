//! Program loading and execution.
//!
//! A [`Program`] owns the file descriptor of a loaded program and closes it
//! on drop. When the kernel rejects a program the load is retried once with
//! the verifier log enabled, so the error carries the verifier's
//! explanation.

use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{close, ENOSPC};
use thiserror::Error;

use crate::asm::INSTRUCTION_SIZE;
use crate::features::FEATURES;
use crate::obj::{ProgramSpec, ProgramType};
use crate::sys::{
    bpf_pin_object, bpf_prog_load, bpf_prog_load_attr, bpf_prog_test_run,
    bpf_prog_test_run_attr, new_obj_name, NameError, PinError,
};

/// Number of bytes allocated for the verifier log when a failed load is
/// retried.
pub const DEFAULT_VERIFIER_LOG_SIZE: usize = 64 * 1024;

// Spare room for the kernel to grow the packet during a test run. This is
// the maximum slack given to XDP and SKB programs, XDP_PACKET_HEADROOM +
// NET_IP_ALIGN.
const TEST_OUTPUT_PAD: usize = 256 + 2;

/// The error type returned when working with a [`Program`].
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("the program has no instructions")]
    NoInstructions,

    #[error("call to `{symbol}` was never resolved")]
    UndefinedSymbol { symbol: String },

    #[error("invalid program name")]
    InvalidName(#[from] NameError),

    #[error("the BPF_PROG_LOAD syscall failed: {io_error}\nVerifier output:\n{verifier_log}")]
    LoadFailed {
        #[source]
        io_error: io::Error,
        verifier_log: String,
    },

    #[error("test run input cannot be empty")]
    MissingTestData,

    #[error("the BPF_PROG_TEST_RUN syscall failed with code {code}")]
    TestRunFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("the kernel wrote past the end of the test run output buffer")]
    TestRunOverflow,

    #[error("error pinning program")]
    Pin(#[from] PinError),
}

/// A loaded program. Owns the program's file descriptor.
#[derive(Debug)]
pub struct Program {
    name: Option<String>,
    program_type: ProgramType,
    fd: RawFd,
}

impl Program {
    /// Loads the program described by `spec` into the kernel.
    pub fn load(spec: ProgramSpec) -> Result<Program, ProgramError> {
        let ProgramSpec {
            name,
            program_type,
            instructions,
            license,
            kernel_version,
        } = spec;

        if instructions.is_empty() {
            return Err(ProgramError::NoInstructions);
        }

        // a pseudo-call still carrying a reference was never linked; the
        // verifier would reject it with a far less useful message
        for ins in instructions.iter() {
            if !ins.is_pseudo_call() {
                continue;
            }
            if let Some(symbol) = ins.reference_label() {
                return Err(ProgramError::UndefinedSymbol {
                    symbol: symbol.to_string(),
                });
            }
        }

        let code = instructions.marshal();
        let mut attr = bpf_prog_load_attr {
            prog_type: program_type as u32,
            insn_cnt: (code.len() / INSTRUCTION_SIZE) as u32,
            insns: code.as_ptr() as u64,
            license: license.as_ptr() as u64,
            kern_version: kernel_version.into(),
            ..Default::default()
        };
        if let Some(name) = &name {
            let obj_name = new_obj_name(name)?;
            if FEATURES.obj_name {
                attr.prog_name = obj_name;
            }
        }

        match bpf_prog_load(&attr) {
            Ok(fd) => Ok(Program {
                name,
                program_type,
                fd: fd as RawFd,
            }),
            Err(_) => {
                let mut log = vec![0u8; DEFAULT_VERIFIER_LOG_SIZE];
                attr.log_level = 1;
                attr.log_size = log.len() as u32;
                attr.log_buf = log.as_mut_ptr() as u64;

                match bpf_prog_load(&attr) {
                    Ok(fd) => Ok(Program {
                        name,
                        program_type,
                        fd: fd as RawFd,
                    }),
                    Err((_, io_error)) if io_error.raw_os_error() == Some(ENOSPC) => {
                        Err(ProgramError::LoadFailed {
                            io_error,
                            verifier_log: "verifier log truncated, buffer too small".to_string(),
                        })
                    }
                    Err((_, io_error)) => Err(ProgramError::LoadFailed {
                        io_error,
                        verifier_log: convert_c_string(&log),
                    }),
                }
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn program_type(&self) -> ProgramType {
        self.program_type
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Runs the program over `input` and returns the program's return value
    /// and the output data.
    ///
    /// The kernel expects at least 14 bytes of input for XDP and SKB
    /// programs. Requires Linux 4.12.
    pub fn test_run(&self, input: &[u8]) -> Result<(u32, Vec<u8>), ProgramError> {
        if input.is_empty() {
            return Err(ProgramError::MissingTestData);
        }

        // Older kernels ignore data_size_out when copying to user space, and
        // helpers like bpf_xdp_adjust_head() can grow the packet. Allocate
        // enough slack for the kernel to stay inside the buffer.
        let mut output = vec![0u8; input.len() + TEST_OUTPUT_PAD];

        let mut attr = bpf_prog_test_run_attr {
            prog_fd: self.fd as u32,
            data_size_in: input.len() as u32,
            data_size_out: output.len() as u32,
            data_in: input.as_ptr() as u64,
            data_out: output.as_mut_ptr() as u64,
            repeat: 1,
            ..Default::default()
        };

        bpf_prog_test_run(&mut attr)
            .map_err(|(code, io_error)| ProgramError::TestRunFailed { code, io_error })?;

        if attr.data_size_out as usize > output.len() {
            return Err(ProgramError::TestRunOverflow);
        }
        output.truncate(attr.data_size_out as usize);

        Ok((attr.retval, output))
    }

    /// Pins the program, keeping it loaded past the lifetime of this
    /// process. `path` must be on a bpf filesystem.
    pub fn pin<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgramError> {
        Ok(bpf_pin_object(path.as_ref(), self.fd)?)
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        unsafe { close(self.fd) };
    }
}

fn convert_c_string(data: &[u8]) -> String {
    let end = match data.iter().position(|b| *b == 0) {
        Some(end) => end,
        None => data.len(),
    };
    String::from_utf8_lossy(&data[..end]).to_string()
}
