//! Loading whole object files.

use std::collections::HashMap;

use thiserror::Error;

use crate::editor::{EditError, Editor};
use crate::maps::{Map, MapError};
use crate::obj::{CollectionSpec, ParseError};
use crate::programs::{Program, ProgramError};

/// The error type returned when a collection cannot be materialized.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("error parsing object: {0}")]
    Parse(#[from] ParseError),

    #[error("map error: {0}")]
    Map(#[from] MapError),

    #[error("program error: {0}")]
    Program(#[from] ProgramError),

    #[error("error resolving map references: {0}")]
    Edit(#[from] EditError),
}

/// The maps and programs of an object file, created and loaded into the
/// kernel.
#[derive(Debug)]
pub struct Collection {
    maps: HashMap<String, Map>,
    programs: HashMap<String, Program>,
}

impl Collection {
    /// Parses `data` as an object file and materializes everything in it.
    pub fn load(data: &[u8]) -> Result<Collection, CollectionError> {
        Collection::new(CollectionSpec::parse(data)?)
    }

    /// Creates the maps of `spec`, resolves every map reference through the
    /// editor and loads the programs.
    pub fn new(spec: CollectionSpec) -> Result<Collection, CollectionError> {
        let CollectionSpec {
            maps: map_specs,
            programs: program_specs,
        } = spec;

        let mut maps = HashMap::new();
        for (name, map_spec) in &map_specs {
            maps.insert(name.clone(), Map::create(name, map_spec)?);
        }

        let mut programs = HashMap::new();
        for (name, mut prog_spec) in program_specs {
            {
                let mut editor = Editor::new(&mut prog_spec.instructions);
                for (map_name, map) in &maps {
                    match editor.rewrite_map_fd(map_name, map.fd()) {
                        Ok(()) => {}
                        // the program doesn't use this map
                        Err(EditError::MissingSymbol { .. }) => {}
                        Err(e) => return Err(CollectionError::Edit(e)),
                    }
                }
            }
            programs.insert(name, Program::load(prog_spec)?);
        }

        Ok(Collection { maps, programs })
    }

    pub fn map(&self, name: &str) -> Option<&Map> {
        self.maps.get(name)
    }

    pub fn map_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.get_mut(name)
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    pub fn program_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.programs.get_mut(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::ffi::CString;

    use libc::EFAULT;

    use super::*;
    use crate::asm::{self, exit, ld_imm64, Instructions, R1, PSEUDO_MAP_FD};
    use crate::obj::{KernelVersion, MapSpec, MapType, ProgramSpec, ProgramType};
    use crate::sys::{override_syscall, Syscall};

    fn host_endianness() -> object::Endianness {
        if cfg!(target_endian = "little") {
            object::Endianness::Little
        } else {
            object::Endianness::Big
        }
    }

    #[test]
    fn test_collection_resolves_map_references() {
        override_syscall(|call| match call {
            Syscall::MapCreate { .. } => Ok(4242),
            Syscall::ProgLoad { attr } => {
                // the submitted code must have the fd patched in
                let code = unsafe {
                    std::slice::from_raw_parts(
                        attr.insns as *const u8,
                        attr.insn_cnt as usize * asm::INSTRUCTION_SIZE,
                    )
                };
                let (insns, _) = Instructions::read(code, host_endianness()).unwrap();
                assert_eq!(insns[0].src.0, PSEUDO_MAP_FD);
                assert_eq!(insns[0].constant, 4242);
                Ok(4243)
            }
            _ => Err((-1, std::io::Error::from_raw_os_error(EFAULT))),
        });

        let mut maps = BTreeMap::new();
        maps.insert(
            "my_map".to_string(),
            MapSpec {
                map_type: MapType::Hash,
                key_size: 4,
                value_size: 4,
                max_entries: 16,
                flags: 0,
                inner_map: None,
            },
        );

        let mut programs = BTreeMap::new();
        programs.insert(
            "filter".to_string(),
            ProgramSpec {
                name: Some("filter".to_string()),
                program_type: ProgramType::Xdp,
                instructions: vec![ld_imm64(R1, 0).reference("my_map"), exit()].into(),
                license: CString::new("MIT").unwrap(),
                kernel_version: KernelVersion::Any,
            },
        );

        let collection = Collection::new(CollectionSpec { maps, programs }).unwrap();

        assert_eq!(collection.map("my_map").map(Map::fd), Some(4242));
        assert!(collection.program("filter").is_some());
        assert!(collection.map("other").is_none());
    }

    #[test]
    fn test_collection_ignores_unreferenced_maps() {
        override_syscall(|call| match call {
            Syscall::MapCreate { .. } => Ok(4242),
            Syscall::ProgLoad { .. } => Ok(4243),
            _ => Err((-1, std::io::Error::from_raw_os_error(EFAULT))),
        });

        let mut maps = BTreeMap::new();
        maps.insert(
            "unused".to_string(),
            MapSpec {
                map_type: MapType::Array,
                key_size: 4,
                value_size: 4,
                max_entries: 1,
                flags: 0,
                inner_map: None,
            },
        );

        let mut programs = BTreeMap::new();
        programs.insert(
            "prog".to_string(),
            ProgramSpec {
                name: None,
                program_type: ProgramType::SocketFilter,
                instructions: vec![exit()].into(),
                license: CString::new("MIT").unwrap(),
                kernel_version: KernelVersion::Any,
            },
        );

        Collection::new(CollectionSpec { maps, programs }).unwrap();
    }
}
