//! ELF object parsing.
//!
//! Turns a compiled object file into a [`CollectionSpec`]: named map and
//! program specifications whose instructions carry symbolic references to
//! maps and `.text` sub-programs instead of resolved file descriptors.

mod relocation;

use std::collections::{BTreeMap, HashMap};
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use object::read::{
    Object as ElfObject, ObjectSection, ObjectSymbol, ObjectSymbolTable, Section as ObjSection,
};
use object::{Endianness, RelocationTarget, SectionIndex, SectionKind, SymbolKind};
use thiserror::Error;

pub use self::relocation::RelocationError;
use self::relocation::{Relocation, Symbol};
use crate::asm::{AsmError, Instructions, INSTRUCTION_SIZE};
use crate::editor::{EditError, Editor};

const KERNEL_VERSION_ANY: u32 = 0xFFFF_FFFE;

// The first four u32 fields of a map record must be present; flags and the
// inner map index are optional.
const MINIMUM_MAP_SIZE: usize = mem::size_of::<u32>() * 4;
const FULL_MAP_SIZE: usize = mem::size_of::<u32>() * 6;

/// The contents of an object file: named maps and named programs, both in
/// deterministic (lexicographic) order.
#[derive(Debug, Clone, Default)]
pub struct CollectionSpec {
    pub maps: BTreeMap<String, MapSpec>,
    pub programs: BTreeMap<String, ProgramSpec>,
}

/// A map defined in an object file's `maps` section.
#[derive(Debug, Clone, PartialEq)]
pub struct MapSpec {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    /// The specification of the inner map, for [`MapType::ArrayOfMaps`] and
    /// [`MapType::HashOfMaps`].
    pub inner_map: Option<Box<MapSpec>>,
}

/// A program defined in an object file.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    /// Passed to the kernel as a debug aid. Must only contain alphanumeric
    /// and `_` characters.
    pub name: Option<String>,
    pub program_type: ProgramType,
    pub instructions: Instructions,
    pub license: CString,
    pub kernel_version: KernelVersion,
}

/// The kernel version a program was compiled against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelVersion {
    Version(u32),
    Any,
}

impl From<KernelVersion> for u32 {
    fn from(version: KernelVersion) -> u32 {
        match version {
            KernelVersion::Any => KERNEL_VERSION_ANY,
            KernelVersion::Version(v) => v,
        }
    }
}

/// The type of a map.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapType {
    Unspec = 0,
    Hash = 1,
    Array = 2,
    ProgramArray = 3,
    PerfEventArray = 4,
    PercpuHash = 5,
    PercpuArray = 6,
    StackTrace = 7,
    CgroupArray = 8,
    LruHash = 9,
    LruPercpuHash = 10,
    LpmTrie = 11,
    ArrayOfMaps = 12,
    HashOfMaps = 13,
    DevMap = 14,
    SockMap = 15,
    CpuMap = 16,
}

impl MapType {
    /// Returns true for types whose values are file descriptors of other
    /// maps.
    pub fn is_map_of_maps(self) -> bool {
        matches!(self, MapType::ArrayOfMaps | MapType::HashOfMaps)
    }
}

impl TryFrom<u32> for MapType {
    type Error = ParseError;

    fn try_from(map_type: u32) -> Result<MapType, ParseError> {
        use MapType::*;
        Ok(match map_type {
            x if x == Unspec as u32 => Unspec,
            x if x == Hash as u32 => Hash,
            x if x == Array as u32 => Array,
            x if x == ProgramArray as u32 => ProgramArray,
            x if x == PerfEventArray as u32 => PerfEventArray,
            x if x == PercpuHash as u32 => PercpuHash,
            x if x == PercpuArray as u32 => PercpuArray,
            x if x == StackTrace as u32 => StackTrace,
            x if x == CgroupArray as u32 => CgroupArray,
            x if x == LruHash as u32 => LruHash,
            x if x == LruPercpuHash as u32 => LruPercpuHash,
            x if x == LpmTrie as u32 => LpmTrie,
            x if x == ArrayOfMaps as u32 => ArrayOfMaps,
            x if x == HashOfMaps as u32 => HashOfMaps,
            x if x == DevMap as u32 => DevMap,
            x if x == SockMap as u32 => SockMap,
            x if x == CpuMap as u32 => CpuMap,
            _ => return Err(ParseError::InvalidMapType { map_type }),
        })
    }
}

/// The type of a program, determined by the name of the section that holds
/// it.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgramType {
    Unspec = 0,
    SocketFilter = 1,
    KProbe = 2,
    SchedClassifier = 3,
    TracePoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    CgroupSock = 9,
    LwtIn = 10,
    LwtOut = 11,
    LwtXmit = 12,
    SockOps = 13,
    SkSkb = 14,
    SkMsg = 16,
}

impl FromStr for ProgramType {
    type Err = ParseError;

    // Parses a section name, eg "xdp" or "kprobe/sys_connect". The prefix
    // before the first `/` selects the type.
    fn from_str(section: &str) -> Result<ProgramType, ParseError> {
        use ProgramType::*;
        let prefix = section.split('/').next().unwrap_or(section);
        Ok(match prefix {
            "socket" => SocketFilter,
            "kprobe" | "kretprobe" | "uprobe" | "uretprobe" => KProbe,
            "classifier" => SchedClassifier,
            "tracepoint" => TracePoint,
            "xdp" => Xdp,
            "perf_event" => PerfEvent,
            "cgroup_skb" | "cgroup" => CgroupSkb,
            "cgroup_sock" => CgroupSock,
            "lwt_in" => LwtIn,
            "lwt_out" => LwtOut,
            "lwt_xmit" => LwtXmit,
            "sockops" => SockOps,
            "sk_skb" => SkSkb,
            "sk_msg" => SkMsg,
            _ => {
                return Err(ParseError::UnsupportedProgramType {
                    section: section.to_string(),
                })
            }
        })
    }
}

/// The error type returned when an object file cannot be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("error reading `{path}`")]
    FileError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error parsing ELF data")]
    ElfError {
        #[source]
        source: object::read::Error,
    },

    #[error("error parsing section with index {index}")]
    SectionError {
        index: usize,
        #[source]
        source: object::read::Error,
    },

    #[error("invalid license `{data:?}`: missing NULL terminator")]
    MissingLicenseNullTerminator { data: Vec<u8> },

    #[error("invalid license `{data:?}`")]
    InvalidLicense { data: Vec<u8> },

    #[error("invalid kernel version `{data:?}`")]
    InvalidKernelVersion { data: Vec<u8> },

    #[error("invalid map type {map_type}")]
    InvalidMapType { map_type: u32 },

    #[error("error parsing map `{name}`")]
    InvalidMapDefinition { name: String },

    #[error("map `{name}` has inner map index {index}, but only {count} maps are defined")]
    InvalidInnerMapIndex {
        name: String,
        index: u32,
        count: usize,
    },

    #[error("two maps or two programs share the name `{name}`")]
    DuplicateName { name: String },

    #[error("unsupported program section `{section}`")]
    UnsupportedProgramType { section: String },

    #[error("section `{section}` has no symbols")]
    NoSymbolsForSection { section: String },

    #[error("symbol `{symbol}` does not point at an instruction")]
    InvalidSymbolAddress { symbol: String, address: u64 },

    #[error("error decoding instructions in section `{section}`")]
    InvalidProgramCode {
        section: String,
        #[source]
        source: AsmError,
    },

    #[error("unsupported relocation target at offset {offset}")]
    UnsupportedRelocationTarget { offset: u64 },

    #[error("error applying relocations in section `{section}`")]
    RelocationError {
        section: String,
        #[source]
        source: RelocationError,
    },

    #[error("error linking sub-programs into `{program}`")]
    LinkError {
        program: String,
        #[source]
        source: EditError,
    },
}

impl CollectionSpec {
    /// Parses the object file at `path`.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<CollectionSpec, ParseError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| ParseError::FileError {
            path: path.to_path_buf(),
            source,
        })?;
        CollectionSpec::parse(&data)
    }

    /// Parses an object file from memory.
    pub fn parse(data: &[u8]) -> Result<CollectionSpec, ParseError> {
        let obj = object::read::File::parse(data)
            .map_err(|source| ParseError::ElfError { source })?;

        let mut loader = Loader::new(obj.endianness());
        if let Some(symbol_table) = obj.symbol_table() {
            for symbol in symbol_table.symbols() {
                loader.symbols.insert(
                    symbol.index().0,
                    Symbol {
                        name: symbol.name().ok().map(String::from),
                        section: symbol.section().index(),
                        address: symbol.address(),
                        kind: symbol.kind(),
                    },
                );
            }
        }

        for s in obj.sections() {
            loader.parse_section(Section::try_from(&s)?)?;
        }

        loader.finish()
    }
}

// The parts of an ELF section the loader cares about, decoupled from the
// underlying reader so section handling can be driven from plain data.
#[derive(Debug)]
struct Section<'a> {
    index: SectionIndex,
    kind: SectionKind,
    name: &'a str,
    data: &'a [u8],
    relocations: Vec<Relocation>,
}

impl<'data, 'file, 's> TryFrom<&'s ObjSection<'data, 'file>> for Section<'s> {
    type Error = ParseError;

    fn try_from(section: &'s ObjSection<'data, 'file>) -> Result<Section<'s>, ParseError> {
        let index = section.index();
        let map_err = |source| ParseError::SectionError {
            index: index.0,
            source,
        };
        Ok(Section {
            index,
            kind: section.kind(),
            name: section.name().map_err(map_err)?,
            data: section.data().map_err(map_err)?,
            relocations: section
                .relocations()
                .map(|(offset, relocation)| match relocation.target() {
                    RelocationTarget::Symbol(index) => Ok(Relocation {
                        offset,
                        symbol: index.0,
                    }),
                    _ => Err(ParseError::UnsupportedRelocationTarget { offset }),
                })
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

// Accumulates sections one at a time; `finish` applies relocations, links
// `.text` sub-programs and assembles the collection spec. Section order in
// the file does not matter.
struct Loader {
    endianness: Endianness,
    license: CString,
    kernel_version: KernelVersion,
    symbols: HashMap<usize, Symbol>,
    maps_section: Option<SectionIndex>,
    text_section: Option<SectionIndex>,
    map_records: Vec<(String, MapSpec, Option<u32>)>,
    text: Instructions,
    text_relocations: Vec<Relocation>,
    programs: Vec<RawProgram>,
}

struct RawProgram {
    section: String,
    name: String,
    program_type: ProgramType,
    instructions: Instructions,
    relocations: Vec<Relocation>,
}

impl Loader {
    fn new(endianness: Endianness) -> Loader {
        Loader {
            endianness,
            license: CString::default(),
            kernel_version: KernelVersion::Any,
            symbols: HashMap::new(),
            maps_section: None,
            text_section: None,
            map_records: Vec::new(),
            text: Instructions::new(),
            text_relocations: Vec::new(),
            programs: Vec::new(),
        }
    }

    fn parse_section(&mut self, section: Section<'_>) -> Result<(), ParseError> {
        match section.name {
            "license" => {
                self.license = parse_license(section.data)?;
            }
            "version" => {
                self.kernel_version = parse_version(section.data, self.endianness)?;
            }
            "maps" => self.parse_maps(&section)?,
            ".text" => self.parse_text(section)?,
            name if section.kind == SectionKind::Text
                && !section.data.is_empty()
                && !name.starts_with('.') =>
            {
                self.parse_program(section)?
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_maps(&mut self, section: &Section<'_>) -> Result<(), ParseError> {
        self.maps_section = Some(section.index);

        // each symbol pointing into the section marks the start of one record
        let mut map_symbols: Vec<(String, u64)> = self
            .symbols
            .values()
            .filter(|sym| sym.section == Some(section.index))
            .filter_map(|sym| match &sym.name {
                Some(name) if !name.is_empty() => Some((name.clone(), sym.address)),
                _ => None,
            })
            .collect();
        map_symbols.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        if map_symbols.is_empty() {
            return Err(ParseError::NoSymbolsForSection {
                section: "maps".to_string(),
            });
        }

        self.map_records = parse_map_records(section.data, &map_symbols, self.endianness)?;
        Ok(())
    }

    fn parse_text(&mut self, section: Section<'_>) -> Result<(), ParseError> {
        self.text_section = Some(section.index);
        if section.data.is_empty() {
            return Ok(());
        }

        let (mut instructions, _) = Instructions::read(section.data, self.endianness).map_err(
            |source| ParseError::InvalidProgramCode {
                section: ".text".to_string(),
                source,
            },
        )?;

        // function symbols name the sub-programs callable from other sections
        for sym in self.symbols.values() {
            if sym.section != Some(section.index) || sym.kind != SymbolKind::Text {
                continue;
            }
            let name = match &sym.name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => continue,
            };
            let invalid_address = || ParseError::InvalidSymbolAddress {
                symbol: name.clone(),
                address: sym.address,
            };
            if sym.address % INSTRUCTION_SIZE as u64 != 0 {
                return Err(invalid_address());
            }
            let slot = (sym.address / INSTRUCTION_SIZE as u64) as usize;
            let index = instructions
                .logical_at_slot(slot)
                .ok_or_else(invalid_address)?;
            instructions[index].symbol = Some(name);
        }

        self.text = instructions;
        self.text_relocations = section.relocations;
        Ok(())
    }

    fn parse_program(&mut self, section: Section<'_>) -> Result<(), ParseError> {
        let program_type = ProgramType::from_str(section.name)?;
        let name = program_name(&self.symbols, section.index).ok_or_else(|| {
            ParseError::NoSymbolsForSection {
                section: section.name.to_string(),
            }
        })?;

        let (instructions, _) = Instructions::read(section.data, self.endianness).map_err(
            |source| ParseError::InvalidProgramCode {
                section: section.name.to_string(),
                source,
            },
        )?;

        self.programs.push(RawProgram {
            section: section.name.to_string(),
            name,
            program_type,
            instructions,
            relocations: section.relocations,
        });
        Ok(())
    }

    fn finish(self) -> Result<CollectionSpec, ParseError> {
        let Loader {
            endianness: _,
            license,
            kernel_version,
            symbols,
            maps_section,
            text_section,
            map_records,
            mut text,
            text_relocations,
            programs: raw_programs,
        } = self;

        let maps = resolve_inner_maps(map_records)?;

        relocation::apply(
            &mut text,
            &text_relocations,
            &symbols,
            maps_section,
            text_section,
        )
        .map_err(|source| ParseError::RelocationError {
            section: ".text".to_string(),
            source,
        })?;

        let mut programs = BTreeMap::new();
        for raw in raw_programs {
            let RawProgram {
                section,
                name,
                program_type,
                mut instructions,
                relocations,
            } = raw;

            relocation::apply(
                &mut instructions,
                &relocations,
                &symbols,
                maps_section,
                text_section,
            )
            .map_err(|source| ParseError::RelocationError { section, source })?;

            let calls_text = instructions
                .iter()
                .any(|ins| ins.is_pseudo_call() && ins.reference_label().is_some());
            if calls_text && !text.is_empty() {
                Editor::new(&mut instructions)
                    .link(&text)
                    .map_err(|source| ParseError::LinkError {
                        program: name.clone(),
                        source,
                    })?;
            }

            let spec = ProgramSpec {
                name: Some(name.clone()),
                program_type,
                instructions,
                license: license.clone(),
                kernel_version,
            };
            if programs.insert(name.clone(), spec).is_some() {
                return Err(ParseError::DuplicateName { name });
            }
        }

        Ok(CollectionSpec { maps, programs })
    }
}

fn parse_license(data: &[u8]) -> Result<CString, ParseError> {
    if data.len() < 2 {
        return Err(ParseError::InvalidLicense {
            data: data.to_vec(),
        });
    }
    if data[data.len() - 1] != 0 {
        return Err(ParseError::MissingLicenseNullTerminator {
            data: data.to_vec(),
        });
    }

    Ok(CStr::from_bytes_with_nul(data)
        .map_err(|_| ParseError::InvalidLicense {
            data: data.to_vec(),
        })?
        .to_owned())
}

fn parse_version(data: &[u8], endianness: Endianness) -> Result<KernelVersion, ParseError> {
    let data: [u8; 4] = match data.len() {
        4 => data.try_into().map_err(|_| ParseError::InvalidKernelVersion {
            data: data.to_vec(),
        })?,
        _ => {
            return Err(ParseError::InvalidKernelVersion {
                data: data.to_vec(),
            })
        }
    };

    let v = match endianness {
        Endianness::Big => u32::from_be_bytes(data),
        Endianness::Little => u32::from_le_bytes(data),
    };

    Ok(match v {
        KERNEL_VERSION_ANY => KernelVersion::Any,
        v => KernelVersion::Version(v),
    })
}

fn parse_map_records(
    data: &[u8],
    symbols: &[(String, u64)],
    endianness: Endianness,
) -> Result<Vec<(String, MapSpec, Option<u32>)>, ParseError> {
    let mut records = Vec::new();
    for (i, (name, address)) in symbols.iter().enumerate() {
        if records.iter().any(|(n, _, _)| n == name) {
            return Err(ParseError::DuplicateName { name: name.clone() });
        }
        let start = *address as usize;
        let end = match symbols.get(i + 1) {
            Some((_, next_address)) => *next_address as usize,
            None => data.len(),
        };
        let record = data
            .get(start..end)
            .filter(|record| record.len() >= MINIMUM_MAP_SIZE)
            .ok_or_else(|| ParseError::InvalidMapDefinition { name: name.clone() })?;
        let (spec, inner_index) = parse_map_record(name, record, endianness)?;
        records.push((name.clone(), spec, inner_index));
    }
    Ok(records)
}

fn parse_map_record(
    name: &str,
    data: &[u8],
    endianness: Endianness,
) -> Result<(MapSpec, Option<u32>), ParseError> {
    let field = |index: usize| {
        let bytes: [u8; 4] = data[index * 4..index * 4 + 4].try_into().unwrap();
        match endianness {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    };

    let map_type = MapType::try_from(field(0))?;
    let flags = if data.len() >= 20 { field(4) } else { 0 };
    let inner_index = if data.len() >= FULL_MAP_SIZE {
        Some(field(5))
    } else {
        None
    };

    // trailing bytes from toolchains with larger map structs must be zero
    let parsed = match data.len() {
        n if n >= FULL_MAP_SIZE => FULL_MAP_SIZE,
        n if n >= 20 => 20,
        _ => MINIMUM_MAP_SIZE,
    };
    if data[parsed..].iter().any(|b| *b != 0) {
        return Err(ParseError::InvalidMapDefinition {
            name: name.to_string(),
        });
    }

    Ok((
        MapSpec {
            map_type,
            key_size: field(1),
            value_size: field(2),
            max_entries: field(3),
            flags,
            inner_map: None,
        },
        inner_index,
    ))
}

// Replaces inner map indices with owned copies of the referenced
// specification. Indices count the symbols of the maps section in address
// order.
fn resolve_inner_maps(
    records: Vec<(String, MapSpec, Option<u32>)>,
) -> Result<BTreeMap<String, MapSpec>, ParseError> {
    let templates: Vec<MapSpec> = records.iter().map(|(_, spec, _)| spec.clone()).collect();

    let mut maps = BTreeMap::new();
    for (name, mut spec, inner_index) in records {
        if spec.map_type.is_map_of_maps() {
            let index = inner_index.ok_or_else(|| ParseError::InvalidMapDefinition {
                name: name.clone(),
            })?;
            let inner = templates.get(index as usize).ok_or_else(|| {
                ParseError::InvalidInnerMapIndex {
                    name: name.clone(),
                    index,
                    count: templates.len(),
                }
            })?;
            spec.inner_map = Some(Box::new(inner.clone()));
        }
        maps.insert(name, spec);
    }
    Ok(maps)
}

// A program is named by the symbol at the start of its section.
fn program_name(symbols: &HashMap<usize, Symbol>, section: SectionIndex) -> Option<String> {
    let named = |sym: &&Symbol| {
        sym.section == Some(section)
            && sym.address == 0
            && matches!(&sym.name, Some(name) if !name.is_empty())
    };
    symbols
        .values()
        .filter(named)
        .find(|sym| sym.kind == SymbolKind::Text)
        .or_else(|| symbols.values().find(named))
        .and_then(|sym| sym.name.clone())
}
