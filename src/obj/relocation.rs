use std::collections::HashMap;

use log::debug;
use object::{SectionIndex, SymbolKind};
use thiserror::Error;

use crate::asm::{Instructions, Register, CALL, INSTRUCTION_SIZE, PSEUDO_CALL};

/// The error type returned when a relocation cannot be applied.
#[derive(Debug, Clone, Error)]
pub enum RelocationError {
    #[error("unknown symbol, index `{index}`")]
    UnknownSymbol { index: usize },

    #[error("invalid relocation offset `{offset}`")]
    InvalidRelocationOffset { offset: u64 },

    #[error("relocation against `{symbol}` is not supported")]
    UnsupportedRelocation { symbol: String },

    #[error("relocation against `{symbol}` targets an instruction that cannot take it")]
    OrphanedRelocation { symbol: String },
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct Relocation {
    // byte offset of the targeted instruction slot
    pub(crate) offset: u64,
    // index of the referent symbol
    pub(crate) symbol: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Symbol {
    pub(crate) name: Option<String>,
    pub(crate) section: Option<SectionIndex>,
    pub(crate) address: u64,
    pub(crate) kind: SymbolKind,
}

// Annotates the targets of `relocations` with reference labels. Referents in
// the maps section label a 64-bit load with the map name; referents in
// `.text` label a call with the sub-program name. Everything else is
// rejected.
pub(crate) fn apply(
    instructions: &mut Instructions,
    relocations: &[Relocation],
    symbols: &HashMap<usize, Symbol>,
    maps_section: Option<SectionIndex>,
    text_section: Option<SectionIndex>,
) -> Result<(), RelocationError> {
    for rel in relocations {
        let sym = symbols
            .get(&rel.symbol)
            .ok_or(RelocationError::UnknownSymbol { index: rel.symbol })?;

        if rel.offset % INSTRUCTION_SIZE as u64 != 0 {
            return Err(RelocationError::InvalidRelocationOffset { offset: rel.offset });
        }
        let slot = (rel.offset / INSTRUCTION_SIZE as u64) as usize;
        let index = instructions
            .logical_at_slot(slot)
            .ok_or(RelocationError::InvalidRelocationOffset { offset: rel.offset })?;

        let name = match &sym.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => return Err(RelocationError::UnknownSymbol { index: rel.symbol }),
        };

        let ins = &mut instructions[index];
        match sym.section {
            Some(section) if Some(section) == maps_section => {
                if !ins.is_ld_imm64() {
                    return Err(RelocationError::OrphanedRelocation { symbol: name });
                }
                debug!("relocating map `{name}` at slot {slot}");
                ins.reference = Some(name);
            }
            Some(section) if Some(section) == text_section => {
                if ins.opcode != CALL {
                    return Err(RelocationError::OrphanedRelocation { symbol: name });
                }
                debug!("relocating call to `{name}` at slot {slot}");
                ins.src = Register(PSEUDO_CALL);
                ins.reference = Some(name);
            }
            _ => {
                return Err(RelocationError::UnsupportedRelocation { symbol: name });
            }
        }
    }

    Ok(())
}
