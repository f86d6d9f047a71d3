//! Editing of instruction sequences: patching labeled constants, resolving
//! map references and linking named sub-programs.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;

use log::debug;
use thiserror::Error;

use crate::asm::{Instruction, Instructions, Register, PSEUDO_MAP_FD};

/// The error type returned by [`Editor`] operations.
#[derive(Debug, Clone, Error)]
pub enum EditError {
    #[error("no instruction references symbol `{symbol}`")]
    MissingSymbol { symbol: String },

    #[error("instruction referencing `{symbol}` is not a 64-bit load")]
    ExpectedLoad64 { symbol: String },

    #[error("call to `{symbol}` cannot be resolved")]
    UndefinedSymbol { symbol: String },

    #[error("cyclic call chain through sub-program `{symbol}`")]
    CyclicReference { symbol: String },

    #[error("sub-program `{symbol}` has no terminating exit")]
    MissingExit { symbol: String },
}

/// Mutates an instruction sequence in place.
///
/// All operations preserve the relative wire-slot targets of the jumps and
/// calls already present in the sequence.
pub struct Editor<'a> {
    instructions: &'a mut Instructions,
}

impl<'a> Editor<'a> {
    pub fn new(instructions: &'a mut Instructions) -> Editor<'a> {
        Editor { instructions }
    }

    /// Sets the constant of every 64-bit load referencing `symbol` and
    /// clears the reference.
    pub fn rewrite_constant(&mut self, symbol: &str, value: u64) -> Result<(), EditError> {
        self.rewrite(symbol, |ins| {
            ins.constant = value as i64;
        })
    }

    /// Turns every 64-bit load referencing `symbol` into a map load: the
    /// source register is set to the map-fd marker and the constant to `fd`.
    /// The reference is cleared.
    pub fn rewrite_map_fd(&mut self, symbol: &str, fd: RawFd) -> Result<(), EditError> {
        self.rewrite(symbol, |ins| {
            ins.src = Register(PSEUDO_MAP_FD);
            ins.constant = fd as i64;
        })
    }

    fn rewrite<F: Fn(&mut Instruction)>(&mut self, symbol: &str, f: F) -> Result<(), EditError> {
        let mut found = false;
        for ins in self.instructions.iter_mut() {
            if ins.reference_label() != Some(symbol) {
                continue;
            }
            if !ins.is_ld_imm64() {
                return Err(EditError::ExpectedLoad64 {
                    symbol: symbol.to_string(),
                });
            }
            f(ins);
            ins.reference = None;
            found = true;
        }
        if !found {
            return Err(EditError::MissingSymbol {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }

    /// Resolves bpf-to-bpf calls against the sub-programs in `library`.
    ///
    /// Every pseudo-call whose reference matches a `symbol` label in the
    /// library gets the referenced sub-program appended (once, regardless of
    /// the number of call sites) and its immediate patched to the wire-slot
    /// distance from the slot after the call to the appended code. Resolved
    /// references are cleared; references the library cannot satisfy are
    /// left untouched so that a later pass may resolve them.
    pub fn link(&mut self, library: &Instructions) -> Result<(), EditError> {
        self.link_inner(library, false)
    }

    /// Like [`Editor::link`], but fails with [`EditError::UndefinedSymbol`]
    /// if any pseudo-call reference remains unresolved.
    pub fn link_strict(&mut self, library: &Instructions) -> Result<(), EditError> {
        self.link_inner(library, true)
    }

    fn link_inner(&mut self, library: &Instructions, strict: bool) -> Result<(), EditError> {
        let exports = index_symbols(library);
        let mut state = LinkState {
            appended: HashMap::new(),
            in_progress: HashSet::new(),
        };

        // Only the original instructions are scanned; appended sub-programs
        // are resolved depth-first as they are copied in.
        let primary_len = self.instructions.len();
        self.resolve_range(0, primary_len, 0, library, &exports, &mut state, strict)
    }

    // Resolves the pseudo-calls in instructions[start..end], which begins at
    // wire slot `start_slot`.
    #[allow(clippy::too_many_arguments)]
    fn resolve_range(
        &mut self,
        start: usize,
        end: usize,
        start_slot: i64,
        library: &Instructions,
        exports: &HashMap<String, usize>,
        state: &mut LinkState,
        strict: bool,
    ) -> Result<(), EditError> {
        let mut slot = start_slot;
        for index in start..end {
            let width = self.instructions[index].slots() as i64;
            let wanted = match &self.instructions[index] {
                ins if ins.is_pseudo_call() => ins.reference_label().map(String::from),
                _ => None,
            };
            if let Some(symbol) = wanted {
                match exports.get(&symbol) {
                    Some(&library_start) => {
                        let target = self.append_subprogram(
                            &symbol,
                            library_start,
                            library,
                            exports,
                            state,
                            strict,
                        )?;
                        let ins = &mut self.instructions[index];
                        ins.constant = target - (slot + 1);
                        ins.reference = None;
                    }
                    None if strict => {
                        return Err(EditError::UndefinedSymbol { symbol });
                    }
                    None => {}
                }
            }
            slot += width;
        }
        Ok(())
    }

    // Appends the sub-program named `symbol` unless a previous call site
    // already did, and returns the wire slot of its first instruction.
    fn append_subprogram(
        &mut self,
        symbol: &str,
        library_start: usize,
        library: &Instructions,
        exports: &HashMap<String, usize>,
        state: &mut LinkState,
        strict: bool,
    ) -> Result<i64, EditError> {
        if state.in_progress.contains(symbol) {
            return Err(EditError::CyclicReference {
                symbol: symbol.to_string(),
            });
        }
        if let Some(&slot) = state.appended.get(symbol) {
            return Ok(slot);
        }

        let library_end = subprogram_end(library, library_start).ok_or_else(|| {
            EditError::MissingExit {
                symbol: symbol.to_string(),
            }
        })?;

        state.in_progress.insert(symbol.to_string());

        let at_slot = self.instructions.slot_len() as i64;
        let at_index = self.instructions.len();
        for ins in &library[library_start..library_end] {
            self.instructions.push(ins.clone());
        }
        debug!("linked sub-program `{symbol}` at slot {at_slot}");

        let count = library_end - library_start;
        self.resolve_range(
            at_index,
            at_index + count,
            at_slot,
            library,
            exports,
            state,
            strict,
        )?;

        state.in_progress.remove(symbol);
        state.appended.insert(symbol.to_string(), at_slot);
        Ok(at_slot)
    }
}

struct LinkState {
    // symbol -> wire slot of the appended copy
    appended: HashMap<String, i64>,
    in_progress: HashSet<String>,
}

fn index_symbols(library: &Instructions) -> HashMap<String, usize> {
    library
        .iter()
        .enumerate()
        .filter_map(|(index, ins)| ins.symbol_label().map(|name| (name.to_string(), index)))
        .collect()
}

// A sub-program runs from its symbol through the first exit. Running into
// the next symbol or off the end of the library first means the sub-program
// has no terminator.
fn subprogram_end(library: &Instructions, start: usize) -> Option<usize> {
    for index in start..library.len() {
        if index > start && library[index].symbol_label().is_some() {
            return None;
        }
        if library[index].is_exit() {
            return Some(index + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::asm::{self, call_fn, exit, ja, jmp_imm, ld_imm64, mov_imm, JmpOp, R0, R1};

    #[test]
    fn test_rewrite_constant() {
        let mut insns: Instructions = vec![ld_imm64(R0, 0).reference("ret"), exit()].into();

        Editor::new(&mut insns).rewrite_constant("ret", 42).unwrap();

        assert_eq!(insns[0].constant, 42);
        assert_eq!(insns[0].reference_label(), None);
    }

    #[test]
    fn test_rewrite_constant_full_range() {
        let mut insns: Instructions = vec![ld_imm64(R0, 0).reference("ret"), exit()].into();

        Editor::new(&mut insns)
            .rewrite_constant("ret", u64::MAX)
            .unwrap();

        assert_eq!(insns[0].constant, -1);
    }

    #[test]
    fn test_rewrite_missing_symbol() {
        let mut insns: Instructions = vec![ld_imm64(R0, 0).reference("ret"), exit()].into();

        assert_matches!(
            Editor::new(&mut insns).rewrite_constant("other", 1),
            Err(EditError::MissingSymbol { symbol }) if symbol == "other"
        );
    }

    #[test]
    fn test_rewrite_requires_load() {
        let mut insns: Instructions = vec![mov_imm(R0, 0).reference("ret"), exit()].into();

        assert_matches!(
            Editor::new(&mut insns).rewrite_constant("ret", 1),
            Err(EditError::ExpectedLoad64 { .. })
        );
    }

    #[test]
    fn test_rewrite_map_fd() {
        let mut insns: Instructions = vec![
            ld_imm64(R1, 0).reference("my_map"),
            ld_imm64(R1, 0).reference("my_map"),
            exit(),
        ]
        .into();

        Editor::new(&mut insns).rewrite_map_fd("my_map", 4).unwrap();

        for ins in insns.iter().take(2) {
            assert_eq!(ins.src.0, asm::PSEUDO_MAP_FD);
            assert_eq!(ins.constant, 4);
            assert_eq!(ins.reference_label(), None);
        }
    }

    #[test]
    fn test_rewrite_preserves_jump_offsets() {
        let mut insns: Instructions = vec![
            jmp_imm(JmpOp::Eq, R0, 0, 3),
            ld_imm64(R0, 0).reference("ret"),
            ja(-4),
            exit(),
        ]
        .into();
        let offsets: Vec<i16> = insns.iter().map(|ins| ins.offset).collect();
        let slots = insns.slot_len();

        Editor::new(&mut insns).rewrite_constant("ret", 7).unwrap();

        assert_eq!(insns.iter().map(|ins| ins.offset).collect::<Vec<_>>(), offsets);
        assert_eq!(insns.slot_len(), slots);
    }

    #[test]
    fn test_link() {
        let mut insns: Instructions = vec![call_fn(-1).reference("my_func"), exit()].into();
        let library: Instructions =
            vec![ld_imm64(R0, 1337).symbol("my_func"), exit()].into();

        Editor::new(&mut insns).link(&library).unwrap();

        assert_eq!(insns.len(), 4);
        // call at slot 0, sub-program appended at slot 2: imm = 2 - (0 + 1)
        assert_eq!(insns[0].constant, 1);
        assert_eq!(insns[0].reference_label(), None);
        assert_eq!(insns[2].constant, 1337);
    }

    #[test]
    fn test_link_shares_appended_copy() {
        let mut insns: Instructions = vec![
            call_fn(-1).reference("my_func"),
            call_fn(-1).reference("my_func"),
            exit(),
        ]
        .into();
        let library: Instructions = vec![mov_imm(R0, 1).symbol("my_func"), exit()].into();

        Editor::new(&mut insns).link(&library).unwrap();

        assert_eq!(insns.len(), 5);
        // both call sites point at the single copy appended at slot 3
        assert_eq!(insns[0].constant, 2);
        assert_eq!(insns[1].constant, 1);
    }

    #[test]
    fn test_link_idempotent() {
        let mut insns: Instructions = vec![call_fn(-1).reference("my_func"), exit()].into();
        let library: Instructions = vec![mov_imm(R0, 1).symbol("my_func"), exit()].into();

        Editor::new(&mut insns).link(&library).unwrap();
        let once = insns.clone();
        Editor::new(&mut insns).link(&library).unwrap();

        assert_eq!(insns, once);
    }

    #[test]
    fn test_link_nested_calls() {
        let mut insns: Instructions = vec![call_fn(-1).reference("outer"), exit()].into();
        let library: Instructions = vec![
            call_fn(-1).reference("inner").symbol("outer"),
            exit(),
            ld_imm64(R0, 2).symbol("inner"),
            exit(),
        ]
        .into();

        Editor::new(&mut insns).link(&library).unwrap();

        // primary (2 slots) + outer (2 slots) + inner (3 slots)
        assert_eq!(insns.slot_len(), 7);
        // outer appended at slot 2, inner at slot 4
        assert_eq!(insns[0].constant, 1);
        assert_eq!(insns[2].constant, 1);
        assert_eq!(insns[2].reference_label(), None);
    }

    #[test]
    fn test_link_cyclic_reference() {
        let mut insns: Instructions = vec![call_fn(-1).reference("a"), exit()].into();
        let library: Instructions = vec![
            call_fn(-1).reference("b").symbol("a"),
            exit(),
            call_fn(-1).reference("a").symbol("b"),
            exit(),
        ]
        .into();

        assert_matches!(
            Editor::new(&mut insns).link(&library),
            Err(EditError::CyclicReference { symbol }) if symbol == "a"
        );
    }

    #[test]
    fn test_link_leaves_unresolved_references() {
        let mut insns: Instructions = vec![call_fn(-1).reference("elsewhere"), exit()].into();
        let library: Instructions = vec![mov_imm(R0, 1).symbol("my_func"), exit()].into();

        Editor::new(&mut insns).link(&library).unwrap();

        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].reference_label(), Some("elsewhere"));
        assert_eq!(insns[0].constant, -1);
    }

    #[test]
    fn test_link_strict_undefined_symbol() {
        let mut insns: Instructions = vec![call_fn(-1).reference("elsewhere"), exit()].into();
        let library = Instructions::new();

        assert_matches!(
            Editor::new(&mut insns).link_strict(&library),
            Err(EditError::UndefinedSymbol { symbol }) if symbol == "elsewhere"
        );
    }

    #[test]
    fn test_link_missing_exit() {
        let mut insns: Instructions = vec![call_fn(-1).reference("a"), exit()].into();
        // `a` falls through into `b` without an exit of its own
        let library: Instructions = vec![
            mov_imm(R0, 1).symbol("a"),
            mov_imm(R0, 2).symbol("b"),
            exit(),
        ]
        .into();

        assert_matches!(
            Editor::new(&mut insns).link(&library),
            Err(EditError::MissingExit { symbol }) if symbol == "a"
        );
    }
}
