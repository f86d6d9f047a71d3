//! eBPF instructions and their binary encoding.
//!
//! Instructions are held in logical form: a 64-bit immediate load occupies
//! two slots on the wire but is a single [`Instruction`] in memory, with the
//! full constant in [`Instruction::constant`]. All offset arithmetic (jumps,
//! calls) is done in wire slots, the same unit the kernel uses.

use std::fmt;
use std::ops::{Deref, DerefMut};

use object::Endianness;
use thiserror::Error;

/// The size in bytes of one wire slot.
pub const INSTRUCTION_SIZE: usize = 8;

/// Opcode of the first slot of a 64-bit immediate load.
pub const LD_DW_IMM: u8 = 0x18; // BPF_LD | BPF_DW | BPF_IMM
/// Opcode of a call.
pub const CALL: u8 = 0x85; // BPF_JMP | BPF_CALL
/// Opcode of an exit.
pub const EXIT: u8 = 0x95; // BPF_JMP | BPF_EXIT

const BPF_ALU64: u8 = 0x07;
const BPF_JMP: u8 = 0x05;
const BPF_X: u8 = 0x08;

/// Source register value marking the immediate of a 64-bit load as a map
/// file descriptor.
pub const PSEUDO_MAP_FD: u8 = 1;
/// Source register value marking a call as a bpf-to-bpf call. The immediate
/// holds the wire-slot distance to the callee.
pub const PSEUDO_CALL: u8 = 1;

/// An eBPF register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Register(pub u8);

pub const R0: Register = Register(0);
pub const R1: Register = Register(1);
pub const R2: Register = Register(2);
pub const R3: Register = Register(3);
pub const R4: Register = Register(4);
pub const R5: Register = Register(5);
pub const R6: Register = Register(6);
pub const R7: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
/// The read-only frame pointer.
pub const R10: Register = Register(10);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// ALU operations usable with [`alu64_imm`] and [`alu64_reg`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AluOp {
    Add = 0x00,
    Sub = 0x10,
    Mul = 0x20,
    Div = 0x30,
    Or = 0x40,
    And = 0x50,
    Lsh = 0x60,
    Rsh = 0x70,
    Neg = 0x80,
    Mod = 0x90,
    Xor = 0xa0,
    Mov = 0xb0,
}

/// Conditional jump operations usable with [`jmp_imm`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JmpOp {
    Eq = 0x10,
    Gt = 0x20,
    Ge = 0x30,
    Set = 0x40,
    Ne = 0x50,
    SGt = 0x60,
    SGe = 0x70,
}

/// A single logical eBPF instruction.
///
/// Next to the wire fields, an instruction carries two optional labels:
/// `reference` names an external symbol whose resolved value should
/// overwrite the constant, `symbol` names the instruction as the entry
/// point of a sub-program. Labels never change the wire bytes and survive
/// every mutation until explicitly cleared by the editor.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: u8,
    pub dst: Register,
    pub src: Register,
    pub offset: i16,
    pub constant: i64,
    pub(crate) reference: Option<String>,
    pub(crate) symbol: Option<String>,
}

impl Instruction {
    /// Annotates the instruction with a reference to an external symbol.
    pub fn reference(mut self, symbol: &str) -> Instruction {
        self.reference = Some(symbol.to_string());
        self
    }

    /// Names the instruction as the entry point of a sub-program.
    pub fn symbol(mut self, name: &str) -> Instruction {
        self.symbol = Some(name.to_string());
        self
    }

    pub fn reference_label(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn symbol_label(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    /// The number of wire slots the instruction occupies, 1 or 2.
    pub fn slots(&self) -> usize {
        if self.opcode == LD_DW_IMM {
            2
        } else {
            1
        }
    }

    pub fn is_ld_imm64(&self) -> bool {
        self.opcode == LD_DW_IMM
    }

    pub fn is_exit(&self) -> bool {
        self.opcode == EXIT
    }

    /// Returns true for bpf-to-bpf calls, where the immediate is a
    /// wire-slot displacement rather than a helper number.
    pub fn is_pseudo_call(&self) -> bool {
        self.opcode == CALL && self.src.0 == PSEUDO_CALL
    }

    fn read_slot(data: &[u8], endianness: Endianness) -> Instruction {
        let (dst, src) = unpack_registers(data[1], endianness);
        let (offset, constant) = match endianness {
            Endianness::Little => (
                i16::from_le_bytes([data[2], data[3]]),
                i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            ),
            Endianness::Big => (
                i16::from_be_bytes([data[2], data[3]]),
                i32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ),
        };
        Instruction {
            opcode: data[0],
            dst: Register(dst),
            src: Register(src),
            offset,
            constant: constant as i64,
            reference: None,
            symbol: None,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        if self.opcode == LD_DW_IMM {
            let value = self.constant as u64;
            self.write_slot(buf, (value & 0xFFFF_FFFF) as u32 as i32);
            buf.push(0);
            buf.push(0);
            buf.extend_from_slice(&0i16.to_ne_bytes());
            buf.extend_from_slice(&(((value >> 32) as u32 as i32).to_ne_bytes()));
        } else {
            self.write_slot(buf, self.constant as i32);
        }
    }

    fn write_slot(&self, buf: &mut Vec<u8>, constant: i32) {
        buf.push(self.opcode);
        buf.push(pack_registers(self.dst.0, self.src.0));
        buf.extend_from_slice(&self.offset.to_ne_bytes());
        buf.extend_from_slice(&constant.to_ne_bytes());
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            LD_DW_IMM => write!(f, "LdImmDW dst: {} imm: {}", self.dst, self.constant)?,
            CALL => write!(f, "Call imm: {}", self.constant)?,
            EXIT => write!(f, "Exit")?,
            op => write!(
                f,
                "Op({:#04x}) dst: {} src: {} off: {} imm: {}",
                op, self.dst, self.src, self.offset, self.constant
            )?,
        }
        if let Some(reference) = &self.reference {
            write!(f, " [ref: {reference}]")?;
        }
        if let Some(symbol) = &self.symbol {
            write!(f, " [sym: {symbol}]")?;
        }
        Ok(())
    }
}

// The dst and src registers share one byte. The kernel declares them as bit
// fields, so their position depends on the byte order.
fn unpack_registers(byte: u8, endianness: Endianness) -> (u8, u8) {
    match endianness {
        Endianness::Little => (byte & 0x0f, byte >> 4),
        Endianness::Big => (byte >> 4, byte & 0x0f),
    }
}

fn pack_registers(dst: u8, src: u8) -> u8 {
    if cfg!(target_endian = "little") {
        (src << 4) | (dst & 0x0f)
    } else {
        (dst << 4) | (src & 0x0f)
    }
}

/// The error type returned when an instruction stream cannot be decoded.
#[derive(Debug, Clone, Error)]
pub enum AsmError {
    #[error("truncated instruction at offset {offset}")]
    TruncatedInstruction { offset: usize },

    #[error("64-bit load at offset {offset} is missing its second slot")]
    TruncatedLoad64 { offset: usize },

    #[error("64-bit load at offset {offset} is followed by a slot with non-zero opcode")]
    InvalidLoad64 { offset: usize },
}

/// An ordered sequence of logical instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instructions(Vec<Instruction>);

impl Instructions {
    pub fn new() -> Instructions {
        Instructions(Vec::new())
    }

    /// Decodes `data` using the given byte order.
    ///
    /// Returns the decoded instructions and the number of bytes consumed.
    pub fn read(data: &[u8], endianness: Endianness) -> Result<(Instructions, usize), AsmError> {
        let mut instructions = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            if data.len() - offset < INSTRUCTION_SIZE {
                return Err(AsmError::TruncatedInstruction { offset });
            }
            let mut ins = Instruction::read_slot(&data[offset..offset + INSTRUCTION_SIZE], endianness);
            offset += INSTRUCTION_SIZE;
            if ins.opcode == LD_DW_IMM {
                if data.len() - offset < INSTRUCTION_SIZE {
                    return Err(AsmError::TruncatedLoad64 { offset });
                }
                let pseudo = &data[offset..offset + INSTRUCTION_SIZE];
                if pseudo[0] != 0 {
                    return Err(AsmError::InvalidLoad64 { offset });
                }
                let high = match endianness {
                    Endianness::Little => {
                        u32::from_le_bytes([pseudo[4], pseudo[5], pseudo[6], pseudo[7]])
                    }
                    Endianness::Big => {
                        u32::from_be_bytes([pseudo[4], pseudo[5], pseudo[6], pseudo[7]])
                    }
                };
                let low = ins.constant as u32;
                ins.constant = (((high as u64) << 32) | low as u64) as i64;
                offset += INSTRUCTION_SIZE;
            }
            instructions.push(ins);
        }
        Ok((Instructions(instructions), offset))
    }

    /// Encodes the instructions in host byte order, the form the kernel
    /// consumes.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.slot_len() * INSTRUCTION_SIZE);
        for ins in &self.0 {
            ins.write(&mut buf);
        }
        buf
    }

    /// The total number of wire slots, the unit of all jump and call
    /// arithmetic.
    pub fn slot_len(&self) -> usize {
        self.0.iter().map(Instruction::slots).sum()
    }

    /// Maps a wire-slot index back to a logical index. Returns `None` when
    /// the slot is out of range or points into the second half of a 64-bit
    /// load.
    pub(crate) fn logical_at_slot(&self, slot: usize) -> Option<usize> {
        let mut current = 0;
        for (index, ins) in self.0.iter().enumerate() {
            if current == slot {
                return Some(index);
            }
            if current > slot {
                break;
            }
            current += ins.slots();
        }
        None
    }
}

impl Deref for Instructions {
    type Target = Vec<Instruction>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Instructions {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Instruction>> for Instructions {
    fn from(instructions: Vec<Instruction>) -> Instructions {
        Instructions(instructions)
    }
}

impl FromIterator<Instruction> for Instructions {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Instructions {
        Instructions(iter.into_iter().collect())
    }
}

impl fmt::Display for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut slot = 0;
        for ins in &self.0 {
            writeln!(f, "{slot:>4}: {ins}")?;
            slot += ins.slots();
        }
        Ok(())
    }
}

fn instruction(opcode: u8, dst: Register, src: Register, offset: i16, constant: i64) -> Instruction {
    Instruction {
        opcode,
        dst,
        src,
        offset,
        constant,
        reference: None,
        symbol: None,
    }
}

/// Loads a 64-bit constant into `dst`.
pub fn ld_imm64(dst: Register, value: i64) -> Instruction {
    instruction(LD_DW_IMM, dst, Register(0), 0, value)
}

/// Loads a map file descriptor into `dst`.
pub fn ld_map_fd(dst: Register, fd: i32) -> Instruction {
    instruction(LD_DW_IMM, dst, Register(PSEUDO_MAP_FD), 0, fd as i64)
}

/// A 64-bit ALU operation with an immediate operand.
pub fn alu64_imm(op: AluOp, dst: Register, value: i32) -> Instruction {
    instruction(BPF_ALU64 | op as u8, dst, Register(0), 0, value as i64)
}

/// A 64-bit ALU operation with a register operand.
pub fn alu64_reg(op: AluOp, dst: Register, src: Register) -> Instruction {
    instruction(BPF_ALU64 | op as u8 | BPF_X, dst, src, 0, 0)
}

pub fn mov_imm(dst: Register, value: i32) -> Instruction {
    alu64_imm(AluOp::Mov, dst, value)
}

pub fn mov_reg(dst: Register, src: Register) -> Instruction {
    alu64_reg(AluOp::Mov, dst, src)
}

/// An unconditional jump by `offset` wire slots.
pub fn ja(offset: i16) -> Instruction {
    instruction(BPF_JMP, Register(0), Register(0), offset, 0)
}

/// A conditional jump comparing `dst` against an immediate.
pub fn jmp_imm(op: JmpOp, dst: Register, value: i32, offset: i16) -> Instruction {
    instruction(BPF_JMP | op as u8, dst, Register(0), offset, value as i64)
}

/// A call to the numbered kernel helper.
pub fn call(helper: i32) -> Instruction {
    instruction(CALL, Register(0), Register(0), 0, helper as i64)
}

/// A bpf-to-bpf call. `target` is the wire-slot displacement to the callee,
/// or -1 when the callee is named by a reference label and resolved later.
pub fn call_fn(target: i32) -> Instruction {
    instruction(CALL, Register(0), Register(PSEUDO_CALL), 0, target as i64)
}

pub fn exit() -> Instruction {
    instruction(EXIT, Register(0), Register(0), 0, 0)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn host_endianness() -> Endianness {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    #[test]
    fn test_decode_ld_imm64() {
        // r1 = i32::MIN - 1
        let data = [
            0x18, 0x01, 0x00, 0x00, 0xff, 0xff, 0xff, 0x7f, //
            0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff,
        ];

        let (insns, read) = Instructions::read(&data, Endianness::Little).unwrap();
        assert_eq!(read, 16);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].constant, i32::MIN as i64 - 1);
        assert_eq!(insns[0].dst, R1);
        assert_eq!(insns.slot_len(), 2);
    }

    #[test]
    fn test_decode_truncated() {
        assert_matches!(
            Instructions::read(&[0xb7; 7], Endianness::Little),
            Err(AsmError::TruncatedInstruction { offset: 0 })
        );

        let mut data = vec![0xb7, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[0x18; 3]);
        assert_matches!(
            Instructions::read(&data, Endianness::Little),
            Err(AsmError::TruncatedInstruction { offset: 8 })
        );

        // first half of a 64-bit load with nothing after it
        let data = [0x18, 0x01, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00];
        assert_matches!(
            Instructions::read(&data, Endianness::Little),
            Err(AsmError::TruncatedLoad64 { offset: 8 })
        );
    }

    #[test]
    fn test_decode_invalid_pseudo_slot() {
        let data = [
            0x18, 0x01, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, //
            0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_matches!(
            Instructions::read(&data, Endianness::Little),
            Err(AsmError::InvalidLoad64 { offset: 8 })
        );
    }

    #[test]
    fn test_round_trip() {
        let insns: Instructions = vec![
            ld_imm64(R0, i64::MIN),
            ld_imm64(R1, i64::MAX),
            ld_imm64(R2, -1),
            ld_map_fd(R3, 42),
            mov_imm(R4, -42),
            mov_reg(R5, R4),
            jmp_imm(JmpOp::Eq, R0, 0, 2),
            ja(-4),
            call(12),
            exit(),
        ]
        .into();

        let bytes = insns.marshal();
        assert_eq!(bytes.len(), insns.slot_len() * INSTRUCTION_SIZE);

        let (decoded, read) = Instructions::read(&bytes, host_endianness()).unwrap();
        assert_eq!(read, bytes.len());
        assert_eq!(decoded, insns);
    }

    #[test]
    fn test_labels_do_not_change_bytes() {
        let plain: Instructions = vec![ld_imm64(R0, 1), exit()].into();
        let labeled: Instructions = vec![
            ld_imm64(R0, 1).reference("value").symbol("entry"),
            exit(),
        ]
        .into();

        assert_eq!(plain.marshal(), labeled.marshal());
        assert_eq!(labeled[0].reference_label(), Some("value"));
        assert_eq!(labeled[0].symbol_label(), Some("entry"));
    }

    #[test]
    fn test_logical_at_slot() {
        let insns: Instructions = vec![ld_imm64(R0, 0), exit(), ld_imm64(R1, 1), exit()].into();

        assert_eq!(insns.slot_len(), 6);
        assert_eq!(insns.logical_at_slot(0), Some(0));
        // slot 1 is the pseudo half of the first load
        assert_eq!(insns.logical_at_slot(1), None);
        assert_eq!(insns.logical_at_slot(2), Some(1));
        assert_eq!(insns.logical_at_slot(3), Some(2));
        assert_eq!(insns.logical_at_slot(5), Some(3));
        assert_eq!(insns.logical_at_slot(6), None);
    }

    #[test]
    fn test_builders() {
        assert_eq!(exit().opcode, 0x95);
        assert_eq!(call(1).opcode, 0x85);
        assert_eq!(mov_imm(R0, 0).opcode, 0xb7);
        assert_eq!(mov_reg(R0, R1).opcode, 0xbf);
        assert!(call_fn(-1).is_pseudo_call());
        assert!(!call(1).is_pseudo_call());
        assert_eq!(ld_map_fd(R1, 7).src.0, PSEUDO_MAP_FD);
    }
}
