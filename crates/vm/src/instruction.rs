//! Instruction representation and encoding for the Teal Virtual Machine.
//!
//! Instructions serialise as an opcode byte plus a fixed-width 8-byte
//! operand (two little-endian u32 fields), so the code vector has a
//! stable, deterministic layout.

use crate::binary::{BinaryWriter, MemoryReader};
use crate::error::{VmError, VmResult};
use crate::op_code::{OpCode, OperandKind};
use std::convert::TryFrom;
use std::fmt;

/// The decoded operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// No operand.
    None,
    /// A constant-pool index.
    Const(u32),
    /// A signed integer immediate.
    Imm(i32),
    /// An absolute code offset.
    Target(u32),
    /// An argument count.
    Argc(u8),
    /// A constant-pool index naming a binding.
    Name(u32),
    /// A constant-pool name index plus an argument count.
    NameArgc { name: u32, argc: u8 },
}

/// Represents an instruction in the Teal Virtual Machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The opcode of the instruction
    pub op: OpCode,

    /// The decoded operand
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction with no operand.
    pub fn simple(op: OpCode) -> Self {
        Self {
            op,
            operand: Operand::None,
        }
    }

    /// Creates an instruction, checking the operand matches the opcode's
    /// layout.
    pub fn new(op: OpCode, operand: Operand) -> VmResult<Self> {
        let ok = matches!(
            (op.operand_kind(), operand),
            (OperandKind::None, Operand::None)
                | (OperandKind::Const, Operand::Const(_))
                | (OperandKind::Imm, Operand::Imm(_))
                | (OperandKind::Target, Operand::Target(_))
                | (OperandKind::Argc, Operand::Argc(_))
                | (OperandKind::Name, Operand::Name(_))
                | (OperandKind::NameArgc, Operand::NameArgc { .. })
        );
        if !ok {
            return Err(VmError::decode(format!(
                "operand {operand:?} does not fit opcode {op}"
            )));
        }
        Ok(Self { op, operand })
    }

    /// Serialises the instruction: opcode byte plus two u32 operand words.
    pub fn encode(&self, writer: &mut BinaryWriter) {
        writer.write_u8(self.op as u8);
        let (a, b) = match self.operand {
            Operand::None => (0, 0),
            Operand::Const(idx) => (idx, 0),
            Operand::Imm(value) => (value as u32, 0),
            Operand::Target(target) => (target, 0),
            Operand::Argc(argc) => (argc as u32, 0),
            Operand::Name(name) => (name, 0),
            Operand::NameArgc { name, argc } => (name, argc as u32),
        };
        writer.write_u32(a);
        writer.write_u32(b);
    }

    /// Decodes one instruction from the reader.
    pub fn decode(reader: &mut MemoryReader) -> VmResult<Self> {
        let op = OpCode::try_from(reader.read_u8()?)?;
        let a = reader.read_u32()?;
        let b = reader.read_u32()?;
        let operand = match op.operand_kind() {
            OperandKind::None => Operand::None,
            OperandKind::Const => Operand::Const(a),
            OperandKind::Imm => Operand::Imm(a as i32),
            OperandKind::Target => Operand::Target(a),
            OperandKind::Argc => Operand::Argc(a as u8),
            OperandKind::Name => Operand::Name(a),
            OperandKind::NameArgc => Operand::NameArgc {
                name: a,
                argc: b as u8,
            },
        };
        Ok(Self { op, operand })
    }

    /// The encoded size of any instruction in bytes.
    pub const ENCODED_SIZE: usize = 9;
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.op),
            Operand::Const(idx) => write!(f, "{} #{idx}", self.op),
            Operand::Imm(value) => write!(f, "{} {value}", self.op),
            Operand::Target(target) => write!(f, "{} @{target}", self.op),
            Operand::Argc(argc) => write!(f, "{} {argc}", self.op),
            Operand::Name(name) => write!(f, "{} #{name}", self.op),
            Operand::NameArgc { name, argc } => write!(f, "{} #{name} {argc}", self.op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let instructions = [
            Instruction::simple(OpCode::WAIT),
            Instruction::new(OpCode::PUSH, Operand::Const(7)).unwrap(),
            Instruction::new(OpCode::PUSHV, Operand::Imm(-3)).unwrap(),
            Instruction::new(OpCode::JUMPF, Operand::Target(12)).unwrap(),
            Instruction::new(OpCode::FORK, Operand::Argc(2)).unwrap(),
            Instruction::new(OpCode::FCALL, Operand::NameArgc { name: 4, argc: 2 }).unwrap(),
        ];
        let mut writer = BinaryWriter::new();
        for instruction in &instructions {
            instruction.encode(&mut writer);
        }
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), instructions.len() * Instruction::ENCODED_SIZE);

        let mut reader = MemoryReader::new(&bytes);
        for expected in &instructions {
            assert_eq!(Instruction::decode(&mut reader).unwrap(), *expected);
        }
    }

    #[test]
    fn test_operand_mismatch() {
        assert!(Instruction::new(OpCode::WAIT, Operand::Const(1)).is_err());
        assert!(Instruction::new(OpCode::PUSH, Operand::None).is_err());
    }
}
