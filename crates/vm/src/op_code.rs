//! OpCode definitions for the Teal Virtual Machine.
//!
//! Opcodes are grouped by byte range: data movement, control flow,
//! concurrency, foreign calls, and diagnostics.

use crate::error::VmError;
use std::convert::TryFrom;
use std::fmt;

/// The instructions supported by the Teal VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Push a constant-pool entry onto the data stack.
    PUSH = 0x01,
    /// Push a small integer immediate.
    PUSHV = 0x02,
    /// Discard the top of the data stack.
    POP = 0x03,
    /// Duplicate the top of the data stack.
    DUP = 0x04,
    /// Pop a value and bind it to a name in the innermost scope.
    BIND = 0x05,
    /// Push the value bound to a name, innermost scope first.
    LOOKUP = 0x06,

    /// Unconditional jump to an absolute code offset.
    JUMP = 0x10,
    /// Pop; jump to an absolute code offset if the value is falsy.
    JUMPF = 0x11,
    /// Pop a callable; push a return frame and enter its body.
    CALL = 0x12,
    /// Return from the current frame, or terminate the thread if none.
    RET = 0x13,
    /// Terminate the thread; a future return value chains instead of
    /// resolving.
    MRETURN = 0x14,

    /// Pop a callable and its arguments; run them on a fresh thread and
    /// push a future for the result.
    FORK = 0x20,
    /// Suspend until the future on top of the stack resolves.
    WAIT = 0x21,

    /// Invoke a host-provided function synchronously.
    FCALL = 0x30,

    /// Append the top of the stack to the thread's stdout buffer.
    PRINT = 0x40,

    /// Do nothing.
    NOP = 0x50,
    /// Abort the thread with a fatal error.
    HALT = 0x51,
}

/// The operand layout carried by an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand.
    None,
    /// A constant-pool index.
    Const,
    /// A signed integer immediate.
    Imm,
    /// An absolute code offset.
    Target,
    /// An argument count.
    Argc,
    /// A constant-pool index naming a binding.
    Name,
    /// A constant-pool name index plus an argument count.
    NameArgc,
}

impl OpCode {
    /// Returns the operand layout for this opcode.
    pub fn operand_kind(self) -> OperandKind {
        match self {
            OpCode::PUSH => OperandKind::Const,
            OpCode::PUSHV => OperandKind::Imm,
            OpCode::BIND | OpCode::LOOKUP => OperandKind::Name,
            OpCode::JUMP | OpCode::JUMPF => OperandKind::Target,
            OpCode::CALL | OpCode::FORK => OperandKind::Argc,
            OpCode::FCALL => OperandKind::NameArgc,
            OpCode::POP
            | OpCode::DUP
            | OpCode::RET
            | OpCode::MRETURN
            | OpCode::WAIT
            | OpCode::PRINT
            | OpCode::NOP
            | OpCode::HALT => OperandKind::None,
        }
    }

    /// Returns the mnemonic for this opcode.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::PUSH => "PUSH",
            OpCode::PUSHV => "PUSHV",
            OpCode::POP => "POP",
            OpCode::DUP => "DUP",
            OpCode::BIND => "BIND",
            OpCode::LOOKUP => "LOOKUP",
            OpCode::JUMP => "JUMP",
            OpCode::JUMPF => "JUMPF",
            OpCode::CALL => "CALL",
            OpCode::RET => "RET",
            OpCode::MRETURN => "MRETURN",
            OpCode::FORK => "FORK",
            OpCode::WAIT => "WAIT",
            OpCode::FCALL => "FCALL",
            OpCode::PRINT => "PRINT",
            OpCode::NOP => "NOP",
            OpCode::HALT => "HALT",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

impl TryFrom<u8> for OpCode {
    type Error = VmError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(OpCode::PUSH),
            0x02 => Ok(OpCode::PUSHV),
            0x03 => Ok(OpCode::POP),
            0x04 => Ok(OpCode::DUP),
            0x05 => Ok(OpCode::BIND),
            0x06 => Ok(OpCode::LOOKUP),
            0x10 => Ok(OpCode::JUMP),
            0x11 => Ok(OpCode::JUMPF),
            0x12 => Ok(OpCode::CALL),
            0x13 => Ok(OpCode::RET),
            0x14 => Ok(OpCode::MRETURN),
            0x20 => Ok(OpCode::FORK),
            0x21 => Ok(OpCode::WAIT),
            0x30 => Ok(OpCode::FCALL),
            0x40 => Ok(OpCode::PRINT),
            0x50 => Ok(OpCode::NOP),
            0x51 => Ok(OpCode::HALT),
            other => Err(VmError::invalid_opcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for op in [
            OpCode::PUSH,
            OpCode::PUSHV,
            OpCode::POP,
            OpCode::DUP,
            OpCode::BIND,
            OpCode::LOOKUP,
            OpCode::JUMP,
            OpCode::JUMPF,
            OpCode::CALL,
            OpCode::RET,
            OpCode::MRETURN,
            OpCode::FORK,
            OpCode::WAIT,
            OpCode::FCALL,
            OpCode::PRINT,
            OpCode::NOP,
            OpCode::HALT,
        ] {
            assert_eq!(OpCode::try_from(op as u8).unwrap(), op);
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(matches!(
            OpCode::try_from(0xff),
            Err(VmError::InvalidOpCode { opcode: 0xff })
        ));
    }

    #[test]
    fn test_operand_kinds() {
        assert_eq!(OpCode::PUSH.operand_kind(), OperandKind::Const);
        assert_eq!(OpCode::FCALL.operand_kind(), OperandKind::NameArgc);
        assert_eq!(OpCode::WAIT.operand_kind(), OperandKind::None);
    }
}
