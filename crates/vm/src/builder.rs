//! Programmatic executable construction.
//!
//! This is the shape a compiler frontend emits: functions registered at
//! their code offsets, constants interned into the pool, and forward
//! jumps patched through named labels. Tests and embedders use it to
//! assemble programs without a parser.

use crate::error::{VmError, VmResult};
use crate::executable::{Executable, FunctionEntry};
use crate::instruction::{Instruction, Operand};
use crate::op_code::OpCode;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Helps construct Teal executables programmatically.
#[derive(Debug, Default)]
pub struct ExecutableBuilder {
    code: Vec<Instruction>,
    constants: Vec<Value>,
    symbols: IndexMap<String, FunctionEntry>,
    labels: HashMap<String, u32>,
    patches: Vec<(usize, String)>,
}

impl ExecutableBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function starting at the current code offset.
    pub fn function(&mut self, name: &str, arity: u8) -> &mut Self {
        self.symbols.insert(
            name.to_string(),
            FunctionEntry {
                offset: self.code.len() as u32,
                arity,
            },
        );
        self
    }

    /// Interns a constant, reusing an existing pool slot when equal.
    pub fn constant(&mut self, value: Value) -> u32 {
        if let Some(index) = self.constants.iter().position(|c| *c == value) {
            return index as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn emit(&mut self, op: OpCode, operand: Operand) -> &mut Self {
        self.code.push(Instruction { op, operand });
        self
    }

    /// Emits a PUSH of an interned constant.
    pub fn push(&mut self, value: Value) -> &mut Self {
        let index = self.constant(value);
        self.emit(OpCode::PUSH, Operand::Const(index))
    }

    /// Emits a PUSHV small-integer immediate.
    pub fn pushv(&mut self, value: i32) -> &mut Self {
        self.emit(OpCode::PUSHV, Operand::Imm(value))
    }

    /// Emits a POP.
    pub fn pop(&mut self) -> &mut Self {
        self.emit(OpCode::POP, Operand::None)
    }

    /// Emits a DUP.
    pub fn dup(&mut self) -> &mut Self {
        self.emit(OpCode::DUP, Operand::None)
    }

    /// Emits a BIND of the given name.
    pub fn bind(&mut self, name: &str) -> &mut Self {
        let index = self.constant(Value::Symbol(name.to_string()));
        self.emit(OpCode::BIND, Operand::Name(index))
    }

    /// Emits a LOOKUP of the given name.
    pub fn lookup(&mut self, name: &str) -> &mut Self {
        let index = self.constant(Value::Symbol(name.to_string()));
        self.emit(OpCode::LOOKUP, Operand::Name(index))
    }

    /// Emits a CALL with the given argument count. The callable is
    /// expected on top of the stack.
    pub fn call(&mut self, argc: u8) -> &mut Self {
        self.emit(OpCode::CALL, Operand::Argc(argc))
    }

    /// Emits a PUSH of a function reference followed by a CALL.
    pub fn call_fn(&mut self, name: &str, argc: u8) -> &mut Self {
        self.push(Value::Function(name.to_string()));
        self.call(argc)
    }

    /// Emits a RET.
    pub fn ret(&mut self) -> &mut Self {
        self.emit(OpCode::RET, Operand::None)
    }

    /// Emits an MRETURN.
    pub fn mreturn(&mut self) -> &mut Self {
        self.emit(OpCode::MRETURN, Operand::None)
    }

    /// Emits a FORK with the given argument count. The callable is
    /// expected on top of the stack.
    pub fn fork(&mut self, argc: u8) -> &mut Self {
        self.emit(OpCode::FORK, Operand::Argc(argc))
    }

    /// Emits a PUSH of a function reference followed by a FORK.
    pub fn fork_fn(&mut self, name: &str, argc: u8) -> &mut Self {
        self.push(Value::Function(name.to_string()));
        self.fork(argc)
    }

    /// Emits a WAIT.
    pub fn wait(&mut self) -> &mut Self {
        self.emit(OpCode::WAIT, Operand::None)
    }

    /// Emits an FCALL of the named foreign function.
    pub fn fcall(&mut self, name: &str, argc: u8) -> &mut Self {
        let index = self.constant(Value::Symbol(name.to_string()));
        self.emit(OpCode::FCALL, Operand::NameArgc { name: index, argc })
    }

    /// Emits a PRINT.
    pub fn print(&mut self) -> &mut Self {
        self.emit(OpCode::PRINT, Operand::None)
    }

    /// Emits a NOP.
    pub fn nop(&mut self) -> &mut Self {
        self.emit(OpCode::NOP, Operand::None)
    }

    /// Emits a HALT.
    pub fn halt(&mut self) -> &mut Self {
        self.emit(OpCode::HALT, Operand::None)
    }

    /// Places a label at the current code offset.
    pub fn label(&mut self, name: &str) -> &mut Self {
        self.labels.insert(name.to_string(), self.code.len() as u32);
        self
    }

    /// Emits a JUMP to a label (which may be defined later).
    pub fn jump(&mut self, label: &str) -> &mut Self {
        self.patches.push((self.code.len(), label.to_string()));
        self.emit(OpCode::JUMP, Operand::Target(0))
    }

    /// Emits a JUMPF to a label (which may be defined later).
    pub fn jumpf(&mut self, label: &str) -> &mut Self {
        self.patches.push((self.code.len(), label.to_string()));
        self.emit(OpCode::JUMPF, Operand::Target(0))
    }

    /// Resolves labels and produces the executable.
    pub fn finish(mut self) -> VmResult<Executable> {
        for (index, label) in &self.patches {
            let target = self
                .labels
                .get(label)
                .copied()
                .ok_or_else(|| VmError::decode(format!("undefined label: {label}")))?;
            self.code[*index].operand = Operand::Target(target);
        }
        Executable::new(self.code, self.constants, self.symbols)
    }
}
