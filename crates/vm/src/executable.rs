//! Compiled executables for the Teal Virtual Machine.
//!
//! An [`Executable`] is an immutable compiled program: an ordered code
//! vector, a constant pool, and a symbol table mapping function names to
//! code offsets and arities. The binary serialisation is deterministic
//! (identical inputs produce identical bytes), so content hashes are
//! stable across runs.

use crate::binary::{BinaryWriter, MemoryReader};
use crate::error::{VmError, VmResult};
use crate::instruction::Instruction;
use crate::value::Value;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// Magic bytes at the head of a serialised executable.
pub const MAGIC: &[u8; 6] = b"TLEXE\0";

/// Current serialisation format version.
pub const FORMAT_VERSION: u16 = 1;

/// Conventional file extension for serialised executables.
pub const FILE_EXT: &str = "tlx";

/// A function entry in the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    /// Code offset of the function's first instruction.
    pub offset: u32,

    /// Number of parameters the function takes.
    pub arity: u8,
}

/// An immutable compiled Teal program.
#[derive(Debug, Clone, PartialEq)]
pub struct Executable {
    code: Vec<Instruction>,
    constants: Vec<Value>,
    symbols: IndexMap<String, FunctionEntry>,
}

impl Executable {
    /// Assembles an executable from its parts, validating symbol offsets.
    pub fn new(
        code: Vec<Instruction>,
        constants: Vec<Value>,
        symbols: IndexMap<String, FunctionEntry>,
    ) -> VmResult<Self> {
        for (name, entry) in &symbols {
            if entry.offset as usize > code.len() {
                return Err(VmError::decode(format!(
                    "symbol {name} points past end of code: {} > {}",
                    entry.offset,
                    code.len()
                )));
            }
        }
        Ok(Self {
            code,
            constants,
            symbols,
        })
    }

    /// Returns the instruction at `ip`, if in range.
    pub fn instruction(&self, ip: usize) -> Option<&Instruction> {
        self.code.get(ip)
    }

    /// Returns the length of the code vector.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Returns the constant at the given pool index.
    pub fn constant(&self, index: usize) -> VmResult<&Value> {
        self.constants.get(index).ok_or(VmError::BadConstant {
            index,
            size: self.constants.len(),
        })
    }

    /// Resolves a constant-pool entry to a name (symbol or string).
    pub fn constant_name(&self, index: usize) -> VmResult<&str> {
        match self.constant(index)? {
            Value::Symbol(s) | Value::Str(s) => Ok(s),
            other => Err(VmError::type_error(
                "symbol".to_string(),
                other.type_name().to_string(),
            )),
        }
    }

    /// Looks up a function by name.
    pub fn function(&self, name: &str) -> Option<FunctionEntry> {
        self.symbols.get(name).copied()
    }

    /// Returns the symbol table, in insertion order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, FunctionEntry)> {
        self.symbols.iter().map(|(name, entry)| (name.as_str(), *entry))
    }

    /// Serialises the executable to its deterministic binary form.
    pub fn serialise(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        writer.write_bytes(MAGIC);
        writer.write_u16(FORMAT_VERSION);

        writer.write_u32(self.symbols.len() as u32);
        for (name, entry) in &self.symbols {
            writer.write_string(name);
            writer.write_u32(entry.offset);
            writer.write_u8(entry.arity);
        }

        writer.write_u32(self.constants.len() as u32);
        for constant in &self.constants {
            write_value(&mut writer, constant);
        }

        writer.write_u32(self.code.len() as u32);
        for instruction in &self.code {
            instruction.encode(&mut writer);
        }

        writer.into_bytes()
    }

    /// Deserialises an executable, verifying magic and version.
    pub fn deserialise(bytes: &[u8]) -> VmResult<Self> {
        let mut reader = MemoryReader::new(bytes);

        let magic = reader.read_bytes(MAGIC.len())?;
        if magic != MAGIC {
            return Err(VmError::decode("bad magic: not a Teal executable"));
        }
        let version = reader.read_u16()?;
        if version != FORMAT_VERSION {
            return Err(VmError::decode(format!(
                "unsupported executable version: {version}"
            )));
        }

        let symbol_count = reader.read_u32()? as usize;
        let mut symbols = IndexMap::with_capacity(symbol_count);
        for _ in 0..symbol_count {
            let name = reader.read_string()?;
            let offset = reader.read_u32()?;
            let arity = reader.read_u8()?;
            symbols.insert(name, FunctionEntry { offset, arity });
        }

        let constant_count = reader.read_u32()? as usize;
        let mut constants = Vec::with_capacity(constant_count);
        for _ in 0..constant_count {
            constants.push(read_value(&mut reader)?);
        }

        let code_count = reader.read_u32()? as usize;
        let mut code = Vec::with_capacity(code_count);
        for _ in 0..code_count {
            code.push(Instruction::decode(&mut reader)?);
        }

        if reader.remaining() != 0 {
            return Err(VmError::decode(format!(
                "{} trailing bytes after executable",
                reader.remaining()
            )));
        }

        Self::new(code, constants, symbols)
    }

    /// Hex SHA-256 of the serialised form; used as the executable
    /// reference in persisted sessions.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.serialise());
        hex::encode(hasher.finalize())
    }
}

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_SYMBOL: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_FUNCTION: u8 = 7;
const TAG_FUTURE: u8 = 8;

fn write_value(writer: &mut BinaryWriter, value: &Value) {
    match value {
        Value::Nil => writer.write_u8(TAG_NIL),
        Value::Bool(b) => {
            writer.write_u8(TAG_BOOL);
            writer.write_u8(*b as u8);
        }
        Value::Int(n) => {
            writer.write_u8(TAG_INT);
            writer.write_i64(*n);
        }
        Value::Float(x) => {
            writer.write_u8(TAG_FLOAT);
            writer.write_f64(*x);
        }
        Value::Str(s) => {
            writer.write_u8(TAG_STR);
            writer.write_string(s);
        }
        Value::Symbol(s) => {
            writer.write_u8(TAG_SYMBOL);
            writer.write_string(s);
        }
        Value::List(items) => {
            writer.write_u8(TAG_LIST);
            writer.write_u32(items.len() as u32);
            for item in items {
                write_value(writer, item);
            }
        }
        Value::Function(name) => {
            writer.write_u8(TAG_FUNCTION);
            writer.write_string(name);
        }
        Value::Future(id) => {
            writer.write_u8(TAG_FUTURE);
            writer.write_u32(*id);
        }
    }
}

fn read_value(reader: &mut MemoryReader) -> VmResult<Value> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_BOOL => Ok(Value::Bool(reader.read_u8()? != 0)),
        TAG_INT => Ok(Value::Int(reader.read_i64()?)),
        TAG_FLOAT => Ok(Value::Float(reader.read_f64()?)),
        TAG_STR => Ok(Value::Str(reader.read_string()?)),
        TAG_SYMBOL => Ok(Value::Symbol(reader.read_string()?)),
        TAG_LIST => {
            let len = reader.read_u32()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_value(reader)?);
            }
            Ok(Value::List(items))
        }
        TAG_FUNCTION => Ok(Value::Function(reader.read_string()?)),
        TAG_FUTURE => Ok(Value::Future(reader.read_u32()?)),
        other => Err(VmError::decode(format!("unknown value tag: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Operand;
    use crate::op_code::OpCode;

    fn sample() -> Executable {
        let mut symbols = IndexMap::new();
        symbols.insert(
            "main".to_string(),
            FunctionEntry {
                offset: 0,
                arity: 0,
            },
        );
        Executable::new(
            vec![
                Instruction::new(OpCode::PUSH, Operand::Const(0)).unwrap(),
                Instruction::simple(OpCode::RET),
            ],
            vec![Value::Int(42), Value::Symbol("main".to_string())],
            symbols,
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let exe = sample();
        let bytes = exe.serialise();
        let decoded = Executable::deserialise(&bytes).unwrap();
        assert_eq!(decoded, exe);
    }

    #[test]
    fn test_deterministic() {
        let exe = sample();
        assert_eq!(exe.serialise(), sample().serialise());
        assert_eq!(exe.content_hash(), sample().content_hash());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().serialise();
        bytes[0] = b'X';
        assert!(matches!(
            Executable::deserialise(&bytes),
            Err(VmError::Decode { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().serialise();
        bytes.push(0);
        assert!(Executable::deserialise(&bytes).is_err());
    }

    #[test]
    fn test_symbol_offset_validated() {
        let mut symbols = IndexMap::new();
        symbols.insert(
            "main".to_string(),
            FunctionEntry {
                offset: 99,
                arity: 0,
            },
        );
        assert!(Executable::new(vec![], vec![], symbols).is_err());
    }
}
