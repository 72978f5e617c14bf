//! Bytecode virtual machine for the Teal concurrent language.
//!
//! Teal programs compile to an immutable [`Executable`]: a code vector,
//! a constant pool, and a symbol table. The [`Machine`] interprets one
//! thread of one session at a time, suspending at futures so the
//! surrounding runtime can park the thread's [`ThreadState`] in durable
//! storage and resume it on any worker.
//!
//! The crate deliberately knows nothing about sessions, storage, or
//! dispatch; those arrive through the [`MachineHost`] capability.

pub mod binary;
pub mod builder;
pub mod error;
pub mod executable;
pub mod foreign;
pub mod instruction;
pub mod limits;
pub mod machine;
pub mod op_code;
pub mod thread_state;
pub mod value;

pub use builder::ExecutableBuilder;
pub use error::{VmError, VmResult};
pub use executable::{Executable, FunctionEntry, FILE_EXT};
pub use foreign::{ForeignDescriptor, ForeignMethod, ForeignRegistry};
pub use instruction::{Instruction, Operand};
pub use limits::ExecutionLimits;
pub use machine::{CycleArtifacts, CycleOutcome, Machine, MachineHost, WaitResult};
pub use op_code::{OpCode, OperandKind};
pub use thread_state::{Frame, ThreadState};
pub use value::{FutureId, ThreadId, Value};
