//! The compiler capability.
//!
//! The language frontend lives outside this crate; the runtime reaches
//! it only through this trait, and only to honour entry-API requests
//! that carry source code. Embedders without a frontend construct
//! executables programmatically with [`teal_vm::ExecutableBuilder`].

use crate::error::CompileError;
use teal_vm::Executable;

/// Compiles Teal source text into an executable.
pub trait CodeCompiler: Send + Sync {
    /// Compiles `source`, returning diagnostics on failure.
    fn compile(&self, source: &str) -> Result<Executable, CompileError>;
}
