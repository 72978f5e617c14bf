//! Distributed session runtime for the Teal virtual machine.
//!
//! A session is one running program: its executable, threads, and
//! futures, all persisted through a [`SessionStore`] so that any worker
//! can hydrate a paused thread, run it to its next suspension point,
//! and commit the result. The [`DataController`] mediates durable state
//! under a per-session advisory lock; [`Invoker`] implementations fan
//! threads out across workers; [`Runtime`] ties it together behind the
//! worker entry points.
//!
//! ```no_run
//! use std::sync::Arc;
//! use teal_runtime::{MemoryStore, Runtime, RuntimeConfig, SerialInvoker};
//! use teal_vm::ExecutableBuilder;
//!
//! let store = Arc::new(MemoryStore::new());
//! let invoker = Arc::new(SerialInvoker::new());
//! let runtime = Runtime::new(store, invoker.clone(), RuntimeConfig::default());
//!
//! let mut builder = ExecutableBuilder::new();
//! builder.function("main", 0);
//! builder.pushv(1).pushv(2).fcall("+", 2).ret();
//! runtime.set_base_executable(builder.finish().unwrap());
//! ```

pub mod compiler;
pub mod config;
pub mod controller;
pub mod error;
pub mod invoker;
pub mod session;
pub mod store;
pub mod worker;

pub use compiler::CodeCompiler;
pub use config::RuntimeConfig;
pub use controller::{DataController, HostBridge};
pub use error::{CompileError, RuntimeError, RuntimeResult};
pub use invoker::{Invoker, PoolInvoker, RemoteInvoker, RetryPolicy, SerialInvoker, WorkerPool};
pub use session::{Continuation, FutureRow, SessionId, SessionRow, ThreadRow};
pub use store::{MemoryStore, SessionGuard, SessionStore};
pub use worker::{
    ApiError, CycleReport, MessageResponse, NewSessionRequest, OutputRequest, OutputResponse,
    ResumeRequest, Runtime, SessionResponse, SetExecutableRequest,
};
