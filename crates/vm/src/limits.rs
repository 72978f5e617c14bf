//! Execution limits for the Teal Virtual Machine.

use serde::{Deserialize, Serialize};

/// Default maximum number of values on a thread's data stack.
pub const DEFAULT_MAX_DATA_STACK: usize = 1024;

/// Default maximum call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Restrictions on a single thread's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Maximum number of values on the data stack.
    pub max_data_stack: usize,

    /// Maximum number of frames on the call stack.
    pub max_call_depth: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_data_stack: DEFAULT_MAX_DATA_STACK,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}
