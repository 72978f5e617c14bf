//! Persistent session records.
//!
//! A session is the unit of a running program: its executable, threads,
//! futures, finished flag, and result. The row types here mirror the
//! logical storage schema; a [`crate::store::SessionStore`] persists
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;
use teal_vm::{FutureId, ThreadId, ThreadState, Value};
use uuid::Uuid;

/// An opaque unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The session row: program-wide state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    /// The session identifier
    pub session_id: SessionId,

    /// True once the top-level future has resolved
    pub finished: bool,

    /// The program result; valid only when finished
    pub result: Option<Value>,

    /// Serialised executable bytes
    pub executable: Option<Vec<u8>>,

    /// Content hash of the executable bytes
    pub executable_ref: Option<String>,

    /// Advisory lock owner, when held
    pub locked_by: Option<String>,

    /// Advisory lock expiry, milliseconds since the epoch
    pub lock_expiry: Option<u64>,
}

impl SessionRow {
    /// Creates an unlocked, unfinished session row.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            finished: false,
            result: None,
            executable: None,
            executable_ref: None,
            locked_by: None,
            lock_expiry: None,
        }
    }
}

/// The thread row: one concurrent line of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRow {
    /// Dense per-session thread id
    pub thread_id: ThreadId,

    /// True for the session's first thread only
    pub is_top_level: bool,

    /// The future that will hold this thread's return value
    pub future_id: FutureId,

    /// The thread's VM state
    pub state: ThreadState,

    /// Ordered probe log lines
    pub probe_log: Vec<String>,

    /// Accumulated standard output
    pub stdout: String,

    /// Fatal exception text, if the thread aborted
    pub exception: Option<String>,
}

/// A waiter registration: where to deliver a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    /// The waiting thread
    pub thread_id: ThreadId,

    /// Absolute data-stack offset to write the value at
    pub offset: usize,
}

/// The future row: a single-assignment cell with waiters and an
/// optional forward chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureRow {
    /// Dense per-session future id
    pub future_id: FutureId,

    /// True once a value has been assigned
    pub resolved: bool,

    /// The assigned value; undefined while unresolved
    pub value: Option<Value>,

    /// Forward chain: the future this one's value propagates into
    pub chain: Option<FutureId>,

    /// Waiters to schedule on resolution
    pub continuations: Vec<Continuation>,
}

impl FutureRow {
    /// Creates an unresolved future.
    pub fn new(future_id: FutureId) -> Self {
        Self {
            future_id,
            resolved: false,
            value: None,
            chain: None,
            continuations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_round_trip() {
        let id = SessionId::generate();
        let text = id.to_string();
        assert_eq!(SessionId::from(text.as_str()), id);
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_fresh_future_is_unresolved() {
        let future = FutureRow::new(0);
        assert!(!future.resolved);
        assert!(future.value.is_none());
        assert!(future.continuations.is_empty());
    }
}
