//! Session storage.
//!
//! [`SessionStore`] is the seam between the runtime and whatever durable
//! backend holds session state. The bundled [`MemoryStore`] is the
//! reference implementation; production backends persist the same rows
//! in a transactional store.
//!
//! The advisory session lock is part of the schema: a `locked_by` owner
//! plus a `lock_expiry` deadline, stealable after expiry so a crashed
//! worker cannot park a session forever.

use crate::error::{RuntimeError, RuntimeResult};
use crate::session::{FutureRow, SessionId, SessionRow, ThreadRow};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use teal_vm::{FutureId, ThreadId};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Abstract transactional storage for session state.
///
/// Row operations assume the caller holds the session's advisory lock;
/// only `try_lock`/`unlock` are safe without it.
pub trait SessionStore: Send + Sync {
    /// Inserts a fresh session.
    fn create_session(&self, row: SessionRow) -> RuntimeResult<()>;

    /// Loads the session row.
    fn get_session(&self, id: &SessionId) -> RuntimeResult<SessionRow>;

    /// Stores the session row.
    fn put_session(&self, row: SessionRow) -> RuntimeResult<()>;

    /// Loads one thread row.
    fn get_thread(&self, id: &SessionId, thread: ThreadId) -> RuntimeResult<ThreadRow>;

    /// Stores one thread row (appending when the id is new).
    fn put_thread(&self, id: &SessionId, row: ThreadRow) -> RuntimeResult<()>;

    /// Lists all thread rows in thread-id order.
    fn list_threads(&self, id: &SessionId) -> RuntimeResult<Vec<ThreadRow>>;

    /// Number of threads in the session.
    fn thread_count(&self, id: &SessionId) -> RuntimeResult<u32>;

    /// Loads one future row.
    fn get_future(&self, id: &SessionId, future: FutureId) -> RuntimeResult<FutureRow>;

    /// Stores one future row (appending when the id is new).
    fn put_future(&self, id: &SessionId, row: FutureRow) -> RuntimeResult<()>;

    /// Number of futures in the session.
    fn future_count(&self, id: &SessionId) -> RuntimeResult<u32>;

    /// Attempts to take the advisory lock; returns false when it is
    /// held by a live owner.
    fn try_lock(&self, id: &SessionId, owner: &str, expiry_millis: u64) -> RuntimeResult<bool>;

    /// Releases the advisory lock if still owned by `owner`.
    fn unlock(&self, id: &SessionId, owner: &str) -> RuntimeResult<()>;
}

/// RAII guard for the session advisory lock.
///
/// Holding a guard is the proof-of-lock the controller requires for row
/// operations. Dropping it releases the lock.
pub struct SessionGuard {
    store: Arc<dyn SessionStore>,
    session_id: SessionId,
    owner: String,
}

impl SessionGuard {
    /// Blocks until the lock is acquired or `timeout` elapses.
    pub fn acquire(
        store: Arc<dyn SessionStore>,
        session_id: &SessionId,
        timeout: Duration,
        lease: Duration,
    ) -> RuntimeResult<Self> {
        let owner = Uuid::new_v4().to_string();
        let deadline = now_millis() + timeout.as_millis() as u64;
        loop {
            let expiry = now_millis() + lease.as_millis() as u64;
            if store.try_lock(session_id, &owner, expiry)? {
                tracing::trace!(session = %session_id, %owner, "session lock acquired");
                return Ok(Self {
                    store,
                    session_id: session_id.clone(),
                    owner,
                });
            }
            if now_millis() >= deadline {
                return Err(RuntimeError::LockTimeout {
                    session: session_id.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// The locked session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.store.unlock(&self.session_id, &self.owner) {
            tracing::warn!(session = %self.session_id, %err, "failed to release session lock");
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: SessionRow,
    threads: Vec<ThreadRow>,
    futures: Vec<FutureRow>,
}

/// In-memory reference store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, SessionEntry>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionEntry) -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.to_string()))?;
        f(entry.value_mut())
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&self, row: SessionRow) -> RuntimeResult<()> {
        let id = row.session_id.clone();
        let entry = SessionEntry {
            session: row,
            threads: Vec::new(),
            futures: Vec::new(),
        };
        if self.sessions.insert(id.clone(), entry).is_some() {
            return Err(RuntimeError::storage(format!(
                "session already exists: {id}"
            )));
        }
        Ok(())
    }

    fn get_session(&self, id: &SessionId) -> RuntimeResult<SessionRow> {
        self.with_entry(id, |entry| Ok(entry.session.clone()))
    }

    fn put_session(&self, row: SessionRow) -> RuntimeResult<()> {
        self.with_entry(&row.session_id.clone(), |entry| {
            // The lock columns are owned by try_lock/unlock
            let locked_by = entry.session.locked_by.clone();
            let lock_expiry = entry.session.lock_expiry;
            entry.session = row;
            entry.session.locked_by = locked_by;
            entry.session.lock_expiry = lock_expiry;
            Ok(())
        })
    }

    fn get_thread(&self, id: &SessionId, thread: ThreadId) -> RuntimeResult<ThreadRow> {
        self.with_entry(id, |entry| {
            entry
                .threads
                .get(thread as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::ThreadNotFound {
                    session: id.to_string(),
                    thread,
                })
        })
    }

    fn put_thread(&self, id: &SessionId, row: ThreadRow) -> RuntimeResult<()> {
        self.with_entry(id, |entry| {
            let index = row.thread_id as usize;
            if index < entry.threads.len() {
                entry.threads[index] = row;
            } else if index == entry.threads.len() {
                entry.threads.push(row);
            } else {
                return Err(RuntimeError::storage(format!(
                    "thread ids must be dense: got {index}, have {}",
                    entry.threads.len()
                )));
            }
            Ok(())
        })
    }

    fn list_threads(&self, id: &SessionId) -> RuntimeResult<Vec<ThreadRow>> {
        self.with_entry(id, |entry| Ok(entry.threads.clone()))
    }

    fn thread_count(&self, id: &SessionId) -> RuntimeResult<u32> {
        self.with_entry(id, |entry| Ok(entry.threads.len() as u32))
    }

    fn get_future(&self, id: &SessionId, future: FutureId) -> RuntimeResult<FutureRow> {
        self.with_entry(id, |entry| {
            entry
                .futures
                .get(future as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::FutureNotFound {
                    session: id.to_string(),
                    future,
                })
        })
    }

    fn put_future(&self, id: &SessionId, row: FutureRow) -> RuntimeResult<()> {
        self.with_entry(id, |entry| {
            let index = row.future_id as usize;
            if index < entry.futures.len() {
                entry.futures[index] = row;
            } else if index == entry.futures.len() {
                entry.futures.push(row);
            } else {
                return Err(RuntimeError::storage(format!(
                    "future ids must be dense: got {index}, have {}",
                    entry.futures.len()
                )));
            }
            Ok(())
        })
    }

    fn future_count(&self, id: &SessionId) -> RuntimeResult<u32> {
        self.with_entry(id, |entry| Ok(entry.futures.len() as u32))
    }

    fn try_lock(&self, id: &SessionId, owner: &str, expiry_millis: u64) -> RuntimeResult<bool> {
        self.with_entry(id, |entry| {
            let now = now_millis();
            let held = match (&entry.session.locked_by, entry.session.lock_expiry) {
                (Some(_), Some(expiry)) => expiry > now,
                _ => false,
            };
            if held {
                return Ok(false);
            }
            entry.session.locked_by = Some(owner.to_string());
            entry.session.lock_expiry = Some(expiry_millis);
            Ok(true)
        })
    }

    fn unlock(&self, id: &SessionId, owner: &str) -> RuntimeResult<()> {
        self.with_entry(id, |entry| {
            if entry.session.locked_by.as_deref() == Some(owner) {
                entry.session.locked_by = None;
                entry.session.lock_expiry = None;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (Arc<MemoryStore>, SessionId) {
        let store = Arc::new(MemoryStore::new());
        let id = SessionId::generate();
        store.create_session(SessionRow::new(id.clone())).unwrap();
        (store, id)
    }

    #[test]
    fn test_session_round_trip() {
        let (store, id) = store_with_session();
        let mut row = store.get_session(&id).unwrap();
        row.finished = true;
        store.put_session(row).unwrap();
        assert!(store.get_session(&id).unwrap().finished);
    }

    #[test]
    fn test_missing_session() {
        let store = MemoryStore::new();
        let err = store.get_session(&SessionId::from("nope")).unwrap_err();
        assert!(matches!(err, RuntimeError::SessionNotFound { .. }));
    }

    #[test]
    fn test_dense_future_ids_enforced() {
        let (store, id) = store_with_session();
        store.put_future(&id, FutureRow::new(0)).unwrap();
        assert!(store.put_future(&id, FutureRow::new(2)).is_err());
    }

    #[test]
    fn test_lock_exclusion_and_release() {
        let (store, id) = store_with_session();
        let expiry = now_millis() + 10_000;
        assert!(store.try_lock(&id, "a", expiry).unwrap());
        assert!(!store.try_lock(&id, "b", expiry).unwrap());
        store.unlock(&id, "b").unwrap();
        // Wrong owner must not release
        assert!(!store.try_lock(&id, "b", expiry).unwrap());
        store.unlock(&id, "a").unwrap();
        assert!(store.try_lock(&id, "b", expiry).unwrap());
    }

    #[test]
    fn test_lock_steal_after_expiry() {
        let (store, id) = store_with_session();
        assert!(store.try_lock(&id, "a", now_millis() - 1).unwrap());
        assert!(store.try_lock(&id, "b", now_millis() + 10_000).unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (store, id) = store_with_session();
        let store: Arc<dyn SessionStore> = store;
        {
            let _guard = SessionGuard::acquire(
                Arc::clone(&store),
                &id,
                Duration::from_millis(100),
                Duration::from_secs(10),
            )
            .unwrap();
            assert!(SessionGuard::acquire(
                Arc::clone(&store),
                &id,
                Duration::from_millis(20),
                Duration::from_secs(10),
            )
            .is_err());
        }
        SessionGuard::acquire(
            store,
            &id,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .unwrap();
    }

    #[test]
    fn test_put_session_preserves_lock_columns() {
        let (store, id) = store_with_session();
        let expiry = now_millis() + 10_000;
        assert!(store.try_lock(&id, "a", expiry).unwrap());
        let mut row = store.get_session(&id).unwrap();
        row.locked_by = None;
        row.lock_expiry = None;
        row.finished = true;
        store.put_session(row).unwrap();
        let after = store.get_session(&id).unwrap();
        assert!(after.finished);
        assert_eq!(after.locked_by.as_deref(), Some("a"));
    }
}
