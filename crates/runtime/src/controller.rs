//! The data controller: the transactional façade over persistent
//! session state.
//!
//! The controller never interprets bytecode. It persists threads and
//! futures, resolves futures through chain-resolve, and triggers
//! dispatch through the injected [`Invoker`]. Every row operation takes
//! a [`SessionGuard`] as proof that the caller holds the session lock.

use crate::error::{RuntimeError, RuntimeResult};
use crate::invoker::Invoker;
use crate::session::{Continuation, FutureRow, SessionId, SessionRow, ThreadRow};
use crate::store::{SessionGuard, SessionStore};
use std::sync::Arc;
use teal_vm::{
    Executable, FutureId, MachineHost, ThreadId, ThreadState, Value, VmError, VmResult, WaitResult,
};

/// Mediates all access to one session's durable state.
pub struct DataController {
    store: Arc<dyn SessionStore>,
    invoker: Arc<dyn Invoker>,
    session_id: SessionId,
    executable: Arc<Executable>,
}

impl DataController {
    /// Allocates a fresh persistent session and returns its id.
    pub fn new_session(store: &Arc<dyn SessionStore>) -> RuntimeResult<SessionId> {
        let session_id = SessionId::generate();
        store.create_session(SessionRow::new(session_id.clone()))?;
        tracing::info!(session = %session_id, "session allocated");
        Ok(session_id)
    }

    /// Creates a controller over an existing session.
    pub fn new(
        store: Arc<dyn SessionStore>,
        invoker: Arc<dyn Invoker>,
        session_id: SessionId,
        executable: Arc<Executable>,
    ) -> Self {
        Self {
            store,
            invoker,
            session_id,
            executable,
        }
    }

    /// The session this controller mediates.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The session's executable.
    pub fn executable(&self) -> &Arc<Executable> {
        &self.executable
    }

    /// Allocates a thread plus its owning future, initialised to call
    /// `function` with `args`. Returns the new thread id.
    pub fn new_thread(
        &self,
        _guard: &SessionGuard,
        args: Vec<Value>,
        function: &str,
        is_top_level: bool,
    ) -> RuntimeResult<ThreadId> {
        let entry = self
            .executable
            .function(function)
            .ok_or_else(|| VmError::link(function, "unknown function"))?;
        if entry.arity as usize != args.len() {
            return Err(VmError::link(
                function.to_string(),
                format!("arity mismatch: takes {}, got {}", entry.arity, args.len()),
            )
            .into());
        }

        if is_top_level
            && self
                .store
                .list_threads(&self.session_id)?
                .iter()
                .any(|t| t.is_top_level)
        {
            return Err(RuntimeError::storage(format!(
                "session {} already has a top-level thread",
                self.session_id
            )));
        }

        let thread_id = self.store.thread_count(&self.session_id)?;
        let future_id = self.store.future_count(&self.session_id)?;
        self.store
            .put_future(&self.session_id, FutureRow::new(future_id))?;
        self.store.put_thread(
            &self.session_id,
            ThreadRow {
                thread_id,
                is_top_level,
                future_id,
                state: ThreadState::new(entry.offset as usize, args),
                probe_log: Vec::new(),
                stdout: String::new(),
                exception: None,
            },
        )?;
        tracing::debug!(
            session = %self.session_id,
            thread = thread_id,
            future = future_id,
            function,
            is_top_level,
            "thread created"
        );
        Ok(thread_id)
    }

    /// Loads a thread row.
    pub fn get_thread(&self, _guard: &SessionGuard, thread: ThreadId) -> RuntimeResult<ThreadRow> {
        self.store.get_thread(&self.session_id, thread)
    }

    /// Stores a thread row.
    pub fn put_thread(&self, _guard: &SessionGuard, row: ThreadRow) -> RuntimeResult<()> {
        self.store.put_thread(&self.session_id, row)
    }

    /// Loads a future row.
    pub fn get_future(&self, _guard: &SessionGuard, future: FutureId) -> RuntimeResult<FutureRow> {
        self.store.get_future(&self.session_id, future)
    }

    /// Stores a future row.
    pub fn put_future(&self, _guard: &SessionGuard, row: FutureRow) -> RuntimeResult<()> {
        self.store.put_future(&self.session_id, row)
    }

    /// Atomic check-or-wait: if the future is resolved, returns its
    /// value; otherwise appends a continuation for `thread` at `offset`
    /// and returns None.
    ///
    /// The guard makes this atomic with respect to [`Self::resolve`],
    /// which is what prevents a waiter from being lost between the
    /// check and the append.
    pub fn get_or_wait(
        &self,
        guard: &SessionGuard,
        thread: ThreadId,
        future: FutureId,
        offset: usize,
    ) -> RuntimeResult<Option<Value>> {
        let mut row = self.get_future(guard, future)?;
        if row.resolved {
            let value = row.value.clone().ok_or_else(|| {
                RuntimeError::future_violation(future, "resolved without a value")
            })?;
            return Ok(Some(value));
        }
        row.continuations.push(Continuation {
            thread_id: thread,
            offset,
        });
        self.put_future(guard, row)?;
        tracing::debug!(
            session = %self.session_id,
            thread,
            future,
            offset,
            "continuation registered"
        );
        Ok(None)
    }

    /// Resolves a future with a value and propagates through its chain,
    /// scheduling every waiter. Resolving an already-resolved future is
    /// a FutureViolation.
    pub fn resolve(
        &self,
        guard: &SessionGuard,
        future: FutureId,
        value: Value,
    ) -> RuntimeResult<()> {
        self.chain_resolve(guard, future, value, false)
    }

    /// Marks the session finished with the program result.
    pub fn mark_finished(&self, _guard: &SessionGuard, value: Value) -> RuntimeResult<()> {
        let mut session = self.store.get_session(&self.session_id)?;
        session.finished = true;
        session.result = Some(value);
        self.store.put_session(session)?;
        tracing::info!(session = %self.session_id, "session finished");
        Ok(())
    }

    /// Asks the invoker to run a thread on some worker.
    pub fn dispatch(&self, thread: ThreadId) -> RuntimeResult<()> {
        tracing::debug!(session = %self.session_id, thread, "dispatching thread");
        self.invoker.invoke(&self.session_id, thread)
    }

    /// Delivers a terminating thread's result: resolves the thread's
    /// own future, or chains it forward when the value is itself an
    /// unresolved future.
    pub fn set_thread_result(
        &self,
        guard: &SessionGuard,
        thread: ThreadId,
        value: Value,
    ) -> RuntimeResult<()> {
        let own_future = self.get_thread(guard, thread)?.future_id;
        match value.as_future() {
            Some(tail) if tail != own_future => {
                let tail_row = self.get_future(guard, tail)?;
                if tail_row.resolved {
                    let tail_value = tail_row.value.clone().ok_or_else(|| {
                        RuntimeError::future_violation(tail, "resolved without a value")
                    })?;
                    self.chain_resolve(guard, own_future, tail_value, false)
                } else {
                    self.set_chain(guard, tail, own_future)
                }
            }
            Some(_) => Err(RuntimeError::future_violation(
                own_future,
                "future cannot chain to itself",
            )),
            None => self.chain_resolve(guard, own_future, value, false),
        }
    }

    /// Points `from`'s forward chain at `to`, walking to the end of any
    /// existing chain and rejecting a link that would close a cycle.
    fn set_chain(&self, guard: &SessionGuard, from: FutureId, to: FutureId) -> RuntimeResult<()> {
        let mut tail = from;
        loop {
            if tail == to {
                return Err(RuntimeError::future_violation(
                    to,
                    format!("chaining future {from} would close a cycle"),
                ));
            }
            match self.get_future(guard, tail)?.chain {
                Some(next) => tail = next,
                None => break,
            }
        }
        let mut row = self.get_future(guard, tail)?;
        row.chain = Some(to);
        self.put_future(guard, row)?;
        tracing::debug!(session = %self.session_id, from, to, "future chained");
        Ok(())
    }

    /// Chain-resolve: assign the value, schedule every waiter, then
    /// propagate through the forward chain. A resolved target met while
    /// propagating is tolerated only when its value already equals the
    /// propagated one (idempotent completion of a race).
    fn chain_resolve(
        &self,
        guard: &SessionGuard,
        future: FutureId,
        value: Value,
        propagating: bool,
    ) -> RuntimeResult<()> {
        let mut row = self.get_future(guard, future)?;
        if row.resolved {
            if propagating && row.value.as_ref() == Some(&value) {
                return Ok(());
            }
            return Err(RuntimeError::future_violation(
                future,
                "already resolved (single assignment)",
            ));
        }

        row.resolved = true;
        row.value = Some(value.clone());
        let continuations = std::mem::take(&mut row.continuations);
        let chain = row.chain;
        self.put_future(guard, row)?;
        tracing::debug!(
            session = %self.session_id,
            future,
            waiters = continuations.len(),
            "future resolved"
        );

        for continuation in continuations {
            let mut waiter = self.get_thread(guard, continuation.thread_id)?;
            waiter
                .state
                .set_abs(continuation.offset, value.clone())
                .map_err(RuntimeError::from)?;
            waiter.state.stopped = false;
            self.put_thread(guard, waiter)?;
            self.dispatch(continuation.thread_id)?;
        }

        if let Some(next) = chain {
            self.chain_resolve(guard, next, value.clone(), true)?;
        }

        let owner = self
            .store
            .list_threads(&self.session_id)?
            .into_iter()
            .find(|t| t.future_id == future);
        if matches!(owner, Some(ref t) if t.is_top_level) {
            self.mark_finished(guard, value)?;
        }
        Ok(())
    }
}

/// Adapts the controller to the VM's [`MachineHost`] capability for one
/// thread's cycle.
pub struct HostBridge<'a> {
    controller: &'a DataController,
    guard: &'a SessionGuard,
    thread_id: ThreadId,
}

impl<'a> HostBridge<'a> {
    /// Binds the bridge to a thread under a held session lock.
    pub fn new(
        controller: &'a DataController,
        guard: &'a SessionGuard,
        thread_id: ThreadId,
    ) -> Self {
        Self {
            controller,
            guard,
            thread_id,
        }
    }
}

fn to_vm_error(err: RuntimeError) -> VmError {
    match err {
        RuntimeError::Vm(inner) => inner,
        other => VmError::host(other.to_string()),
    }
}

impl MachineHost for HostBridge<'_> {
    fn fork(&mut self, function: &str, args: Vec<Value>) -> VmResult<FutureId> {
        let child = self
            .controller
            .new_thread(self.guard, args, function, false)
            .map_err(to_vm_error)?;
        let future_id = self
            .controller
            .get_thread(self.guard, child)
            .map_err(to_vm_error)?
            .future_id;
        self.controller.dispatch(child).map_err(to_vm_error)?;
        Ok(future_id)
    }

    fn get_or_wait(&mut self, future: FutureId, offset: usize) -> VmResult<WaitResult> {
        match self
            .controller
            .get_or_wait(self.guard, self.thread_id, future, offset)
            .map_err(to_vm_error)?
        {
            Some(value) => Ok(WaitResult::Resolved(value)),
            None => Ok(WaitResult::Pending),
        }
    }

    fn set_thread_result(&mut self, value: Value) -> VmResult<()> {
        self.controller
            .set_thread_result(self.guard, self.thread_id, value)
            .map_err(to_vm_error)
    }
}
