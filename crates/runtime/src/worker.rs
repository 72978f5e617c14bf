//! Worker entry points.
//!
//! These are the handlers a deployment wires to its transport (HTTP
//! gateway, queue, or direct function invocation): create a session,
//! resume a suspended thread, fetch a session's output, and set
//! executables. Payloads are plain serde types; errors carry an
//! HTTP-style code (400 client, 500 server) and a short message.

use crate::compiler::CodeCompiler;
use crate::config::{RuntimeConfig, DEFAULT_CHECK_PERIOD_SECS};
use crate::controller::{DataController, HostBridge};
use crate::error::{RuntimeError, RuntimeResult};
use crate::invoker::{Invoker, SerialInvoker};
use crate::session::{SessionId, SessionRow};
use crate::store::{SessionGuard, SessionStore};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teal_vm::{
    CycleOutcome, Executable, ForeignRegistry, Machine, ThreadId, Value,
};

/// Request payload for the new-session entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionRequest {
    /// Entry function name
    #[serde(default = "default_function")]
    pub function: String,

    /// Entry arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Teal source to compile for this session; otherwise the base
    /// executable is used
    #[serde(default)]
    pub code: Option<String>,

    /// Block until the session finishes (or times out)
    #[serde(default = "default_true")]
    pub wait_for_finish: bool,

    /// Polling period while waiting, in seconds
    #[serde(default = "default_check_period")]
    pub check_period: f64,

    /// Wall-clock timeout in seconds; falls back to the configured
    /// fixed timeout
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_function() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_check_period() -> f64 {
    DEFAULT_CHECK_PERIOD_SECS
}

impl Default for NewSessionRequest {
    fn default() -> Self {
        Self {
            function: default_function(),
            args: Vec::new(),
            code: None,
            wait_for_finish: true,
            check_period: default_check_period(),
            timeout: None,
        }
    }
}

/// Request payload for the resume entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// The session to resume in
    pub session_id: SessionId,

    /// The thread to run
    pub vmid: ThreadId,
}

/// Response payload for new-session and resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    /// The session
    pub session_id: SessionId,

    /// The thread this request ran
    pub vmid: ThreadId,

    /// Whether the session has finished
    pub finished: bool,

    /// The program result, present once finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Request payload for the get-output entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRequest {
    /// The session to inspect
    #[serde(default)]
    pub session_id: String,
}

/// Response payload for get-output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputResponse {
    /// Stdout per thread, in thread order
    pub output: Vec<String>,

    /// Exception text per thread, in thread order
    pub exceptions: Vec<Option<String>>,

    /// Reserved event stream
    pub events: Vec<serde_json::Value>,
}

/// Request payload for set-executable. Without a session id the base
/// executable is replaced; with one, that session's executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetExecutableRequest {
    /// Target session, or None for the base executable
    #[serde(default)]
    pub session_id: Option<String>,

    /// Teal source to compile
    #[serde(default)]
    pub content: Option<String>,
}

/// A simple message response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Human-readable confirmation
    pub message: String,
}

/// Structured entry-API failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP-style status: 400 client, 500 server
    pub code: u16,

    /// Human-readable message
    pub message: String,

    /// The session involved, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl ApiError {
    /// A 400-class client error.
    pub fn client<S: Into<String>>(message: S) -> Self {
        Self {
            code: 400,
            message: message.into(),
            session_id: None,
        }
    }

    /// A 500-class server error.
    pub fn server<S: Into<String>>(message: S) -> Self {
        Self {
            code: 500,
            message: message.into(),
            session_id: None,
        }
    }

    /// Attaches the session id.
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match &err {
            RuntimeError::SessionNotFound { .. } => ApiError::client("Couldn't find that session"),
            RuntimeError::Compile(_) | RuntimeError::Vm(_) | RuntimeError::Timeout { .. } => {
                ApiError::client(err.to_string())
            }
            _ => ApiError::server(err.to_string()),
        }
    }
}

/// What one VM cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// How the cycle ended; None when it was an idempotent no-op
    pub outcome: Option<CycleOutcome>,

    /// Whether the session is finished after this cycle
    pub finished: bool,

    /// The session result, present once finished
    pub result: Option<Value>,
}

/// A worker: storage, dispatch, foreign functions, and configuration
/// wired together behind the entry points.
pub struct Runtime {
    store: Arc<dyn SessionStore>,
    invoker: Arc<dyn Invoker>,
    foreign: Arc<ForeignRegistry>,
    compiler: Option<Arc<dyn CodeCompiler>>,
    config: RuntimeConfig,
    base_executable: RwLock<Option<Arc<Executable>>>,
    executable_cache: DashMap<String, Arc<Executable>>,
}

impl Runtime {
    /// Wires a runtime together. Call [`RuntimeConfig::init_logging`]
    /// separately when logging is wanted.
    pub fn new(
        store: Arc<dyn SessionStore>,
        invoker: Arc<dyn Invoker>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            foreign: Arc::new(ForeignRegistry::new()),
            compiler: None,
            config,
            base_executable: RwLock::new(None),
            executable_cache: DashMap::new(),
        }
    }

    /// Installs a compiler capability for source-carrying requests.
    pub fn with_compiler(mut self, compiler: Arc<dyn CodeCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Replaces the foreign-function registry.
    pub fn with_foreign(mut self, foreign: Arc<ForeignRegistry>) -> Self {
        self.foreign = foreign;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// The injected dispatcher.
    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    /// The active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Sets the base executable used by sessions created without code.
    pub fn set_base_executable(&self, executable: Executable) {
        *self.base_executable.write() = Some(Arc::new(executable));
    }

    fn lock_session(&self, session_id: &SessionId) -> RuntimeResult<SessionGuard> {
        SessionGuard::acquire(
            Arc::clone(&self.store),
            session_id,
            Duration::from_millis(self.config.lock_timeout_ms),
            Duration::from_millis(self.config.lock_lease_ms),
        )
    }

    fn load_executable(&self, session: &SessionRow) -> RuntimeResult<Arc<Executable>> {
        let bytes = session.executable.as_ref().ok_or_else(|| {
            RuntimeError::storage(format!("session {} has no executable", session.session_id))
        })?;
        if let Some(reference) = &session.executable_ref {
            if let Some(cached) = self.executable_cache.get(reference) {
                return Ok(Arc::clone(cached.value()));
            }
        }
        let executable = Arc::new(Executable::deserialise(bytes)?);
        if let Some(reference) = &session.executable_ref {
            self.executable_cache
                .insert(reference.clone(), Arc::clone(&executable));
        }
        Ok(executable)
    }

    /// Runs one VM cycle on a thread: hydrate, execute to the next
    /// suspension point, persist. Idempotent for terminated threads.
    /// A fatal VM error lands in the thread's exception slot and is
    /// re-surfaced to the caller.
    pub fn run_cycle(&self, session_id: &SessionId, vmid: ThreadId) -> RuntimeResult<CycleReport> {
        let guard = self.lock_session(session_id)?;
        let session = self.store.get_session(session_id)?;
        let executable = self.load_executable(&session)?;
        let controller = DataController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.invoker),
            session_id.clone(),
            Arc::clone(&executable),
        );

        let mut thread = controller.get_thread(&guard, vmid)?;
        let resolved = controller.get_future(&guard, thread.future_id)?.resolved;
        if resolved || thread.state.stopped {
            // Redelivery: the thread has terminated, or it is parked
            // waiting and the resolver will re-dispatch it.
            tracing::debug!(session = %session_id, thread = vmid, resolved, "cycle no-op");
            let session = self.store.get_session(session_id)?;
            return Ok(CycleReport {
                outcome: None,
                finished: session.finished,
                result: session.result,
            });
        }

        let mut bridge = HostBridge::new(&controller, &guard, vmid);
        let mut machine = Machine::new(
            &mut bridge,
            &executable,
            &self.foreign,
            self.config.limits,
            thread.state.clone(),
            self.config.enable_probes,
        );
        let run_result = machine.run();
        let artifacts = machine.into_artifacts();

        thread.state = artifacts.state;
        thread.stdout.push_str(&artifacts.stdout);
        thread.probe_log.extend(artifacts.probe);

        match run_result {
            Ok(outcome) => {
                controller.put_thread(&guard, thread)?;
                let session = self.store.get_session(session_id)?;
                Ok(CycleReport {
                    outcome: Some(outcome),
                    finished: session.finished,
                    result: session.result,
                })
            }
            Err(err) => {
                tracing::error!(
                    session = %session_id,
                    thread = vmid,
                    category = err.category(),
                    %err,
                    "thread aborted"
                );
                thread.exception = Some(err.to_string());
                thread.state.stopped = true;
                controller.put_thread(&guard, thread)?;
                Err(err.into())
            }
        }
    }

    /// Runs queued cycles of a [`SerialInvoker`] until it is empty.
    /// Thread aborts are persisted and skipped; other errors stop the
    /// drain.
    pub fn drain(&self, invoker: &SerialInvoker) -> RuntimeResult<()> {
        while let Some((session_id, vmid)) = invoker.pop() {
            match self.run_cycle(&session_id, vmid) {
                Ok(_) => {}
                Err(RuntimeError::Vm(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Entry point: create a session, run its first cycle inline, and
    /// optionally wait for the program to finish.
    pub async fn new_session(&self, req: NewSessionRequest) -> Result<SessionResponse, ApiError> {
        let executable = match &req.code {
            Some(code) => {
                let compiler = self
                    .compiler
                    .as_ref()
                    .ok_or_else(|| ApiError::server("Error compiling code: no compiler"))?;
                match compiler.compile(code) {
                    Ok(executable) => Arc::new(executable),
                    Err(err) => {
                        return Err(ApiError::client(format!("Error compiling code:\n{err}")))
                    }
                }
            }
            None => match self.base_executable.read().clone() {
                Some(executable) => executable,
                None => return Err(ApiError::client("No Teal code")),
            },
        };

        let session_id = DataController::new_session(&self.store).map_err(ApiError::from)?;
        let reference = executable.content_hash();
        let mut row = self
            .store
            .get_session(&session_id)
            .map_err(|err| ApiError::from(err).with_session(session_id.clone()))?;
        row.executable = Some(executable.serialise());
        row.executable_ref = Some(reference.clone());
        self.store
            .put_session(row)
            .map_err(|err| ApiError::from(err).with_session(session_id.clone()))?;
        self.executable_cache
            .insert(reference, Arc::clone(&executable));
        tracing::info!(session = %session_id, function = %req.function, "session created");

        let controller = DataController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.invoker),
            session_id.clone(),
            Arc::clone(&executable),
        );
        let vmid = {
            let guard = self
                .lock_session(&session_id)
                .map_err(|err| ApiError::from(err).with_session(session_id.clone()))?;
            controller
                .new_thread(&guard, req.args.clone(), &req.function, true)
                .map_err(|err| ApiError::from(err).with_session(session_id.clone()))?
        };

        match self.run_cycle(&session_id, vmid) {
            Ok(_) => {}
            Err(RuntimeError::Vm(_)) => {
                return Err(ApiError::client("Runtime error").with_session(session_id))
            }
            Err(err) => return Err(ApiError::from(err).with_session(session_id)),
        }

        if req.wait_for_finish {
            let timeout = req.timeout.unwrap_or(self.config.fixed_timeout_secs);
            let deadline = Instant::now() + Duration::from_secs(timeout);
            loop {
                let session = self
                    .store
                    .get_session(&session_id)
                    .map_err(|err| ApiError::from(err).with_session(session_id.clone()))?;
                if session.finished {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(
                        ApiError::client("Timeout waiting for finish").with_session(session_id)
                    );
                }
                tokio::time::sleep(Duration::from_secs_f64(req.check_period.max(0.01))).await;
            }
        }

        let session = self
            .store
            .get_session(&session_id)
            .map_err(|err| ApiError::from(err).with_session(session_id.clone()))?;
        Ok(SessionResponse {
            session_id,
            vmid,
            finished: session.finished,
            result: session.result,
        })
    }

    /// Entry point: run one cycle of an existing thread.
    pub fn resume(&self, req: ResumeRequest) -> Result<SessionResponse, ApiError> {
        let report = self
            .run_cycle(&req.session_id, req.vmid)
            .map_err(|err| ApiError::from(err).with_session(req.session_id.clone()))?;
        Ok(SessionResponse {
            session_id: req.session_id,
            vmid: req.vmid,
            finished: report.finished,
            result: report.result,
        })
    }

    /// Entry point: fetch per-thread stdout and exceptions.
    pub fn get_output(&self, req: OutputRequest) -> Result<OutputResponse, ApiError> {
        if req.session_id.is_empty() {
            return Err(ApiError::client("No session ID"));
        }
        let session_id = SessionId::from(req.session_id);
        let threads = self
            .store
            .list_threads(&session_id)
            .map_err(ApiError::from)?;
        Ok(OutputResponse {
            output: threads.iter().map(|t| t.stdout.clone()).collect(),
            exceptions: threads.iter().map(|t| t.exception.clone()).collect(),
            events: Vec::new(),
        })
    }

    /// Entry point: compile and install an executable, either the base
    /// default or a specific session's.
    pub fn set_executable(&self, req: SetExecutableRequest) -> Result<MessageResponse, ApiError> {
        let content = match req.content.as_deref() {
            Some(content) if !content.is_empty() => content,
            _ => return Err(ApiError::client("No Teal code")),
        };
        let compiler = self
            .compiler
            .as_ref()
            .ok_or_else(|| ApiError::server("Error compiling code: no compiler"))?;
        let executable = compiler
            .compile(content)
            .map_err(|_| ApiError::client("Error compiling code"))?;

        match req.session_id.as_deref() {
            None => {
                self.set_base_executable(executable);
                Ok(MessageResponse {
                    message: "Base executable set successfully".to_string(),
                })
            }
            Some("") => Err(ApiError::client("No session ID")),
            Some(session_id) => {
                let session_id = SessionId::from(session_id);
                let mut session = self
                    .store
                    .get_session(&session_id)
                    .map_err(|_| ApiError::client("Couldn't find that session"))?;
                session.executable = Some(executable.serialise());
                session.executable_ref = Some(executable.content_hash());
                self.store
                    .put_session(session)
                    .map_err(|_| ApiError::client("Error saving code"))?;
                Ok(MessageResponse {
                    message: "Executable set successfully".to_string(),
                })
            }
        }
    }
}
