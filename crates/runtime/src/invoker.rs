//! Dispatchers: the "run thread T asynchronously" capability.
//!
//! An [`Invoker`] requests that some worker eventually run a VM cycle
//! on a (session, thread). Delivery is at-least-once; re-invoking a
//! terminated thread is a no-op at the VM level, so redelivery is safe.

use crate::error::{RuntimeError, RuntimeResult};
use crate::session::SessionId;
use crate::worker::{ResumeRequest, Runtime};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use teal_vm::ThreadId;
use tokio::sync::mpsc;

/// The dispatch capability injected into the controller.
pub trait Invoker: Send + Sync {
    /// Requests that some worker eventually run the given thread.
    fn invoke(&self, session_id: &SessionId, vmid: ThreadId) -> RuntimeResult<()>;
}

/// A cooperative single-threaded dispatcher.
///
/// Invocations pile up in a queue the caller drains explicitly, so
/// execution order is deterministic. The reference Invoker for tests.
#[derive(Default)]
pub struct SerialInvoker {
    queue: Mutex<VecDeque<(SessionId, ThreadId)>>,
}

impl SerialInvoker {
    /// Creates an empty serial dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest queued invocation, if any.
    pub fn pop(&self) -> Option<(SessionId, ThreadId)> {
        self.queue.lock().pop_front()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Invoker for SerialInvoker {
    fn invoke(&self, session_id: &SessionId, vmid: ThreadId) -> RuntimeResult<()> {
        self.queue.lock().push_back((session_id.clone(), vmid));
        Ok(())
    }
}

/// Sends invocations into a bounded tokio worker pool.
pub struct PoolInvoker {
    sender: mpsc::UnboundedSender<(SessionId, ThreadId)>,
}

impl PoolInvoker {
    /// Creates the invoker half and the receiver a [`WorkerPool`]
    /// consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(SessionId, ThreadId)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Invoker for PoolInvoker {
    fn invoke(&self, session_id: &SessionId, vmid: ThreadId) -> RuntimeResult<()> {
        self.sender
            .send((session_id.clone(), vmid))
            .map_err(|_| RuntimeError::dispatch("worker pool is shut down"))
    }
}

/// The in-process worker pool behind a [`PoolInvoker`].
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks consuming the queue. Each message runs
    /// one VM cycle on a blocking thread; cycle errors are already
    /// persisted in the thread's exception slot, so they are only
    /// logged here.
    pub fn start(
        runtime: Arc<Runtime>,
        receiver: mpsc::UnboundedReceiver<(SessionId, ThreadId)>,
        workers: usize,
    ) -> Self {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let runtime = Arc::clone(&runtime);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let message = { receiver.lock().await.recv().await };
                        let Some((session_id, vmid)) = message else {
                            break;
                        };
                        tracing::debug!(worker, session = %session_id, thread = vmid, "pool cycle");
                        let cycle_runtime = Arc::clone(&runtime);
                        let cycle_session = session_id.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            cycle_runtime.run_cycle(&cycle_session, vmid)
                        })
                        .await;
                        match result {
                            Ok(Ok(_)) => {}
                            Ok(Err(RuntimeError::LockTimeout { .. })) => {
                                // Another worker is mid-cycle on this
                                // session; requeue for a later attempt.
                                tracing::debug!(worker, session = %session_id, "lock contended, requeueing");
                                let _ = runtime.invoker().invoke(&session_id, vmid);
                            }
                            Ok(Err(err)) => {
                                tracing::error!(worker, %err, "cycle failed")
                            }
                            Err(err) => tracing::error!(worker, %err, "cycle panicked"),
                        }
                    }
                })
            })
            .collect();
        Self { handles }
    }

    /// Waits for all workers to drain and exit. Only returns once every
    /// `PoolInvoker` clone of the sending side has been dropped.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Retry policy for remote dispatch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts before giving up
    pub max_attempts: u32,

    /// Base delay, doubled per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Backoff before `attempt` (0-based): base * 2^attempt, with ±50%
    /// jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay * 2u32.saturating_pow(attempt);
        base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// Dispatches by invoking a peer worker's resume endpoint over HTTP.
///
/// Fire-and-forget: `invoke` spawns the delivery task and returns. Must
/// be used from within a tokio runtime.
pub struct RemoteInvoker {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl RemoteInvoker {
    /// Creates a dispatcher posting to the given resume endpoint URL.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Creates a dispatcher targeting a peer worker's configured resume
    /// function, e.g. `https://peer.example` + `resume`.
    pub fn for_peer(base_url: &str, config: &crate::config::RuntimeConfig) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::new(format!("{base}/{}", config.resume_fn_name))
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn deliver(
        client: reqwest::Client,
        endpoint: String,
        retry: RetryPolicy,
        request: ResumeRequest,
    ) {
        for attempt in 0..retry.max_attempts {
            let response = client.post(&endpoint).json(&request).send().await;
            match response {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                Ok(response) => {
                    tracing::warn!(
                        attempt,
                        status = %response.status(),
                        session = %request.session_id,
                        thread = request.vmid,
                        "resume invocation rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        %err,
                        session = %request.session_id,
                        thread = request.vmid,
                        "resume invocation failed"
                    );
                }
            }
            tokio::time::sleep(retry.backoff(attempt)).await;
        }
        tracing::error!(
            session = %request.session_id,
            thread = request.vmid,
            "dispatch abandoned after {} attempts",
            retry.max_attempts
        );
    }
}

impl Invoker for RemoteInvoker {
    fn invoke(&self, session_id: &SessionId, vmid: ThreadId) -> RuntimeResult<()> {
        let request = ResumeRequest {
            session_id: session_id.clone(),
            vmid,
        };
        tokio::spawn(Self::deliver(
            self.client.clone(),
            self.endpoint.clone(),
            self.retry,
            request,
        ));
        Ok(())
    }
}
