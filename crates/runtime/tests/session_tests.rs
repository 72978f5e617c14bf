//! End-to-end session tests over the serial (cooperative) dispatcher.

use std::sync::Arc;
use teal_runtime::{
    ApiError, CompileError, CodeCompiler, MemoryStore, NewSessionRequest, OutputRequest, Runtime,
    RuntimeConfig, SerialInvoker, SessionStore, SetExecutableRequest,
};
use teal_vm::{Executable, ExecutableBuilder, Value};

fn serial_runtime() -> (Arc<Runtime>, Arc<SerialInvoker>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(SerialInvoker::new());
    let runtime = Runtime::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        invoker.clone(),
        RuntimeConfig::default(),
    );
    (Arc::new(runtime), invoker, store)
}

fn arithmetic_program() -> Executable {
    // main() = 1 + 2
    let mut builder = ExecutableBuilder::new();
    builder.function("main", 0);
    builder.pushv(1).pushv(2).fcall("+", 2).ret();
    builder.finish().unwrap()
}

fn fork_wait_program() -> Executable {
    // main() = wait(fork(g, 10)) + 1; g(x) = x * 2
    let mut builder = ExecutableBuilder::new();
    builder.function("main", 0);
    builder.pushv(10).fork_fn("g", 1).wait().pushv(1).fcall("+", 2).ret();
    builder.function("g", 1);
    builder.bind("x").lookup("x").pushv(2).fcall("*", 2).ret();
    builder.finish().unwrap()
}

fn chain_program() -> Executable {
    // main() = h(); h() = fork(k, 5); k(x) = x + 100
    let mut builder = ExecutableBuilder::new();
    builder.function("main", 0);
    builder.call_fn("h", 0).ret();
    builder.function("h", 0);
    builder.pushv(5).fork_fn("k", 1).ret();
    builder.function("k", 1);
    builder.bind("x").lookup("x").pushv(100).fcall("+", 2).ret();
    builder.finish().unwrap()
}

async fn run_program(
    exe: Executable,
) -> (
    Arc<Runtime>,
    Arc<SerialInvoker>,
    Arc<MemoryStore>,
    teal_runtime::SessionResponse,
) {
    let (runtime, invoker, store) = serial_runtime();
    runtime.set_base_executable(exe);
    let response = runtime
        .new_session(NewSessionRequest {
            wait_for_finish: false,
            ..Default::default()
        })
        .await
        .expect("new_session");
    runtime.drain(&invoker).expect("drain");
    (runtime, invoker, store, response)
}

#[tokio::test]
async fn arithmetic_session_finishes_inline() {
    let (_, _, store, response) = run_program(arithmetic_program()).await;
    let session = store.get_session(&response.session_id).unwrap();
    assert!(session.finished);
    assert_eq!(session.result, Some(Value::Int(3)));

    let threads = store.list_threads(&response.session_id).unwrap();
    assert_eq!(threads.len(), 1);
    assert!(threads[0].is_top_level);
    assert!(threads[0].state.stopped);
}

#[tokio::test]
async fn fork_and_wait_produces_combined_result() {
    let (_, _, store, response) = run_program(fork_wait_program()).await;
    let session = store.get_session(&response.session_id).unwrap();
    assert!(session.finished);
    assert_eq!(session.result, Some(Value::Int(21)));

    let threads = store.list_threads(&response.session_id).unwrap();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|t| t.state.stopped));
    assert_eq!(threads.iter().filter(|t| t.is_top_level).count(), 1);

    // Both futures resolved; the top-level one carries 21
    let top = threads.iter().find(|t| t.is_top_level).unwrap();
    let top_future = store
        .get_future(&response.session_id, top.future_id)
        .unwrap();
    assert!(top_future.resolved);
    assert_eq!(top_future.value, Some(Value::Int(21)));
    assert!(top_future.continuations.is_empty());
}

#[tokio::test]
async fn tail_future_chains_to_top_level() {
    let (_, _, store, response) = run_program(chain_program()).await;
    let session = store.get_session(&response.session_id).unwrap();
    assert!(session.finished);
    assert_eq!(session.result, Some(Value::Int(105)));

    let threads = store.list_threads(&response.session_id).unwrap();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|t| t.state.stopped));

    // The child's future carries the chain into the top-level future
    let child = threads.iter().find(|t| !t.is_top_level).unwrap();
    let top = threads.iter().find(|t| t.is_top_level).unwrap();
    let child_future = store
        .get_future(&response.session_id, child.future_id)
        .unwrap();
    assert_eq!(child_future.chain, Some(top.future_id));
    assert_eq!(child_future.value, Some(Value::Int(105)));
    let top_future = store
        .get_future(&response.session_id, top.future_id)
        .unwrap();
    assert_eq!(top_future.value, Some(Value::Int(105)));
}

#[tokio::test]
async fn fork_fan_out_joins_all_children() {
    // main() = g(1) + g(2) + g(3) via sequential fork/wait, g(x) = x*10
    let mut builder = ExecutableBuilder::new();
    builder.function("main", 0);
    builder.pushv(1).fork_fn("g", 1).wait();
    builder.pushv(2).fork_fn("g", 1).wait();
    builder.fcall("+", 2);
    builder.pushv(3).fork_fn("g", 1).wait();
    builder.fcall("+", 2).ret();
    builder.function("g", 1);
    builder.bind("x").lookup("x").pushv(10).fcall("*", 2).ret();
    let exe = builder.finish().unwrap();

    let (_, _, store, response) = run_program(exe).await;
    let session = store.get_session(&response.session_id).unwrap();
    assert!(session.finished);
    assert_eq!(session.result, Some(Value::Int(60)));

    let threads = store.list_threads(&response.session_id).unwrap();
    assert_eq!(threads.len(), 4);
    assert!(threads.iter().all(|t| t.state.stopped));
}

#[tokio::test]
async fn stdout_is_deterministic_under_serial_dispatch() {
    fn print_program() -> Executable {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.push(Value::Str("parent".into())).print().pop();
        builder.pushv(7).fork_fn("g", 1).wait().ret();
        builder.function("g", 1);
        builder.bind("x");
        builder.push(Value::Str("child".into())).print().pop();
        builder.lookup("x").ret();
        builder.finish().unwrap()
    }

    let (_, _, store_a, resp_a) = run_program(print_program()).await;
    let (_, _, store_b, resp_b) = run_program(print_program()).await;

    let stdout_a: Vec<String> = store_a
        .list_threads(&resp_a.session_id)
        .unwrap()
        .into_iter()
        .map(|t| t.stdout)
        .collect();
    let stdout_b: Vec<String> = store_b
        .list_threads(&resp_b.session_id)
        .unwrap()
        .into_iter()
        .map(|t| t.stdout)
        .collect();
    assert_eq!(stdout_a, vec!["parent\n".to_string(), "child\n".to_string()]);
    assert_eq!(stdout_a, stdout_b);
}

#[tokio::test]
async fn probe_logs_record_steps() {
    let (_, _, store, response) = run_program(arithmetic_program()).await;
    let threads = store.list_threads(&response.session_id).unwrap();
    assert!(threads[0]
        .probe_log
        .iter()
        .any(|line| line.starts_with("[step=1, ip=0]")));
    assert!(threads[0].probe_log.iter().any(|line| line.contains("[CTRL]")));
}

#[tokio::test]
async fn failing_thread_lands_in_exception_slot() {
    // main waits on a child that divides by zero; the child aborts and
    // the session never finishes
    let mut builder = ExecutableBuilder::new();
    builder.function("main", 0);
    builder.pushv(1).fork_fn("bad", 1).wait().ret();
    builder.function("bad", 1);
    builder.bind("x").lookup("x").pushv(0).fcall("/", 2).ret();
    let exe = builder.finish().unwrap();

    let (runtime, _, store, response) = run_program(exe).await;
    let session = store.get_session(&response.session_id).unwrap();
    assert!(!session.finished);

    let output = runtime
        .get_output(OutputRequest {
            session_id: response.session_id.to_string(),
        })
        .unwrap();
    assert_eq!(output.output.len(), 2);
    assert!(output.exceptions[0].is_none());
    let exception = output.exceptions[1].as_ref().expect("child exception");
    assert!(exception.contains("division by zero"));
    assert!(output.events.is_empty());
}

#[tokio::test]
async fn new_session_without_code_or_base_is_client_error() {
    let (runtime, _, _) = serial_runtime();
    let err = runtime
        .new_session(NewSessionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::client("No Teal code"));
}

#[tokio::test]
async fn get_output_validates_session() {
    let (runtime, _, _) = serial_runtime();
    let err = runtime
        .get_output(OutputRequest {
            session_id: String::new(),
        })
        .unwrap_err();
    assert_eq!(err.message, "No session ID");

    let err = runtime
        .get_output(OutputRequest {
            session_id: "missing".to_string(),
        })
        .unwrap_err();
    assert_eq!(err.message, "Couldn't find that session");
    assert_eq!(err.code, 400);
}

/// Stub frontend: "ok" compiles to the arithmetic program, anything
/// else is a syntax error.
struct StubCompiler;

impl CodeCompiler for StubCompiler {
    fn compile(&self, source: &str) -> Result<Executable, CompileError> {
        if source.trim() == "ok" {
            Ok(arithmetic_program())
        } else {
            Err(CompileError::new("unexpected token", 1, 1).with_source_line(source))
        }
    }
}

#[tokio::test]
async fn set_executable_base_and_session_forms() {
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(SerialInvoker::new());
    let runtime = Runtime::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        invoker,
        RuntimeConfig::default(),
    )
    .with_compiler(Arc::new(StubCompiler));

    // Missing content
    let err = runtime
        .set_executable(SetExecutableRequest {
            session_id: None,
            content: None,
        })
        .unwrap_err();
    assert_eq!(err.message, "No Teal code");

    // Base form
    let response = runtime
        .set_executable(SetExecutableRequest {
            session_id: None,
            content: Some("ok".to_string()),
        })
        .unwrap();
    assert_eq!(response.message, "Base executable set successfully");

    // The base executable now backs code-less sessions
    let session = runtime
        .new_session(NewSessionRequest {
            wait_for_finish: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(session.finished);
    assert_eq!(session.result, Some(Value::Int(3)));

    // Session form
    let response = runtime
        .set_executable(SetExecutableRequest {
            session_id: Some(session.session_id.to_string()),
            content: Some("ok".to_string()),
        })
        .unwrap();
    assert_eq!(response.message, "Executable set successfully");
    assert!(store
        .get_session(&session.session_id)
        .unwrap()
        .executable
        .is_some());

    // Error strings
    let err = runtime
        .set_executable(SetExecutableRequest {
            session_id: Some(String::new()),
            content: Some("ok".to_string()),
        })
        .unwrap_err();
    assert_eq!(err.message, "No session ID");

    let err = runtime
        .set_executable(SetExecutableRequest {
            session_id: Some("missing".to_string()),
            content: Some("ok".to_string()),
        })
        .unwrap_err();
    assert_eq!(err.message, "Couldn't find that session");

    let err = runtime
        .set_executable(SetExecutableRequest {
            session_id: None,
            content: Some("(((".to_string()),
        })
        .unwrap_err();
    assert_eq!(err.message, "Error compiling code");
}

#[tokio::test]
async fn compile_errors_surface_with_diagnostics() {
    let (_, invoker, store) = serial_runtime();
    let runtime = Runtime::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        invoker,
        RuntimeConfig::default(),
    )
    .with_compiler(Arc::new(StubCompiler));

    let err = runtime
        .new_session(NewSessionRequest {
            code: Some("(((".to_string()),
            wait_for_finish: false,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, 400);
    assert!(err.message.starts_with("Error compiling code:"));
    assert!(err.message.contains("unexpected token"));
    assert!(err.message.contains("1:1"));
}
