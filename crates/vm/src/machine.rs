//! The bytecode interpreter.
//!
//! One [`Machine`] executes at a time against exactly one thread of one
//! session; the caller holds the session lock for the whole cycle. The
//! machine reaches into the surrounding runtime only through the
//! [`MachineHost`] capability: forking threads, registering waits, and
//! delivering the thread's result.
//!
//! Suspension points are exactly: WAIT on an unresolved future, RET with
//! an empty call stack (thread termination), and any fatal error. No
//! other instruction yields, and foreign calls run to completion.

use crate::error::{VmError, VmResult};
use crate::executable::Executable;
use crate::foreign::ForeignRegistry;
use crate::instruction::{Instruction, Operand};
use crate::limits::ExecutionLimits;
use crate::op_code::OpCode;
use crate::thread_state::{Frame, ThreadState};
use crate::value::{FutureId, Value};

/// The result of asking the host about a future.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResult {
    /// The future is resolved; here is its value.
    Resolved(Value),

    /// The future is unresolved; a continuation was registered.
    Pending,
}

/// Why the VM loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The thread suspended at a WAIT and will be resumed by dispatch.
    Suspended,

    /// The thread terminated and its future has been dealt with.
    Terminated,
}

/// Capability the interpreter requires from the surrounding session
/// runtime. The controller implements this; tests may stub it.
pub trait MachineHost {
    /// Allocates a child thread and its future to run `function` with
    /// `args`, dispatches the child, and returns the future id.
    fn fork(&mut self, function: &str, args: Vec<Value>) -> VmResult<FutureId>;

    /// Atomically checks the future: if resolved (walking any chain),
    /// returns its value; otherwise registers a continuation at the
    /// given data-stack offset for this thread.
    fn get_or_wait(&mut self, future: FutureId, offset: usize) -> VmResult<WaitResult>;

    /// Delivers the thread's result: resolves the thread's own future,
    /// or chains it when the value is itself a future.
    fn set_thread_result(&mut self, value: Value) -> VmResult<()>;
}

enum Step {
    Continue,
    Suspend,
    Terminate,
}

/// A single VM instance, bound to one thread's state for one cycle.
pub struct Machine<'a, H: MachineHost> {
    host: &'a mut H,
    exe: &'a Executable,
    foreign: &'a ForeignRegistry,
    limits: ExecutionLimits,
    state: ThreadState,
    stdout: String,
    probe: Vec<String>,
    probe_enabled: bool,
    steps: u64,
}

/// What a finished cycle leaves behind for persistence.
pub struct CycleArtifacts {
    /// The thread state to persist.
    pub state: ThreadState,

    /// Stdout produced during this cycle.
    pub stdout: String,

    /// Probe log lines produced during this cycle.
    pub probe: Vec<String>,
}

impl<'a, H: MachineHost> Machine<'a, H> {
    /// Creates a machine over a hydrated thread state.
    pub fn new(
        host: &'a mut H,
        exe: &'a Executable,
        foreign: &'a ForeignRegistry,
        limits: ExecutionLimits,
        state: ThreadState,
        probe_enabled: bool,
    ) -> Self {
        Self {
            host,
            exe,
            foreign,
            limits,
            state,
            stdout: String::new(),
            probe: Vec::new(),
            probe_enabled,
            steps: 0,
        }
    }

    /// Runs until the next suspension point.
    pub fn run(&mut self) -> VmResult<CycleOutcome> {
        self.state.stopped = false;
        loop {
            let ip = self.state.ip;
            let instruction = *self.exe.instruction(ip).ok_or(VmError::BadJump {
                ip,
                len: self.exe.code_len(),
            })?;

            if self.probe_enabled {
                self.steps += 1;
                self.probe
                    .push(format!("[step={}, ip={ip}] {instruction}", self.steps));
            }

            // The ip moves past the instruction before it executes, so a
            // suspended thread resumes at the next instruction.
            self.state.ip = ip + 1;

            match self.execute(instruction)? {
                Step::Continue => {}
                Step::Suspend => {
                    self.state.stopped = true;
                    self.probe_ctrl("suspended waiting on future");
                    return Ok(CycleOutcome::Suspended);
                }
                Step::Terminate => {
                    self.state.stopped = true;
                    self.probe_ctrl("thread terminated");
                    return Ok(CycleOutcome::Terminated);
                }
            }
        }
    }

    /// Tears the machine down into the state and buffers to persist.
    pub fn into_artifacts(self) -> CycleArtifacts {
        CycleArtifacts {
            state: self.state,
            stdout: self.stdout,
            probe: self.probe,
        }
    }

    /// Read access to the thread state mid-cycle.
    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    fn probe_ctrl(&mut self, message: &str) {
        if self.probe_enabled {
            self.probe.push(format!("[CTRL] {message}"));
        }
    }

    fn execute(&mut self, instruction: Instruction) -> VmResult<Step> {
        match (instruction.op, instruction.operand) {
            (OpCode::PUSH, Operand::Const(index)) => {
                let value = self.exe.constant(index as usize)?.clone();
                self.state.push(value, &self.limits)?;
            }
            (OpCode::PUSHV, Operand::Imm(value)) => {
                self.state.push(Value::Int(value as i64), &self.limits)?;
            }
            (OpCode::POP, _) => {
                self.state.pop()?;
            }
            (OpCode::DUP, _) => {
                let top = self.state.peek()?.clone();
                self.state.push(top, &self.limits)?;
            }
            (OpCode::BIND, Operand::Name(index)) => {
                let name = self.exe.constant_name(index as usize)?.to_string();
                let value = self.state.pop()?;
                self.state.bind(&name, value);
            }
            (OpCode::LOOKUP, Operand::Name(index)) => {
                let name = self.exe.constant_name(index as usize)?;
                let value = self.state.lookup(name)?;
                self.state.push(value, &self.limits)?;
            }
            (OpCode::JUMP, Operand::Target(target)) => {
                self.state.ip = target as usize;
            }
            (OpCode::JUMPF, Operand::Target(target)) => {
                let value = self.state.pop()?;
                if !value.is_truthy() {
                    self.state.ip = target as usize;
                }
            }
            (OpCode::CALL, Operand::Argc(argc)) => {
                self.enter_function(argc)?;
            }
            (OpCode::RET, _) => match self.state.pop_frame() {
                Some(frame) => {
                    self.state.ip = frame.return_ip;
                    self.state.leave_scopes_to(frame.scope_depth);
                }
                None => {
                    let result = self.state.pop()?;
                    self.host.set_thread_result(result)?;
                    return Ok(Step::Terminate);
                }
            },
            (OpCode::MRETURN, _) => {
                let result = self.state.pop()?;
                self.host.set_thread_result(result)?;
                return Ok(Step::Terminate);
            }
            (OpCode::FORK, Operand::Argc(argc)) => {
                let callee = self.state.pop()?;
                let name = callable_name(&callee)?;
                let args = self.state.pop_n(argc as usize)?;
                let future_id = self.host.fork(&name, args)?;
                self.probe_ctrl(&format!("forked {name} -> future {future_id}"));
                self.state.push(Value::Future(future_id), &self.limits)?;
            }
            (OpCode::WAIT, _) => {
                let top = self.state.peek()?;
                if let Some(future_id) = top.as_future() {
                    let offset = self.state.top_offset()?;
                    match self.host.get_or_wait(future_id, offset)? {
                        WaitResult::Resolved(value) => {
                            self.state.set_abs(offset, value)?;
                        }
                        WaitResult::Pending => return Ok(Step::Suspend),
                    }
                }
            }
            (OpCode::FCALL, Operand::NameArgc { name, argc }) => {
                let name = self.exe.constant_name(name as usize)?.to_string();
                let args = self.state.pop_n(argc as usize)?;
                let result = self.foreign.invoke(&name, &args)?;
                self.state.push(result, &self.limits)?;
            }
            (OpCode::PRINT, _) => {
                let value = self.state.pop()?;
                self.stdout.push_str(&value.to_string());
                self.stdout.push('\n');
                self.state.push(value, &self.limits)?;
            }
            (OpCode::NOP, _) => {}
            (OpCode::HALT, _) => {
                return Err(VmError::Halted {
                    reason: "explicit HALT".to_string(),
                });
            }
            (op, operand) => {
                return Err(VmError::decode(format!(
                    "malformed instruction: {op} with {operand:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }

    fn enter_function(&mut self, argc: u8) -> VmResult<()> {
        let callee = self.state.pop()?;
        let name = callable_name(&callee)?;
        let entry = self
            .exe
            .function(&name)
            .ok_or_else(|| VmError::link(name.clone(), "unknown function".to_string()))?;
        if entry.arity != argc {
            return Err(VmError::link(
                name,
                format!("arity mismatch: takes {}, called with {argc}", entry.arity),
            ));
        }
        // Arguments stay on the data stack; the function prologue binds
        // them.
        self.state.push_frame(
            Frame {
                return_ip: self.state.ip,
                scope_depth: self.state.scope_depth(),
            },
            &self.limits,
        )?;
        self.state.enter_scope();
        self.state.ip = entry.offset as usize;
        Ok(())
    }
}

fn callable_name(value: &Value) -> VmResult<String> {
    match value {
        Value::Function(name) | Value::Symbol(name) => Ok(name.clone()),
        other => Err(VmError::type_error(
            "function".to_string(),
            other.type_name().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ExecutableBuilder;

    /// Host stub with scripted future behaviour.
    struct StubHost {
        forks: Vec<(String, Vec<Value>)>,
        result: Option<Value>,
        wait_result: Option<WaitResult>,
    }

    impl StubHost {
        fn new() -> Self {
            Self {
                forks: Vec::new(),
                result: None,
                wait_result: None,
            }
        }
    }

    impl MachineHost for StubHost {
        fn fork(&mut self, function: &str, args: Vec<Value>) -> VmResult<FutureId> {
            self.forks.push((function.to_string(), args));
            Ok(self.forks.len() as FutureId)
        }

        fn get_or_wait(&mut self, _future: FutureId, _offset: usize) -> VmResult<WaitResult> {
            Ok(self.wait_result.clone().unwrap_or(WaitResult::Pending))
        }

        fn set_thread_result(&mut self, value: Value) -> VmResult<()> {
            self.result = Some(value);
            Ok(())
        }
    }

    fn run_main(
        exe: &Executable,
        host: &mut StubHost,
    ) -> VmResult<(CycleOutcome, CycleArtifacts)> {
        let entry = exe.function("main").expect("main");
        let foreign = ForeignRegistry::new();
        let mut machine = Machine::new(
            host,
            exe,
            &foreign,
            ExecutionLimits::default(),
            ThreadState::new(entry.offset as usize, vec![]),
            true,
        );
        let outcome = machine.run()?;
        Ok((outcome, machine.into_artifacts()))
    }

    #[test]
    fn test_arithmetic_program() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(1).pushv(2).fcall("+", 2).ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (outcome, _) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(host.result, Some(Value::Int(3)));
    }

    #[test]
    fn test_call_and_bind() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(10).call_fn("double", 1).ret();
        builder.function("double", 1);
        builder.bind("x").lookup("x").pushv(2).fcall("*", 2).ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (outcome, _) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(host.result, Some(Value::Int(20)));
    }

    #[test]
    fn test_link_errors() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.call_fn("missing", 0).ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        assert!(matches!(
            run_main(&exe, &mut host),
            Err(VmError::Link { .. })
        ));

        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(1).call_fn("f", 1).ret();
        builder.function("f", 2);
        builder.ret();
        let exe = builder.finish().unwrap();
        assert!(matches!(
            run_main(&exe, &mut StubHost::new()),
            Err(VmError::Link { .. })
        ));
    }

    #[test]
    fn test_conditional_jump() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.push(Value::Bool(false)).jumpf("else");
        builder.pushv(1).jump("end");
        builder.label("else").pushv(2);
        builder.label("end").ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        run_main(&exe, &mut host).unwrap();
        assert_eq!(host.result, Some(Value::Int(2)));
    }

    #[test]
    fn test_fork_pushes_future() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(5).fork_fn("work", 1).ret();
        builder.function("work", 1);
        builder.ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (outcome, _) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(host.forks, vec![("work".to_string(), vec![Value::Int(5)])]);
        // main returned the future itself
        assert_eq!(host.result, Some(Value::Future(1)));
    }

    #[test]
    fn test_wait_suspends_on_pending() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(5).fork_fn("work", 1).wait().ret();
        builder.function("work", 1);
        builder.ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (outcome, artifacts) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Suspended);
        assert!(artifacts.state.stopped);
        // The future reference is still parked at the recorded offset
        assert_eq!(*artifacts.state.get_abs(0).unwrap(), Value::Future(1));
    }

    #[test]
    fn test_wait_on_resolved_future() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(5).fork_fn("work", 1).wait().ret();
        builder.function("work", 1);
        builder.ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        host.wait_result = Some(WaitResult::Resolved(Value::Int(10)));
        let (outcome, _) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(host.result, Some(Value::Int(10)));
    }

    #[test]
    fn test_wait_on_plain_value_proceeds() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(7).wait().ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (outcome, _) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(host.result, Some(Value::Int(7)));
    }

    #[test]
    fn test_mreturn_terminates_through_frames() {
        // helper MRETURNs while main's frame is still on the call stack
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.call_fn("helper", 0).pushv(99).ret();
        builder.function("helper", 0);
        builder.pushv(7).mreturn();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (outcome, _) = run_main(&exe, &mut host).unwrap();
        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(host.result, Some(Value::Int(7)));
    }

    #[test]
    fn test_dup_and_pop() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(4).dup().fcall("*", 2).pushv(0).pop().ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        run_main(&exe, &mut host).unwrap();
        assert_eq!(host.result, Some(Value::Int(16)));
    }

    #[test]
    fn test_print_appends_stdout() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.push(Value::Str("hello".into())).print().ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (_, artifacts) = run_main(&exe, &mut host).unwrap();
        assert_eq!(artifacts.stdout, "hello\n");
        assert_eq!(host.result, Some(Value::Str("hello".into())));
    }

    #[test]
    fn test_probe_records_steps() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.pushv(1).ret();
        let exe = builder.finish().unwrap();

        let mut host = StubHost::new();
        let (_, artifacts) = run_main(&exe, &mut host).unwrap();
        assert!(artifacts.probe[0].starts_with("[step=1, ip=0]"));
        assert!(artifacts.probe.last().unwrap().contains("[CTRL]"));
    }

    #[test]
    fn test_halt_is_fatal() {
        let mut builder = ExecutableBuilder::new();
        builder.function("main", 0);
        builder.halt();
        let exe = builder.finish().unwrap();

        assert!(matches!(
            run_main(&exe, &mut StubHost::new()),
            Err(VmError::Halted { .. })
        ));
    }
}
