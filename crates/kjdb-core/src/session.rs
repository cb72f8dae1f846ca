//! The session coordinator: owns every sub-component, enforces the session
//! state machine, and exposes the public debugging API.
//!
//! State machine: `NotStarted → Running ⇄ Suspended → Terminated`, with
//! Terminated absorbing. Every query that inspects frames or variables is
//! gated on Suspended; mutating operations after termination fail with
//! `Terminated`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::breakpoint::{
    BreakpointId, BreakpointInfo, BreakpointManager, ExceptionBreakpointManager, ExceptionFilter,
    HitVerdict,
};
use crate::condition;
use crate::connect::{self, LaunchConfig, LaunchedProcess};
use crate::error::{DebugError, Result};
use crate::event::{DebugEvent, EventHandler, EventListener, EventPump};
use crate::frames::{FrameBuilder, StackFrame};
use crate::position::{PositionManager, SourcePosition};
use crate::stepping::{StepController, StepVerdict};
use crate::variables::{FrameScope, Inspector, VariableRecord, VariableRegistry};
use crate::vm::{
    EventSet, StepDepth, SuspendPolicy, TargetVm, ThreadId, ThreadInfo, Value, VmEvent,
};

// ── Session state ────────────────────────────────────────────────────────────

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running,
    Suspended,
    Terminated,
}

/// Construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// The target started suspended and must not be auto-resumed.
    pub suspend_on_start: bool,
}

/// Result of an `evaluate` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalResult {
    pub value: String,
    pub type_name: String,
}

#[derive(Debug)]
struct CoordinatorState {
    phase: SessionState,
    current_thread: Option<ThreadId>,
    current_frame: usize,
    /// Logical stack of the current thread, rebuilt per suspension.
    frame_cache: Vec<StackFrame>,
}

// ── DebugSession ─────────────────────────────────────────────────────────────

/// A debugging session against one target VM.
///
/// Cheap to clone handles are not provided; share the session behind an
/// `Arc` where several surfaces (console, adapter) drive it.
pub struct DebugSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    vm: Arc<dyn TargetVm>,
    positions: Arc<PositionManager>,
    breakpoints: BreakpointManager,
    exceptions: ExceptionBreakpointManager,
    stepper: StepController,
    frames: FrameBuilder,
    registry: Arc<VariableRegistry>,
    inspector: Inspector,
    suspend_on_start: bool,
    process: Option<LaunchedProcess>,
    state: Mutex<CoordinatorState>,
    listeners: Mutex<Vec<(usize, Box<dyn EventListener>)>>,
    next_listener: AtomicUsize,
    pump: Mutex<Option<EventPump>>,
}

impl DebugSession {
    /// Build a session over an already-connected VM handle.
    pub fn new(vm: Arc<dyn TargetVm>, options: SessionOptions) -> Self {
        Self::assemble(vm, options, None)
    }

    /// Attach to a listening debug agent.
    pub fn attach(host: &str, port: u16) -> Result<Self> {
        let vm = connect::attach(host, port)?;
        Ok(Self::assemble(vm, SessionOptions::default(), None))
    }

    /// Launch a target JVM and attach to it.
    pub fn launch(config: &LaunchConfig) -> Result<Self> {
        let (vm, process) = connect::launch(config)?;
        Ok(Self::assemble(
            vm,
            SessionOptions {
                suspend_on_start: config.suspend_on_start,
            },
            Some(process),
        ))
    }

    fn assemble(
        vm: Arc<dyn TargetVm>,
        options: SessionOptions,
        process: Option<LaunchedProcess>,
    ) -> Self {
        let positions = Arc::new(PositionManager::new(Arc::clone(&vm)));
        let registry = Arc::new(VariableRegistry::new());
        let inner = Arc::new(SessionInner {
            breakpoints: BreakpointManager::new(Arc::clone(&vm), Arc::clone(&positions)),
            exceptions: ExceptionBreakpointManager::new(Arc::clone(&vm)),
            stepper: StepController::new(Arc::clone(&vm)),
            frames: FrameBuilder::new(Arc::clone(&vm), Arc::clone(&positions)),
            inspector: Inspector::new(Arc::clone(&vm), Arc::clone(&registry)),
            positions,
            registry,
            suspend_on_start: options.suspend_on_start,
            process,
            state: Mutex::new(CoordinatorState {
                phase: SessionState::NotStarted,
                current_thread: None,
                current_frame: 0,
                frame_cache: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicUsize::new(1),
            pump: Mutex::new(None),
            vm,
        });
        Self { inner }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Begin the session: start the event pump and, unless the target was
    /// launched suspended, resume it once.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            match state.phase {
                SessionState::NotStarted => state.phase = SessionState::Running,
                SessionState::Terminated => return Err(DebugError::Terminated),
                _ => return Ok(()),
            }
        }

        let pump = EventPump::start(
            Arc::clone(&self.inner.vm),
            Arc::clone(&self.inner) as Arc<dyn EventHandler>,
        );
        *self.inner.pump.lock().expect("pump slot poisoned") = Some(pump);

        if let Some(process) = &self.inner.process {
            if let Some(rx) = process.take_output() {
                let inner = Arc::clone(&self.inner);
                std::thread::Builder::new()
                    .name("kjdb-output-events".into())
                    .spawn(move || {
                        for (category, text) in rx {
                            inner.emit(&DebugEvent::Output { category, text });
                        }
                    })
                    .expect("failed to spawn output event thread");
            }
        }

        if !self.inner.suspend_on_start {
            self.inner.vm.resume_all()?;
        }
        Ok(())
    }

    /// Tear the session down. Idempotent; `stop(); stop()` equals `stop()`.
    pub fn stop(&self) {
        self.inner.terminate(true);
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> SessionState {
        self.inner.lock_state().phase
    }

    // ── Breakpoints ──────────────────────────────────────────────────────────

    pub fn add_breakpoint(
        &self,
        file: &str,
        line: u32,
        condition: Option<&str>,
    ) -> Result<BreakpointInfo> {
        self.inner.fail_if_terminated()?;
        self.inner.breakpoints.add_line(file, line, condition)
    }

    pub fn add_method_breakpoint(
        &self,
        class_name: &str,
        method_name: &str,
        condition: Option<&str>,
    ) -> Result<BreakpointInfo> {
        self.inner.fail_if_terminated()?;
        self.inner
            .breakpoints
            .add_method(class_name, method_name, condition)
    }

    /// Line breakpoint that only stops once its hit count reaches the
    /// target.
    pub fn add_breakpoint_with_hit_count(
        &self,
        file: &str,
        line: u32,
        condition: Option<&str>,
        hit_count_target: Option<u64>,
    ) -> Result<BreakpointInfo> {
        self.inner.fail_if_terminated()?;
        self.inner.breakpoints.add_with_hit_count(
            crate::breakpoint::BreakpointSpec::Line {
                file: file.to_string(),
                line,
            },
            condition,
            hit_count_target,
        )
    }

    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<bool> {
        self.inner.fail_if_terminated()?;
        Ok(self.inner.breakpoints.delete(id))
    }

    pub fn list_breakpoints(&self) -> Vec<BreakpointInfo> {
        self.inner.breakpoints.list()
    }

    pub fn enable_breakpoint(&self, id: BreakpointId) -> Result<bool> {
        self.inner.fail_if_terminated()?;
        self.inner.breakpoints.enable(id)
    }

    pub fn disable_breakpoint(&self, id: BreakpointId) -> Result<bool> {
        self.inner.fail_if_terminated()?;
        Ok(self.inner.breakpoints.disable(id))
    }

    pub fn update_breakpoint_condition(
        &self,
        id: BreakpointId,
        condition: Option<&str>,
    ) -> Result<bool> {
        self.inner.fail_if_terminated()?;
        Ok(self.inner.breakpoints.update_condition(id, condition))
    }

    /// Remove every line breakpoint in `file`. Used by adapter replace-all
    /// updates; returns the removed ids.
    pub fn remove_breakpoints_in_file(&self, file: &str) -> Result<Vec<BreakpointId>> {
        self.inner.fail_if_terminated()?;
        Ok(self.inner.breakpoints.delete_where(|info| {
            matches!(&info.spec, crate::breakpoint::BreakpointSpec::Line { file: f, .. } if f == file)
        }))
    }

    pub fn set_exception_breakpoints(&self, filters: &[ExceptionFilter]) -> Result<()> {
        self.inner.fail_if_terminated()?;
        self.inner.exceptions.set_filters(filters)
    }

    pub fn is_exception_breakpoints_enabled(&self) -> bool {
        self.inner.exceptions.is_enabled()
    }

    // ── Execution control ────────────────────────────────────────────────────

    /// Resume the whole target. Suspended → Running.
    pub fn resume(&self) -> Result<()> {
        self.inner.leave_suspended()?;
        self.inner.emit(&DebugEvent::Continued);
        self.inner.vm.resume_all()
    }

    /// Suspend the whole target. Running → Suspended; the first suspended
    /// thread becomes current.
    pub fn suspend(&self) -> Result<()> {
        {
            let state = self.inner.lock_state();
            match state.phase {
                SessionState::Running => {}
                SessionState::Terminated => return Err(DebugError::Terminated),
                _ => return Err(DebugError::NotRunning),
            }
        }
        self.inner.vm.suspend_all()?;
        let threads = self.inner.vm.threads()?;
        let current = threads
            .iter()
            .find(|t| t.is_suspended)
            .or_else(|| threads.first())
            .map(|t| t.id);
        {
            let mut state = self.inner.lock_state();
            state.phase = SessionState::Suspended;
            state.current_thread = current;
            state.current_frame = 0;
            state.frame_cache.clear();
        }
        if let Some(thread) = current {
            self.inner.emit(&DebugEvent::Paused { thread });
        }
        Ok(())
    }

    pub fn step_into(&self) -> Result<()> {
        self.step(StepDepth::Into)
    }

    pub fn step_over(&self) -> Result<()> {
        self.step(StepDepth::Over)
    }

    pub fn step_out(&self) -> Result<()> {
        self.step(StepDepth::Out)
    }

    fn step(&self, depth: StepDepth) -> Result<()> {
        let thread = {
            let state = self.inner.lock_state();
            match state.phase {
                SessionState::Suspended => {}
                SessionState::Terminated => return Err(DebugError::Terminated),
                _ => return Err(DebugError::NotSuspended),
            }
            state.current_thread.ok_or(DebugError::NotSuspended)?
        };
        self.inner.stepper.step(thread, depth)?;
        self.inner.leave_suspended()?;
        self.inner.emit(&DebugEvent::Continued);
        self.inner.vm.resume_all()
    }

    // ── Threads ──────────────────────────────────────────────────────────────

    /// Fresh thread snapshots, refetched on every call.
    pub fn threads(&self) -> Result<Vec<ThreadInfo>> {
        self.inner.fail_if_terminated()?;
        self.inner.vm.threads()
    }

    pub fn select_thread(&self, thread: ThreadId) -> Result<()> {
        self.inner.fail_if_terminated()?;
        let known = self.inner.vm.threads()?.iter().any(|t| t.id == thread);
        if !known {
            return Err(DebugError::UnknownThread(thread));
        }
        let mut state = self.inner.lock_state();
        state.current_thread = Some(thread);
        state.current_frame = 0;
        state.frame_cache.clear();
        Ok(())
    }

    /// Fresh snapshot of the current thread.
    pub fn current_thread(&self) -> Result<Option<ThreadInfo>> {
        self.inner.fail_if_terminated()?;
        let current = self.inner.lock_state().current_thread;
        match current {
            Some(id) => Ok(Some(self.inner.vm.thread_info(id)?)),
            None => Ok(None),
        }
    }

    // ── Frames ───────────────────────────────────────────────────────────────

    /// Logical stack of the current thread, including inline frames.
    pub fn stack_frames(&self) -> Result<Vec<StackFrame>> {
        let thread = self.inner.require_suspended_thread()?;
        let frames = self.inner.frames.build(thread)?;
        let mut state = self.inner.lock_state();
        state.frame_cache = frames.clone();
        if state.current_frame >= frames.len() {
            state.current_frame = 0;
        }
        Ok(frames)
    }

    pub fn select_frame(&self, index: usize) -> Result<()> {
        self.inner.require_suspended_thread()?;
        self.inner.ensure_frame_cache()?;
        let mut state = self.inner.lock_state();
        if index >= state.frame_cache.len() {
            return Err(DebugError::InvalidFrameIndex(index));
        }
        state.current_frame = index;
        Ok(())
    }

    /// Move one frame toward the caller, clamped at the outermost frame.
    pub fn frame_up(&self) -> Result<StackFrame> {
        self.inner.require_suspended_thread()?;
        self.inner.ensure_frame_cache()?;
        let mut state = self.inner.lock_state();
        if state.frame_cache.is_empty() {
            return Err(DebugError::InvalidFrameIndex(0));
        }
        if state.current_frame + 1 < state.frame_cache.len() {
            state.current_frame += 1;
        }
        Ok(state.frame_cache[state.current_frame].clone())
    }

    /// Move one frame toward the callee, clamped at the innermost frame.
    pub fn frame_down(&self) -> Result<StackFrame> {
        self.inner.require_suspended_thread()?;
        self.inner.ensure_frame_cache()?;
        let mut state = self.inner.lock_state();
        if state.frame_cache.is_empty() {
            return Err(DebugError::InvalidFrameIndex(0));
        }
        state.current_frame = state.current_frame.saturating_sub(1);
        Ok(state.frame_cache[state.current_frame].clone())
    }

    pub fn current_frame(&self) -> Result<StackFrame> {
        self.inner.require_suspended_thread()?;
        self.inner.ensure_frame_cache()?;
        let state = self.inner.lock_state();
        state
            .frame_cache
            .get(state.current_frame)
            .cloned()
            .ok_or(DebugError::InvalidFrameIndex(state.current_frame))
    }

    /// Source position of the current frame.
    pub fn current_position(&self) -> Result<Option<SourcePosition>> {
        Ok(self.current_frame()?.position)
    }

    // ── Variables ────────────────────────────────────────────────────────────

    /// Locals of the current frame, `this` first.
    pub fn local_variables(&self) -> Result<Vec<VariableRecord>> {
        let (thread, frame) = self.inner.current_real_frame()?;
        self.inner.inspector.locals(thread, frame)
    }

    /// One local of the current frame by name.
    pub fn variable(&self, name: &str) -> Result<Option<VariableRecord>> {
        let (thread, frame) = self.inner.current_real_frame()?;
        self.inner.inspector.local(thread, frame, name)
    }

    /// A registry reference to a frame's locals, for adapter scopes.
    pub fn frame_reference(&self, index: usize) -> Result<i32> {
        self.inner.require_suspended_thread()?;
        self.inner.ensure_frame_cache()?;
        let state = self.inner.lock_state();
        let frame = state
            .frame_cache
            .get(index)
            .ok_or(DebugError::InvalidFrameIndex(index))?;
        let thread = state.current_thread.ok_or(DebugError::NotSuspended)?;
        Ok(self
            .inner
            .registry
            .register(crate::variables::VarTarget::Frame {
                thread,
                frame_index: frame.real_index,
            }))
    }

    /// Children of a variable reference. The registry is authoritative: a
    /// reference that survived into Running state was purged, so the error
    /// is `StaleReference` rather than `NotSuspended`.
    pub fn expand_variable(&self, reference: i32) -> Result<Vec<VariableRecord>> {
        self.inner.inspector.expand(reference)
    }

    /// Children of an array reference over an explicit range.
    pub fn expand_variable_range(
        &self,
        reference: i32,
        start: u32,
        count: u32,
    ) -> Result<Vec<VariableRecord>> {
        self.inner.inspector.expand_range(reference, start, count)
    }

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// Evaluate an expression against a frame (default: the current one).
    pub fn evaluate(&self, expression: &str, frame_index: Option<usize>) -> Result<EvalResult> {
        let (thread, frame) = match frame_index {
            None => self.inner.current_real_frame()?,
            Some(index) => {
                self.inner.require_suspended_thread()?;
                self.inner.ensure_frame_cache()?;
                let state = self.inner.lock_state();
                let frame = state
                    .frame_cache
                    .get(index)
                    .ok_or(DebugError::InvalidFrameIndex(index))?;
                let thread = state.current_thread.ok_or(DebugError::NotSuspended)?;
                (thread, frame.real_index)
            }
        };
        let parsed = condition::parse(expression)?;
        let scope = FrameScope::new(self.inner.vm.as_ref(), thread, frame);
        let value = parsed.evaluate_value(&scope)?;
        Ok(EvalResult {
            value: value.display(),
            type_name: cond_type_name(&value),
        })
    }

    /// Assign a local in the current frame from a literal or expression.
    pub fn set_variable(&self, name: &str, expression: &str) -> Result<VariableRecord> {
        let (thread, frame) = self.inner.current_real_frame()?;
        let parsed = condition::parse(expression)?;
        let scope = FrameScope::new(self.inner.vm.as_ref(), thread, frame);
        let value = match parsed.evaluate_value(&scope)? {
            condition::CondValue::Null => Value::Null,
            condition::CondValue::Bool(b) => Value::Bool(b),
            condition::CondValue::Int(n) => Value::Long(n),
            condition::CondValue::Double(d) => Value::Double(d),
            condition::CondValue::Str(s) => Value::Str { id: 0, value: s },
            condition::CondValue::Ref { class_name, .. } => {
                return Err(DebugError::InvocationFailed(format!(
                    "cannot assign reference of type {class_name}"
                )))
            }
        };
        self.inner
            .vm
            .set_local_variable(thread, frame, name, value)?;
        self.variable(name)?
            .ok_or_else(|| DebugError::InvocationFailed(format!("no local named {name}")))
    }

    // ── Listeners ────────────────────────────────────────────────────────────

    /// Register a listener; returns a token for removal.
    pub fn add_listener(&self, listener: Box<dyn EventListener>) -> usize {
        let token = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .expect("listener table poisoned")
            .push((token, listener));
        token
    }

    pub fn remove_listener(&self, token: usize) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .expect("listener table poisoned");
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() < before
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.inner.terminate(true);
    }
}

fn cond_type_name(value: &condition::CondValue) -> String {
    match value {
        condition::CondValue::Null => "null".into(),
        condition::CondValue::Bool(_) => "boolean".into(),
        condition::CondValue::Int(_) => "int".into(),
        condition::CondValue::Double(_) => "double".into(),
        condition::CondValue::Str(_) => "java.lang.String".into(),
        condition::CondValue::Ref { class_name, .. } => class_name.clone(),
    }
}

// ── SessionInner ─────────────────────────────────────────────────────────────

impl SessionInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state.lock().expect("session state poisoned")
    }

    fn fail_if_terminated(&self) -> Result<()> {
        if self.lock_state().phase == SessionState::Terminated {
            return Err(DebugError::Terminated);
        }
        Ok(())
    }

    /// Gate for frame/variable queries.
    fn require_suspended_thread(&self) -> Result<ThreadId> {
        let state = self.lock_state();
        match state.phase {
            SessionState::Suspended => state.current_thread.ok_or(DebugError::NotSuspended),
            SessionState::Terminated => Err(DebugError::Terminated),
            _ => Err(DebugError::NotSuspended),
        }
    }

    /// The (thread, real frame index) behind the current logical frame.
    fn current_real_frame(&self) -> Result<(ThreadId, usize)> {
        let thread = self.require_suspended_thread()?;
        self.ensure_frame_cache()?;
        let state = self.lock_state();
        let frame = state
            .frame_cache
            .get(state.current_frame)
            .ok_or(DebugError::InvalidFrameIndex(state.current_frame))?;
        Ok((thread, frame.real_index))
    }

    fn ensure_frame_cache(&self) -> Result<()> {
        let needs_build = {
            let state = self.lock_state();
            state.frame_cache.is_empty()
        };
        if needs_build {
            let thread = self.require_suspended_thread()?;
            let frames = self.frames.build(thread)?;
            let mut state = self.lock_state();
            if state.frame_cache.is_empty() {
                state.frame_cache = frames;
            }
        }
        Ok(())
    }

    /// Shared Suspended → Running transition: purge the reference registry
    /// before any listener can observe the resume.
    fn leave_suspended(&self) -> Result<()> {
        let mut state = self.lock_state();
        match state.phase {
            SessionState::Suspended => {}
            SessionState::Terminated => return Err(DebugError::Terminated),
            _ => return Err(DebugError::NotSuspended),
        }
        self.registry.clear();
        state.phase = SessionState::Running;
        state.current_frame = 0;
        state.frame_cache.clear();
        Ok(())
    }

    /// Fan an event out to every listener unless the session is terminated.
    fn emit(&self, event: &DebugEvent) {
        if self.lock_state().phase == SessionState::Terminated {
            return;
        }
        self.fan_out(event);
    }

    fn fan_out(&self, event: &DebugEvent) {
        let listeners = self.listeners.lock().expect("listener table poisoned");
        for (_, listener) in listeners.iter() {
            listener.on_event(event);
        }
    }

    /// Idempotent teardown shared by `stop()` and disconnect handling.
    fn terminate(&self, dispose: bool) {
        {
            let mut state = self.lock_state();
            if state.phase == SessionState::Terminated {
                return;
            }
            state.phase = SessionState::Terminated;
            state.current_thread = None;
            state.frame_cache.clear();
        }

        self.registry.clear();
        self.stepper.cancel();
        self.breakpoints.clear_all();
        self.exceptions.clear();
        if dispose {
            self.vm.dispose();
        }

        if let Some(process) = &self.process {
            if dispose {
                process.kill();
            } else if let Some(code) = process.wait_exit_code() {
                self.fan_out(&DebugEvent::Exited { exit_code: code });
            }
        }
        self.fan_out(&DebugEvent::Terminated);

        let pump = self.pump.lock().expect("pump slot poisoned").take();
        if let Some(pump) = pump {
            pump.shutdown();
        }
    }
}

// ── Event handling ───────────────────────────────────────────────────────────

impl EventHandler for SessionInner {
    fn on_event_set(&self, set: EventSet) -> bool {
        eprintln!("DEBUG on_event_set called with {} events", set.events.len());
        let mut emitted: Vec<DebugEvent> = Vec::new();
        let mut suspending_thread: Option<ThreadId> = None;
        let mut should_resume = true;

        for event in &set.events {
            match event {
                VmEvent::VmStart { thread } => {
                    emitted.push(DebugEvent::VmStarted {
                        main_thread: *thread,
                    });
                    // start() performs the one resume for a non-suspended
                    // launch; the pump never resumes on this event.
                    should_resume = false;
                    if self.suspend_on_start {
                        suspending_thread = Some(*thread);
                    }
                }
                VmEvent::Breakpoint {
                    request,
                    thread,
                    location,
                } => {
                    let scope = FrameScope::new(self.vm.as_ref(), *thread, 0);
                    match self.breakpoints.hit_verdict(*request, &scope) {
                        HitVerdict::Stop(id) => {
                            should_resume = false;
                            suspending_thread = Some(*thread);
                            emitted.push(DebugEvent::BreakpointHit {
                                breakpoint: id,
                                thread: *thread,
                                position: self.positions.location_to_position(location),
                            });
                        }
                        HitVerdict::Skip => {}
                        HitVerdict::Unknown => {
                            log::debug!("hit on unowned wire request {request}");
                        }
                    }
                }
                VmEvent::Step {
                    request,
                    thread,
                    location,
                } => match self.stepper.on_step_event(*request, location) {
                    StepVerdict::Stop => {
                        should_resume = false;
                        suspending_thread = Some(*thread);
                        emitted.push(DebugEvent::StepCompleted {
                            thread: *thread,
                            position: self.positions.location_to_position(location),
                        });
                    }
                    StepVerdict::Continue | StepVerdict::Unknown => {}
                },
                VmEvent::Exception {
                    thread,
                    class_name,
                    message,
                    is_caught,
                    location,
                } => {
                    if self.exceptions.should_stop_on_exception(*is_caught) {
                        should_resume = false;
                        suspending_thread = Some(*thread);
                        emitted.push(DebugEvent::ExceptionThrown {
                            class_name: class_name.clone(),
                            message: message.clone(),
                            thread: *thread,
                            position: location
                                .as_ref()
                                .and_then(|loc| self.positions.location_to_position(loc)),
                        });
                    }
                }
                VmEvent::ClassPrepare { class, .. } => {
                    // Pending breakpoints must resolve before this set is
                    // resumed.
                    let resolved = self.breakpoints.on_class_prepared(class);
                    if !resolved.is_empty() {
                        log::debug!("{} resolved breakpoints {resolved:?}", class.name);
                    }
                    emitted.push(DebugEvent::ClassPrepared {
                        name: class.name.clone(),
                    });
                }
                VmEvent::ThreadStart { thread } => {
                    emitted.push(DebugEvent::ThreadStarted { thread: *thread });
                }
                VmEvent::ThreadDeath { thread } => {
                    emitted.push(DebugEvent::ThreadDied { thread: *thread });
                }
                VmEvent::VmDeath | VmEvent::Disconnected => {
                    // Terminal transition happens in on_disconnect.
                    should_resume = false;
                }
            }
        }

        if !should_resume {
            if let Some(thread) = suspending_thread {
                let mut state = self.lock_state();
                state.phase = SessionState::Suspended;
                state.current_thread = Some(thread);
                state.current_frame = 0;
                state.frame_cache.clear();
            }
        }

        for event in &emitted {
            self.emit(event);
        }

        should_resume && set.suspend_policy != SuspendPolicy::None
    }

    fn on_disconnect(&self) {
        self.terminate(false);
    }
}
