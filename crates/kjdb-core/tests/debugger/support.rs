//! Scripted fake target VM and event-collection helpers.
//!
//! `MockVm` implements `TargetVm` from in-memory tables the test sets up,
//! and lets the test inject event sets as if the wire had produced them.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kjdb_core::error::{DebugError, Result};
use kjdb_core::event::{DebugEvent, EventListener};
use kjdb_core::vm::{
    ClassId, ClassInfo, ClassPrepareFilter, CodeLocation, EventSet, FieldValue, LocalSlot,
    ObjectId, RawFrame, RequestId, StepDepth, SuspendPolicy, TargetVm, ThreadId, ThreadInfo,
    ThreadStatus, Value, VmEvent,
};

// ── MockVm ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MockClass {
    pub info: ClassInfo,
    pub smap: Option<String>,
    pub line_table: Vec<CodeLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Breakpoint(CodeLocation),
    Step { thread: ThreadId, depth: StepDepth },
    ExceptionWatch { caught: bool, uncaught: bool },
    ClassPrepareWatch(ClassPrepareFilter),
}

#[derive(Default)]
struct MockState {
    classes: Vec<MockClass>,
    threads: Vec<ThreadInfo>,
    frames: HashMap<ThreadId, Vec<RawFrame>>,
    locals: HashMap<(ThreadId, usize), Vec<LocalSlot>>,
    this_objects: HashMap<(ThreadId, usize), Value>,
    fields: HashMap<ObjectId, Vec<FieldValue>>,
    arrays: HashMap<ObjectId, Vec<Value>>,
    nullary_methods: HashMap<ObjectId, HashMap<String, Value>>,
    next_request: RequestId,
    active: HashMap<RequestId, RequestKind>,
    cleared: Vec<RequestId>,
    resume_count: usize,
    suspend_count: usize,
    disposed: bool,
}

pub struct MockVm {
    state: Mutex<MockState>,
    event_tx: Sender<EventSet>,
    event_rx: Mutex<Receiver<EventSet>>,
}

impl MockVm {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel();
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_request: 1,
                ..MockState::default()
            }),
            event_tx,
            event_rx: Mutex::new(event_rx),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    // ── Scripting ────────────────────────────────────────────────────────────

    /// Register a class with a line table of `(method, line, code_index)`.
    pub fn add_class(
        &self,
        id: ClassId,
        name: &str,
        source_name: Option<&str>,
        smap: Option<&str>,
        lines: &[(&str, i32, u64)],
    ) {
        let info = ClassInfo {
            id,
            name: name.to_string(),
            source_name: source_name.map(str::to_string),
        };
        let line_table = lines
            .iter()
            .enumerate()
            .map(|(i, (method, line, code_index))| CodeLocation {
                class_id: id,
                class_name: name.to_string(),
                method_id: i as u64 + 1,
                method_name: method.to_string(),
                line: *line,
                source_name: source_name.unwrap_or_default().to_string(),
                code_index: *code_index,
            })
            .collect();
        self.lock().classes.push(MockClass {
            info,
            smap: smap.map(str::to_string),
            line_table,
        });
    }

    pub fn add_thread(&self, id: ThreadId, name: &str) {
        self.lock().threads.push(ThreadInfo {
            id,
            name: name.to_string(),
            status: ThreadStatus::Running,
            is_suspended: false,
        });
    }

    pub fn set_thread_suspended(&self, id: ThreadId, suspended: bool) {
        let mut state = self.lock();
        if let Some(thread) = state.threads.iter_mut().find(|t| t.id == id) {
            thread.is_suspended = suspended;
        }
    }

    pub fn set_frames(&self, thread: ThreadId, frames: Vec<RawFrame>) {
        self.lock().frames.insert(thread, frames);
    }

    pub fn set_locals(&self, thread: ThreadId, frame: usize, locals: Vec<LocalSlot>) {
        self.lock().locals.insert((thread, frame), locals);
    }

    pub fn set_this(&self, thread: ThreadId, frame: usize, value: Value) {
        self.lock().this_objects.insert((thread, frame), value);
    }

    pub fn set_fields(&self, object: ObjectId, fields: Vec<FieldValue>) {
        self.lock().fields.insert(object, fields);
    }

    pub fn set_array(&self, object: ObjectId, elements: Vec<Value>) {
        self.lock().arrays.insert(object, elements);
    }

    pub fn set_nullary(&self, object: ObjectId, name: &str, result: Value) {
        self.lock()
            .nullary_methods
            .entry(object)
            .or_default()
            .insert(name.to_string(), result);
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn active_requests(&self) -> Vec<(RequestId, RequestKind)> {
        let state = self.lock();
        let mut requests: Vec<(RequestId, RequestKind)> = state
            .active
            .iter()
            .map(|(id, kind)| (*id, kind.clone()))
            .collect();
        requests.sort_by_key(|(id, _)| *id);
        requests
    }

    pub fn breakpoint_requests(&self) -> Vec<(RequestId, CodeLocation)> {
        self.active_requests()
            .into_iter()
            .filter_map(|(id, kind)| match kind {
                RequestKind::Breakpoint(location) => Some((id, location)),
                _ => None,
            })
            .collect()
    }

    pub fn step_requests(&self) -> Vec<(RequestId, ThreadId, StepDepth)> {
        self.active_requests()
            .into_iter()
            .filter_map(|(id, kind)| match kind {
                RequestKind::Step { thread, depth } => Some((id, thread, depth)),
                _ => None,
            })
            .collect()
    }

    pub fn exception_watches(&self) -> Vec<(bool, bool)> {
        self.active_requests()
            .into_iter()
            .filter_map(|(_, kind)| match kind {
                RequestKind::ExceptionWatch { caught, uncaught } => Some((caught, uncaught)),
                _ => None,
            })
            .collect()
    }

    pub fn class_prepare_watches(&self) -> Vec<ClassPrepareFilter> {
        self.active_requests()
            .into_iter()
            .filter_map(|(_, kind)| match kind {
                RequestKind::ClassPrepareWatch(filter) => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn cleared_requests(&self) -> Vec<RequestId> {
        self.lock().cleared.clone()
    }

    pub fn resume_count(&self) -> usize {
        self.lock().resume_count
    }

    pub fn was_disposed(&self) -> bool {
        self.lock().disposed
    }

    // ── Event injection ──────────────────────────────────────────────────────

    pub fn push_event_set(&self, set: EventSet) {
        let _ = self.event_tx.send(set);
    }

    pub fn fire_hit(&self, request: RequestId, thread: ThreadId) {
        let location = {
            let state = self.lock();
            match state.active.get(&request) {
                Some(RequestKind::Breakpoint(location)) => location.clone(),
                other => panic!("request {request} is not a breakpoint: {other:?}"),
            }
        };
        self.push_event_set(EventSet {
            suspend_policy: SuspendPolicy::All,
            events: vec![VmEvent::Breakpoint {
                request,
                thread,
                location,
            }],
        });
    }

    pub fn fire_step(&self, request: RequestId, thread: ThreadId, location: CodeLocation) {
        self.push_event_set(EventSet {
            suspend_policy: SuspendPolicy::All,
            events: vec![VmEvent::Step {
                request,
                thread,
                location,
            }],
        });
    }

    pub fn fire_class_prepare(&self, request: RequestId, class: ClassInfo) {
        self.push_event_set(EventSet {
            suspend_policy: SuspendPolicy::All,
            events: vec![VmEvent::ClassPrepare { request, class }],
        });
    }

    pub fn fire_exception(&self, thread: ThreadId, class_name: &str, is_caught: bool) {
        self.push_event_set(EventSet {
            suspend_policy: SuspendPolicy::All,
            events: vec![VmEvent::Exception {
                thread,
                class_name: class_name.to_string(),
                message: Some("boom".into()),
                is_caught,
                location: None,
            }],
        });
    }

    pub fn fire_disconnect(&self) {
        self.push_event_set(EventSet {
            suspend_policy: SuspendPolicy::None,
            events: vec![VmEvent::Disconnected],
        });
    }
}

impl TargetVm for MockVm {
    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        Ok(self.lock().threads.clone())
    }

    fn thread_info(&self, thread: ThreadId) -> Result<ThreadInfo> {
        self.lock()
            .threads
            .iter()
            .find(|t| t.id == thread)
            .cloned()
            .ok_or(DebugError::UnknownThread(thread))
    }

    fn all_classes(&self) -> Result<Vec<ClassInfo>> {
        Ok(self.lock().classes.iter().map(|c| c.info.clone()).collect())
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassInfo>> {
        Ok(self
            .lock()
            .classes
            .iter()
            .filter(|c| c.info.name == name)
            .map(|c| c.info.clone())
            .collect())
    }

    fn source_debug_extension(&self, class: ClassId) -> Result<Option<String>> {
        Ok(self
            .lock()
            .classes
            .iter()
            .find(|c| c.info.id == class)
            .and_then(|c| c.smap.clone()))
    }

    fn line_table(&self, class: ClassId) -> Result<Vec<CodeLocation>> {
        Ok(self
            .lock()
            .classes
            .iter()
            .find(|c| c.info.id == class)
            .map(|c| c.line_table.clone())
            .unwrap_or_default())
    }

    fn locations_of_line(&self, class: ClassId, line: i32) -> Result<Vec<CodeLocation>> {
        Ok(self
            .line_table(class)?
            .into_iter()
            .filter(|location| location.line == line)
            .collect())
    }

    fn set_breakpoint(&self, location: &CodeLocation) -> Result<RequestId> {
        let mut state = self.lock();
        let id = state.next_request;
        state.next_request += 1;
        state.active.insert(id, RequestKind::Breakpoint(location.clone()));
        Ok(id)
    }

    fn set_step(&self, thread: ThreadId, depth: StepDepth) -> Result<RequestId> {
        let mut state = self.lock();
        let id = state.next_request;
        state.next_request += 1;
        state.active.insert(id, RequestKind::Step { thread, depth });
        Ok(id)
    }

    fn set_exception_watch(&self, notify_caught: bool, notify_uncaught: bool) -> Result<RequestId> {
        let mut state = self.lock();
        let id = state.next_request;
        state.next_request += 1;
        state.active.insert(
            id,
            RequestKind::ExceptionWatch {
                caught: notify_caught,
                uncaught: notify_uncaught,
            },
        );
        Ok(id)
    }

    fn set_class_prepare_watch(&self, filter: &ClassPrepareFilter) -> Result<RequestId> {
        let mut state = self.lock();
        let id = state.next_request;
        state.next_request += 1;
        state
            .active
            .insert(id, RequestKind::ClassPrepareWatch(filter.clone()));
        Ok(id)
    }

    fn clear_request(&self, request: RequestId) -> Result<()> {
        let mut state = self.lock();
        state.active.remove(&request);
        state.cleared.push(request);
        Ok(())
    }

    fn suspend_all(&self) -> Result<()> {
        let mut state = self.lock();
        state.suspend_count += 1;
        for thread in &mut state.threads {
            thread.is_suspended = true;
        }
        Ok(())
    }

    fn resume_all(&self) -> Result<()> {
        let mut state = self.lock();
        state.resume_count += 1;
        for thread in &mut state.threads {
            thread.is_suspended = false;
        }
        Ok(())
    }

    fn next_events(&self, timeout: Duration) -> Result<Option<EventSet>> {
        let rx = self.event_rx.lock().expect("mock event queue poisoned");
        match rx.recv_timeout(timeout) {
            Ok(set) => Ok(Some(set)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DebugError::VmDisconnected),
        }
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<RawFrame>> {
        Ok(self.lock().frames.get(&thread).cloned().unwrap_or_default())
    }

    fn this_object(&self, thread: ThreadId, frame_index: usize) -> Result<Option<Value>> {
        Ok(self.lock().this_objects.get(&(thread, frame_index)).cloned())
    }

    fn local_variables(&self, thread: ThreadId, frame_index: usize) -> Result<Vec<LocalSlot>> {
        Ok(self
            .lock()
            .locals
            .get(&(thread, frame_index))
            .cloned()
            .unwrap_or_default())
    }

    fn set_local_variable(
        &self,
        thread: ThreadId,
        frame_index: usize,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let mut state = self.lock();
        let slots = state
            .locals
            .get_mut(&(thread, frame_index))
            .ok_or(DebugError::InvalidFrameIndex(frame_index))?;
        let slot = slots
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| DebugError::InvocationFailed(format!("no local named {name}")))?;
        slot.value = value;
        Ok(())
    }

    fn fields(&self, object: ObjectId) -> Result<Vec<FieldValue>> {
        Ok(self.lock().fields.get(&object).cloned().unwrap_or_default())
    }

    fn array_elements(&self, object: ObjectId, start: u32, count: u32) -> Result<Vec<Value>> {
        let state = self.lock();
        let elements = state.arrays.get(&object).cloned().unwrap_or_default();
        Ok(elements
            .into_iter()
            .skip(start as usize)
            .take(count as usize)
            .collect())
    }

    fn has_nullary_method(&self, object: ObjectId, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .nullary_methods
            .get(&object)
            .is_some_and(|methods| methods.contains_key(name)))
    }

    fn invoke_nullary(&self, _thread: ThreadId, object: ObjectId, name: &str) -> Result<Value> {
        self.lock()
            .nullary_methods
            .get(&object)
            .and_then(|methods| methods.get(name).cloned())
            .ok_or_else(|| DebugError::InvocationFailed(format!("no method {name}()")))
    }

    fn dispose(&self) {
        self.lock().disposed = true;
    }
}

// ── Listener & waiting helpers ───────────────────────────────────────────────

/// Records every session event for later assertions.
#[derive(Clone)]
pub struct CollectingListener {
    events: Arc<Mutex<Vec<DebugEvent>>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Vec<DebugEvent> {
        self.events.lock().expect("listener log poisoned").clone()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&DebugEvent) -> bool,
    {
        self.snapshot().iter().filter(|e| predicate(e)).count()
    }
}

impl EventListener for CollectingListener {
    fn on_event(&self, event: &DebugEvent) {
        self.events
            .lock()
            .expect("listener log poisoned")
            .push(event.clone());
    }
}

/// Poll `condition` until it holds or two seconds elapse.
pub fn wait_for<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
