//! Remote-VM boundary: data model and the `TargetVm` capability trait.
//!
//! Everything above this module is wire-protocol agnostic. The JDWP client
//! in [`wire`] implements [`TargetVm`] for live targets; tests implement it
//! with a scripted fake.

pub mod wire;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Remote thread identifier.
pub type ThreadId = u64;
/// Remote object identifier.
pub type ObjectId = u64;
/// Remote reference-type (class) identifier.
pub type ClassId = u64;
/// Remote method identifier, scoped to its declaring class.
pub type MethodId = u64;
/// Identifier of an installed event request (breakpoint, step, watch).
pub type RequestId = u32;

// ── CodeLocation ─────────────────────────────────────────────────────────────

/// A precise executable location inside the target VM.
///
/// Valid for the lifetime of the connection. The `line` is the code-unit
/// (generated) line number; author-source translation happens in the
/// position manager. Non-positive lines mark synthetic code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLocation {
    /// Declaring reference type.
    pub class_id: ClassId,
    /// Binary name of the declaring class (e.g. `MainKt`).
    pub class_name: String,
    /// Method containing the location.
    pub method_id: MethodId,
    /// Simple method name (e.g. `main`, `invokeSuspend`).
    pub method_name: String,
    /// Generated-code line number (non-positive for synthetic code).
    pub line: i32,
    /// Source file name the compiler embedded for the class.
    pub source_name: String,
    /// Bytecode index within the method.
    pub code_index: u64,
}

impl std::fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}({}:{})",
            self.class_name, self.method_name, self.source_name, self.line
        )
    }
}

// ── Threads ──────────────────────────────────────────────────────────────────

/// Scheduling status of a remote thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Running,
    Sleeping,
    Waiting,
    Monitor,
    Zombie,
    NotStarted,
    Unknown,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = match self {
            ThreadStatus::Running => "running",
            ThreadStatus::Sleeping => "sleeping",
            ThreadStatus::Waiting => "waiting",
            ThreadStatus::Monitor => "monitor",
            ThreadStatus::Zombie => "zombie",
            ThreadStatus::NotStarted => "not started",
            ThreadStatus::Unknown => "unknown",
        };
        f.write_str(word)
    }
}

/// Point-in-time snapshot of a remote thread.
///
/// Only valid while captured; re-fetch after any resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub is_suspended: bool,
}

// ── Classes ──────────────────────────────────────────────────────────────────

/// A loaded reference type in the target VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    /// Binary name, dots as separators (e.g. `com.example.MainKt`).
    pub name: String,
    /// Declared source file name, if the class carries one.
    pub source_name: Option<String>,
}

// ── Values ───────────────────────────────────────────────────────────────────

/// A value read from the target VM.
///
/// Strings carry their contents eagerly so display never needs a second
/// round-trip; other objects are expanded lazily through [`TargetVm`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Str { id: ObjectId, value: String },
    Object { id: ObjectId, class_name: String },
    Array { id: ObjectId, class_name: String, length: u32 },
}

impl Value {
    /// Type name as shown to the user.
    pub fn type_name(&self) -> String {
        match self {
            Value::Void => "void".into(),
            Value::Null => "null".into(),
            Value::Bool(_) => "boolean".into(),
            Value::Byte(_) => "byte".into(),
            Value::Short(_) => "short".into(),
            Value::Int(_) => "int".into(),
            Value::Long(_) => "long".into(),
            Value::Float(_) => "float".into(),
            Value::Double(_) => "double".into(),
            Value::Char(_) => "char".into(),
            Value::Str { .. } => "java.lang.String".into(),
            Value::Object { class_name, .. } | Value::Array { class_name, .. } => {
                class_name.clone()
            }
        }
    }

    /// The remote object identity, when this value is a reference.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Str { id, .. } | Value::Object { id, .. } | Value::Array { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }

    /// Returns `true` if expanding this value can yield children.
    pub fn is_expandable(&self) -> bool {
        matches!(self, Value::Object { .. } | Value::Array { .. })
    }
}

/// A named local slot in a stack frame, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSlot {
    pub name: String,
    pub type_name: String,
    pub value: Value,
    /// Declared as a method argument rather than a body local.
    pub is_argument: bool,
}

/// A named field of a remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub type_name: String,
    pub value: Value,
}

/// A raw VM stack frame: index 0 is innermost.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub location: CodeLocation,
    pub is_native: bool,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// What the target suspended when an event set fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

/// One event decoded from the target's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum VmEvent {
    VmStart {
        thread: ThreadId,
    },
    Breakpoint {
        request: RequestId,
        thread: ThreadId,
        location: CodeLocation,
    },
    Step {
        request: RequestId,
        thread: ThreadId,
        location: CodeLocation,
    },
    Exception {
        thread: ThreadId,
        class_name: String,
        message: Option<String>,
        is_caught: bool,
        location: Option<CodeLocation>,
    },
    ClassPrepare {
        request: RequestId,
        class: ClassInfo,
    },
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    VmDeath,
    Disconnected,
}

/// A batch of events delivered together by the target.
///
/// All events in a set share one suspend policy; resuming the set resumes
/// whatever the policy suspended.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<VmEvent>,
}

// ── Step depth ───────────────────────────────────────────────────────────────

/// Depth of a step request. Granularity is always one source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

// ── Class-prepare filtering ──────────────────────────────────────────────────

/// Server-side filter for a class-prepare watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassPrepareFilter {
    /// Every prepared class.
    Any,
    /// Class-name pattern with a `*` wildcard at either end.
    ClassPattern(String),
    /// Classes whose declared source file matches exactly.
    SourceName(String),
}

// ── TargetVm ─────────────────────────────────────────────────────────────────

/// Capabilities the debugger needs from a connected target VM.
///
/// The handle is thread-safe; operations may be issued from the event-pump
/// thread or any caller thread. Frame and variable reads are only defined
/// while the thread of interest is suspended — callers enforce that.
pub trait TargetVm: Send + Sync {
    // Threads
    fn threads(&self) -> Result<Vec<ThreadInfo>>;
    fn thread_info(&self, thread: ThreadId) -> Result<ThreadInfo>;

    // Classes and line tables
    fn all_classes(&self) -> Result<Vec<ClassInfo>>;
    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassInfo>>;
    /// The class's embedded debug-extension attribute (SMAP text), if any.
    fn source_debug_extension(&self, class: ClassId) -> Result<Option<String>>;
    /// Every line-table entry of every method of the class.
    fn line_table(&self, class: ClassId) -> Result<Vec<CodeLocation>>;
    /// Line-table entries of the class matching one generated line.
    fn locations_of_line(&self, class: ClassId, line: i32) -> Result<Vec<CodeLocation>>;

    // Event requests
    fn set_breakpoint(&self, location: &CodeLocation) -> Result<RequestId>;
    fn set_step(&self, thread: ThreadId, depth: StepDepth) -> Result<RequestId>;
    fn set_exception_watch(&self, notify_caught: bool, notify_uncaught: bool)
        -> Result<RequestId>;
    fn set_class_prepare_watch(&self, filter: &ClassPrepareFilter) -> Result<RequestId>;
    fn clear_request(&self, request: RequestId) -> Result<()>;

    // Suspension
    fn suspend_all(&self) -> Result<()>;
    fn resume_all(&self) -> Result<()>;

    // Event stream
    /// Block up to `timeout` for the next event set. `Ok(None)` on timeout.
    fn next_events(&self, timeout: Duration) -> Result<Option<EventSet>>;

    // Frames and variables (target must be suspended)
    fn frames(&self, thread: ThreadId) -> Result<Vec<RawFrame>>;
    fn this_object(&self, thread: ThreadId, frame_index: usize) -> Result<Option<Value>>;
    fn local_variables(&self, thread: ThreadId, frame_index: usize) -> Result<Vec<LocalSlot>>;
    fn set_local_variable(
        &self,
        thread: ThreadId,
        frame_index: usize,
        name: &str,
        value: Value,
    ) -> Result<()>;

    // Object graph (target must be suspended)
    fn fields(&self, object: ObjectId) -> Result<Vec<FieldValue>>;
    fn array_elements(&self, object: ObjectId, start: u32, count: u32) -> Result<Vec<Value>>;
    fn has_nullary_method(&self, object: ObjectId, name: &str) -> Result<bool>;
    /// Invoke a nullary method on `object` with only `thread` running.
    fn invoke_nullary(&self, thread: ThreadId, object: ObjectId, name: &str) -> Result<Value>;

    // Lifecycle
    fn dispose(&self);
}
