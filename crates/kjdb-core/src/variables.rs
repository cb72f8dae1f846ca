//! Variable rendering, lazy expansion, and the reference registry.
//!
//! Every expandable value gets a stable integer reference so callers can
//! ask for its children later. References never outlive a suspension: the
//! registry is purged on every resume, and stale handles fail with
//! `StaleReference`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::condition::{CondError, CondValue, EvalScope};
use crate::error::{DebugError, Result};
use crate::vm::{ObjectId, TargetVm, ThreadId, Value};

/// Array expansions are capped at this many elements unless an explicit
/// range is requested.
const DEFAULT_ARRAY_CAP: u32 = 10;

/// Displayed strings are truncated at this many characters.
const MAX_STRING_DISPLAY: usize = 100;

// ── VariableRecord ───────────────────────────────────────────────────────────

/// One rendered variable, ready for the console or adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRecord {
    pub name: String,
    pub type_name: String,
    pub value: String,
    /// Frame local (or `this`) as opposed to an object member.
    pub is_local: bool,
    /// Registry handle for expansion; 0 when the value has no children.
    pub reference: i32,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// What a variable reference points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarTarget {
    /// A stack frame's locals. Holds thread and index, never a frame
    /// handle: frame handles are invalidated by any resume.
    Frame {
        thread: ThreadId,
        frame_index: usize,
    },
    /// A remote object's fields. Keeps the suspended thread for
    /// display-time method invocation.
    Object {
        object: ObjectId,
        class_name: String,
        thread: ThreadId,
    },
    /// A slice of a remote array. The thread is carried for expanding
    /// object elements.
    ArraySlice {
        object: ObjectId,
        start: u32,
        count: u32,
        thread: ThreadId,
    },
}

#[derive(Default)]
struct RegistryState {
    next: i32,
    entries: HashMap<i32, VarTarget>,
}

/// Session-owned table of live variable references.
#[derive(Default)]
pub struct VariableRegistry {
    state: Mutex<RegistryState>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target and return its fresh reference. References are
    /// monotonically assigned for the whole session so a purged handle can
    /// never be confused with a new one.
    pub fn register(&self, target: VarTarget) -> i32 {
        let mut state = self.state.lock().expect("variable registry poisoned");
        state.next += 1;
        let reference = state.next;
        state.entries.insert(reference, target);
        reference
    }

    /// Resolve a reference issued during the current suspension.
    pub fn get(&self, reference: i32) -> Result<VarTarget> {
        self.state
            .lock()
            .expect("variable registry poisoned")
            .entries
            .get(&reference)
            .cloned()
            .ok_or(DebugError::StaleReference(reference))
    }

    /// Purge every reference. Called on each transition out of Suspended,
    /// before listeners observe the resume.
    pub fn clear(&self) {
        self.state
            .lock()
            .expect("variable registry poisoned")
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("variable registry poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Inspector ────────────────────────────────────────────────────────────────

/// Renders remote values and expands compound ones.
///
/// Display-time method invocations run single-threaded on the suspended
/// thread, and only while the session is suspended; callers gate on state.
pub struct Inspector {
    vm: Arc<dyn TargetVm>,
    registry: Arc<VariableRegistry>,
}

impl Inspector {
    pub fn new(vm: Arc<dyn TargetVm>, registry: Arc<VariableRegistry>) -> Self {
        Self { vm, registry }
    }

    /// Local variables of a real frame: `this` first when present, then
    /// every visible local in declaration order.
    pub fn locals(&self, thread: ThreadId, frame_index: usize) -> Result<Vec<VariableRecord>> {
        let mut records = Vec::new();
        if let Some(this) = self.vm.this_object(thread, frame_index)? {
            records.push(self.render("this", &this, true, thread));
        }
        for slot in self.vm.local_variables(thread, frame_index)? {
            records.push(self.render(&slot.name, &slot.value, true, thread));
        }
        Ok(records)
    }

    /// One local by name, `this` included.
    pub fn local(
        &self,
        thread: ThreadId,
        frame_index: usize,
        name: &str,
    ) -> Result<Option<VariableRecord>> {
        Ok(self
            .locals(thread, frame_index)?
            .into_iter()
            .find(|record| record.name == name))
    }

    /// Children of a previously issued reference.
    pub fn expand(&self, reference: i32) -> Result<Vec<VariableRecord>> {
        match self.registry.get(reference)? {
            VarTarget::Frame {
                thread,
                frame_index,
            } => self.locals(thread, frame_index),
            VarTarget::Object {
                object,
                class_name,
                thread,
            } => self.expand_object(object, &class_name, thread),
            VarTarget::ArraySlice {
                object,
                start,
                count,
                thread,
            } => self.expand_array(object, start, count, thread),
        }
    }

    /// Children of an array reference over an explicit element range.
    pub fn expand_range(&self, reference: i32, start: u32, count: u32) -> Result<Vec<VariableRecord>> {
        match self.registry.get(reference)? {
            VarTarget::ArraySlice { object, thread, .. } => {
                self.expand_array(object, start, count, thread)
            }
            _ => self.expand(reference),
        }
    }

    fn expand_object(
        &self,
        object: ObjectId,
        class_name: &str,
        thread: ThreadId,
    ) -> Result<Vec<VariableRecord>> {
        let mut records = Vec::new();
        for field in self.vm.fields(object)? {
            records.push(self.render(&field.name, &field.value, false, thread));
        }
        if is_collection_class(class_name) && self.vm.has_nullary_method(object, "size")? {
            let display = match self.vm.invoke_nullary(thread, object, "size") {
                Ok(value) => self.display_value(&value),
                Err(err) => format!("<error: {err}>"),
            };
            records.push(VariableRecord {
                name: "size".into(),
                type_name: "int".into(),
                value: display,
                is_local: false,
                reference: 0,
            });
        }
        Ok(records)
    }

    fn expand_array(
        &self,
        object: ObjectId,
        start: u32,
        count: u32,
        thread: ThreadId,
    ) -> Result<Vec<VariableRecord>> {
        let elements = self.vm.array_elements(object, start, count)?;
        Ok(elements
            .iter()
            .enumerate()
            .map(|(offset, value)| {
                let index = start + offset as u32;
                self.render(&format!("[{index}]"), value, false, thread)
            })
            .collect())
    }

    /// Render one value, registering a reference when it is expandable.
    pub fn render(
        &self,
        name: &str,
        value: &Value,
        is_local: bool,
        thread: ThreadId,
    ) -> VariableRecord {
        let reference = match value {
            Value::Object { id, class_name } => self.registry.register(VarTarget::Object {
                object: *id,
                class_name: class_name.clone(),
                thread,
            }),
            Value::Array { id, length, .. } => self.registry.register(VarTarget::ArraySlice {
                object: *id,
                start: 0,
                count: (*length).min(DEFAULT_ARRAY_CAP),
                thread,
            }),
            _ => 0,
        };
        VariableRecord {
            name: name.to_string(),
            type_name: value.type_name(),
            value: self.display_value(value),
            is_local,
            reference,
        }
    }

    /// Human-readable form of a value.
    pub fn display_value(&self, value: &Value) -> String {
        match value {
            Value::Void => "void".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Byte(n) => n.to_string(),
            Value::Short(n) => n.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Long(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Double(n) => n.to_string(),
            Value::Char(c) => format!("'{c}'"),
            Value::Str { value, .. } => format!("\"{}\"", truncate(value, MAX_STRING_DISPLAY)),
            Value::Object { class_name, id } => format!("{class_name}@{id}"),
            Value::Array {
                class_name, length, ..
            } => format!("{class_name}[{length}]"),
        }
    }
}

/// Well-known collection types live under the platform collection
/// namespace.
fn is_collection_class(class_name: &str) -> bool {
    class_name.starts_with("java.util.")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}…")
}

// ── FrameScope ───────────────────────────────────────────────────────────────

/// Condition/evaluation scope over a suspended frame: visible locals first,
/// then fields of `this`.
pub struct FrameScope<'a> {
    vm: &'a dyn TargetVm,
    thread: ThreadId,
    frame_index: usize,
}

impl<'a> FrameScope<'a> {
    pub fn new(vm: &'a dyn TargetVm, thread: ThreadId, frame_index: usize) -> Self {
        Self {
            vm,
            thread,
            frame_index,
        }
    }

    fn base_value(&self, name: &str) -> Result<Option<Value>> {
        if name == "this" {
            return self.vm.this_object(self.thread, self.frame_index);
        }
        let slot = self
            .vm
            .local_variables(self.thread, self.frame_index)?
            .into_iter()
            .find(|slot| slot.name == name);
        if let Some(slot) = slot {
            return Ok(Some(slot.value));
        }
        // Fall back to a field of `this`.
        let Some(this) = self.vm.this_object(self.thread, self.frame_index)? else {
            return Ok(None);
        };
        let Some(object) = this.object_id() else {
            return Ok(None);
        };
        Ok(self
            .vm
            .fields(object)?
            .into_iter()
            .find(|field| field.name == name)
            .map(|field| field.value))
    }

    fn field_of(&self, value: &Value, name: &str) -> Result<Option<Value>> {
        let Some(object) = value.object_id() else {
            return Ok(None);
        };
        Ok(self
            .vm
            .fields(object)?
            .into_iter()
            .find(|field| field.name == name)
            .map(|field| field.value))
    }
}

impl EvalScope for FrameScope<'_> {
    fn resolve(&self, path: &[String]) -> std::result::Result<CondValue, CondError> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| CondError::UnresolvedName(String::new()))?;
        let mut current = self
            .base_value(first)
            .map_err(|err| CondError::Evaluation(err.to_string()))?
            .ok_or_else(|| CondError::UnresolvedName(first.clone()))?;
        for part in rest {
            current = self
                .field_of(&current, part)
                .map_err(|err| CondError::Evaluation(err.to_string()))?
                .ok_or_else(|| CondError::UnresolvedName(path.join(".")))?;
        }
        Ok(cond_value_of(&current))
    }
}

/// Project a VM value into the condition domain with the usual numeric
/// widening.
pub fn cond_value_of(value: &Value) -> CondValue {
    match value {
        Value::Void | Value::Null => CondValue::Null,
        Value::Bool(b) => CondValue::Bool(*b),
        Value::Byte(n) => CondValue::Int(*n as i64),
        Value::Short(n) => CondValue::Int(*n as i64),
        Value::Int(n) => CondValue::Int(*n as i64),
        Value::Long(n) => CondValue::Int(*n),
        Value::Float(n) => CondValue::Double(*n as f64),
        Value::Double(n) => CondValue::Double(*n),
        Value::Char(c) => CondValue::Str(c.to_string()),
        Value::Str { value, .. } => CondValue::Str(value.clone()),
        Value::Object { id, class_name } => CondValue::Ref {
            id: *id,
            class_name: class_name.clone(),
        },
        Value::Array { id, class_name, .. } => CondValue::Ref {
            id: *id,
            class_name: class_name.clone(),
        },
    }
}
