//! Breakpoint management: line and method breakpoints, deferred resolution
//! on class load, condition gating, and exception filters.
//!
//! A source breakpoint may materialize into several wire requests (one per
//! remote location). The manager owns every wire request it creates;
//! deleting a record clears all of its requests atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::condition::{self, CondError, Condition, EvalScope};
use crate::error::{DebugError, Result};
use crate::position::PositionManager;
use crate::vm::{ClassInfo, ClassPrepareFilter, CodeLocation, RequestId, TargetVm};

// ── Public records ───────────────────────────────────────────────────────────

/// Unique breakpoint identifier, assigned from 1 and never reused.
pub type BreakpointId = u32;

/// What the user asked to break on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointSpec {
    /// A source line.
    Line { file: String, line: u32 },
    /// Entry of a named method.
    Method {
        class_name: String,
        method_name: String,
    },
}

impl std::fmt::Display for BreakpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointSpec::Line { file, line } => write!(f, "{file}:{line}"),
            BreakpointSpec::Method {
                class_name,
                method_name,
            } => write!(f, "{class_name}.{method_name}"),
        }
    }
}

/// Snapshot of one breakpoint for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub id: BreakpointId,
    pub spec: BreakpointSpec,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_count_target: Option<u64>,
    pub hit_count: u64,
    /// At least one wire request is installed. `false` means pending.
    pub resolved: bool,
}

/// Decision for a wire breakpoint hit, made before any listener runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitVerdict {
    /// Report the hit under this source breakpoint id.
    Stop(BreakpointId),
    /// Swallow the hit and resume transparently.
    Skip,
    /// The request is not owned by this manager.
    Unknown,
}

// ── Internal state ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum ConditionState {
    None,
    /// Parsed and evaluable.
    Ready(Condition),
    /// Did not parse; hits never stop. Retains the source text.
    Broken(String),
}

impl ConditionState {
    fn source(&self) -> Option<String> {
        match self {
            ConditionState::None => None,
            ConditionState::Ready(cond) => Some(cond.source().to_string()),
            ConditionState::Broken(text) => Some(text.clone()),
        }
    }
}

#[derive(Debug)]
struct BreakpointEntry {
    id: BreakpointId,
    spec: BreakpointSpec,
    enabled: bool,
    condition: ConditionState,
    /// One diagnostic per breakpoint for a failing condition.
    condition_diagnosed: bool,
    hit_count_target: Option<u64>,
    hit_count: u64,
    /// Owned wire requests, one per resolved remote location.
    requests: Vec<(RequestId, CodeLocation)>,
}

impl BreakpointEntry {
    fn info(&self) -> BreakpointInfo {
        BreakpointInfo {
            id: self.id,
            spec: self.spec.clone(),
            enabled: self.enabled,
            condition: self.condition.source(),
            hit_count_target: self.hit_count_target,
            hit_count: self.hit_count,
            resolved: !self.requests.is_empty(),
        }
    }
}

#[derive(Default)]
struct Table {
    next_id: BreakpointId,
    entries: HashMap<BreakpointId, BreakpointEntry>,
    by_request: HashMap<RequestId, BreakpointId>,
    /// Class-prepare watches installed for pending breakpoints.
    prepare_watches: Vec<RequestId>,
}

// ── BreakpointManager ────────────────────────────────────────────────────────

/// Owns every breakpoint of a session.
///
/// Shared between the event pump and caller threads; compound operations
/// (resolve-then-register) hold the table lock throughout so ids stay unique
/// and request ownership stays consistent.
pub struct BreakpointManager {
    vm: Arc<dyn TargetVm>,
    positions: Arc<PositionManager>,
    table: Mutex<Table>,
}

impl BreakpointManager {
    pub fn new(vm: Arc<dyn TargetVm>, positions: Arc<PositionManager>) -> Self {
        Self {
            vm,
            positions,
            table: Mutex::new(Table {
                next_id: 1,
                ..Table::default()
            }),
        }
    }

    // ── Adding ───────────────────────────────────────────────────────────────

    /// Add a line breakpoint. Resolves eagerly when the declaring class is
    /// loaded, otherwise records the breakpoint as pending and installs a
    /// class-prepare watch keyed to the source file.
    pub fn add_line(
        &self,
        file: impl Into<String>,
        line: u32,
        condition: Option<&str>,
    ) -> Result<BreakpointInfo> {
        let file = file.into();
        let spec = BreakpointSpec::Line { file, line };
        self.add(spec, condition, None)
    }

    /// Add a method-entry breakpoint.
    pub fn add_method(
        &self,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        condition: Option<&str>,
    ) -> Result<BreakpointInfo> {
        let spec = BreakpointSpec::Method {
            class_name: class_name.into(),
            method_name: method_name.into(),
        };
        self.add(spec, condition, None)
    }

    /// Add with an explicit hit-count target.
    pub fn add_with_hit_count(
        &self,
        spec: BreakpointSpec,
        condition: Option<&str>,
        hit_count_target: Option<u64>,
    ) -> Result<BreakpointInfo> {
        self.add(spec, condition, hit_count_target)
    }

    fn add(
        &self,
        spec: BreakpointSpec,
        condition: Option<&str>,
        hit_count_target: Option<u64>,
    ) -> Result<BreakpointInfo> {
        let locations = self.resolve_spec(&spec)?;

        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;

        let mut entry = BreakpointEntry {
            id,
            spec,
            enabled: true,
            condition: parse_condition(id, condition),
            condition_diagnosed: false,
            hit_count_target,
            hit_count: 0,
            requests: Vec::new(),
        };

        if locations.is_empty() {
            self.watch_class_prepare(&mut table, &entry.spec)?;
            log::debug!("breakpoint {id} pending on {}", entry.spec);
        } else {
            self.install_requests(&mut table, &mut entry, &locations)?;
        }

        let info = entry.info();
        table.entries.insert(id, entry);
        Ok(info)
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Delete a breakpoint and every wire request it owns.
    pub fn delete(&self, id: BreakpointId) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.entries.remove(&id) else {
            return false;
        };
        for (request, _) in &entry.requests {
            table.by_request.remove(request);
            if let Err(err) = self.vm.clear_request(*request) {
                log::warn!("failed to clear wire request {request}: {err}");
            }
        }
        self.drop_watches_if_idle(&mut table);
        true
    }

    /// Enable a disabled breakpoint, re-resolving its wire requests.
    pub fn enable(&self, id: BreakpointId) -> Result<bool> {
        let spec = {
            let mut table = self.lock();
            let Some(entry) = table.entries.get_mut(&id) else {
                return Ok(false);
            };
            if entry.enabled {
                return Ok(true);
            }
            entry.enabled = true;
            entry.spec.clone()
        };
        let locations = self.resolve_spec(&spec)?;
        let mut table = self.lock();
        if let Some(mut entry) = table.entries.remove(&id) {
            if locations.is_empty() {
                self.watch_class_prepare(&mut table, &entry.spec)?;
            } else {
                self.install_requests(&mut table, &mut entry, &locations)?;
            }
            table.entries.insert(id, entry);
        }
        Ok(true)
    }

    /// Disable a breakpoint, clearing its wire requests but keeping the
    /// record.
    pub fn disable(&self, id: BreakpointId) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.entries.get_mut(&id) else {
            return false;
        };
        entry.enabled = false;
        let requests = std::mem::take(&mut entry.requests);
        for (request, _) in requests {
            table.by_request.remove(&request);
            if let Err(err) = self.vm.clear_request(request) {
                log::warn!("failed to clear wire request {request}: {err}");
            }
        }
        true
    }

    /// Replace (or clear) a breakpoint's condition.
    pub fn update_condition(&self, id: BreakpointId, condition: Option<&str>) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.entries.get_mut(&id) else {
            return false;
        };
        entry.condition = parse_condition(id, condition);
        entry.condition_diagnosed = false;
        true
    }

    /// All breakpoints sorted by id.
    pub fn list(&self) -> Vec<BreakpointInfo> {
        let table = self.lock();
        let mut infos: Vec<BreakpointInfo> = table.entries.values().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Look up one breakpoint.
    pub fn get(&self, id: BreakpointId) -> Option<BreakpointInfo> {
        self.lock().entries.get(&id).map(|e| e.info())
    }

    /// Remove every breakpoint. Used by source-scoped replace-all updates.
    pub fn delete_where<F>(&self, mut predicate: F) -> Vec<BreakpointId>
    where
        F: FnMut(&BreakpointInfo) -> bool,
    {
        let doomed: Vec<BreakpointId> = self
            .list()
            .into_iter()
            .filter(|info| predicate(info))
            .map(|info| info.id)
            .collect();
        for id in &doomed {
            self.delete(*id);
        }
        doomed
    }

    // ── Event-pump entry points ──────────────────────────────────────────────

    /// Decide what to do with a wire breakpoint hit. Called by the pump
    /// before any listener. A false or failing condition swallows the hit.
    ///
    /// Condition evaluation reads remote frames, so the table lock is not
    /// held across it.
    pub fn hit_verdict(&self, request: RequestId, scope: &dyn EvalScope) -> HitVerdict {
        let (id, condition) = {
            let table = self.lock();
            let Some(&id) = table.by_request.get(&request) else {
                return HitVerdict::Unknown;
            };
            let Some(entry) = table.entries.get(&id) else {
                return HitVerdict::Unknown;
            };
            if !entry.enabled {
                return HitVerdict::Skip;
            }
            match &entry.condition {
                ConditionState::None => (id, None),
                ConditionState::Broken(_) => return HitVerdict::Skip,
                ConditionState::Ready(cond) => (id, Some(cond.clone())),
            }
        };

        if let Some(cond) = condition {
            let passed = match cond.evaluate(scope) {
                Ok(value) => value,
                Err(err) => {
                    let mut table = self.lock();
                    if let Some(entry) = table.entries.get_mut(&id) {
                        if !entry.condition_diagnosed {
                            entry.condition_diagnosed = true;
                            log::warn!(
                                "breakpoint {id} condition {:?} failed: {err}; treating as false",
                                cond.source()
                            );
                        }
                    }
                    false
                }
            };
            if !passed {
                return HitVerdict::Skip;
            }
        }

        let mut table = self.lock();
        let Some(entry) = table.entries.get_mut(&id) else {
            return HitVerdict::Unknown;
        };
        entry.hit_count += 1;
        if let Some(target) = entry.hit_count_target {
            if entry.hit_count < target {
                return HitVerdict::Skip;
            }
        }
        HitVerdict::Stop(id)
    }

    /// React to a prepared class: try to resolve every pending breakpoint.
    /// Returns the ids that transitioned to resolved.
    pub fn on_class_prepared(&self, class: &ClassInfo) -> Vec<BreakpointId> {
        let pending: Vec<(BreakpointId, BreakpointSpec)> = {
            let table = self.lock();
            table
                .entries
                .values()
                .filter(|e| e.enabled && e.requests.is_empty())
                .map(|e| (e.id, e.spec.clone()))
                .collect()
        };

        let mut resolved = Vec::new();
        for (id, spec) in pending {
            let locations = match self.resolve_spec(&spec) {
                Ok(locations) => locations,
                Err(err) => {
                    log::warn!("resolving {spec} after {} prepared: {err}", class.name);
                    continue;
                }
            };
            if locations.is_empty() {
                continue;
            }
            let mut table = self.lock();
            if let Some(mut entry) = table.entries.remove(&id) {
                if entry.requests.is_empty() {
                    if let Err(err) = self.install_requests(&mut table, &mut entry, &locations) {
                        log::warn!("installing requests for breakpoint {id}: {err}");
                    } else {
                        resolved.push(id);
                    }
                }
                table.entries.insert(id, entry);
            }
        }

        if !resolved.is_empty() {
            let mut table = self.lock();
            self.drop_watches_if_idle(&mut table);
        }
        resolved
    }

    /// The source breakpoint owning a wire request, if any.
    pub fn breakpoint_for_request(&self, request: RequestId) -> Option<BreakpointId> {
        self.lock().by_request.get(&request).copied()
    }

    /// Clear every wire request and watch. Used by session teardown.
    pub fn clear_all(&self) {
        let mut table = self.lock();
        let requests: Vec<RequestId> = table.by_request.keys().copied().collect();
        for request in requests {
            let _ = self.vm.clear_request(request);
        }
        let watches = std::mem::take(&mut table.prepare_watches);
        for watch in watches {
            let _ = self.vm.clear_request(watch);
        }
        table.by_request.clear();
        table.entries.clear();
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().expect("breakpoint table poisoned")
    }

    fn resolve_spec(&self, spec: &BreakpointSpec) -> Result<Vec<CodeLocation>> {
        match spec {
            BreakpointSpec::Line { file, line } => self.positions.find_locations(file, *line),
            BreakpointSpec::Method {
                class_name,
                method_name,
            } => {
                let mut locations = Vec::new();
                for class in self.vm.classes_by_name(class_name)? {
                    let entry = self
                        .vm
                        .line_table(class.id)?
                        .into_iter()
                        .filter(|loc| loc.method_name == *method_name)
                        .min_by_key(|loc| loc.code_index);
                    if let Some(location) = entry {
                        locations.push(location);
                    }
                }
                Ok(locations)
            }
        }
    }

    /// Install one wire request per location. At most one request exists per
    /// (location, breakpoint) pair because locations arrive deduplicated.
    fn install_requests(
        &self,
        table: &mut Table,
        entry: &mut BreakpointEntry,
        locations: &[CodeLocation],
    ) -> Result<()> {
        for location in locations {
            let already = entry
                .requests
                .iter()
                .any(|(_, existing)| existing == location);
            if already {
                continue;
            }
            let request = self.vm.set_breakpoint(location)?;
            table.by_request.insert(request, entry.id);
            entry.requests.push((request, location.clone()));
            log::debug!("breakpoint {} bound to {location}", entry.id);
        }
        Ok(())
    }

    fn watch_class_prepare(&self, table: &mut Table, spec: &BreakpointSpec) -> Result<()> {
        let filter = match spec {
            BreakpointSpec::Line { file, .. } => match infer_class_pattern(file) {
                Some(pattern) => ClassPrepareFilter::ClassPattern(pattern),
                None => ClassPrepareFilter::SourceName(file.clone()),
            },
            BreakpointSpec::Method { class_name, .. } => {
                ClassPrepareFilter::ClassPattern(format!("{class_name}*"))
            }
        };
        let watch = self.vm.set_class_prepare_watch(&filter)?;
        table.prepare_watches.push(watch);
        Ok(())
    }

    /// Once no pending breakpoints remain, the prepare watches are dead
    /// weight; clear them.
    fn drop_watches_if_idle(&self, table: &mut Table) {
        let still_pending = table
            .entries
            .values()
            .any(|e| e.enabled && e.requests.is_empty());
        if still_pending {
            return;
        }
        let watches = std::mem::take(&mut table.prepare_watches);
        for watch in watches {
            if let Err(err) = self.vm.clear_request(watch) {
                log::warn!("failed to clear class-prepare watch {watch}: {err}");
            }
        }
    }
}

fn parse_condition(id: BreakpointId, text: Option<&str>) -> ConditionState {
    match text {
        None => ConditionState::None,
        Some(text) => match condition::parse(text) {
            Ok(cond) => ConditionState::Ready(cond),
            Err(err) => {
                log::warn!("breakpoint {id} condition {text:?} does not parse: {err}");
                ConditionState::Broken(text.to_string())
            }
        },
    }
}

/// Infer the Kotlin facade-class pattern for a source file name:
/// `Main.kt` → `MainKt*`. Returns `None` for non-Kotlin names, which fall
/// back to a source-name filter.
fn infer_class_pattern(file: &str) -> Option<String> {
    let stem = file.strip_suffix(".kt")?;
    if stem.is_empty() || !stem.chars().next().is_some_and(|c| c.is_alphabetic()) {
        return None;
    }
    let mut chars = stem.chars();
    let first = chars.next()?.to_uppercase().to_string();
    Some(format!("{first}{}Kt*", chars.as_str()))
}

// ── Exception filters ────────────────────────────────────────────────────────

/// Recognized exception-breakpoint filter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionFilter {
    Caught,
    Uncaught,
}

impl ExceptionFilter {
    /// Parse a filter name from the adapter or console.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "caught" => Some(ExceptionFilter::Caught),
            "uncaught" => Some(ExceptionFilter::Uncaught),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ExceptionState {
    requests: Vec<RequestId>,
    caught: bool,
    uncaught: bool,
}

/// Installs caught/uncaught exception watches over the VM's root throwable
/// type. Setting filters replaces whatever was installed before.
pub struct ExceptionBreakpointManager {
    vm: Arc<dyn TargetVm>,
    state: Mutex<ExceptionState>,
}

impl ExceptionBreakpointManager {
    pub fn new(vm: Arc<dyn TargetVm>) -> Self {
        Self {
            vm,
            state: Mutex::new(ExceptionState::default()),
        }
    }

    /// Replace the installed exception filters.
    pub fn set_filters(&self, filters: &[ExceptionFilter]) -> Result<()> {
        let mut state = self.state.lock().expect("exception state poisoned");
        let old = std::mem::take(&mut state.requests);
        for request in old {
            if let Err(err) = self.vm.clear_request(request) {
                log::warn!("failed to clear exception watch {request}: {err}");
            }
        }
        state.caught = filters.contains(&ExceptionFilter::Caught);
        state.uncaught = filters.contains(&ExceptionFilter::Uncaught);
        if state.caught || state.uncaught {
            let request = self.vm.set_exception_watch(state.caught, state.uncaught)?;
            state.requests.push(request);
        }
        Ok(())
    }

    /// Whether an exception event with the given caughtness should suspend.
    pub fn should_stop_on_exception(&self, is_caught: bool) -> bool {
        let state = self.state.lock().expect("exception state poisoned");
        if is_caught {
            state.caught
        } else {
            state.uncaught
        }
    }

    /// Whether any filter is installed.
    pub fn is_enabled(&self) -> bool {
        let state = self.state.lock().expect("exception state poisoned");
        state.caught || state.uncaught
    }

    /// Remove every installed watch.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("exception state poisoned");
        let old = std::mem::take(&mut state.requests);
        for request in old {
            let _ = self.vm.clear_request(request);
        }
        state.caught = false;
        state.uncaught = false;
    }
}

impl From<CondError> for DebugError {
    fn from(err: CondError) -> Self {
        DebugError::ConditionError(err.to_string())
    }
}
