//! Step requests over line granularity, with generated-code filtering.
//!
//! At most one step request is active per session. Landing inside compiler
//! generated code (lambda factories, inlined bodies, coroutine plumbing) is
//! not a user-visible stop; the controller issues a continuation step
//! instead.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::vm::{CodeLocation, RequestId, StepDepth, TargetVm, ThreadId};

/// Class-name patterns that mark generated code.
const GENERATED_CLASS_PATTERNS: &[&str] = &["*$$Lambda$*", "*$$inlined$*", "*$lambda$*"];

/// Method names that mark coroutine plumbing.
const GENERATED_METHOD_NAMES: &[&str] = &["invokeSuspend", "resumeWith", "create"];

// ── Verdict ──────────────────────────────────────────────────────────────────

/// Outcome of a step-completed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepVerdict {
    /// A user-visible stop; the request has been cleared.
    Stop,
    /// Landed in generated code; a continuation step was issued and the
    /// target should resume.
    Continue,
    /// The request does not belong to this controller (stale).
    Unknown,
}

// ── StepController ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ActiveStep {
    request: RequestId,
    thread: ThreadId,
    depth: StepDepth,
}

/// Issues and tracks the session's single step request.
pub struct StepController {
    vm: Arc<dyn TargetVm>,
    active: Mutex<Option<ActiveStep>>,
}

impl StepController {
    pub fn new(vm: Arc<dyn TargetVm>) -> Self {
        Self {
            vm,
            active: Mutex::new(None),
        }
    }

    /// Begin a step on `thread`. Any prior step request is cleared first.
    pub fn step(&self, thread: ThreadId, depth: StepDepth) -> Result<()> {
        let mut active = self.lock();
        if let Some(prior) = active.take() {
            if let Err(err) = self.vm.clear_request(prior.request) {
                log::warn!("failed to clear stale step request {}: {err}", prior.request);
            }
        }
        let request = self.vm.set_step(thread, depth)?;
        *active = Some(ActiveStep {
            request,
            thread,
            depth,
        });
        Ok(())
    }

    /// Whether a step request is outstanding.
    pub fn is_stepping(&self) -> bool {
        self.lock().is_some()
    }

    /// Clear the outstanding request, if any. Safe to call repeatedly.
    pub fn cancel(&self) {
        let mut active = self.lock();
        if let Some(prior) = active.take() {
            let _ = self.vm.clear_request(prior.request);
        }
    }

    /// Handle a step-completed event from the pump.
    ///
    /// The wire request is always cleared; when the stop location is
    /// generated code a fresh request of the same depth is issued so the
    /// step lands on the next author line instead.
    pub fn on_step_event(&self, request: RequestId, location: &CodeLocation) -> StepVerdict {
        let mut active = self.lock();
        let Some(current) = *active else {
            return StepVerdict::Unknown;
        };
        if current.request != request {
            return StepVerdict::Unknown;
        }

        if let Err(err) = self.vm.clear_request(current.request) {
            log::warn!("failed to clear completed step request {request}: {err}");
        }
        *active = None;

        if is_generated_location(location) {
            let depth = current.depth;
            match self.vm.set_step(current.thread, depth) {
                Ok(next) => {
                    *active = Some(ActiveStep {
                        request: next,
                        thread: current.thread,
                        depth,
                    });
                    StepVerdict::Continue
                }
                Err(err) => {
                    log::warn!("failed to issue continuation step: {err}");
                    StepVerdict::Stop
                }
            }
        } else {
            StepVerdict::Stop
        }
    }
}

impl StepController {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveStep>> {
        self.active.lock().expect("step state poisoned")
    }
}

// ── Generated-code detection ─────────────────────────────────────────────────

/// Whether a location belongs to compiler-generated code that stepping
/// should skip.
pub fn is_generated_location(location: &CodeLocation) -> bool {
    if location.line <= 0 {
        return true;
    }
    if GENERATED_METHOD_NAMES.contains(&location.method_name.as_str()) {
        return true;
    }
    GENERATED_CLASS_PATTERNS
        .iter()
        .any(|pattern| wildcard_matches(&location.class_name, pattern))
}

/// Match a name against a pattern with `*` wildcards at either end.
fn wildcard_matches(name: &str, pattern: &str) -> bool {
    let starts_open = pattern.starts_with('*');
    let ends_open = pattern.ends_with('*');
    let needle = pattern.trim_matches('*');
    match (starts_open, ends_open) {
        (true, true) => name.contains(needle),
        (true, false) => name.ends_with(needle),
        (false, true) => name.starts_with(needle),
        (false, false) => name == needle,
    }
}
