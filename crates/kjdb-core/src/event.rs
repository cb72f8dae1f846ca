//! The per-session event pump and the core-visible event model.
//!
//! One dedicated thread drains the target's event queue. Conversion and
//! policy (conditions, pending breakpoints, generated-code steps) belong to
//! the session, reached through [`EventHandler`]; the pump only schedules:
//! drain, hand over, resume when asked, stop on disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::breakpoint::BreakpointId;
use crate::position::SourcePosition;
use crate::vm::{EventSet, TargetVm, ThreadId, VmEvent};

/// How long one queue poll blocks before re-checking the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── Core-visible events ──────────────────────────────────────────────────────

/// Category of a forwarded output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Stdout,
    Stderr,
    Console,
}

/// Events delivered to session listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    VmStarted {
        main_thread: ThreadId,
    },
    BreakpointHit {
        breakpoint: BreakpointId,
        thread: ThreadId,
        position: Option<SourcePosition>,
    },
    StepCompleted {
        thread: ThreadId,
        position: Option<SourcePosition>,
    },
    ExceptionThrown {
        class_name: String,
        message: Option<String>,
        thread: ThreadId,
        position: Option<SourcePosition>,
    },
    /// The session was suspended by an explicit pause request.
    Paused {
        thread: ThreadId,
    },
    Continued,
    ThreadStarted {
        thread: ThreadId,
    },
    ThreadDied {
        thread: ThreadId,
    },
    ClassPrepared {
        name: String,
    },
    Output {
        category: OutputCategory,
        text: String,
    },
    /// A launched target exited with this code.
    Exited {
        exit_code: i32,
    },
    Terminated,
}

impl DebugEvent {
    /// Whether this event leaves the target suspended.
    pub fn leaves_suspended(&self) -> bool {
        matches!(
            self,
            DebugEvent::BreakpointHit { .. }
                | DebugEvent::StepCompleted { .. }
                | DebugEvent::ExceptionThrown { .. }
                | DebugEvent::Paused { .. }
        )
    }
}

/// Receives session events. Callbacks run on the pump thread and must
/// return promptly.
pub trait EventListener: Send {
    fn on_event(&self, event: &DebugEvent);
}

// ── Pump ─────────────────────────────────────────────────────────────────────

/// Converts and dispatches raw event sets on behalf of the pump.
pub trait EventHandler: Send + Sync + 'static {
    /// Process one event set. Returns `true` when the pump should resume
    /// the target afterwards.
    fn on_event_set(&self, set: EventSet) -> bool;

    /// The connection is gone (disconnect event or I/O failure). Called at
    /// most once per pump.
    fn on_disconnect(&self);
}

/// The dedicated event-pump thread of one session.
pub struct EventPump {
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventPump {
    /// Spawn the pump thread.
    pub fn start(vm: Arc<dyn TargetVm>, handler: Arc<dyn EventHandler>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("kjdb-event-pump".into())
            .spawn(move || pump_loop(vm, handler, flag))
            .expect("failed to spawn event pump thread");
        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the pump to stop and wait for it. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().expect("pump handle poisoned").take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn pump_loop(vm: Arc<dyn TargetVm>, handler: Arc<dyn EventHandler>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        eprintln!("DEBUG pump loop iter");
        let set = match vm.next_events(POLL_INTERVAL) {
            Ok(Some(set)) => set,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("DEBUG pump got ERROR from next_events: {err}");
                handler.on_disconnect();
                return;
            }
        };

        let terminal = set
            .events
            .iter()
            .any(|event| matches!(event, VmEvent::VmDeath | VmEvent::Disconnected));

        let resume = handler.on_event_set(set);

        if terminal {
            handler.on_disconnect();
            return;
        }
        if resume {
            if let Err(err) = vm.resume_all() {
                log::warn!("resume after event set failed: {err}");
            }
        }
    }
}
