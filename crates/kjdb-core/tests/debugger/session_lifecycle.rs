//! Session state machine, teardown, and thread snapshots.

use super::support::wait_for;
use super::*;
use kjdb_core::error::DebugError;
use kjdb_core::event::DebugEvent;
use kjdb_core::session::SessionState;
use kjdb_core::vm::ThreadStatus;

fn running_harness() -> (Arc<MockVm>, DebugSession, CollectingListener) {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();
    (vm, session, listener)
}

#[test]
fn test_initial_state_is_not_started() {
    let vm = MockVm::new();
    let (session, _) = harness(vm);
    assert_eq!(session.state(), SessionState::NotStarted);
}

#[test]
fn test_start_resumes_non_suspended_launch_once() {
    let vm = MockVm::new();
    vm.add_thread(1, "main");
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(vm.resume_count(), 1);

    // The queued VMStart event must not trigger a second resume; start()
    // already performed the only one.
    vm.push_event_set(kjdb_core::vm::EventSet {
        suspend_policy: kjdb_core::vm::SuspendPolicy::All,
        events: vec![kjdb_core::vm::VmEvent::VmStart { thread: 1 }],
    });
    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::VmStarted { .. })) == 1
    }));
    assert_eq!(vm.resume_count(), 1);
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn test_suspended_start_does_not_resume() {
    let vm = MockVm::new();
    vm.add_thread(1, "main");
    let session = DebugSession::new(
        Arc::clone(&vm) as Arc<dyn kjdb_core::TargetVm>,
        kjdb_core::SessionOptions {
            suspend_on_start: true,
        },
    );
    let listener = CollectingListener::new();
    session.add_listener(Box::new(listener.clone()));
    session.start().unwrap();
    assert_eq!(vm.resume_count(), 0);

    // The queued VMStart event suspends the session instead of resuming.
    vm.push_event_set(kjdb_core::vm::EventSet {
        suspend_policy: kjdb_core::vm::SuspendPolicy::All,
        events: vec![kjdb_core::vm::VmEvent::VmStart { thread: 1 }],
    });
    assert!(wait_for(|| session.state() == SessionState::Suspended));
    assert_eq!(vm.resume_count(), 0);
    assert_eq!(
        listener.count(|e| matches!(e, DebugEvent::VmStarted { .. })),
        1
    );
}

#[test]
fn test_stop_is_idempotent() {
    let (vm, session, listener) = running_harness();
    session.stop();
    session.stop();

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(vm.was_disposed());
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::Terminated)), 1);
}

#[test]
fn test_terminated_rejects_mutations_and_stays_silent() {
    let (vm, session, listener) = running_harness();
    session.stop();
    let events_after_stop = listener.snapshot().len();

    match session.add_breakpoint("Main.kt", 15, None) {
        Err(DebugError::Terminated) => {}
        other => panic!("unexpected: {other:?}"),
    }
    match session.resume() {
        Err(DebugError::Terminated) => {}
        other => panic!("unexpected: {other:?}"),
    }
    match session.threads() {
        Err(DebugError::Terminated) => {}
        other => panic!("unexpected: {other:?}"),
    }
    match session.suspend() {
        Err(DebugError::Terminated) => {}
        other => panic!("unexpected: {other:?}"),
    }

    // No listener was invoked by the rejected operations.
    assert_eq!(listener.snapshot().len(), events_after_stop);
    let _ = vm;
}

#[test]
fn test_disconnect_event_terminates() {
    let (vm, session, listener) = running_harness();
    vm.fire_disconnect();
    assert!(wait_for(|| session.state() == SessionState::Terminated));
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::Terminated)), 1);
}

#[test]
fn test_suspend_selects_first_suspended_thread() {
    let (vm, session, listener) = running_harness();
    vm.add_thread(2, "worker");

    session.suspend().unwrap();
    assert_eq!(session.state(), SessionState::Suspended);
    let current = session.current_thread().unwrap().unwrap();
    assert_eq!(current.id, 1);
    assert_eq!(
        listener.count(|e| matches!(e, DebugEvent::Paused { thread: 1 })),
        1
    );
}

#[test]
fn test_suspend_requires_running() {
    let (_, session, _) = running_harness();
    session.suspend().unwrap();
    match session.suspend() {
        Err(DebugError::NotRunning) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_resume_requires_suspension() {
    let (_, session, _) = running_harness();
    match session.resume() {
        Err(DebugError::NotSuspended) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_resume_emits_continued() {
    let (vm, session, listener) = running_harness();
    session.suspend().unwrap();
    let resumes_before = vm.resume_count();

    session.resume().unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(vm.resume_count(), resumes_before + 1);
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::Continued)), 1);
}

#[test]
fn test_threads_are_refetched_each_call() {
    let (vm, session, _) = running_harness();
    let first = session.threads().unwrap();
    assert_eq!(first.len(), 1);
    assert!(!first[0].is_suspended);

    vm.add_thread(2, "worker");
    vm.set_thread_suspended(1, true);
    let second = session.threads().unwrap();
    assert_eq!(second.len(), 2);
    assert!(second[0].is_suspended);
}

#[test]
fn test_select_unknown_thread_fails() {
    let (_, session, _) = running_harness();
    match session.select_thread(42) {
        Err(DebugError::UnknownThread(42)) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_thread_status_snapshot_round_trips() {
    let (vm, session, _) = running_harness();
    let status = session.threads().unwrap()[0].status;
    assert_eq!(status, ThreadStatus::Running);
    let _ = vm;
}

#[test]
fn test_listener_removal() {
    let vm = MockVm::new();
    vm.add_thread(1, "main");
    let (session, listener) = harness(Arc::clone(&vm));
    let extra = CollectingListener::new();
    let token = session.add_listener(Box::new(extra.clone()));

    assert!(session.remove_listener(token));
    assert!(!session.remove_listener(token));

    session.start().unwrap();
    session.suspend().unwrap();
    assert_eq!(extra.snapshot().len(), 0);
    assert!(listener.count(|e| matches!(e, DebugEvent::Paused { .. })) == 1);
}
