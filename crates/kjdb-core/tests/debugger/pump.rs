//! Event pump behavior: classification, resume policy, ordering.

use super::support::wait_for;
use super::*;
use kjdb_core::event::DebugEvent;
use kjdb_core::session::SessionState;
use kjdb_core::vm::{EventSet, SuspendPolicy, VmEvent};
use kjdb_core::ExceptionFilter;

fn pump_harness() -> (Arc<MockVm>, DebugSession, CollectingListener) {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();
    (vm, session, listener)
}

#[test]
fn test_non_suspending_events_resume_the_set() {
    let (vm, session, listener) = pump_harness();
    let resumes_before = vm.resume_count();

    vm.push_event_set(EventSet {
        suspend_policy: SuspendPolicy::All,
        events: vec![VmEvent::ThreadStart { thread: 2 }],
    });

    assert!(wait_for(|| vm.resume_count() > resumes_before));
    assert_eq!(
        listener.count(|e| matches!(e, DebugEvent::ThreadStarted { thread: 2 })),
        1
    );
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn test_policy_none_sets_are_not_resumed() {
    let (vm, _, listener) = pump_harness();
    let resumes_before = vm.resume_count();

    vm.push_event_set(EventSet {
        suspend_policy: SuspendPolicy::None,
        events: vec![VmEvent::ThreadDeath { thread: 1 }],
    });

    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::ThreadDied { thread: 1 })) == 1
    }));
    assert_eq!(vm.resume_count(), resumes_before);
}

#[test]
fn test_events_within_a_set_keep_wire_order() {
    let (vm, _, listener) = pump_harness();

    vm.push_event_set(EventSet {
        suspend_policy: SuspendPolicy::All,
        events: vec![
            VmEvent::ThreadStart { thread: 7 },
            VmEvent::ThreadStart { thread: 8 },
            VmEvent::ThreadDeath { thread: 7 },
        ],
    });

    assert!(wait_for(|| listener.snapshot().len() >= 3));
    let order: Vec<DebugEvent> = listener
        .snapshot()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                DebugEvent::ThreadStarted { .. } | DebugEvent::ThreadDied { .. }
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![
            DebugEvent::ThreadStarted { thread: 7 },
            DebugEvent::ThreadStarted { thread: 8 },
            DebugEvent::ThreadDied { thread: 7 },
        ]
    );
}

#[test]
fn test_uncaught_exception_stops_when_filter_installed() {
    let (vm, session, listener) = pump_harness();
    session
        .set_exception_breakpoints(&[ExceptionFilter::Uncaught])
        .unwrap();

    vm.fire_exception(1, "java.lang.IllegalStateException", false);
    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::ExceptionThrown { .. })) == 1
    }));
    assert_eq!(session.state(), SessionState::Suspended);

    let events = listener.snapshot();
    let exception = events
        .iter()
        .find_map(|e| match e {
            DebugEvent::ExceptionThrown {
                class_name,
                message,
                thread,
                ..
            } => Some((class_name.clone(), message.clone(), *thread)),
            _ => None,
        })
        .unwrap();
    assert_eq!(exception.0, "java.lang.IllegalStateException");
    assert_eq!(exception.1.as_deref(), Some("boom"));
    assert_eq!(exception.2, 1);
}

#[test]
fn test_caught_exception_resumes_when_only_uncaught_filtered() {
    let (vm, session, listener) = pump_harness();
    session
        .set_exception_breakpoints(&[ExceptionFilter::Uncaught])
        .unwrap();

    let resumes_before = vm.resume_count();
    vm.fire_exception(1, "java.lang.RuntimeException", true);

    assert!(wait_for(|| vm.resume_count() > resumes_before));
    assert_eq!(
        listener.count(|e| matches!(e, DebugEvent::ExceptionThrown { .. })),
        0
    );
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn test_class_prepare_is_delivered_and_resumed() {
    let (vm, session, listener) = pump_harness();
    // A pending breakpoint installs the watch the event will arrive on.
    session.add_breakpoint("Other.kt", 3, None).unwrap();
    let watch = vm
        .active_requests()
        .into_iter()
        .find_map(|(id, kind)| match kind {
            super::support::RequestKind::ClassPrepareWatch(_) => Some(id),
            _ => None,
        })
        .unwrap();

    let resumes_before = vm.resume_count();
    vm.fire_class_prepare(
        watch,
        kjdb_core::vm::ClassInfo {
            id: 9,
            name: "Unrelated".into(),
            source_name: Some("Unrelated.kt".into()),
        },
    );

    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::ClassPrepared { .. })) == 1
    }));
    assert!(vm.resume_count() > resumes_before);
}

#[test]
fn test_breakpoint_hit_reports_position() {
    let (vm, session, listener) = pump_harness();
    vm.set_frames(1, vec![frame_at(1, "MainKt", "main", 15, "Main.kt")]);
    let info = session.add_breakpoint("Main.kt", 15, None).unwrap();

    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);

    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })) == 1
    }));
    let events = listener.snapshot();
    let hit = events
        .iter()
        .find_map(|e| match e {
            DebugEvent::BreakpointHit {
                breakpoint,
                thread,
                position,
            } => Some((*breakpoint, *thread, position.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(hit.0, info.id);
    assert_eq!(hit.1, 1);
    let position = hit.2.unwrap();
    assert_eq!(position.file, "Main.kt");
    assert_eq!(position.line, 15);
}

#[test]
fn test_vm_death_terminates_without_resume() {
    let (vm, session, listener) = pump_harness();
    let resumes_before = vm.resume_count();

    vm.push_event_set(EventSet {
        suspend_policy: SuspendPolicy::None,
        events: vec![VmEvent::VmDeath],
    });

    assert!(wait_for(|| session.state() == SessionState::Terminated));
    assert_eq!(vm.resume_count(), resumes_before);
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::Terminated)), 1);
}
