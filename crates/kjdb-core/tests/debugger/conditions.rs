//! Condition-gated breakpoint hits.

use super::support::wait_for;
use super::*;
use kjdb_core::event::DebugEvent;
use kjdb_core::session::SessionState;

fn conditional_harness() -> (Arc<MockVm>, DebugSession, CollectingListener) {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    vm.set_frames(1, vec![frame_at(1, "MainKt", "main", 20, "Main.kt")]);
    vm.set_locals(1, 0, vec![int_local("x", 3)]);
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();
    (vm, session, listener)
}

#[test]
fn test_false_condition_swallows_hit_and_resumes() {
    let (vm, session, listener) = conditional_harness();
    session.add_breakpoint("Main.kt", 20, Some("x == 99")).unwrap();

    let resumes_before = vm.resume_count();
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);

    // The VM resumes transparently; no stop reaches listeners.
    assert!(wait_for(|| vm.resume_count() > resumes_before));
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })), 0);
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn test_replacing_condition_makes_next_hit_stop() {
    let (vm, session, listener) = conditional_harness();
    let info = session.add_breakpoint("Main.kt", 20, Some("x == 99")).unwrap();

    let resumes_before = vm.resume_count();
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| vm.resume_count() > resumes_before));

    assert!(session.update_breakpoint_condition(info.id, Some("x == 3")).unwrap());
    vm.fire_hit(request, 1);

    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })) == 1
    }));
    assert_eq!(session.state(), SessionState::Suspended);
}

#[test]
fn test_unresolved_identifier_resumes_silently() {
    let (vm, session, listener) = conditional_harness();
    session
        .add_breakpoint("Main.kt", 20, Some("nonexistent == 1"))
        .unwrap();

    let resumes_before = vm.resume_count();
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);

    assert!(wait_for(|| vm.resume_count() > resumes_before));
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })), 0);
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn test_unparseable_condition_still_registers_but_never_stops() {
    let (vm, session, listener) = conditional_harness();
    let info = session
        .add_breakpoint("Main.kt", 20, Some("x &&"))
        .unwrap();
    assert_eq!(info.condition.as_deref(), Some("x &&"));

    let resumes_before = vm.resume_count();
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);

    assert!(wait_for(|| vm.resume_count() > resumes_before));
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })), 0);
}

#[test]
fn test_clearing_condition_restores_unconditional_stop() {
    let (vm, session, listener) = conditional_harness();
    let info = session.add_breakpoint("Main.kt", 20, Some("x == 99")).unwrap();
    assert!(session.update_breakpoint_condition(info.id, None).unwrap());

    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })) == 1
    }));
}

#[test]
fn test_dotted_condition_reads_this_fields() {
    let (vm, session, listener) = conditional_harness();
    vm.set_this(1, 0, kjdb_core::Value::Object { id: 50, class_name: "Counter".into() });
    vm.set_fields(
        50,
        vec![kjdb_core::vm::FieldValue {
            name: "count".into(),
            type_name: "int".into(),
            value: kjdb_core::Value::Int(7),
        }],
    );
    session
        .add_breakpoint("Main.kt", 20, Some("this.count == 7"))
        .unwrap();

    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })) == 1
    }));
}
