//! Stack building (inline virtualization) and variable inspection.

use super::support::wait_for;
use super::*;
use kjdb_core::error::DebugError;
use kjdb_core::session::SessionState;
use kjdb_core::vm::FieldValue;
use kjdb_core::Value;
use pretty_assertions::assert_eq;

const CALLER_SMAP: &str = concat!(
    "SMAP\nCallerKt.class\nKotlin\n*S Kotlin\n*F\n",
    "+ 1 Caller.kt\nCaller.kt\n+ 2 Inline.kt\nInline.kt\n",
    "*L\n1#1,5:1\n10#2,3:6\n*E\n"
);

/// Session suspended at Main.kt:15 with scripted locals.
fn locals_harness() -> (Arc<MockVm>, DebugSession, CollectingListener) {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    vm.set_frames(1, vec![frame_at(1, "MainKt", "main", 15, "Main.kt")]);
    vm.set_locals(1, 0, vec![int_local("a", 10), int_local("b", 20)]);
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();
    session.add_breakpoint("Main.kt", 15, None).unwrap();
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| session.state() == SessionState::Suspended));
    (vm, session, listener)
}

#[test]
fn test_inline_stack_virtualization() {
    let vm = MockVm::new();
    vm.add_class(3, "CallerKt", Some("Caller.kt"), Some(CALLER_SMAP), &[]);
    vm.add_thread(1, "main");
    vm.set_frames(1, vec![frame_at(3, "CallerKt", "main", 7, "Caller.kt")]);
    let (session, _) = harness(Arc::clone(&vm));
    session.start().unwrap();
    session.suspend().unwrap();

    let frames = session.stack_frames().unwrap();
    assert_eq!(frames.len(), 2);

    assert!(frames[0].is_inline);
    assert_eq!(frames[0].index, 0);
    assert_eq!(frames[0].inline_depth, 1);
    let top = frames[0].position.as_ref().unwrap();
    assert_eq!(top.file, "Inline.kt");
    assert_eq!(top.line, 11);

    assert!(!frames[1].is_inline);
    assert_eq!(frames[1].index, 1);
    assert_eq!(frames[1].inline_depth, 0);
    assert_eq!(frames[1].source_name, "Caller.kt");
    assert_eq!(frames[1].position, None);
}

#[test]
fn test_non_inline_line_maps_directly() {
    let vm = MockVm::new();
    vm.add_class(3, "CallerKt", Some("Caller.kt"), Some(CALLER_SMAP), &[]);
    vm.add_thread(1, "main");
    vm.set_frames(1, vec![frame_at(3, "CallerKt", "main", 3, "Caller.kt")]);
    let (session, _) = harness(Arc::clone(&vm));
    session.start().unwrap();
    session.suspend().unwrap();

    let frames = session.stack_frames().unwrap();
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].is_inline);
    let pos = frames[0].position.as_ref().unwrap();
    assert_eq!(pos.file, "Caller.kt");
    assert_eq!(pos.line, 3);
}

#[test]
fn test_locals_at_breakpoint_then_after_step() {
    let (vm, session, listener) = locals_harness();

    let locals = session.local_variables().unwrap();
    let rendered: Vec<(String, String, String)> = locals
        .iter()
        .map(|v| (v.name.clone(), v.type_name.clone(), v.value.clone()))
        .collect();
    assert_eq!(
        rendered,
        vec![
            ("a".into(), "int".into(), "10".into()),
            ("b".into(), "int".into(), "20".into()),
        ]
    );

    // One step later the new local is visible.
    session.step_over().unwrap();
    vm.set_locals(
        1,
        0,
        vec![int_local("a", 10), int_local("b", 20), int_local("sum", 30)],
    );
    let step_request = vm.step_requests()[0].0;
    vm.fire_step(step_request, 1, location(1, "MainKt", "main", 16, "Main.kt"));
    assert!(wait_for(|| {
        listener.count(|e| matches!(e, kjdb_core::DebugEvent::StepCompleted { .. })) == 1
    }));

    let locals = session.local_variables().unwrap();
    assert_eq!(locals.len(), 3);
    assert_eq!(locals[2].name, "sum");
    assert_eq!(locals[2].value, "30");
}

#[test]
fn test_this_is_first_entry() {
    let (vm, session, _) = locals_harness();
    vm.set_this(1, 0, Value::Object { id: 40, class_name: "App".into() });

    let locals = session.local_variables().unwrap();
    assert_eq!(locals[0].name, "this");
    assert!(locals[0].reference > 0);
    assert_eq!(locals[1].name, "a");
}

#[test]
fn test_variables_query_requires_suspension() {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    let (session, _) = harness(Arc::clone(&vm));
    session.start().unwrap();

    match session.local_variables() {
        Err(DebugError::NotSuspended) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_select_frame_out_of_range_keeps_current() {
    let (_, session, _) = locals_harness();
    session.stack_frames().unwrap();

    match session.select_frame(5) {
        Err(DebugError::InvalidFrameIndex(5)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(session.current_frame().unwrap().index, 0);
}

#[test]
fn test_frame_up_down_clamp() {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    vm.set_frames(
        1,
        vec![
            frame_at(1, "MainKt", "inner", 15, "Main.kt"),
            frame_at(1, "MainKt", "main", 20, "Main.kt"),
        ],
    );
    let (session, _) = harness(Arc::clone(&vm));
    session.start().unwrap();
    session.suspend().unwrap();

    assert_eq!(session.frame_up().unwrap().index, 1);
    // Clamped at the outermost frame.
    assert_eq!(session.frame_up().unwrap().index, 1);
    assert_eq!(session.frame_down().unwrap().index, 0);
    assert_eq!(session.frame_down().unwrap().index, 0);
}

#[test]
fn test_resume_invalidates_variable_references() {
    let (vm, session, _) = locals_harness();
    vm.set_locals(
        1,
        0,
        vec![LocalSlot {
            name: "list".into(),
            type_name: "java.util.ArrayList".into(),
            value: Value::Object { id: 42, class_name: "java.util.ArrayList".into() },
            is_argument: false,
        }],
    );
    vm.set_fields(
        42,
        vec![FieldValue {
            name: "elementData".into(),
            type_name: "java.lang.Object[]".into(),
            value: Value::Null,
        }],
    );

    let locals = session.local_variables().unwrap();
    let reference = locals[0].reference;
    assert!(reference > 0);
    assert!(session.expand_variable(reference).is_ok());

    session.resume().unwrap();
    match session.expand_variable(reference) {
        Err(DebugError::StaleReference(r)) => assert_eq!(r, reference),
        other => panic!("unexpected: {other:?}"),
    }

    // Next stop issues a fresh reference.
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| session.state() == SessionState::Suspended));
    let locals = session.local_variables().unwrap();
    assert!(locals[0].reference > 0);
    assert_ne!(locals[0].reference, reference);
}

#[test]
fn test_collection_gets_synthetic_size() {
    let (vm, session, _) = locals_harness();
    vm.set_locals(
        1,
        0,
        vec![LocalSlot {
            name: "names".into(),
            type_name: "java.util.ArrayList".into(),
            value: Value::Object { id: 60, class_name: "java.util.ArrayList".into() },
            is_argument: false,
        }],
    );
    vm.set_fields(60, vec![]);
    vm.set_nullary(60, "size", Value::Int(3));

    let locals = session.local_variables().unwrap();
    let children = session.expand_variable(locals[0].reference).unwrap();
    let size = children.iter().find(|c| c.name == "size").unwrap();
    assert_eq!(size.value, "3");
    assert_eq!(size.type_name, "int");
}

#[test]
fn test_array_expansion_caps_at_ten() {
    let (vm, session, _) = locals_harness();
    vm.set_locals(
        1,
        0,
        vec![LocalSlot {
            name: "data".into(),
            type_name: "int[]".into(),
            value: Value::Array { id: 70, class_name: "int[]".into(), length: 25 },
            is_argument: false,
        }],
    );
    vm.set_array(70, (0..25).map(Value::Int).collect());

    let locals = session.local_variables().unwrap();
    assert_eq!(locals[0].value, "int[][25]");

    let children = session.expand_variable(locals[0].reference).unwrap();
    assert_eq!(children.len(), 10);
    assert_eq!(children[0].name, "[0]");
    assert_eq!(children[9].name, "[9]");

    // An explicit range overrides the cap.
    let ranged = session
        .expand_variable_range(locals[0].reference, 20, 5)
        .unwrap();
    assert_eq!(ranged.len(), 5);
    assert_eq!(ranged[0].name, "[20]");
}

#[test]
fn test_long_strings_truncate_with_ellipsis() {
    let (vm, session, _) = locals_harness();
    let long = "k".repeat(150);
    vm.set_locals(
        1,
        0,
        vec![LocalSlot {
            name: "text".into(),
            type_name: "java.lang.String".into(),
            value: Value::Str { id: 80, value: long },
            is_argument: false,
        }],
    );

    let locals = session.local_variables().unwrap();
    assert!(locals[0].value.ends_with("…\""));
    // 100 kept chars plus the ellipsis and both quotes.
    assert_eq!(locals[0].value.chars().count(), 103);
}

#[test]
fn test_frame_reference_expands_to_locals() {
    let (_, session, _) = locals_harness();
    session.stack_frames().unwrap();

    let reference = session.frame_reference(0).unwrap();
    let children = session.expand_variable(reference).unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].name, "a");

    match session.frame_reference(9) {
        Err(DebugError::InvalidFrameIndex(9)) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_evaluate_against_current_frame() {
    let (_, session, _) = locals_harness();
    let result = session.evaluate("a", None).unwrap();
    assert_eq!(result.value, "10");
    assert_eq!(result.type_name, "int");

    let check = session.evaluate("a == 10 && b == 20", None).unwrap();
    assert_eq!(check.value, "true");
    assert_eq!(check.type_name, "boolean");
}

#[test]
fn test_set_variable_updates_local() {
    let (_, session, _) = locals_harness();
    let updated = session.set_variable("a", "77").unwrap();
    assert_eq!(updated.value, "77");
    assert_eq!(session.variable("a").unwrap().unwrap().value, "77");
}

#[test]
fn test_current_position_comes_from_frame() {
    let (_, session, _) = locals_harness();
    let position = session.current_position().unwrap().unwrap();
    assert_eq!(position.file, "Main.kt");
    assert_eq!(position.line, 15);
}
