//! Breakpoint resolution, pending attachment, and wire-request ownership.

use super::*;
use super::support::{wait_for, RequestKind};
use kjdb_core::event::DebugEvent;
use kjdb_core::vm::{ClassInfo, ClassPrepareFilter};

#[test]
fn test_add_resolves_to_wire_request() {
    let vm = MockVm::new();
    main_class(&vm);
    let (session, _) = harness(Arc::clone(&vm));

    let info = session.add_breakpoint("Main.kt", 15, None).unwrap();
    assert_eq!(info.id, 1);
    assert!(info.resolved);
    assert!(info.enabled);

    let requests = vm.breakpoint_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.line, 15);
}

#[test]
fn test_ids_are_monotonic_and_never_reused() {
    let vm = MockVm::new();
    main_class(&vm);
    let (session, _) = harness(Arc::clone(&vm));

    let first = session.add_breakpoint("Main.kt", 14, None).unwrap();
    let second = session.add_breakpoint("Main.kt", 15, None).unwrap();
    assert_eq!((first.id, second.id), (1, 2));

    assert!(session.remove_breakpoint(first.id).unwrap());
    let third = session.add_breakpoint("Main.kt", 16, None).unwrap();
    assert_eq!(third.id, 3);
}

#[test]
fn test_same_line_twice_yields_two_independent_breakpoints() {
    let vm = MockVm::new();
    main_class(&vm);
    let (session, _) = harness(Arc::clone(&vm));

    let first = session.add_breakpoint("Main.kt", 15, None).unwrap();
    let second = session.add_breakpoint("Main.kt", 15, None).unwrap();
    assert_ne!(first.id, second.id);

    assert!(session.remove_breakpoint(first.id).unwrap());
    assert_eq!(session.list_breakpoints().len(), 1);
    assert!(session.remove_breakpoint(second.id).unwrap());
    assert!(session.list_breakpoints().is_empty());
}

#[test]
fn test_delete_removes_exactly_its_wire_requests() {
    let vm = MockVm::new();
    // The same author line maps into two classes.
    main_class(&vm);
    vm.add_class(2, "MainKt$inner", Some("Main.kt"), None, &[("invoke", 15, 0)]);
    let (session, _) = harness(Arc::clone(&vm));

    let info = session.add_breakpoint("Main.kt", 15, None).unwrap();
    let installed = vm.breakpoint_requests();
    assert_eq!(installed.len(), 2);

    assert!(session.remove_breakpoint(info.id).unwrap());
    assert!(vm.breakpoint_requests().is_empty());
    let cleared = vm.cleared_requests();
    for (request, _) in installed {
        assert!(cleared.contains(&request));
    }
}

#[test]
fn test_remove_unknown_breakpoint_is_false() {
    let vm = MockVm::new();
    let (session, _) = harness(vm);
    assert!(!session.remove_breakpoint(99).unwrap());
}

#[test]
fn test_pending_breakpoint_records_class_prepare_watch() {
    let vm = MockVm::new();
    let (session, _) = harness(Arc::clone(&vm));

    let info = session.add_breakpoint("NotYet.kt", 7, None).unwrap();
    assert!(!info.resolved);
    assert!(info.enabled);
    assert_eq!(session.list_breakpoints().len(), 1);

    let watches = vm.class_prepare_watches();
    assert_eq!(
        watches,
        vec![ClassPrepareFilter::ClassPattern("NotYetKt*".into())]
    );
}

#[test]
fn test_pending_breakpoint_attaches_on_class_prepare() {
    let vm = MockVm::new();
    vm.add_thread(1, "main");
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();

    let info = session.add_breakpoint("NotYet.kt", 7, None).unwrap();
    assert!(vm.breakpoint_requests().is_empty());

    vm.add_class(5, "NotYetKt", Some("NotYet.kt"), None, &[("main", 7, 0)]);
    let watch = vm.class_prepare_watches();
    assert_eq!(watch.len(), 1);
    let watch_request = vm
        .active_requests()
        .into_iter()
        .find(|(_, kind)| matches!(kind, RequestKind::ClassPrepareWatch(_)))
        .map(|(id, _)| id)
        .unwrap();
    vm.fire_class_prepare(
        watch_request,
        ClassInfo {
            id: 5,
            name: "NotYetKt".into(),
            source_name: Some("NotYet.kt".into()),
        },
    );

    assert!(wait_for(|| !vm.breakpoint_requests().is_empty()));
    assert!(wait_for(|| session.list_breakpoints()[0].resolved));

    // Running to the line now reports a hit under the original id.
    let (request, _) = vm.breakpoint_requests()[0].clone();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| {
        listener.count(|e| {
            matches!(e, DebugEvent::BreakpointHit { breakpoint, .. } if *breakpoint == info.id)
        }) == 1
    }));
}

#[test]
fn test_disable_clears_requests_and_enable_restores() {
    let vm = MockVm::new();
    main_class(&vm);
    let (session, _) = harness(Arc::clone(&vm));

    let info = session.add_breakpoint("Main.kt", 15, None).unwrap();
    assert_eq!(vm.breakpoint_requests().len(), 1);

    assert!(session.disable_breakpoint(info.id).unwrap());
    assert!(vm.breakpoint_requests().is_empty());
    let listed = session.list_breakpoints();
    assert!(!listed[0].enabled);

    assert!(session.enable_breakpoint(info.id).unwrap());
    assert_eq!(vm.breakpoint_requests().len(), 1);
    assert!(session.list_breakpoints()[0].enabled);
}

#[test]
fn test_method_breakpoint_binds_to_method_entry() {
    let vm = MockVm::new();
    main_class(&vm);
    let (session, _) = harness(Arc::clone(&vm));

    let info = session
        .add_method_breakpoint("MainKt", "main", None)
        .unwrap();
    assert!(info.resolved);
    let requests = vm.breakpoint_requests();
    assert_eq!(requests.len(), 1);
    // Entry is the lowest code index of the method.
    assert_eq!(requests[0].1.code_index, 0);
}

#[test]
fn test_hit_count_target_swallows_early_hits() {
    let vm = MockVm::new();
    main_class(&vm);
    vm.add_thread(1, "main");
    vm.set_frames(1, vec![frame_at(1, "MainKt", "main", 15, "Main.kt")]);
    let (session, listener) = harness(Arc::clone(&vm));
    session.start().unwrap();

    session
        .add_breakpoint_with_hit_count("Main.kt", 15, None, Some(2))
        .unwrap();
    let (request, _) = vm.breakpoint_requests()[0].clone();

    let resumes_before = vm.resume_count();
    vm.fire_hit(request, 1);
    assert!(wait_for(|| vm.resume_count() > resumes_before));
    assert_eq!(listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })), 0);

    vm.fire_hit(request, 1);
    assert!(wait_for(|| {
        listener.count(|e| matches!(e, DebugEvent::BreakpointHit { .. })) == 1
    }));
    assert_eq!(session.list_breakpoints()[0].hit_count, 2);
}

#[test]
fn test_exception_filters_replace_on_set() {
    let vm = MockVm::new();
    let (session, _) = harness(Arc::clone(&vm));

    session
        .set_exception_breakpoints(&[kjdb_core::ExceptionFilter::Uncaught])
        .unwrap();
    assert_eq!(vm.exception_watches(), vec![(false, true)]);
    assert!(session.is_exception_breakpoints_enabled());

    session
        .set_exception_breakpoints(&[
            kjdb_core::ExceptionFilter::Caught,
            kjdb_core::ExceptionFilter::Uncaught,
        ])
        .unwrap();
    assert_eq!(vm.exception_watches(), vec![(true, true)]);

    session.set_exception_breakpoints(&[]).unwrap();
    assert!(vm.exception_watches().is_empty());
    assert!(!session.is_exception_breakpoints_enabled());
}
