//! Position-manager queries: location translation and source fan-out.

use super::*;
use kjdb_core::position::PositionManager;

const MAIN_SMAP: &str =
    "SMAP\nMainKt.class\nKotlin\n*S Kotlin\n*F\n+ 1 Main.kt\nMain.kt\n*L\n10#1,5:100\n*E\n";

const TWO_FILE_SMAP: &str = concat!(
    "SMAP\nCallerKt.class\nKotlin\n*S Kotlin\n*F\n",
    "+ 1 Caller.kt\nCaller.kt\n+ 2 Inline.kt\nInline.kt\n",
    "*L\n1#1,5:1\n10#2,3:6\n*E\n"
);

#[test]
fn test_location_maps_through_smap() {
    let vm = MockVm::new();
    vm.add_class(1, "MainKt", Some("Main.kt"), Some(MAIN_SMAP), &[("main", 102, 0)]);
    let positions = PositionManager::new(vm);

    let pos = positions
        .location_to_position(&location(1, "MainKt", "main", 102, "Main.kt"))
        .unwrap();
    assert_eq!(pos.file, "Main.kt");
    assert_eq!(pos.line, 12);
}

#[test]
fn test_location_falls_back_to_own_line() {
    let vm = MockVm::new();
    vm.add_class(1, "PlainKt", Some("Plain.kt"), None, &[("run", 7, 0)]);
    let positions = PositionManager::new(vm);

    let pos = positions
        .location_to_position(&location(1, "PlainKt", "run", 7, "Plain.kt"))
        .unwrap();
    assert_eq!(pos.file, "Plain.kt");
    assert_eq!(pos.line, 7);
}

#[test]
fn test_synthetic_lines_have_no_position() {
    let vm = MockVm::new();
    vm.add_class(1, "PlainKt", Some("Plain.kt"), None, &[]);
    let positions = PositionManager::new(vm);
    assert_eq!(
        positions.location_to_position(&location(1, "PlainKt", "run", -1, "Plain.kt")),
        None
    );
}

#[test]
fn test_inlined_positions_deduplicate() {
    let vm = MockVm::new();
    vm.add_class(3, "CallerKt", Some("Caller.kt"), Some(TWO_FILE_SMAP), &[]);
    let positions = PositionManager::new(vm);

    let inlined =
        positions.inlined_positions_at(&location(3, "CallerKt", "main", 7, "Caller.kt"));
    assert_eq!(inlined.len(), 1);
    assert_eq!(inlined[0].file, "Inline.kt");
    assert_eq!(inlined[0].line, 11);

    let none = positions.inlined_positions_at(&location(3, "CallerKt", "main", 99, "Caller.kt"));
    assert!(none.is_empty());
}

#[test]
fn test_is_in_inline_function() {
    let vm = MockVm::new();
    vm.add_class(3, "CallerKt", Some("Caller.kt"), Some(TWO_FILE_SMAP), &[]);
    let positions = PositionManager::new(vm);

    assert!(positions.is_in_inline_function(&location(3, "CallerKt", "main", 7, "Caller.kt")));
    assert!(!positions.is_in_inline_function(&location(3, "CallerKt", "main", 50, "Caller.kt")));
}

#[test]
fn test_find_locations_by_declared_source() {
    let vm = MockVm::new();
    main_class(&vm);
    let positions = PositionManager::new(vm);

    let found = positions.find_locations("Main.kt", 15).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].class_name, "MainKt");
    assert_eq!(found[0].line, 15);
}

#[test]
fn test_find_locations_through_smap_back_mapping() {
    let vm = MockVm::new();
    // The class declares Caller.kt but its SMAP also serves Inline.kt.
    vm.add_class(
        3,
        "CallerKt",
        Some("Caller.kt"),
        Some(TWO_FILE_SMAP),
        &[("main", 6, 0), ("main", 7, 8)],
    );
    let positions = PositionManager::new(vm);

    let found = positions.find_locations("Inline.kt", 11).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].class_name, "CallerKt");
    assert_eq!(found[0].line, 7);
}

#[test]
fn test_find_locations_unknown_file_is_empty() {
    let vm = MockVm::new();
    main_class(&vm);
    let positions = PositionManager::new(vm);
    assert!(positions.find_locations("Missing.kt", 1).unwrap().is_empty());
}
