mod common;

use sable::phase::LoadPhase;
use sable::resolver::{DependencyMemo, DependencyResult, SharedObject};
use sable::sort::topological_sort;
use std::path::{Path, PathBuf};

fn resolved_paths(results: &[DependencyResult]) -> Vec<PathBuf> {
    results
        .iter()
        .filter_map(|result| result.resolved())
        .map(|dep| dep.object.path.clone())
        .collect()
}

fn missing_names(results: &[DependencyResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|result| match result {
            DependencyResult::Missing(object) => {
                Some(object.path.to_string_lossy().into_owned())
            }
            DependencyResult::Resolved(_) => None,
        })
        .collect()
}

fn sorted_order(results: &[DependencyResult]) -> Vec<String> {
    topological_sort(results)
        .iter()
        .map(|dep| {
            dep.object
                .path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

fn index_of(order: &[String], name: &str) -> usize {
    order
        .iter()
        .position(|entry| entry == name)
        .unwrap_or_else(|| panic!("{name} not in {order:?}"))
}

#[test]
fn simple_dependency_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "libs", "libA.so", &[]);
    let b = common::stage(root, "early_mods", "libB.so", &["libA.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&b).get_to_load(root, LoadPhase::EarlyMods, &mut memo);

    assert_eq!(resolved_paths(&results), [root.join("libs/libA.so")]);
    assert!(missing_names(&results).is_empty());
    assert_eq!(sorted_order(&results), ["libA.so"]);
}

#[test]
fn missing_dependency_is_deferred_to_the_linker() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let c = common::stage(root, "mods", "libC.so", &["libX.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&c).get_to_load(root, LoadPhase::Mods, &mut memo);

    assert_eq!(results.len(), 1);
    assert_eq!(missing_names(&results), ["libX.so"]);
}

#[test]
fn diamond_resolves_each_path_once() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "libs", "libA.so", &[]);
    common::stage(root, "early_mods", "libB.so", &["libA.so"]);
    common::stage(root, "early_mods", "libC.so", &["libA.so"]);
    let d = common::stage(root, "mods", "libD.so", &["libB.so", "libC.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&d).get_to_load(root, LoadPhase::Mods, &mut memo);

    let order = sorted_order(&results);
    assert_eq!(order.len(), 3, "every path exactly once: {order:?}");
    let a = index_of(&order, "libA.so");
    assert!(a < index_of(&order, "libB.so"));
    assert!(a < index_of(&order, "libC.so"));
}

#[test]
fn search_crosses_into_earlier_phases_only() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "early_mods", "libE.so", &[]);
    let m = common::stage(root, "mods", "libM.so", &["libE.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&m).get_to_load(root, LoadPhase::Mods, &mut memo);

    assert_eq!(resolved_paths(&results), [root.join("early_mods/libE.so")]);
}

#[test]
fn same_phase_wins_over_earlier_phase() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "libs", "libShared.so", &[]);
    common::stage(root, "mods", "libShared.so", &[]);
    let m = common::stage(root, "mods", "libM.so", &["libShared.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&m).get_to_load(root, LoadPhase::Mods, &mut memo);

    assert_eq!(resolved_paths(&results), [root.join("mods/libShared.so")]);
}

#[test]
fn early_mod_never_resolves_into_the_mods_phase() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "mods", "libLate.so", &[]);
    let e = common::stage(root, "early_mods", "libE.so", &["libLate.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&e).get_to_load(root, LoadPhase::EarlyMods, &mut memo);

    assert_eq!(missing_names(&results), ["libLate.so"]);
}

#[test]
fn memoized_resolution_is_identical(){
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "libs", "libA.so", &[]);
    let b = common::stage(root, "early_mods", "libB.so", &["libA.so"]);

    let mut memo = DependencyMemo::new();
    let object = SharedObject::new(&b);
    let first = object.get_to_load(root, LoadPhase::EarlyMods, &mut memo);
    let second = object.get_to_load(root, LoadPhase::EarlyMods, &mut memo);

    assert_eq!(resolved_paths(&first), resolved_paths(&second));
    assert_eq!(first.len(), second.len());
}

#[test]
fn dependency_cycles_terminate() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    common::stage(root, "libs", "libA.so", &["libB.so"]);
    let b = common::stage(root, "libs", "libB.so", &["libA.so"]);

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&b).get_to_load(root, LoadPhase::Libs, &mut memo);

    // B -> A resolves; the back-edge A -> B hits the in-progress sentinel
    // and carries no further children.
    assert_eq!(resolved_paths(&results), [root.join("libs/libA.so")]);
    let order = sorted_order(&results);
    assert_eq!(order, ["libB.so", "libA.so"]);
}

#[test]
fn unreadable_file_resolves_to_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let dir = root.join("mods");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("libjunk.so");
    std::fs::write(&path, b"not an elf at all").unwrap();

    let mut memo = DependencyMemo::new();
    let results = SharedObject::new(&path).get_to_load(root, LoadPhase::Mods, &mut memo);
    assert!(results.is_empty());

    let missing = SharedObject::new(Path::new("/nowhere/libgone.so"));
    let results = missing.get_to_load(root, LoadPhase::Mods, &mut memo);
    assert!(results.is_empty());
}
