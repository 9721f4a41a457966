use crate::resolver::{Dependency, DependencyResult};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

/// Flattens a dependency forest into the order dlopen must run in:
/// depth-first post-order, so for every edge A -> B (A depends on B), B
/// comes out before A. Deduplicated by path, deterministic across runs.
pub fn topological_sort(list: &[DependencyResult]) -> VecDeque<Dependency> {
    let resolved: Vec<Dependency> = list
        .iter()
        .filter_map(|result| result.resolved().cloned())
        .collect();
    topological_sort_deps(resolved)
}

pub fn topological_sort_deps(mut list: Vec<Dependency>) -> VecDeque<Dependency> {
    let mut out = VecDeque::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    sort_siblings(&mut list);
    for dep in list {
        visit(dep, &mut out, &mut visited);
    }

    out
}

fn visit(mut dep: Dependency, out: &mut VecDeque<Dependency>, visited: &mut HashSet<PathBuf>) {
    if !visited.insert(dep.object.path.clone()) {
        return;
    }

    let mut children: Vec<Dependency> = dep
        .dependencies
        .iter()
        .filter_map(|result| result.resolved().cloned())
        .collect();
    sort_siblings(&mut children);

    for child in children {
        visit(child, out, visited);
    }

    out.push_back(dep);
}

/// Reverse lexical order, stable. The particular direction is arbitrary
/// but fixed: it is what makes the output reproducible.
fn sort_siblings(deps: &mut [Dependency]) {
    deps.sort_by(|a, b| b.object.path.cmp(&a.object.path));
}
