use crate::elf;
use crate::phase::LoadPhase;
use anyhow::{Context, Result};
use log::{debug, warn};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A candidate `.so` on disk. Holds no OS handle; it is just a path with
/// resolution behavior attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedObject {
    pub path: PathBuf,
}

/// A resolved node of the dependency forest.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub object: SharedObject,
    pub dependencies: Vec<DependencyResult>,
}

/// `Missing` carries the bare `DT_NEEDED` name: the dynamic linker may
/// still resolve it from its own search path at dlopen time.
#[derive(Clone, Debug)]
pub enum DependencyResult {
    Resolved(Dependency),
    Missing(SharedObject),
}

pub type DependencyMemo = HashMap<PathBuf, Vec<DependencyResult>>;

impl SharedObject {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Dependency results for this object, searching staged phase
    /// directories from `phase` back towards `Libs`.
    ///
    /// The memo is keyed by path and pre-seeded with an empty vector
    /// before descending, so dependency cycles terminate instead of
    /// recursing forever.
    pub fn get_to_load(
        &self,
        root: &Path,
        phase: LoadPhase,
        memo: &mut DependencyMemo,
    ) -> Vec<DependencyResult> {
        if let Some(cached) = memo.get(&self.path) {
            return cached.clone();
        }
        memo.insert(self.path.clone(), Vec::new());

        let needed = match read_needed(&self.path) {
            Ok(needed) => needed,
            Err(err) => {
                warn!(
                    "could not read dependencies of {}: {err:?}",
                    self.path.display()
                );
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(needed.len());
        for name in needed {
            if name.is_empty() {
                continue;
            }

            match find_shared_object(root, phase, &name) {
                Some((object, found_phase)) => {
                    debug!(
                        "resolved {name} -> {} ({:?})",
                        object.path.display(),
                        found_phase
                    );
                    let dependencies = object.get_to_load(root, found_phase, memo);
                    results.push(DependencyResult::Resolved(Dependency {
                        object,
                        dependencies,
                    }));
                }
                None => {
                    debug!("missing dependency {name}, deferring to the linker");
                    results.push(DependencyResult::Missing(SharedObject::new(name)));
                }
            }
        }

        memo.insert(self.path.clone(), results.clone());
        results
    }
}

impl DependencyResult {
    pub fn resolved(&self) -> Option<&Dependency> {
        match self {
            DependencyResult::Resolved(dep) => Some(dep),
            DependencyResult::Missing(_) => None,
        }
    }
}

fn read_needed(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mapped = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))?;
    Ok(elf::needed_dependencies(&mapped))
}

/// Search the staged phase directories for `name`, current phase first,
/// then each earlier phase down to `Libs`. Returns the first hit together
/// with the phase it was found in.
pub fn find_shared_object(
    root: &Path,
    phase: LoadPhase,
    name: &str,
) -> Option<(SharedObject, LoadPhase)> {
    for candidate_phase in phase.search_order() {
        let candidate = root.join(candidate_phase.dir()).join(name);
        if candidate.is_file() {
            return Some((SharedObject::new(candidate), candidate_phase));
        }
    }
    None
}
