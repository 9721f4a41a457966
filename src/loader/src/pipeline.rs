use crate::context::CONTEXT;
use crate::dlfcn;
use crate::mods::{
    FailedMod, LifecycleFn, LoadResult, LoadedMod, MatchType, ModInfo, SetupFn, close_logged,
};
use crate::phase::LoadPhase;
use crate::resolver::{DependencyMemo, DependencyResult, SharedObject};
use crate::sort::topological_sort;
use log::{debug, error, info, warn};
use nix::libc::c_void;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Owner of the three phase collections and the skip-load set.
///
/// The process-global instance backs the exported API; tests construct
/// their own instances against throwaway directories.
#[derive(Default)]
pub struct Pipeline {
    loaded_libs: Vec<LoadResult>,
    loaded_early_mods: Vec<LoadResult>,
    loaded_mods: Vec<LoadResult>,
    skip_load: HashSet<PathBuf>,
}

static PIPELINE: Lazy<Mutex<Pipeline>> = Lazy::new(|| Mutex::new(Pipeline::new()));

pub fn instance() -> &'static Mutex<Pipeline> {
    &PIPELINE
}

/// Copy-out view of a loaded mod, safe to marshal across the C boundary.
pub struct ModSnapshot {
    pub info: ModInfo,
    pub path: PathBuf,
    pub handle: *mut c_void,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequireStatus {
    NotFound,
    Failed,
    Loaded,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_libs(&mut self, files_dir: &Path) {
        if CONTEXT.failed() {
            error!("staging failed, refusing to open libs");
            return;
        }
        CONTEXT.set_load_phase(LoadPhase::Libs);

        debug!("opening libs using root: {}", files_dir.display());
        let objects = list_all_objects_in_phase(files_dir, LoadPhase::Libs);
        debug!("found {} candidates, attempting to load them", objects.len());

        self.loaded_libs = load_objects(&objects, files_dir, &mut self.skip_load, LoadPhase::Libs);
        for result in &self.loaded_libs {
            if let LoadResult::Failed(failed) = result {
                warn!(
                    "skipping lib {}: {}",
                    failed.object.path.display(),
                    failed.failure
                );
            }
        }

        CONTEXT.set_libs_opened();
    }

    pub fn open_early_mods(&mut self, files_dir: &Path) {
        if CONTEXT.failed() {
            error!("staging failed, refusing to open early mods");
            return;
        }
        CONTEXT.set_load_phase(LoadPhase::EarlyMods);

        let objects = list_all_objects_in_phase(files_dir, LoadPhase::EarlyMods);
        self.loaded_early_mods =
            load_objects(&objects, files_dir, &mut self.skip_load, LoadPhase::EarlyMods);
        run_setup(&mut self.loaded_early_mods);

        CONTEXT.set_early_mods_opened();
    }

    /// Opens the late ('unity') mods. Runs after the first scene loaded,
    /// driven by the object-destruction hook.
    pub fn open_mods(&mut self, files_dir: &Path) {
        if CONTEXT.failed() {
            error!("staging failed, refusing to open mods");
            return;
        }
        CONTEXT.set_load_phase(LoadPhase::Mods);

        let objects = list_all_objects_in_phase(files_dir, LoadPhase::Mods);
        self.loaded_mods = load_objects(&objects, files_dir, &mut self.skip_load, LoadPhase::Mods);
        run_setup(&mut self.loaded_mods);

        CONTEXT.set_late_mods_opened();
    }

    /// `load()` on every early mod, fired from the IL2CPP-init hook.
    pub fn load_early_mods(&mut self) {
        if CONTEXT.failed() {
            error!("staging failed, refusing to load early mods");
            return;
        }

        for result in &mut self.loaded_early_mods {
            match result {
                LoadResult::Loaded(loaded) => {
                    if !loaded.load() {
                        info!("no load function on mod {}", loaded.object.path.display());
                    }
                }
                LoadResult::Failed(failed) => warn!(
                    "skipping load call on {}: {}",
                    failed.object.path.display(),
                    failed.failure
                ),
            }
        }
    }

    /// `late_load()` on early mods then late mods, fired from the
    /// object-destruction hook after `open_mods`.
    pub fn load_mods(&mut self) {
        if CONTEXT.failed() {
            error!("staging failed, refusing to late-load mods");
            return;
        }

        for collection in [&mut self.loaded_early_mods, &mut self.loaded_mods] {
            for result in collection.iter_mut() {
                match result {
                    LoadResult::Loaded(loaded) => {
                        if !loaded.late_load() {
                            info!(
                                "no late_load function on mod {}",
                                loaded.object.path.display()
                            );
                        }
                    }
                    LoadResult::Failed(failed) => warn!(
                        "skipping late_load call on {}: {}",
                        failed.object.path.display(),
                        failed.failure
                    ),
                }
            }
        }
    }

    /// Teardown: close every loaded mod (logging failures) and drain the
    /// collections.
    pub fn close_all(&mut self) {
        for collection in [
            &mut self.loaded_mods,
            &mut self.loaded_early_mods,
            &mut self.loaded_libs,
        ] {
            for result in collection.iter_mut() {
                if let LoadResult::Loaded(loaded) = result {
                    close_logged(loaded);
                }
            }
        }
        self.loaded_libs.clear();
        self.loaded_early_mods.clear();
        self.loaded_mods.clear();
    }

    /// Unloads the first match in `loaded_mods`, then `loaded_early_mods`.
    /// Libs are never force-unloaded. Absent entries count as success.
    pub fn force_unload(&mut self, info: &ModInfo, match_type: MatchType) -> bool {
        debug!("attempting to force unload {info:?} ({match_type:?})");

        for collection in [&mut self.loaded_mods, &mut self.loaded_early_mods] {
            let found = collection.iter().position(|result| match result {
                LoadResult::Loaded(loaded) => loaded.matches(info, match_type),
                LoadResult::Failed(failed) => failed.matches(info, match_type),
            });

            if let Some(index) = found {
                if let LoadResult::Loaded(loaded) = &mut collection[index] {
                    debug!(
                        "found matching mod {:?} at {}",
                        loaded.mod_info,
                        loaded.object.path.display()
                    );
                    if let Err(err) = loaded.close() {
                        warn!(
                            "failed to close mod {}: {err:?}",
                            loaded.object.path.display()
                        );
                        return false;
                    }
                }
                collection.remove(index);
                return true;
            }
        }

        true
    }

    pub fn get_mod(&self, info: &ModInfo, match_type: MatchType) -> Option<ModSnapshot> {
        [&self.loaded_mods, &self.loaded_early_mods]
            .into_iter()
            .flatten()
            .filter_map(LoadResult::loaded)
            .find(|loaded| loaded.matches(info, match_type))
            .map(snapshot)
    }

    pub fn get_all(&self) -> Vec<ModSnapshot> {
        [&self.loaded_libs, &self.loaded_early_mods, &self.loaded_mods]
            .into_iter()
            .flatten()
            .filter_map(LoadResult::loaded)
            .map(snapshot)
            .collect()
    }

    pub fn require_mod(&self, info: &ModInfo, match_type: MatchType) -> RequireStatus {
        for result in [&self.loaded_mods, &self.loaded_early_mods]
            .into_iter()
            .flatten()
        {
            match result {
                LoadResult::Loaded(loaded) if loaded.matches(info, match_type) => {
                    return RequireStatus::Loaded;
                }
                LoadResult::Failed(failed) if failed.matches(info, match_type) => {
                    return RequireStatus::Failed;
                }
                _ => {}
            }
        }
        RequireStatus::NotFound
    }

    pub fn skip_load(&self) -> &HashSet<PathBuf> {
        &self.skip_load
    }
}

fn snapshot(loaded: &LoadedMod) -> ModSnapshot {
    ModSnapshot {
        info: loaded.mod_info.clone(),
        path: loaded.object.path.clone(),
        handle: loaded.handle,
    }
}

fn run_setup(results: &mut [LoadResult]) {
    for result in results {
        match result {
            LoadResult::Loaded(loaded) => {
                if !loaded.init() {
                    info!("no setup on mod {}", loaded.object.path.display());
                }
            }
            LoadResult::Failed(failed) => warn!(
                "skipping setup call on {}: {}",
                failed.object.path.display(),
                failed.failure
            ),
        }
    }
}

/// Stages the three phase directories from `root_load_path` into the app's
/// private files dir, resetting permissions. Any failure is a staging
/// failure: the caller latches the failed flag and the pipeline stops.
pub fn copy_all(root_load_path: &Path, files_dir: &Path) -> bool {
    for phase in LoadPhase::STAGED {
        let src = root_load_path.join(phase.dir());
        let dst = files_dir.join(phase.dir());

        ensure_dir_exists(&src);
        if !remove_dir(&dst) {
            error!("failed to remove {}, stopping early to avoid stale mods", dst.display());
            return false;
        }
        ensure_dir_exists(&dst);

        if let Err(err) = copy_dir_recursive(&src, &dst) {
            error!(
                "failed to copy {} to {}: {err}",
                src.display(),
                dst.display()
            );
            return false;
        }

        if let Err(err) = fs::set_permissions(&dst, fs::Permissions::from_mode(0o777)) {
            error!("failed to set permissions on {}: {err}", dst.display());
            return false;
        }
    }
    true
}

fn statdump(path: &Path) {
    match fs::metadata(path) {
        Ok(meta) => debug!(
            "file: {}, dev: {}, ino: {}, mode: {:o}, nlink: {}, uid: {}, gid: {}, sz: {}, mtime: {}",
            path.display(),
            meta.dev(),
            meta.ino(),
            meta.mode(),
            meta.nlink(),
            meta.uid(),
            meta.gid(),
            meta.size(),
            meta.mtime(),
        ),
        Err(err) => debug!("stat of {} failed: {err}", path.display()),
    }
}

fn ensure_dir_exists(dir: &Path) {
    statdump(dir);
    if dir.exists() {
        warn!("directory {} already existed", dir.display());
        return;
    }
    if let Err(err) = fs::create_dir_all(dir) {
        warn!("failed to make directory {}: {err}", dir.display());
        return;
    }
    debug!("chmod {}", dir.display());
    if let Err(err) = fs::set_permissions(dir, fs::Permissions::from_mode(0o775)) {
        error!("failed to chmod {}: {err}", dir.display());
    }
}

fn remove_dir(dir: &Path) -> bool {
    statdump(dir);
    if !dir.exists() {
        return true;
    }
    if let Err(err) = fs::remove_dir_all(dir) {
        error!("failed to remove directory {}: {err}", dir.display());
        return false;
    }
    true
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Regular files named `*.so`; mod phases additionally require the `lib`
/// prefix. Sorted so the load order is reproducible.
pub fn list_all_objects_in_phase(root: &Path, phase: LoadPhase) -> Vec<SharedObject> {
    let dir = root.join(phase.dir());
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot list {}: {err}", dir.display());
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
                return false;
            };
            name.ends_with(".so") && (phase == LoadPhase::Libs || name.starts_with("lib"))
        })
        .collect();
    paths.sort();

    paths.into_iter().map(SharedObject::new).collect()
}

/// Resolves, orders and dlopens `objects` and their staged dependencies.
/// Entries land in the returned collection in the order dlopen ran.
pub fn load_objects(
    objects: &[SharedObject],
    root: &Path,
    skip_load: &mut HashSet<PathBuf>,
    phase: LoadPhase,
) -> Vec<LoadResult> {
    let mut results = Vec::new();
    let mut memo = DependencyMemo::new();

    for object in objects {
        if skip_load.contains(&object.path) {
            debug!("already processed {}, skipping", object.path.display());
            continue;
        }

        let dependencies = object.get_to_load(root, phase, &mut memo);
        for dep in topological_sort(&dependencies) {
            if skip_load.contains(&dep.object.path) {
                continue;
            }
            skip_load.insert(dep.object.path.clone());
            results.push(open_object(dep.object, dep.dependencies, phase));
        }

        skip_load.insert(object.path.clone());
        results.push(open_object(object.clone(), dependencies, phase));
    }

    results
}

fn open_object(
    object: SharedObject,
    dependencies: Vec<DependencyResult>,
    phase: LoadPhase,
) -> LoadResult {
    match dlfcn::open(&object.path) {
        Ok(handle) => {
            debug!("dlopened {}", object.path.display());
            let setup_fn = bind_symbol(handle, &object, "setup")
                .map(|addr| unsafe { std::mem::transmute::<*mut c_void, SetupFn>(addr) });
            let load_fn = bind_lifecycle(handle, &object, "load");
            let late_load_fn = bind_lifecycle(handle, &object, "late_load");
            let unload_fn = bind_lifecycle(handle, &object, "unload");

            LoadResult::Loaded(LoadedMod::new(
                object,
                phase,
                handle,
                setup_fn,
                load_fn,
                late_load_fn,
                unload_fn,
            ))
        }
        Err(err) => {
            warn!("failed to dlopen {}: {err:#}", object.path.display());
            LoadResult::Failed(FailedMod {
                object,
                failure: format!("{err:#}"),
                dependencies,
            })
        }
    }
}

fn bind_lifecycle(
    handle: *mut c_void,
    object: &SharedObject,
    name: &str,
) -> Option<LifecycleFn> {
    bind_symbol(handle, object, name)
        .map(|addr| unsafe { std::mem::transmute::<*mut c_void, LifecycleFn>(addr) })
}

/// dlsym that only accepts symbols living inside the mod's own mapped
/// image. With `RTLD_LOCAL` opens dlsym still searches the handle's whole
/// dependency closure, so an earlier library exporting `setup` would
/// otherwise leak its callback into this mod's record.
fn bind_symbol(handle: *mut c_void, object: &SharedObject, name: &str) -> Option<*mut c_void> {
    let address = dlfcn::sym(handle, name).ok()?;

    let Some(owner) = dlfcn::containing_file(address.cast_const()) else {
        warn!(
            "cannot attribute symbol {name} of {}, treating as absent",
            object.path.display()
        );
        return None;
    };

    if owner.file_name() != object.path.file_name() {
        warn!(
            "rejecting leaked symbol {name}: resolves into {} instead of {}",
            owner.display(),
            object.path.display()
        );
        return None;
    }

    Some(address)
}
