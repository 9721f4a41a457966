use crate::capi::CModInfo;
use crate::dlfcn;
use crate::phase::LoadPhase;
use crate::resolver::{DependencyResult, SharedObject};
use anyhow::Result;
use log::warn;
use nix::libc::c_void;
use std::ffi::{CStr, CString};

pub type SetupFn = unsafe extern "C" fn(*mut CModInfo);
pub type LifecycleFn = unsafe extern "C" fn();

/// Identity a mod reports about itself. Defaults are derived from the
/// binary until its `setup` export overwrites them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModInfo {
    pub id: String,
    pub version: String,
    pub version_long: u64,
}

impl ModInfo {
    pub fn default_for(object: &SharedObject) -> Self {
        Self {
            id: object.path.to_string_lossy().into_owned(),
            version: "0.0.0".to_string(),
            version_long: 0,
        }
    }
}

/// Which subset of [`ModInfo`] fields must be equal for a lookup to hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Strict,
    IdOnly,
    IdVersion,
    IdVersionLong,
    ObjectName,
}

/// Record of a successful dlopen. Each optional callback fires at most
/// once; the latches survive repeated pipeline entries.
pub struct LoadedMod {
    pub mod_info: ModInfo,
    pub object: SharedObject,
    pub phase: LoadPhase,

    pub setup_fn: Option<SetupFn>,
    pub load_fn: Option<LifecycleFn>,
    pub late_load_fn: Option<LifecycleFn>,
    pub unload_fn: Option<LifecycleFn>,

    pub handle: *mut c_void,

    inited: bool,
    load_called: bool,
    late_load_called: bool,
    unloaded: bool,
}

// The phase collections live in process-global statics but are only ever
// touched from the host's loader thread (see the concurrency model).
unsafe impl Send for LoadedMod {}

impl LoadedMod {
    pub fn new(
        object: SharedObject,
        phase: LoadPhase,
        handle: *mut c_void,
        setup_fn: Option<SetupFn>,
        load_fn: Option<LifecycleFn>,
        late_load_fn: Option<LifecycleFn>,
        unload_fn: Option<LifecycleFn>,
    ) -> Self {
        Self {
            mod_info: ModInfo::default_for(&object),
            object,
            phase,
            setup_fn,
            load_fn,
            late_load_fn,
            unload_fn,
            handle,
            inited: false,
            load_called: false,
            late_load_called: false,
            unloaded: false,
        }
    }

    /// Runs `setup` (once) and copies the mutated info back into owned
    /// strings. Returns false when the mod exports no setup.
    pub fn init(&mut self) -> bool {
        let Some(setup) = self.setup_fn else {
            return false;
        };
        if self.inited {
            return true;
        }
        self.inited = true;

        let id = CString::new(self.mod_info.id.as_str()).unwrap_or_default();
        let version = CString::new(self.mod_info.version.as_str()).unwrap_or_default();
        let mut info = CModInfo {
            id: id.as_ptr(),
            version: version.as_ptr(),
            version_long: self.mod_info.version_long,
        };

        unsafe { setup(&mut info) };

        // The mod usually swaps the pointers for its own statics; copy
        // whatever is there now into loader-owned strings.
        unsafe {
            if !info.id.is_null() {
                self.mod_info.id = CStr::from_ptr(info.id).to_string_lossy().into_owned();
            }
            if !info.version.is_null() {
                self.mod_info.version = CStr::from_ptr(info.version).to_string_lossy().into_owned();
            }
        }
        self.mod_info.version_long = info.version_long;

        true
    }

    pub fn load(&mut self) -> bool {
        let Some(load) = self.load_fn else {
            return false;
        };
        if !self.load_called {
            self.load_called = true;
            unsafe { load() };
        }
        true
    }

    pub fn late_load(&mut self) -> bool {
        let Some(late_load) = self.late_load_fn else {
            return false;
        };
        if !self.late_load_called {
            self.late_load_called = true;
            unsafe { late_load() };
        }
        true
    }

    /// Runs `unload` (once) and dlcloses the handle. The handle is dead
    /// afterwards regardless of the dlclose verdict.
    pub fn close(&mut self) -> Result<()> {
        if let Some(unload) = self.unload_fn
            && !self.unloaded
        {
            self.unloaded = true;
            unsafe { unload() };
        }

        if self.handle.is_null() {
            return Ok(());
        }
        let handle = std::mem::replace(&mut self.handle, std::ptr::null_mut());
        dlfcn::close(handle)
    }

    pub fn matches(&self, info: &ModInfo, match_type: MatchType) -> bool {
        match match_type {
            MatchType::Strict => self.mod_info == *info,
            MatchType::IdOnly => self.mod_info.id == info.id,
            MatchType::IdVersion => {
                self.mod_info.id == info.id && self.mod_info.version == info.version
            }
            MatchType::IdVersionLong => {
                self.mod_info.id == info.id && self.mod_info.version_long == info.version_long
            }
            MatchType::ObjectName => object_name_matches(&self.object, &info.id),
        }
    }
}

/// Record of a dlopen that failed. Kept for diagnostics; never invokes
/// callbacks and is never retried.
pub struct FailedMod {
    pub object: SharedObject,
    pub failure: String,
    pub dependencies: Vec<DependencyResult>,
}

impl FailedMod {
    /// A failed mod has no [`ModInfo`], so only the object-name match can
    /// apply to it.
    pub fn matches(&self, info: &ModInfo, match_type: MatchType) -> bool {
        match_type == MatchType::ObjectName && object_name_matches(&self.object, &info.id)
    }
}

pub enum LoadResult {
    Failed(FailedMod),
    Loaded(LoadedMod),
}

impl LoadResult {
    pub fn object(&self) -> &SharedObject {
        match self {
            LoadResult::Failed(failed) => &failed.object,
            LoadResult::Loaded(loaded) => &loaded.object,
        }
    }

    pub fn loaded(&self) -> Option<&LoadedMod> {
        match self {
            LoadResult::Loaded(loaded) => Some(loaded),
            LoadResult::Failed(_) => None,
        }
    }

    pub fn loaded_mut(&mut self) -> Option<&mut LoadedMod> {
        match self {
            LoadResult::Loaded(loaded) => Some(loaded),
            LoadResult::Failed(_) => None,
        }
    }
}

fn object_name_matches(object: &SharedObject, name: &str) -> bool {
    object
        .path
        .file_name()
        .map(|file| file.to_string_lossy() == name)
        .unwrap_or(false)
}

/// Logged variant of [`LoadedMod::close`] for teardown paths that must
/// keep going.
pub fn close_logged(loaded: &mut LoadedMod) {
    if let Err(err) = loaded.close() {
        warn!(
            "failed to close mod {}: {err:?}",
            loaded.object.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(path: &str) -> LoadedMod {
        LoadedMod::new(
            SharedObject::new(path),
            LoadPhase::Mods,
            std::ptr::null_mut(),
            None,
            None,
            None,
            None,
        )
    }

    #[test]
    fn default_info_derives_from_path() {
        let m = loaded("/tmp/mods/libfoo.so");
        assert_eq!(m.mod_info.id, "/tmp/mods/libfoo.so");
        assert_eq!(m.mod_info.version, "0.0.0");
        assert_eq!(m.mod_info.version_long, 0);
    }

    #[test]
    fn match_types() {
        let mut m = loaded("/tmp/mods/libfoo.so");
        m.mod_info = ModInfo {
            id: "foo".into(),
            version: "1.2".into(),
            version_long: 0x010200,
        };

        let exact = m.mod_info.clone();
        assert!(m.matches(&exact, MatchType::Strict));

        let id_only = ModInfo {
            id: "foo".into(),
            version: "9.9".into(),
            version_long: 7,
        };
        assert!(m.matches(&id_only, MatchType::IdOnly));
        assert!(!m.matches(&id_only, MatchType::IdVersion));
        assert!(!m.matches(&id_only, MatchType::IdVersionLong));
        assert!(!m.matches(&id_only, MatchType::Strict));

        let by_name = ModInfo {
            id: "libfoo.so".into(),
            version: String::new(),
            version_long: 0,
        };
        assert!(m.matches(&by_name, MatchType::ObjectName));
    }

    #[test]
    fn failed_mod_matches_object_name_only() {
        let failed = FailedMod {
            object: SharedObject::new("/tmp/mods/libbroken.so"),
            failure: "dlopen failed".into(),
            dependencies: Vec::new(),
        };
        let info = ModInfo {
            id: "libbroken.so".into(),
            version: String::new(),
            version_long: 0,
        };
        assert!(failed.matches(&info, MatchType::ObjectName));
        assert!(!failed.matches(&info, MatchType::IdOnly));
        assert!(!failed.matches(&info, MatchType::Strict));
    }

    #[test]
    fn lifecycle_latches() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static CALLS: AtomicU32 = AtomicU32::new(0);
        unsafe extern "C" fn count() {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let mut m = loaded("/tmp/mods/liblatch.so");
        m.load_fn = Some(count);

        assert!(m.load());
        assert!(m.load());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn setup_mutation_is_copied_back_once() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static SETUP_CALLS: AtomicU32 = AtomicU32::new(0);
        unsafe extern "C" fn setup(info: *mut CModInfo) {
            SETUP_CALLS.fetch_add(1, Ordering::SeqCst);
            unsafe {
                (*info).id = c"net".as_ptr();
                (*info).version = c"1.2".as_ptr();
                (*info).version_long = 0x010200;
            }
        }

        let mut m = loaded("/tmp/early_mods/libnet.so");
        m.setup_fn = Some(setup);

        assert!(m.init());
        assert_eq!(m.mod_info.id, "net");
        assert_eq!(m.mod_info.version, "1.2");
        assert_eq!(m.mod_info.version_long, 0x010200);

        // A second pipeline pass must not re-invoke setup.
        assert!(m.init());
        assert_eq!(SETUP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn setup_absent_reports_false() {
        let mut m = loaded("/tmp/mods/libnosetup.so");
        assert!(!m.init());
    }

    #[test]
    fn close_without_handle_is_ok() {
        let mut m = loaded("/tmp/mods/libnohandle.so");
        assert!(m.close().is_ok());
        assert!(m.close().is_ok());
    }
}
