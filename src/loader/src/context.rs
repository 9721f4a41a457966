use crate::phase::LoadPhase;
use nix::libc::c_void;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

/// Paths captured from the host during `preload`. Write-once.
#[derive(Debug)]
pub struct Dirs {
    /// Where the staged copy of the loader itself lives, e.g.
    /// `/data/user/0/<app>/files/libsable.so`.
    pub modloader_path: PathBuf,
    /// Parent directory of the loader's source binary; phase directories
    /// are staged from here.
    pub root_load_path: PathBuf,
    pub files_dir: PathBuf,
    pub external_dir: PathBuf,
    pub application_id: String,
    /// Where the host discovered the loader, e.g.
    /// `/sdcard/ModData/<app>/Modloader/libsable.so`.
    pub source_path: PathBuf,
}

/// The loader's process-global scalars: captured paths, engine handles and
/// the pipeline's progress flags. Single writer (the host's loader
/// thread); everything is write-once except the phase cursor.
pub struct Context {
    dirs: OnceCell<Dirs>,
    libil2cpp_path: OnceCell<PathBuf>,

    jvm: AtomicPtr<c_void>,
    unity_handle: AtomicPtr<c_void>,
    il2cpp_handle: AtomicPtr<c_void>,

    failed: AtomicBool,
    libs_opened: AtomicBool,
    early_mods_opened: AtomicBool,
    late_mods_opened: AtomicBool,
    current_load_phase: AtomicU8,
}

pub static CONTEXT: Context = Context {
    dirs: OnceCell::new(),
    libil2cpp_path: OnceCell::new(),
    jvm: AtomicPtr::new(std::ptr::null_mut()),
    unity_handle: AtomicPtr::new(std::ptr::null_mut()),
    il2cpp_handle: AtomicPtr::new(std::ptr::null_mut()),
    failed: AtomicBool::new(false),
    libs_opened: AtomicBool::new(false),
    early_mods_opened: AtomicBool::new(false),
    late_mods_opened: AtomicBool::new(false),
    current_load_phase: AtomicU8::new(0),
};

impl Context {
    pub fn set_dirs(&self, dirs: Dirs) -> bool {
        self.dirs.set(dirs).is_ok()
    }

    pub fn dirs(&self) -> Option<&Dirs> {
        self.dirs.get()
    }

    pub fn set_libil2cpp_path(&self, path: PathBuf) -> bool {
        self.libil2cpp_path.set(path).is_ok()
    }

    pub fn libil2cpp_path(&self) -> Option<&PathBuf> {
        self.libil2cpp_path.get()
    }

    pub fn set_jvm(&self, vm: *mut c_void) {
        self.jvm.store(vm, Ordering::Release);
    }

    pub fn jvm(&self) -> *mut c_void {
        self.jvm.load(Ordering::Acquire)
    }

    pub fn set_unity_handle(&self, handle: *mut c_void) {
        self.unity_handle.store(handle, Ordering::Release);
    }

    pub fn unity_handle(&self) -> *mut c_void {
        self.unity_handle.load(Ordering::Acquire)
    }

    pub fn set_il2cpp_handle(&self, handle: *mut c_void) {
        self.il2cpp_handle.store(handle, Ordering::Release);
    }

    pub fn il2cpp_handle(&self) -> *mut c_void {
        self.il2cpp_handle.load(Ordering::Acquire)
    }

    /// Latched by a staging failure; every later pipeline entry checks it
    /// and becomes a no-op.
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn set_libs_opened(&self) {
        self.libs_opened.store(true, Ordering::Release);
    }

    pub fn libs_opened(&self) -> bool {
        self.libs_opened.load(Ordering::Acquire)
    }

    pub fn set_early_mods_opened(&self) {
        self.early_mods_opened.store(true, Ordering::Release);
    }

    pub fn early_mods_opened(&self) -> bool {
        self.early_mods_opened.load(Ordering::Acquire)
    }

    pub fn set_late_mods_opened(&self) {
        self.late_mods_opened.store(true, Ordering::Release);
    }

    pub fn late_mods_opened(&self) -> bool {
        self.late_mods_opened.load(Ordering::Acquire)
    }

    /// Advanced only by pipeline entry points, never from inside a mod
    /// callback. Reflects the latest stage that started.
    pub fn set_load_phase(&self, phase: LoadPhase) {
        self.current_load_phase.store(phase.into(), Ordering::Release);
    }

    pub fn load_phase(&self) -> LoadPhase {
        match self.current_load_phase.load(Ordering::Acquire) {
            1 => LoadPhase::Libs,
            2 => LoadPhase::EarlyMods,
            3 => LoadPhase::Mods,
            _ => LoadPhase::None,
        }
    }
}
