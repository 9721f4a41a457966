//! The symbols the host entry-point shim calls, in order: `preload`,
//! `load`, `accept_unity_handle`, `unload`. Nothing here may unwind into
//! the host.

use crate::context::{CONTEXT, Dirs};
use crate::{dlfcn, hooks, linker, pipeline, protect};
use jni_sys::{JNIEnv, JavaVM};
use log::{debug, error, info, warn};
use nix::libc::{c_char, c_void};
use std::ffi::CStr;
use std::path::PathBuf;

unsafe fn capture_path(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    let raw = unsafe { CStr::from_ptr(ptr) };
    Some(PathBuf::from(raw.to_string_lossy().into_owned()))
}

unsafe fn capture_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Captures paths and the JavaVM, stages the phase directories and
/// prepares the loader's linker namespace.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_preload(
    env: *mut JNIEnv,
    app_id: *const c_char,
    modloader_path: *const c_char,
    modloader_source: *const c_char,
    files_dir: *const c_char,
    external_dir: *const c_char,
) {
    crate::init_logger();
    info!("sable v{} preload", crate::MOD_VERSION);

    if !env.is_null() {
        let mut vm: *mut JavaVM = std::ptr::null_mut();
        let status = unsafe { ((**env).GetJavaVM.unwrap())(env, &mut vm) };
        if status == 0 {
            CONTEXT.set_jvm(vm as *mut c_void);
        } else {
            warn!("GetJavaVM failed: {status}");
        }
    }

    let (Some(modloader_path), Some(source_path), Some(files_dir), Some(external_dir)) = (unsafe {
        (
            capture_path(modloader_path),
            capture_path(modloader_source),
            capture_path(files_dir),
            capture_path(external_dir),
        )
    }) else {
        error!("preload received null paths, loader disabled");
        CONTEXT.set_failed();
        return;
    };
    let application_id = unsafe { capture_string(app_id) }.unwrap_or_default();

    let root_load_path = source_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| source_path.clone());
    let source_filename = source_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    info!(
        "app {application_id}, source {}, staging {} -> {}",
        source_path.display(),
        root_load_path.display(),
        files_dir.display()
    );

    if !CONTEXT.set_dirs(Dirs {
        modloader_path,
        root_load_path,
        files_dir,
        external_dir,
        application_id,
        source_path,
    }) {
        warn!("preload called twice, keeping the first capture");
        return;
    }

    let dirs = CONTEXT.dirs().expect("dirs were just set");
    if !pipeline::copy_all(&dirs.root_load_path, &dirs.files_dir) {
        error!("staging failed, every later stage will be skipped");
        CONTEXT.set_failed();
        return;
    }

    if let Err(err) = linker::init(&source_filename) {
        warn!("linker namespace patch unavailable: {err:?}");
    }
}

/// Records where libil2cpp.so lives, then opens the `libs` and
/// `early_mods` phases.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_load(_env: *mut JNIEnv, so_dir: *const c_char) {
    crate::init_logger();

    let Some(so_dir) = (unsafe { capture_path(so_dir) }) else {
        error!("load received a null so_dir");
        return;
    };
    CONTEXT.set_libil2cpp_path(so_dir.join("libil2cpp.so"));

    let Some(dirs) = CONTEXT.dirs() else {
        error!("load called before preload");
        return;
    };

    let mut pipeline = pipeline::instance().lock();
    pipeline.open_libs(&dirs.files_dir);
    pipeline.open_early_mods(&dirs.files_dir);
}

/// Captures the Unity handle, opens libil2cpp and arms the IL2CPP-init
/// hook that drives the remaining stages.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_accept_unity_handle(_env: *mut JNIEnv, unity_handle: *mut c_void) {
    crate::init_logger();
    debug!("accept_unity_handle: {unity_handle:p}");
    CONTEXT.set_unity_handle(unity_handle);

    let Some(libil2cpp) = CONTEXT.libil2cpp_path() else {
        error!("accept_unity_handle called before load");
        return;
    };

    match dlfcn::open_global(libil2cpp) {
        Ok(handle) => CONTEXT.set_il2cpp_handle(handle),
        Err(err) => {
            error!("failed to dlopen {}: {err:?}", libil2cpp.display());
            return;
        }
    }

    protect::protect_all();

    if let Err(err) = hooks::install_il2cpp_init_hook() {
        warn!("il2cpp_init hook unavailable, mod lifecycles will not fire: {err:?}");
    }
}

/// Teardown: unload callbacks, dlclose, drained collections.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_unload(_vm: *mut JavaVM) {
    crate::init_logger();
    info!("unload: closing all mods");
    pipeline::instance().lock().close_all();
}
