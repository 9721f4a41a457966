//! The C mirror of the public API. Every string handed out is either a
//! pointer to a loader-owned string (the `modloader_get_*` accessors) or
//! a fresh heap copy the caller releases through
//! [`modloader_free_results`].

use crate::context::CONTEXT;
use crate::linker;
use crate::mods::{MatchType, ModInfo};
use crate::phase::LoadPhase;
use crate::pipeline::{self, ModSnapshot, RequireStatus};
use nix::libc::{c_char, c_void, size_t};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::Path;

#[repr(C)]
pub struct CModInfo {
    pub id: *const c_char,
    pub version: *const c_char,
    pub version_long: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CMatchType {
    Strict = 0,
    IdOnly,
    IdVersion,
    IdVersionLong,
    /// Library binary name, e.g. `libsable.so`.
    ObjectName,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CLoadPhase {
    None = 0,
    Libs,
    EarlyMods,
    Mods,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CLoadResult {
    NotFound = 0,
    Failed,
    Loaded,
}

#[repr(C)]
pub struct CModResult {
    pub info: CModInfo,
    pub path: *const c_char,
    pub handle: *mut c_void,
}

#[repr(C)]
pub struct CModResults {
    pub array: *mut CModResult,
    pub size: size_t,
}

impl From<CMatchType> for MatchType {
    fn from(match_type: CMatchType) -> Self {
        match match_type {
            CMatchType::Strict => MatchType::Strict,
            CMatchType::IdOnly => MatchType::IdOnly,
            CMatchType::IdVersion => MatchType::IdVersion,
            CMatchType::IdVersionLong => MatchType::IdVersionLong,
            CMatchType::ObjectName => MatchType::ObjectName,
        }
    }
}

pub(crate) fn mod_info_from_c(info: &CModInfo) -> ModInfo {
    let read = |ptr: *const c_char| {
        if ptr.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
        }
    };
    ModInfo {
        id: read(info.id),
        version: read(info.version),
        version_long: info.version_long,
    }
}

/// Pointers handed to C stay valid for the process lifetime: the backing
/// `CString`s live in this cache and are never evicted.
fn cached_cstring(key: &'static str, value: &str) -> *const c_char {
    static CACHE: Lazy<Mutex<HashMap<&'static str, CString>>> =
        Lazy::new(|| Mutex::new(HashMap::new()));

    let mut cache = CACHE.lock();
    cache
        .entry(key)
        .or_insert_with(|| CString::new(value).unwrap_or_default())
        .as_ptr()
}

fn cached_path(key: &'static str, value: Option<&Path>) -> *const c_char {
    match value {
        Some(path) => cached_cstring(key, &path.to_string_lossy()),
        None => std::ptr::null(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_path() -> *const c_char {
    cached_path("path", CONTEXT.dirs().map(|dirs| dirs.modloader_path.as_path()))
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_root_load_path() -> *const c_char {
    cached_path(
        "root_load_path",
        CONTEXT.dirs().map(|dirs| dirs.root_load_path.as_path()),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_files_dir() -> *const c_char {
    cached_path("files_dir", CONTEXT.dirs().map(|dirs| dirs.files_dir.as_path()))
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_external_dir() -> *const c_char {
    cached_path(
        "external_dir",
        CONTEXT.dirs().map(|dirs| dirs.external_dir.as_path()),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_application_id() -> *const c_char {
    match CONTEXT.dirs() {
        Some(dirs) => cached_cstring("application_id", &dirs.application_id),
        None => std::ptr::null(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_source_path() -> *const c_char {
    cached_path(
        "source_path",
        CONTEXT.dirs().map(|dirs| dirs.source_path.as_path()),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_libil2cpp_path() -> *const c_char {
    cached_path(
        "libil2cpp_path",
        CONTEXT.libil2cpp_path().map(|path| path.as_path()),
    )
}

/// True when staging failed and the pipeline latched off.
#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_failed() -> bool {
    CONTEXT.failed()
}

#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_load_phase() -> CLoadPhase {
    match CONTEXT.load_phase() {
        LoadPhase::None => CLoadPhase::None,
        LoadPhase::Libs => CLoadPhase::Libs,
        LoadPhase::EarlyMods => CLoadPhase::EarlyMods,
        LoadPhase::Mods => CLoadPhase::Mods,
    }
}

fn marshal(snapshot: &ModSnapshot) -> CModResult {
    let leak = |value: &str| {
        CString::new(value)
            .unwrap_or_default()
            .into_raw()
            .cast_const()
    };
    CModResult {
        info: CModInfo {
            id: leak(&snapshot.info.id),
            version: leak(&snapshot.info.version),
            version_long: snapshot.info.version_long,
        },
        path: leak(&snapshot.path.to_string_lossy()),
        handle: snapshot.handle,
    }
}

fn empty_result() -> CModResult {
    CModResult {
        info: CModInfo {
            id: std::ptr::null(),
            version: std::ptr::null(),
            version_long: 0,
        },
        path: std::ptr::null(),
        handle: std::ptr::null_mut(),
    }
}

/// Finds the matching mod. The handle is null and the strings are null
/// when nothing matched; the strings of a hit are fresh heap copies the
/// caller owns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_get_mod(
    info: *const CModInfo,
    match_type: CMatchType,
) -> CModResult {
    if info.is_null() {
        return empty_result();
    }
    let wanted = mod_info_from_c(unsafe { &*info });

    match pipeline::instance().lock().get_mod(&wanted, match_type.into()) {
        Some(snapshot) => marshal(&snapshot),
        None => empty_result(),
    }
}

/// Every successfully loaded object, marshalled into caller-owned memory.
#[unsafe(no_mangle)]
pub extern "C" fn modloader_get_all() -> CModResults {
    let snapshots = pipeline::instance().lock().get_all();
    marshal_results(&snapshots)
}

fn marshal_results(snapshots: &[ModSnapshot]) -> CModResults {
    let marshalled: Vec<CModResult> = snapshots.iter().map(marshal).collect();
    let size = marshalled.len();
    let array = Box::into_raw(marshalled.into_boxed_slice()) as *mut CModResult;
    CModResults { array, size }
}

/// Releases everything `modloader_get_all` allocated. Safe on an empty
/// result; the struct is zeroed afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_free_results(results: *mut CModResults) {
    if results.is_null() {
        return;
    }
    let results = unsafe { &mut *results };
    if !results.array.is_null() && results.size > 0 {
        let items = unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                results.array,
                results.size,
            ))
        };
        for item in items.iter() {
            unsafe {
                release_string(item.info.id);
                release_string(item.info.version);
                release_string(item.path);
            }
        }
    }
    results.array = std::ptr::null_mut();
    results.size = 0;
}

unsafe fn release_string(ptr: *const c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr.cast_mut()) });
    }
}

/// Unloads the matching mod (running its `unload` first). True when the
/// mod was absent or unloaded cleanly.
#[unsafe(no_mangle)]
pub extern "C" fn modloader_force_unload(info: CModInfo, match_type: CMatchType) -> bool {
    let wanted = mod_info_from_c(&info);
    pipeline::instance()
        .lock()
        .force_unload(&wanted, match_type.into())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_require_mod(
    info: *const CModInfo,
    match_type: CMatchType,
) -> CLoadResult {
    if info.is_null() {
        return CLoadResult::NotFound;
    }
    let wanted = mod_info_from_c(unsafe { &*info });

    match pipeline::instance()
        .lock()
        .require_mod(&wanted, match_type.into())
    {
        RequireStatus::NotFound => CLoadResult::NotFound,
        RequireStatus::Failed => CLoadResult::Failed,
        RequireStatus::Loaded => CLoadResult::Loaded,
    }
}

/// Adds `path` to the search paths of the loader's linker namespace.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn modloader_add_ld_library_path(path: *const c_char) -> bool {
    if path.is_null() {
        return false;
    }
    let path = unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned();
    linker::add_ld_library_paths(&[path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn c_info_with_null_fields_defaults() {
        let info = CModInfo {
            id: std::ptr::null(),
            version: std::ptr::null(),
            version_long: 9,
        };
        let parsed = mod_info_from_c(&info);
        assert_eq!(parsed.id, "");
        assert_eq!(parsed.version, "");
        assert_eq!(parsed.version_long, 9);
    }

    #[test]
    fn marshalled_results_round_trip_and_free() {
        let snapshots = vec![
            ModSnapshot {
                info: ModInfo {
                    id: "alpha".into(),
                    version: "1.0.0".into(),
                    version_long: 0x0100,
                },
                path: PathBuf::from("/tmp/mods/libalpha.so"),
                handle: std::ptr::null_mut(),
            },
            ModSnapshot {
                info: ModInfo {
                    id: "beta".into(),
                    version: "0.2.1".into(),
                    version_long: 0x0201,
                },
                path: PathBuf::from("/tmp/mods/libbeta.so"),
                handle: std::ptr::null_mut(),
            },
        ];

        let mut results = marshal_results(&snapshots);
        assert_eq!(results.size, 2);

        let first = unsafe { &*results.array };
        assert_eq!(
            unsafe { CStr::from_ptr(first.info.id) }.to_str().unwrap(),
            "alpha"
        );
        assert_eq!(
            unsafe { CStr::from_ptr(first.path) }.to_str().unwrap(),
            "/tmp/mods/libalpha.so"
        );

        unsafe { modloader_free_results(&mut results) };
        assert!(results.array.is_null());
        assert_eq!(results.size, 0);

        // Freeing again is a no-op.
        unsafe { modloader_free_results(&mut results) };
    }

    #[test]
    fn match_type_conversion_is_total() {
        assert_eq!(MatchType::from(CMatchType::Strict), MatchType::Strict);
        assert_eq!(MatchType::from(CMatchType::ObjectName), MatchType::ObjectName);
    }
}
