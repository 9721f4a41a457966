pub mod cxx;

use crate::elf;
use anyhow::{Context, Result, bail};
use self::cxx::{CxxString, CxxUnorderedMap, CxxVector};
use log::{debug, error, warn};
use memmap2::Mmap;
use nix::libc::c_char;
use nix::sys::mman::{ProtFlags, mprotect};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sable_common::mem::page_span;
use std::ffi::{CStr, c_void};
use std::fs::File;
use std::ptr::NonNull;

const LINKER_PATH: &str = "/system/bin/linker64";
const SONAME_MAP_SYMBOL: &str = "__dl_g_soinfo_handles_map";
const GET_SONAME_SYMBOL: &str = "__dl__ZNK6soinfo10get_sonameEv";
const GET_PRIMARY_NAMESPACE_SYMBOL: &str = "__dl__ZN6soinfo21get_primary_namespaceEv";

type GetSonameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type GetPrimaryNamespaceFn = unsafe extern "C" fn(*mut c_void) -> *mut AndroidNamespace;

/// The head of bionic's `android_namespace_t`, up to the path lists this
/// loader rewrites. Field order is the platform's (Android 12-14, LP64);
/// everything past `allowed_libs` is never touched and therefore omitted.
#[repr(C)]
pub struct AndroidNamespace {
    pub name: *const c_char,
    pub is_isolated: bool,
    pub is_exempt_list_enabled: bool,
    pub is_also_used_as_anonymous: bool,
    pub ld_library_paths: CxxVector<CxxString>,
    pub default_library_paths: CxxVector<CxxString>,
    pub permitted_paths: CxxVector<CxxString>,
    pub allowed_libs: CxxVector<CxxString>,
}

struct NamespacePatcher {
    namespace: *mut AndroidNamespace,
}

// Only the host's loader thread ever reaches the patcher.
unsafe impl Send for NamespacePatcher {}

static PATCHER: Lazy<Mutex<Option<NamespacePatcher>>> = Lazy::new(|| Mutex::new(None));

/// Finds the namespace the loader itself was opened into and makes it
/// usable for staged binaries: drops isolation so bare-name dlopen can
/// search the paths added later with [`add_ld_library_paths`].
///
/// `modloader_filename` is the basename the host dlopen()ed, the key the
/// soinfo table is searched by.
pub fn init(modloader_filename: &str) -> Result<()> {
    let mut guard = PATCHER.lock();
    if guard.is_some() {
        return Ok(());
    }

    let file = File::open(LINKER_PATH).with_context(|| format!("open {LINKER_PATH}"))?;
    let mapped = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {LINKER_PATH}"))?;

    let base = elf::base_address("linker64").context("linker64 is not mapped")?;

    let handles_map = base
        + elf::symbol_address(&mapped, SONAME_MAP_SYMBOL)
            .with_context(|| format!("symbol {SONAME_MAP_SYMBOL} not found"))? as usize;
    debug!("g_soinfo_handles_map: {handles_map:#x}");

    let get_soname: GetSonameFn = unsafe {
        std::mem::transmute::<usize, GetSonameFn>(
            base + elf::symbol_address(&mapped, GET_SONAME_SYMBOL)
                .with_context(|| format!("symbol {GET_SONAME_SYMBOL} not found"))?
                as usize,
        )
    };
    let get_primary_namespace: GetPrimaryNamespaceFn = unsafe {
        std::mem::transmute::<usize, GetPrimaryNamespaceFn>(
            base + elf::symbol_address(&mapped, GET_PRIMARY_NAMESPACE_SYMBOL)
                .with_context(|| format!("symbol {GET_PRIMARY_NAMESPACE_SYMBOL} not found"))?
                as usize,
        )
    };

    let handles = unsafe { &*(handles_map as *const CxxUnorderedMap) };
    let mut namespace: *mut AndroidNamespace = std::ptr::null_mut();
    for (_, soinfo) in handles.iter() {
        let soname = unsafe { get_soname(soinfo) };
        if soname.is_null() {
            continue;
        }
        if unsafe { CStr::from_ptr(soname) }.to_bytes() == modloader_filename.as_bytes() {
            namespace = unsafe { get_primary_namespace(soinfo) };
            break;
        }
    }

    if namespace.is_null() {
        bail!("no soinfo with soname {modloader_filename}");
    }

    make_namespace_writable(namespace)?;
    unsafe {
        (*namespace).is_isolated = false;
        if !(*namespace).name.is_null() {
            debug!(
                "modloader namespace {:?} at {namespace:p} marked non-isolated",
                CStr::from_ptr((*namespace).name)
            );
        }
    }

    *guard = Some(NamespacePatcher { namespace });
    Ok(())
}

/// Appends `paths` to the namespace's search-path list. No-op failure if
/// [`init`] never succeeded.
pub fn add_ld_library_paths(paths: &[String]) -> bool {
    let guard = PATCHER.lock();
    let Some(patcher) = guard.as_ref() else {
        warn!("namespace patcher is not initialized");
        return false;
    };

    let namespace = unsafe { &mut *patcher.namespace };

    let mut combined: Vec<CxxString> = namespace
        .ld_library_paths
        .as_slice()
        .iter()
        .filter_map(CxxString::as_str)
        .map(CxxString::new_long)
        .collect();
    combined.extend(paths.iter().map(|path| CxxString::new_long(path)));

    debug!(
        "rewriting namespace search paths ({} existing + {} new)",
        namespace.ld_library_paths.as_slice().len(),
        paths.len()
    );
    namespace.ld_library_paths.overwrite(combined);
    true
}

fn make_namespace_writable(namespace: *mut AndroidNamespace) -> Result<()> {
    let (start, span) = page_span(namespace as usize, std::mem::size_of::<AndroidNamespace>());
    let result = unsafe {
        mprotect(
            NonNull::new(start as *mut _).context("namespace page is null")?,
            span,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        )
    };
    if let Err(err) = result {
        error!("mprotect({start:#x}, {span:#x}) on the namespace failed: {err}");
        bail!("cannot make the namespace writable: {err}");
    }
    Ok(())
}
