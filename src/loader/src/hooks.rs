use crate::context::CONTEXT;
use crate::disasm::{Cond, Disassembler, Search};
use crate::dlfcn;
use crate::pipeline;
use crate::trampoline::{InlineHook, TrampolinePool};
use anyhow::{Context as _, Result, bail};
use log::{debug, info, warn};
use nix::libc::{c_char, c_int, c_void};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::CStr;

type Il2cppInitFn = unsafe extern "C" fn(*const c_char) -> c_int;
type ResolveIcallFn = unsafe extern "C" fn(*const c_char) -> *const c_void;
type DestroyFn = unsafe extern "C" fn(u64, u64) -> u64;

static POOL: Lazy<Mutex<TrampolinePool>> = Lazy::new(|| Mutex::new(TrampolinePool::new()));
static IL2CPP_INIT_HOOK: Mutex<Option<InlineHook>> = Mutex::new(None);
static DESTROY_HOOK: Mutex<Option<InlineHook>> = Mutex::new(None);

/// Detours `il2cpp_init` so `load()` callbacks fire right after the engine
/// runtime comes up. A missing symbol degrades (no early `load`, no late
/// mods), it does not abort.
pub fn install_il2cpp_init_hook() -> Result<()> {
    let handle = CONTEXT.il2cpp_handle();
    if handle.is_null() {
        bail!("libil2cpp handle was never captured");
    }

    let target = dlfcn::sym(handle, "il2cpp_init").context("dlsym il2cpp_init")? as usize;
    let hook = InlineHook::install(&mut POOL.lock(), target, il2cpp_init_replacement as usize)?;
    info!("il2cpp_init hooked at {target:#x}");
    *IL2CPP_INIT_HOOK.lock() = Some(hook);
    Ok(())
}

unsafe extern "C" fn il2cpp_init_replacement(domain_name: *const c_char) -> c_int {
    debug!("il2cpp_init fired");
    let hook = IL2CPP_INIT_HOOK.lock().take();

    let result = match &hook {
        Some(hook) => {
            let original: Il2cppInitFn =
                unsafe { std::mem::transmute::<usize, Il2cppInitFn>(hook.trampoline_addr()) };
            unsafe { original(domain_name) }
        }
        None => {
            warn!("il2cpp_init replacement ran without an installed hook");
            0
        }
    };

    if let Some(hook) = hook {
        debug!("removing il2cpp_init hook at {:#x}", hook.target());
        hook.uninstall(&mut POOL.lock());
    }

    pipeline::instance().lock().load_early_mods();

    if let Err(err) = install_destroy_hook() {
        warn!("late mods will not load, object-destruction hook unavailable: {err:?}");
    }

    result
}

/// Locates the engine's object-destruction entry via the icall table and
/// detours it; the hook opens and late-loads the `mods` phase once, then
/// removes itself.
pub fn install_destroy_hook() -> Result<()> {
    let cs = Disassembler::new()?;

    let site = match find_destroy_site(&cs) {
        Ok(site) => site,
        Err(err) => {
            warn!("icall trace failed ({err:?}), trying the JNI_OnLoad fallback");
            find_destroy_site_fallback(&cs).context("fallback trace failed too")?
        }
    };

    let hook = InlineHook::install(&mut POOL.lock(), site, destroy_replacement as usize)?;
    info!("object destruction hooked at {site:#x}");
    *DESTROY_HOOK.lock() = Some(hook);
    Ok(())
}

unsafe extern "C" fn destroy_replacement(object: u64, extra: u64) -> u64 {
    debug!("object-destruction hook fired");
    let hook = DESTROY_HOOK.lock().take();

    let result = match &hook {
        Some(hook) => {
            let original: DestroyFn =
                unsafe { std::mem::transmute::<usize, DestroyFn>(hook.trampoline_addr()) };
            unsafe { original(object, extra) }
        }
        None => {
            warn!("destruction replacement ran without an installed hook");
            0
        }
    };

    if let Some(hook) = hook {
        debug!("removing object-destruction hook at {:#x}", hook.target());
        hook.uninstall(&mut POOL.lock());
    }

    match CONTEXT.dirs() {
        Some(dirs) => {
            let mut pipeline = pipeline::instance().lock();
            pipeline.open_mods(&dirs.files_dir);
            pipeline.load_mods();
        }
        None => warn!("paths were never captured, skipping late mods"),
    }

    result
}

/// Primary trace: `il2cpp_resolve_icall` hands out the DestroyImmediate
/// thunk; the last BL before the method's RET is the scripting frame, and
/// its first unconditional branch lands on the hookable entry.
fn find_destroy_site(cs: &Disassembler) -> Result<usize> {
    let il2cpp = CONTEXT.il2cpp_handle();
    if il2cpp.is_null() {
        bail!("libil2cpp handle was never captured");
    }

    let resolve = dlfcn::sym(il2cpp, "il2cpp_resolve_icall").context("dlsym il2cpp_resolve_icall")?;
    let resolve: ResolveIcallFn = unsafe { std::mem::transmute::<*mut c_void, ResolveIcallFn>(resolve) };

    let mut icall = unsafe { resolve(c"UnityEngine.Object::DestroyImmediate".as_ptr()) };
    if icall.is_null() {
        icall = unsafe { resolve(c"UnityEngine.Object::DestroyImmediate_Injected".as_ptr()) };
    }
    if icall.is_null() {
        bail!("DestroyImmediate icall not registered");
    }
    let icall = icall as usize;
    debug!("DestroyImmediate icall body at {icall:#x}");

    let method_end = cs
        .find_first_ret(icall, 100 * 4)
        .context("no RET within 100 instructions of the icall body")?;
    let next_frame = cs
        .last_bl_before(icall, method_end)
        .context("no BL inside the icall body")?;
    debug!("DestroyObjectFromScriptingImmediate at {next_frame:#x}");

    cs.find_nth_b(next_frame, Search::nth(1), false)
        .context("no unconditional branch in the scripting frame")
}

#[repr(C)]
struct JniNativeMethod {
    name: *const c_char,
    signature: *const c_char,
    fn_ptr: *const c_void,
}

/// Older engine builds never register the icall. Walk in from JNI_OnLoad
/// instead: locate the `JNINativeMethod` table, take `nativeRender`, and
/// follow the build-specific branch chain down to the same site.
fn find_destroy_site_fallback(cs: &Disassembler) -> Option<usize> {
    let unity = CONTEXT.unity_handle();
    if unity.is_null() {
        warn!("unity handle was never captured");
        return None;
    }

    let jni_onload = dlfcn::sym(unity, "JNI_OnLoad").ok()? as usize;
    let register_natives = cs.find_nth_bl(jni_onload, Search::nth(2), false)?;
    let (_, _, methods) = cs.getpcaddr(register_natives, 2, 1, 4096)?;
    let (_, count) = cs.find_nth_movz(register_natives, Search::nth(1))?;
    debug!("JNINativeMethod table at {methods:#x}, {count} entries");

    let mut native_render = None;
    for index in 0..count.min(512) {
        let entry = unsafe { &*((methods + index as usize * 24) as *const JniNativeMethod) };
        if entry.name.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(entry.name) };
        if name.to_bytes() == b"nativeRender" {
            native_render = Some(entry.fn_ptr as usize);
            break;
        }
    }
    let mut addr = native_render?;
    debug!("nativeRender at {addr:#x}");

    addr = cs.find_nth_bl(addr, Search::nth(6), false)?;
    addr = cs.find_nth_tbz(addr, Search::nth(1))?.2;
    addr = cs.find_nth_tbz(addr, Search::nth(1))?.2;
    addr = cs.find_nth_bcond(addr, Search::nth(1), Cond::Ne)?.2;
    addr = cs.find_nth_tbz(addr, Search::nth(1))?.2;
    addr = cs.find_nth_bl(addr, Search::nth(1), false)?;
    addr = cs.find_nth_bl(addr, Search::nth(9), false)?;
    addr = cs.find_nth_bl(addr, Search::nth(2), false)?;

    Some(addr)
}
