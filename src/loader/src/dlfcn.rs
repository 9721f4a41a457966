use anyhow::{Error, Result, anyhow};
use nix::libc::{RTLD_LOCAL, RTLD_NOW, c_char, c_int, c_void};
use std::ffi::{CStr, CString};
use std::path::Path;

mod system {
    use nix::libc::{c_char, c_int, c_void};

    #[repr(C)]
    pub struct DlInfo {
        pub dli_fname: *const c_char,
        pub dli_fbase: *mut c_void,
        pub dli_sname: *const c_char,
        pub dli_saddr: *mut c_void,
    }

    unsafe extern "C" {
        pub fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void;

        pub fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;

        pub fn dlclose(handle: *mut c_void) -> c_int;

        pub fn dlerror() -> *const c_char;

        pub fn dladdr(addr: *const c_void, info: *mut DlInfo) -> c_int;
    }
}

fn dlerror() -> Error {
    let message = unsafe {
        let raw = system::dlerror();
        if raw.is_null() {
            return anyhow!("unknown dl error");
        }
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    };
    anyhow!("{message}")
}

/// dlopen with the pipeline's fixed binding mode: local visibility,
/// immediate relocation.
pub fn open(path: &Path) -> Result<*mut c_void> {
    let filename = CString::new(path.as_os_str().as_encoded_bytes())?;
    let handle = unsafe { system::dlopen(filename.as_ptr(), RTLD_LOCAL | RTLD_NOW) };

    if handle.is_null() {
        return Err(dlerror());
    }

    Ok(handle)
}

pub fn open_global(path: &Path) -> Result<*mut c_void> {
    let filename = CString::new(path.as_os_str().as_encoded_bytes())?;
    let handle = unsafe { system::dlopen(filename.as_ptr(), RTLD_NOW) };

    if handle.is_null() {
        return Err(dlerror());
    }

    Ok(handle)
}

pub fn sym(handle: *mut c_void, symbol: &str) -> Result<*mut c_void> {
    let symbol = CString::new(symbol)?;
    let address = unsafe { system::dlsym(handle, symbol.as_ptr()) };

    if address.is_null() {
        return Err(dlerror());
    }

    Ok(address)
}

pub fn close(handle: *mut c_void) -> Result<()> {
    if unsafe { system::dlclose(handle) } != 0 {
        return Err(dlerror());
    }
    Ok(())
}

/// File name of the mapped object containing `addr`, if the linker knows
/// about it. Used to reject symbols dlsym leaked from earlier-opened
/// libraries.
pub fn containing_file(addr: *const c_void) -> Option<std::path::PathBuf> {
    let mut info = system::DlInfo {
        dli_fname: std::ptr::null(),
        dli_fbase: std::ptr::null_mut(),
        dli_sname: std::ptr::null(),
        dli_saddr: std::ptr::null_mut(),
    };

    unsafe {
        if system::dladdr(addr, &mut info) == 0 || info.dli_fname.is_null() {
            return None;
        }
        let name = CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned();
        Some(std::path::PathBuf::from(name))
    }
}
