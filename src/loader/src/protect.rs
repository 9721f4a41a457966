use log::{debug, error, info, warn};
use nix::sys::mman::{ProtFlags, mprotect};
use procfs::process::{MMPermissions, Process};
use std::ptr::NonNull;

/// Gives every execute-only private mapping read permission.
///
/// Some platforms map engine code `--xp`; the xref traces have to read
/// those bytes. Failures are logged and skipped, a single stubborn
/// segment should not cost the whole trace.
pub fn protect_all() {
    debug!("re-protecting execute-only segments from /proc/self/maps");

    let maps = match Process::myself().and_then(|process| process.maps()) {
        Ok(maps) => maps,
        Err(err) => {
            warn!("cannot read /proc/self/maps: {err:?}");
            return;
        }
    };

    for map in maps {
        let perms = map.perms;
        if !perms.contains(MMPermissions::EXECUTE)
            || perms.contains(MMPermissions::READ)
            || perms.contains(MMPermissions::WRITE)
        {
            continue;
        }

        let (start, end) = (map.address.0 as usize, map.address.1 as usize);
        info!("protecting {start:#x}-{end:#x} to r-x");

        let Some(addr) = NonNull::new(start as *mut _) else {
            continue;
        };
        let result =
            unsafe { mprotect(addr, end - start, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC) };
        if let Err(err) = result {
            error!("protection of {start:#x}-{end:#x} failed: {err}");
        }
    }
}
