use goblin::elf::Elf;
use log::{debug, warn};
use procfs::process::{MMapPath, Process};

/// `DT_NEEDED` names of a mapped shared object, in ELF order.
///
/// Anything short of a well-formed dynamic section yields the empty list:
/// resolution failures are never fatal, the dynamic linker gets the final
/// say at dlopen time.
pub fn needed_dependencies(bytes: &[u8]) -> Vec<String> {
    match Elf::parse(bytes) {
        Ok(elf) => elf.libraries.iter().map(|name| name.to_string()).collect(),
        Err(err) => {
            warn!("failed to parse ELF for DT_NEEDED: {err}");
            Vec::new()
        }
    }
}

/// Looks up `name` in the static symbol table of a statically-mapped ELF
/// and returns its `st_value` (an unrelocated virtual address).
pub fn symbol_address(bytes: &[u8], name: &str) -> Option<u64> {
    let elf = match Elf::parse(bytes) {
        Ok(elf) => elf,
        Err(err) => {
            warn!("failed to parse ELF for symbol lookup: {err}");
            return None;
        }
    };

    elf.syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(name))
        .map(|sym| sym.st_value)
}

/// Load bias of the first loaded library whose path contains `soname`.
pub fn base_address(soname: &str) -> Option<usize> {
    let maps = Process::myself().ok()?.maps().ok()?;

    for map in maps {
        if let MMapPath::Path(path) = &map.pathname
            && path.to_string_lossy().contains(soname)
        {
            debug!("base of {soname}: {:#x} ({})", map.address.0, path.display());
            return Some(map.address.0 as usize);
        }
    }

    None
}
