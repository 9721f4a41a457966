//! Builders for the smallest ELF images the loader's readers accept,
//! so resolution runs against real bytes instead of mocks.

use std::fs;
use std::path::{Path, PathBuf};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

fn w16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn w32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn w64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn ehdr(buf: &mut [u8]) {
    buf[0..4].copy_from_slice(b"\x7fELF");
    buf[4] = 2; // 64-bit
    buf[5] = 1; // little-endian
    buf[6] = 1; // version
    w16(buf, 16, 3); // ET_DYN
    w16(buf, 18, 183); // EM_AARCH64
    w32(buf, 20, 1);
    w16(buf, 52, EHDR_SIZE as u16);
}

/// A shared object whose dynamic section lists `needed`, and nothing
/// else. Enough for `DT_NEEDED` enumeration; dlopen will reject it.
pub fn minimal_dylib(needed: &[&str]) -> Vec<u8> {
    let phoff = EHDR_SIZE;
    let strtab_off = phoff + 2 * PHDR_SIZE;

    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for name in needed {
        name_offsets.push(strtab.len());
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let dyn_off = (strtab_off + strtab.len() + 7) & !7;
    let dyn_len = (needed.len() + 3) * 16;
    let total = dyn_off + dyn_len;

    let mut out = vec![0u8; total];
    ehdr(&mut out);
    w64(&mut out, 32, phoff as u64);
    w16(&mut out, 54, PHDR_SIZE as u16);
    w16(&mut out, 56, 2);

    // PT_LOAD mapping the whole file at vaddr 0.
    w32(&mut out, phoff, 1);
    w32(&mut out, phoff + 4, 4);
    w64(&mut out, phoff + 32, total as u64);
    w64(&mut out, phoff + 40, total as u64);
    w64(&mut out, phoff + 48, 0x1000);

    // PT_DYNAMIC.
    let p = phoff + PHDR_SIZE;
    w32(&mut out, p, 2);
    w32(&mut out, p + 4, 4);
    w64(&mut out, p + 8, dyn_off as u64);
    w64(&mut out, p + 16, dyn_off as u64);
    w64(&mut out, p + 32, dyn_len as u64);
    w64(&mut out, p + 40, dyn_len as u64);
    w64(&mut out, p + 48, 8);

    out[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);

    let mut d = dyn_off;
    for offset in name_offsets {
        w64(&mut out, d, 1); // DT_NEEDED
        w64(&mut out, d + 8, offset as u64);
        d += 16;
    }
    w64(&mut out, d, 5); // DT_STRTAB
    w64(&mut out, d + 8, strtab_off as u64);
    w64(&mut out, d + 16, 10); // DT_STRSZ
    w64(&mut out, d + 24, strtab.len() as u64);
    // DT_NULL terminator is the zeroed tail.

    out
}

/// An ELF carrying only a static symbol table with the given
/// name/address pairs.
pub fn with_symtab(symbols: &[(&str, u64)]) -> Vec<u8> {
    let shoff = EHDR_SIZE;
    let symtab_off = shoff + 3 * SHDR_SIZE;
    let symtab_len = (symbols.len() + 1) * SYM_SIZE;
    let strtab_off = symtab_off + symtab_len;

    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for (name, _) in symbols {
        name_offsets.push(strtab.len());
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let total = strtab_off + strtab.len();
    let mut out = vec![0u8; total];
    ehdr(&mut out);
    w64(&mut out, 40, shoff as u64);
    w16(&mut out, 58, SHDR_SIZE as u16);
    w16(&mut out, 60, 3);

    // Section 0 stays null. Section 1: .symtab, linked to section 2.
    let s = shoff + SHDR_SIZE;
    w32(&mut out, s + 4, 2); // SHT_SYMTAB
    w64(&mut out, s + 24, symtab_off as u64);
    w64(&mut out, s + 32, symtab_len as u64);
    w32(&mut out, s + 40, 2);
    w64(&mut out, s + 56, SYM_SIZE as u64);

    // Section 2: .strtab.
    let s = shoff + 2 * SHDR_SIZE;
    w32(&mut out, s + 4, 3); // SHT_STRTAB
    w64(&mut out, s + 24, strtab_off as u64);
    w64(&mut out, s + 32, strtab.len() as u64);

    for (index, (_, value)) in symbols.iter().enumerate() {
        let sym = symtab_off + (index + 1) * SYM_SIZE;
        w32(&mut out, sym, name_offsets[index] as u32);
        w16(&mut out, sym + 6, 1);
        w64(&mut out, sym + 8, *value);
    }

    out[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
    out
}

/// Writes a synthetic shared object into `root/<phase>/<name>`.
pub fn stage(root: &Path, phase: &str, name: &str, needed: &[&str]) -> PathBuf {
    let dir = root.join(phase);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, minimal_dylib(needed)).unwrap();
    path
}
