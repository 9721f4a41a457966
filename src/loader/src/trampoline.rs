use anyhow::{Result, bail};
use log::{debug, error};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect};
use procfs::process::Process;
use sable_common::mem::{PAGE_SIZE, page_span};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Direct B/BL reach: +/-128 MiB.
const BRANCH_RANGE: usize = 128 * 1024 * 1024;
/// Stay a page short of the limit so a whole slot always fits.
const BRANCH_MARGIN: usize = BRANCH_RANGE - PAGE_SIZE;

pub const MIN_SLOT_INSNS: usize = 16;

const LDR_X17_LIT8: u32 = 0x5800_0051;
const BR_X17: u32 = 0xD61F_0220;
const BLR_X17: u32 = 0xD63F_0220;
const B_SKIP_LITERAL: u32 = 0x1400_0003;

/// Pool of executable slots placed within direct-branch range of hook
/// sites. Pages are mapped `rwx` on demand and never unmapped; uninstall
/// returns slots to a per-page free list.
#[derive(Default)]
pub struct TrampolinePool {
    pages: Vec<PoolPage>,
}

struct PoolPage {
    base: usize,
    len: usize,
    cursor: usize,
    slot_bytes: usize,
    free: Vec<usize>,
}

impl TrampolinePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executable slot of at least `insns` instructions within branch
    /// range of `near`.
    pub fn allocate(&mut self, near: usize, insns: usize) -> Result<Trampoline> {
        let insns = insns.max(MIN_SLOT_INSNS);
        let slot_bytes = insns * 4;

        for page in &mut self.pages {
            if page.slot_bytes < slot_bytes || !branch_reachable(page.base, near) {
                continue;
            }
            if let Some(offset) = page.free.pop() {
                return Ok(Trampoline::from_raw(page.base + offset, page.slot_bytes / 4));
            }
            if page.cursor + page.slot_bytes <= page.len {
                let offset = page.cursor;
                page.cursor += page.slot_bytes;
                return Ok(Trampoline::from_raw(page.base + offset, page.slot_bytes / 4));
            }
        }

        let base = map_page_near(near)?;
        debug!("new trampoline page at {base:#x} for hook site {near:#x}");
        self.pages.push(PoolPage {
            base,
            len: PAGE_SIZE,
            cursor: slot_bytes,
            slot_bytes,
            free: Vec::new(),
        });
        Ok(Trampoline::from_raw(base, insns))
    }

    pub fn release(&mut self, trampoline: Trampoline) {
        for page in &mut self.pages {
            if trampoline.base >= page.base && trampoline.base < page.base + page.len {
                page.free.push(trampoline.base - page.base);
                return;
            }
        }
    }
}

/// Finds an unmapped page within branch range of `near` and maps it
/// `rwx`. Candidate gaps come from `/proc/self/maps`, closest first.
fn map_page_near(near: usize) -> Result<usize> {
    let lo = near.saturating_sub(BRANCH_MARGIN);
    let hi = near.saturating_add(BRANCH_MARGIN);

    let maps = Process::myself()?.maps()?;
    let mut ranges: Vec<(usize, usize)> = maps
        .into_iter()
        .map(|map| (map.address.0 as usize, map.address.1 as usize))
        .collect();
    ranges.sort_unstable();

    let mut candidates: Vec<usize> = Vec::new();
    let mut prev_end = PAGE_SIZE; // never offer the zero page
    for (start, end) in ranges {
        if start > prev_end {
            push_gap_candidate(&mut candidates, prev_end, start, near, lo, hi);
        }
        prev_end = prev_end.max(end);
    }
    push_gap_candidate(&mut candidates, prev_end, usize::MAX - PAGE_SIZE, near, lo, hi);

    candidates.sort_by_key(|addr| addr.abs_diff(near));

    for candidate in candidates.into_iter().take(16) {
        let mapped = unsafe {
            mmap_anonymous(
                NonZeroUsize::new(candidate),
                NonZeroUsize::new(PAGE_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED_NOREPLACE,
            )
        };
        match mapped {
            Ok(ptr) => {
                let addr = ptr.as_ptr() as usize;
                if addr.abs_diff(near) < BRANCH_MARGIN {
                    return Ok(addr);
                }
                // The kernel moved us out of range; give the page back.
                unsafe {
                    nix::libc::munmap(ptr.as_ptr(), PAGE_SIZE);
                }
            }
            Err(err) => debug!("trampoline candidate {candidate:#x} rejected: {err}"),
        }
    }

    bail!("no executable page available within branch range of {near:#x}")
}

fn push_gap_candidate(
    candidates: &mut Vec<usize>,
    gap_start: usize,
    gap_end: usize,
    near: usize,
    lo: usize,
    hi: usize,
) {
    if gap_end <= gap_start || gap_end - gap_start < PAGE_SIZE {
        return;
    }
    let window_lo = gap_start.max(lo);
    let window_hi = gap_end.saturating_sub(PAGE_SIZE).min(hi);
    if window_lo > window_hi {
        return;
    }
    candidates.push(near.clamp(window_lo, window_hi));
}

pub fn branch_reachable(from: usize, to: usize) -> bool {
    from.abs_diff(to) < BRANCH_MARGIN
}

/// An executable slot being filled with the relocated prologue of a hook
/// target plus the jump back to its untouched suffix.
pub struct Trampoline {
    base: usize,
    capacity: usize,
    cursor: usize,
}

impl Trampoline {
    pub(crate) fn from_raw(base: usize, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            cursor: 0,
        }
    }

    pub fn address(&self) -> usize {
        self.base
    }

    fn here(&self) -> usize {
        self.base + self.cursor * 4
    }

    fn push(&mut self, word: u32) -> Result<()> {
        if self.cursor >= self.capacity {
            bail!("trampoline at {:#x} is full", self.base);
        }
        unsafe {
            std::ptr::write((self.base + self.cursor * 4) as *mut u32, word);
        }
        self.cursor += 1;
        Ok(())
    }

    fn push_u64(&mut self, value: u64) -> Result<()> {
        self.push(value as u32)?;
        self.push((value >> 32) as u32)
    }

    /// `LDR rd, #8 ; B #12 ; .qword value` — materializes an absolute
    /// value without disturbing flags.
    fn push_load_imm(&mut self, rd: u32, value: u64) -> Result<()> {
        self.push(0x5800_0040 | (rd & 0x1F))?;
        self.push(B_SKIP_LITERAL)?;
        self.push_u64(value)
    }

    /// Copies the first `count` instructions of `target`, rewriting
    /// PC-relative ones so they still resolve to what they meant at the
    /// original site.
    pub fn write_hook_fixups(&mut self, target: usize, count: usize) -> Result<()> {
        for index in 0..count {
            let site = target + index * 4;
            let word = unsafe { std::ptr::read(site as *const u32) };
            self.relocate(word, site)?;
        }
        Ok(())
    }

    fn relocate(&mut self, word: u32, site: usize) -> Result<()> {
        // ADR
        if word & 0x9F00_0000 == 0x1000_0000 {
            let rd = word & 0x1F;
            let dest = (site as i64 + adr_offset(word)) as u64;
            return self.push_load_imm(rd, dest);
        }
        // ADRP
        if word & 0x9F00_0000 == 0x9000_0000 {
            let rd = word & 0x1F;
            let dest = ((site & !0xFFF) as i64 + (adr_offset(word) << 12)) as u64;
            return self.push_load_imm(rd, dest);
        }
        // B
        if word & 0xFC00_0000 == 0x1400_0000 {
            let dest = (site as i64 + sext(word & 0x03FF_FFFF, 26) * 4) as usize;
            return self.branch_absolute(dest);
        }
        // BL
        if word & 0xFC00_0000 == 0x9400_0000 {
            let dest = (site as i64 + sext(word & 0x03FF_FFFF, 26) * 4) as u64;
            self.push_load_imm(17, dest)?;
            return self.push(BLR_X17);
        }
        // B.cond
        if word & 0xFF00_0010 == 0x5400_0000 {
            let dest = (site as i64 + sext((word >> 5) & 0x7_FFFF, 19) * 4) as u64;
            // Re-aim the condition at an absolute jump two words down,
            // fall through past it otherwise.
            self.push((word & 0xFF00_000F) | (2 << 5))?;
            self.push(0x1400_0005)?;
            self.push(LDR_X17_LIT8)?;
            self.push(BR_X17)?;
            return self.push_u64(dest);
        }
        // CBZ / CBNZ
        if word & 0x7E00_0000 == 0x3400_0000 {
            let dest = (site as i64 + sext((word >> 5) & 0x7_FFFF, 19) * 4) as u64;
            self.push((word & 0xFF00_001F) | (2 << 5))?;
            self.push(0x1400_0005)?;
            self.push(LDR_X17_LIT8)?;
            self.push(BR_X17)?;
            return self.push_u64(dest);
        }
        // TBZ / TBNZ
        if word & 0x7E00_0000 == 0x3600_0000 {
            let dest = (site as i64 + sext((word >> 5) & 0x3FFF, 14) * 4) as u64;
            self.push((word & 0xFFF8_001F) | (2 << 5))?;
            self.push(0x1400_0005)?;
            self.push(LDR_X17_LIT8)?;
            self.push(BR_X17)?;
            return self.push_u64(dest);
        }
        // LDR (literal), GP registers only
        if word & 0x3F00_0000 == 0x1800_0000 {
            let rt = word & 0x1F;
            let dest = (site as i64 + sext((word >> 5) & 0x7_FFFF, 19) * 4) as u64;
            self.push_load_imm(rt, dest)?;
            let deref = match word >> 30 {
                0b01 => 0xF940_0000, // ldr xt, [xt]
                0b00 => 0xB940_0000, // ldr wt, [xt]
                _ => 0xB980_0000,    // ldrsw xt, [xt]
            };
            return self.push(deref | (rt << 5) | rt);
        }

        // Position-independent instruction, copy verbatim.
        self.push(word)
    }

    /// Jump to `dest`: a short direct B when in range, the absolute
    /// LDR/BR form otherwise.
    pub fn write_callback(&mut self, dest: usize) -> Result<()> {
        if branch_reachable(self.here(), dest) {
            let offset = (dest as i64 - self.here() as i64) / 4;
            return self.push(0x1400_0000 | (offset as u32 & 0x03FF_FFFF));
        }
        self.write_ldr_br_data(dest)
    }

    fn branch_absolute(&mut self, dest: usize) -> Result<()> {
        self.write_callback(dest)
    }

    /// The absolute jump form, for callers that must not assume range.
    pub fn write_ldr_br_data(&mut self, dest: usize) -> Result<()> {
        self.push(LDR_X17_LIT8)?;
        self.push(BR_X17)?;
        self.push_u64(dest as u64)
    }

    /// Flushes the instruction cache; the slot is immutable afterwards.
    pub fn finish(&self) {
        clear_cache(self.base, self.cursor * 4);
    }

    #[cfg(test)]
    fn words(&self) -> Vec<u32> {
        (0..self.cursor)
            .map(|i| unsafe { std::ptr::read((self.base + i * 4) as *const u32) })
            .collect()
    }
}

fn adr_offset(word: u32) -> i64 {
    let immlo = (word >> 29) & 0x3;
    let immhi = (word >> 5) & 0x7_FFFF;
    sext((immhi << 2) | immlo, 21)
}

fn sext(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// A reversible inline hook: `target`'s prologue redirected to a
/// replacement, the displaced instructions preserved in an executable
/// trampoline.
pub struct InlineHook {
    target: usize,
    saved: Vec<u32>,
    trampoline: Trampoline,
    installed: bool,
}

impl InlineHook {
    /// Detours `target` to `replacement`. The trampoline is finalized
    /// before the first byte of the prologue changes. An unprotectable
    /// target page or an unplaceable trampoline aborts the process: both
    /// mean the host is in a state the loader cannot reason about.
    pub fn install(pool: &mut TrampolinePool, target: usize, replacement: usize) -> Result<Self> {
        let mut trampoline = match pool.allocate(target, 2 * MIN_SLOT_INSNS) {
            Ok(trampoline) => trampoline,
            Err(err) => {
                error!("cannot place a trampoline near {target:#x}: {err:?}");
                std::process::abort();
            }
        };

        let direct = branch_reachable(target, replacement);
        let displaced = if direct { 1 } else { 4 };

        trampoline.write_hook_fixups(target, displaced)?;
        trampoline.write_callback(target + displaced * 4)?;
        trampoline.finish();

        make_writable(target, displaced * 4);

        let saved: Vec<u32> = (0..displaced)
            .map(|i| unsafe { std::ptr::read((target + i * 4) as *const u32) })
            .collect();

        unsafe {
            if direct {
                let offset = (replacement as i64 - target as i64) / 4;
                std::ptr::write(
                    target as *mut u32,
                    0x1400_0000 | (offset as u32 & 0x03FF_FFFF),
                );
            } else {
                std::ptr::write(target as *mut u32, LDR_X17_LIT8);
                std::ptr::write((target + 4) as *mut u32, BR_X17);
                std::ptr::write((target + 8) as *mut u32, replacement as u32);
                std::ptr::write((target + 12) as *mut u32, (replacement as u64 >> 32) as u32);
            }
        }
        clear_cache(target, displaced * 4);

        debug!(
            "hooked {target:#x} -> {replacement:#x} ({} words displaced, trampoline {:#x})",
            displaced,
            trampoline.address()
        );

        Ok(Self {
            target,
            saved,
            trampoline,
            installed: true,
        })
    }

    /// Address of the relocated prologue; calling it behaves like the
    /// pre-hook target.
    pub fn trampoline_addr(&self) -> usize {
        self.trampoline.address()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Restores the displaced instructions. Safe to call at most once.
    pub fn uninstall(mut self, pool: &mut TrampolinePool) {
        if !self.installed {
            return;
        }
        self.installed = false;

        make_writable(self.target, self.saved.len() * 4);
        for (index, word) in self.saved.iter().enumerate() {
            unsafe {
                std::ptr::write((self.target + index * 4) as *mut u32, *word);
            }
        }
        clear_cache(self.target, self.saved.len() * 4);

        pool.release(std::mem::replace(&mut self.trampoline, Trampoline::from_raw(0, 0)));
    }
}

/// Opens the page(s) covering `[addr, addr + len)` for writing. The pages
/// stay `rwx` afterwards; failure aborts, a half-patched prologue must
/// never run.
fn make_writable(addr: usize, len: usize) {
    let (start, span) = page_span(addr, len);
    let result = unsafe {
        mprotect(
            NonNull::new(start as *mut _).expect("page start is never null"),
            span,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )
    };
    if let Err(err) = result {
        error!("mprotect({start:#x}, {span:#x}) failed: {err}");
        std::process::abort();
    }
}

/// Instruction-cache maintenance for freshly written code.
pub fn clear_cache(start: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        use std::arch::asm;

        let end = start + len;
        let mut line = start & !63;
        while line < end {
            asm!("dc cvau, {0}", in(reg) line);
            line += 64;
        }
        asm!("dsb ish");
        let mut line = start & !63;
        while line < end {
            asm!("ic ivau, {0}", in(reg) line);
            line += 64;
        }
        asm!("dsb ish", "isb");
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (start, len);
    }
}
