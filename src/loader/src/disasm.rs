use anyhow::{Context, Result};
use capstone::arch::arm64::{Arm64Insn, Arm64Operand, Arm64OperandType, ArchMode};
use capstone::prelude::*;
use log::{trace, warn};

/// Structural queries over AArch64 code in the current process.
///
/// Every query walks instruction-by-instruction inside a caller-declared
/// byte budget, skipping 4 bytes on decode failure, and answers with
/// `None` instead of failing hard: a missed xref degrades the feature that
/// needed it, never the process.
pub struct Disassembler {
    cs: Capstone,
}

/// Walk parameters: return on the `n`-th match, give up after `ret_budget`
/// RET instructions (-1 for unlimited) or after `max_bytes`.
#[derive(Clone, Copy, Debug)]
pub struct Search {
    pub n: u32,
    pub ret_budget: i32,
    pub max_bytes: usize,
}

impl Default for Search {
    fn default() -> Self {
        Self {
            n: 1,
            ret_budget: -1,
            max_bytes: 4096,
        }
    }
}

impl Search {
    pub fn nth(n: u32) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }
}

/// One decoded instruction, detached from capstone's buffers.
pub struct DecodedInsn {
    pub address: usize,
    pub id: u32,
    pub word: u32,
    pub mnemonic: String,
    pub operands: Vec<Arm64Operand>,
}

/// AArch64 condition codes as encoded in B.cond.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Lt = 0b1011,
    Ge = 0b1010,
}

const fn id(insn: Arm64Insn) -> u32 {
    insn as u32
}

impl DecodedInsn {
    fn imm(&self, index: usize) -> Option<i64> {
        match self.operands.get(index)?.op_type {
            Arm64OperandType::Imm(value) => Some(value),
            _ => None,
        }
    }

    fn reg(&self, index: usize) -> Option<RegId> {
        match self.operands.get(index)?.op_type {
            Arm64OperandType::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    fn is_cond_branch(&self) -> bool {
        self.word & 0xFF00_0010 == 0x5400_0000
    }
}

impl Disassembler {
    pub fn new() -> Result<Self> {
        let cs = Capstone::new()
            .arm64()
            .mode(ArchMode::Arm)
            .detail(true)
            .build()
            .map_err(|err| anyhow::anyhow!("capstone initialization failed: {err}"))
            .context("creating AArch64 disassembler")?;
        Ok(Self { cs })
    }

    fn decode_at(&self, address: usize) -> Option<DecodedInsn> {
        let window = unsafe { std::slice::from_raw_parts(address as *const u8, 4) };
        let insns = self.cs.disasm_count(window, address as u64, 1).ok()?;
        let insn = insns.iter().next()?;

        let operands = self
            .cs
            .insn_detail(insn)
            .ok()
            .map(|detail| match detail.arch_detail() {
                capstone::arch::ArchDetail::Arm64Detail(arm64) => arm64.operands().collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default();

        Some(DecodedInsn {
            address,
            id: insn.id().0,
            word: u32::from_le_bytes(window.try_into().ok()?),
            mnemonic: insn.mnemonic().unwrap_or("?").to_string(),
            operands,
        })
    }

    /// The generic walker behind every query. `matcher` produces the
    /// result; `skip` flags near-relatives of the wanted instruction that
    /// consume the quota but cannot be resolved (a BLR where a BL was
    /// sought). Landing a skip on the final slot aborts the query.
    pub fn find_nth<T>(
        &self,
        start: usize,
        search: Search,
        matcher: impl Fn(&DecodedInsn) -> Option<T>,
        skip: impl Fn(&DecodedInsn) -> bool,
    ) -> Option<T> {
        let mut remaining = search.n.max(1);
        let mut ret_budget = search.ret_budget;
        let mut offset = 0usize;

        while offset + 4 <= search.max_bytes {
            let address = start + offset;
            offset += 4;

            // Undecodable words are skipped silently.
            let Some(insn) = self.decode_at(address) else {
                continue;
            };
            trace!("{address:#x}: {} (n: {remaining}, rets: {ret_budget})", insn.mnemonic);

            if insn.id == id(Arm64Insn::ARM64_INS_RET) {
                if ret_budget == 0 {
                    warn!(
                        "hit the RET quota before match {} of the search from {start:#x}",
                        search.n
                    );
                    return None;
                }
                ret_budget -= 1;
                continue;
            }

            if let Some(result) = matcher(&insn) {
                if remaining == 1 {
                    return Some(result);
                }
                remaining -= 1;
            } else if skip(&insn) {
                if remaining == 1 {
                    warn!(
                        "match {} of the search from {start:#x} is a {}, cannot compute its destination",
                        search.n, insn.mnemonic
                    );
                    return None;
                }
                remaining -= 1;
            }
        }

        warn!(
            "no match {} within {} bytes of {start:#x}",
            search.n, search.max_bytes
        );
        None
    }

    /// Destination of the `n`-th BL. With `count_blr`, BLR consumes the
    /// quota too (and aborts the query when it lands on the final slot).
    pub fn find_nth_bl(&self, start: usize, search: Search, count_blr: bool) -> Option<usize> {
        self.find_nth(
            start,
            search,
            |insn| {
                (insn.id == id(Arm64Insn::ARM64_INS_BL))
                    .then(|| insn.imm(0))
                    .flatten()
                    .map(|imm| imm as usize)
            },
            move |insn| count_blr && insn.id == id(Arm64Insn::ARM64_INS_BLR),
        )
    }

    /// Destination of the `n`-th unconditional B. Conditional branches are
    /// not counted; with `count_br`, BR consumes the quota.
    pub fn find_nth_b(&self, start: usize, search: Search, count_br: bool) -> Option<usize> {
        self.find_nth(
            start,
            search,
            |insn| {
                (insn.id == id(Arm64Insn::ARM64_INS_B) && !insn.is_cond_branch())
                    .then(|| insn.imm(0))
                    .flatten()
                    .map(|imm| imm as usize)
            },
            move |insn| count_br && insn.id == id(Arm64Insn::ARM64_INS_BR),
        )
    }

    /// The `n`-th ADR/ADRP: `(site, destination register, materialized
    /// immediate)`. For ADRP the immediate is the computed target page.
    pub fn find_nth_pcrel(&self, start: usize, search: Search) -> Option<(usize, RegId, usize)> {
        self.find_nth(
            start,
            search,
            |insn| {
                if insn.id != id(Arm64Insn::ARM64_INS_ADR) && insn.id != id(Arm64Insn::ARM64_INS_ADRP)
                {
                    return None;
                }
                Some((insn.address, insn.reg(0)?, insn.imm(1)? as usize))
            },
            |_| false,
        )
    }

    /// The `n`-th instruction consuming `source`: `(site, destination
    /// register, immediate displacement)`. Recognizes ADD (immediate) and
    /// LDR (immediate offset).
    pub fn find_nth_reg_use(
        &self,
        start: usize,
        search: Search,
        source: RegId,
    ) -> Option<(usize, RegId, i64)> {
        self.find_nth(
            start,
            search,
            |insn| {
                if insn.id == id(Arm64Insn::ARM64_INS_ADD) {
                    if insn.reg(1)? != source {
                        return None;
                    }
                    return Some((insn.address, insn.reg(0)?, insn.imm(2)?));
                }
                if insn.id == id(Arm64Insn::ARM64_INS_LDR) {
                    if let Some(op) = insn.operands.get(1)
                        && let Arm64OperandType::Mem(mem) = op.op_type
                        && mem.base() == source
                    {
                        return Some((insn.address, insn.reg(0)?, mem.disp() as i64));
                    }
                }
                None
            },
            |_| false,
        )
    }

    /// The `n`-th TBZ: `(site, branch offset, target)`.
    pub fn find_nth_tbz(&self, start: usize, search: Search) -> Option<(usize, i64, usize)> {
        self.find_nth(
            start,
            search,
            |insn| {
                if insn.id != id(Arm64Insn::ARM64_INS_TBZ) {
                    return None;
                }
                let target = insn.imm(2)? as usize;
                Some((insn.address, target as i64 - insn.address as i64, target))
            },
            |_| false,
        )
    }

    /// The `n`-th B.cond with the given condition: `(site, branch offset,
    /// target)`.
    pub fn find_nth_bcond(
        &self,
        start: usize,
        search: Search,
        cond: Cond,
    ) -> Option<(usize, i64, usize)> {
        self.find_nth(
            start,
            search,
            |insn| {
                if !insn.is_cond_branch() || insn.word & 0xF != cond as u32 {
                    return None;
                }
                // imm19, in words.
                let imm = ((insn.word >> 5) & 0x7FFFF) as i64;
                let offset = ((imm << 45) >> 45) << 2;
                Some((
                    insn.address,
                    offset,
                    (insn.address as i64 + offset) as usize,
                ))
            },
            |_| false,
        )
    }

    /// The `n`-th MOVZ: `(site, imm16 << hw * 16)`.
    pub fn find_nth_movz(&self, start: usize, search: Search) -> Option<(usize, u64)> {
        self.find_nth(
            start,
            search,
            |insn| {
                if insn.word & 0x7F80_0000 != 0x5280_0000 {
                    return None;
                }
                let imm16 = ((insn.word >> 5) & 0xFFFF) as u64;
                let hw = ((insn.word >> 21) & 0x3) as u64;
                Some((insn.address, imm16 << (hw * 16)))
            },
            |_| false,
        )
    }

    /// Address of the first RET within `max_bytes`, used to bound a
    /// method body before walking it backwards.
    pub fn find_first_ret(&self, start: usize, max_bytes: usize) -> Option<usize> {
        let mut offset = 0usize;
        while offset + 4 <= max_bytes {
            let address = start + offset;
            offset += 4;
            if let Some(insn) = self.decode_at(address)
                && insn.id == id(Arm64Insn::ARM64_INS_RET)
            {
                return Some(address);
            }
        }
        warn!("no RET within {max_bytes} bytes of {start:#x}");
        None
    }

    /// Destination of the last BL strictly before `end`.
    pub fn last_bl_before(&self, start: usize, end: usize) -> Option<usize> {
        let mut last = None;
        let mut address = start;
        while address + 4 <= end {
            if let Some(insn) = self.decode_at(address)
                && insn.id == id(Arm64Insn::ARM64_INS_BL)
                && let Some(imm) = insn.imm(0)
            {
                last = Some(imm as usize);
            }
            address += 4;
        }
        last
    }

    /// Full page-relative materialization: chases the `n_pcrel`-th
    /// ADR/ADRP and then the `n_reg_use`-th instruction consuming its
    /// destination register. Returns `(site, register, final target)`.
    pub fn getpcaddr(
        &self,
        start: usize,
        n_pcrel: u32,
        n_reg_use: u32,
        max_bytes: usize,
    ) -> Option<(usize, RegId, usize)> {
        let (site, reg, base) = self.find_nth_pcrel(
            start,
            Search {
                n: n_pcrel,
                ret_budget: -1,
                max_bytes,
            },
        )?;
        let (use_site, dst, disp) = self.find_nth_reg_use(
            site,
            Search {
                n: n_reg_use,
                ret_budget: -1,
                max_bytes,
            },
            reg,
        )?;
        Some((use_site, dst, (base as i64 + disp) as usize))
    }

    /// Dereferences the jump table materialized at the `n_pcrel`-th
    /// ADR/ADRP: reads the i32 entry for `case` (1-based) and returns the
    /// branch destination relative to the table base.
    pub fn evalswitch(
        &self,
        start: usize,
        n_pcrel: u32,
        n_reg_use: u32,
        case: usize,
        max_bytes: usize,
    ) -> Option<usize> {
        let (_, _, table) = self.getpcaddr(start, n_pcrel, n_reg_use, max_bytes)?;
        let entry = unsafe { std::ptr::read((table + (case - 1) * 4) as *const i32) };
        Some((table as i64 + entry as i64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOP: u32 = 0xD503_201F;
    const RET: u32 = 0xD65F_03C0;

    fn bl(offset_words: i32) -> u32 {
        0x9400_0000 | (offset_words as u32 & 0x03FF_FFFF)
    }

    fn b(offset_words: i32) -> u32 {
        0x1400_0000 | (offset_words as u32 & 0x03FF_FFFF)
    }

    fn search(code: &[u32]) -> (usize, usize) {
        (code.as_ptr() as usize, code.len() * 4)
    }

    #[test]
    fn nth_bl_resolves_target() {
        let code = [NOP, bl(2), NOP, bl(-1), RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let first = cs
            .find_nth_bl(start, Search { max_bytes: max, ..Search::nth(1) }, false)
            .unwrap();
        assert_eq!(first, start + 4 + 8);

        let second = cs
            .find_nth_bl(start, Search { max_bytes: max, ..Search::nth(2) }, false)
            .unwrap();
        assert_eq!(second, start + 12 - 4);
    }

    #[test]
    fn ret_quota_terminates() {
        let code = [RET, bl(1)];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let found = cs.find_nth_bl(
            start,
            Search { ret_budget: 0, max_bytes: max, ..Search::nth(1) },
            false,
        );
        assert!(found.is_none());

        let found = cs.find_nth_bl(
            start,
            Search { ret_budget: 1, max_bytes: max, ..Search::nth(1) },
            false,
        );
        assert!(found.is_some());
    }

    #[test]
    fn blr_skip_aborts_the_final_slot() {
        const BLR_X8: u32 = 0xD63F_0100;
        let code = [BLR_X8, bl(1), RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        // Counting BLR: the first slot lands on the BLR, unresolvable.
        let aborted = cs.find_nth_bl(start, Search { max_bytes: max, ..Search::nth(1) }, true);
        assert!(aborted.is_none());

        // Not counting BLR: the BL is the first match.
        let found = cs
            .find_nth_bl(start, Search { max_bytes: max, ..Search::nth(1) }, false)
            .unwrap();
        assert_eq!(found, start + 4 + 4);
    }

    #[test]
    fn unconditional_b_ignores_conditional() {
        // b.ne +16 then b +8
        let bcond_ne = 0x5400_0000 | (4 << 5) | 0b0001;
        let code = [bcond_ne, b(2), RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let found = cs
            .find_nth_b(start, Search { max_bytes: max, ..Search::nth(1) }, false)
            .unwrap();
        assert_eq!(found, start + 4 + 8);

        let (site, _, target) = cs
            .find_nth_bcond(start, Search { max_bytes: max, ..Search::nth(1) }, Cond::Ne)
            .unwrap();
        assert_eq!(site, start);
        assert_eq!(target, start + 16);
    }

    #[test]
    fn pcrel_and_reg_use_compose() {
        // adr x0, #16 ; add x0, x0, #8
        let adr_x0_16 = 0x1000_0000 | (4 << 5);
        let add_x0_x0_8 = 0x9100_2000;
        let code = [adr_x0_16, add_x0_x0_8, RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let (site, _, target) = cs.getpcaddr(start, 1, 1, max).unwrap();
        assert_eq!(site, start + 4);
        assert_eq!(target, start + 16 + 8);
    }

    #[test]
    fn ldr_counts_as_reg_use() {
        // adr x0, #8 ; ldr x2, [x0, #0x40]
        let adr_x0_8 = 0x1000_0000 | (2 << 5);
        let ldr_x2 = 0xF940_0000 | (8 << 10) | 2;
        let code = [adr_x0_8, ldr_x2, RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let (site, _, target) = cs.getpcaddr(start, 1, 1, max).unwrap();
        assert_eq!(site, start + 4);
        assert_eq!(target, start + 8 + 0x40);
    }

    #[test]
    fn movz_decodes_shifted_immediate() {
        // movz x3, #0x1234, lsl #16
        let movz = 0xD280_0000 | (1 << 21) | (0x1234 << 5) | 3;
        let code = [NOP, movz, RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let (site, value) = cs
            .find_nth_movz(start, Search { max_bytes: max, ..Search::nth(1) })
            .unwrap();
        assert_eq!(site, start + 4);
        assert_eq!(value, 0x1234_0000);
    }

    #[test]
    fn tbz_reports_target() {
        // tbz w0, #3, +8
        let tbz = 0x3600_0000 | (3 << 19) | (2 << 5);
        let code = [tbz, NOP, RET];
        let (start, max) = search(&code);
        let cs = Disassembler::new().unwrap();

        let (site, offset, target) = cs
            .find_nth_tbz(start, Search { max_bytes: max, ..Search::nth(1) })
            .unwrap();
        assert_eq!(site, start);
        assert_eq!(offset, 8);
        assert_eq!(target, start + 8);
    }

    #[test]
    fn evalswitch_reads_table_entries() {
        // adr x0, #12 ; add x0, x0, #4 ; <pad> ; table: [i32; 2]
        let adr_x0_12 = 0x1000_0000 | (3 << 5);
        let add_x0_x0_4 = 0x9100_1000;
        let code = [adr_x0_12, add_x0_x0_4, NOP, NOP, 8i32 as u32, 0x10u32];
        let (start, max) = search(&code);
        let table = start + 16;
        let cs = Disassembler::new().unwrap();

        assert_eq!(cs.evalswitch(start, 1, 1, 1, max), Some(table + 8));
        assert_eq!(cs.evalswitch(start, 1, 1, 2, max), Some(table + 0x10));
    }
}
