//! ARM64 instruction classification, decoding and encoding.
//!
//! Only the handful of instruction shapes the patch heuristics rely on are
//! recognised. Everything else classifies as [`InsnKind::Unknown`].

mod cursor;

pub use cursor::{Direction, InsnCursor};

use crate::util::{align_down, PAGE_SIZE};

/// Width of every AArch64 instruction in bytes.
pub const INSN_SIZE: u64 = 4;

// =============================================================================
// Instruction Kinds
// =============================================================================

/// The instruction shapes the heuristics know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsnKind {
    /// Anything not listed below
    Unknown,
    /// ADRP Xd, page
    Adrp,
    /// ADD (immediate); also matches SUB (immediate), see [`is_add`]
    Add,
    /// BL label
    Bl,
    /// CBZ / CBNZ Rt, label
    Cbz,
    /// RET {Xn}
    Ret,
    /// TBZ / TBNZ Rt, #bit, label
    Tbnz,
}

/// Coarse grouping used when scanning for "the next branch".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supertype {
    /// Not a PC-relative branch
    General,
    /// BL, CBZ or TBNZ
    Branch,
}

impl InsnKind {
    /// Returns the lowercase mnemonic used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            InsnKind::Unknown => "unknown",
            InsnKind::Adrp => "adrp",
            InsnKind::Add => "add",
            InsnKind::Bl => "bl",
            InsnKind::Cbz => "cbz",
            InsnKind::Ret => "ret",
            InsnKind::Tbnz => "tbnz",
        }
    }

    /// Returns the supertype of this kind.
    #[inline]
    pub fn supertype(self) -> Supertype {
        match self {
            InsnKind::Bl | InsnKind::Cbz | InsnKind::Tbnz => Supertype::Branch,
            _ => Supertype::General,
        }
    }
}

impl std::fmt::Display for InsnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Instruction Detection
// =============================================================================

/// Returns true if the instruction is ADRP.
#[inline]
pub fn is_adrp(instr: u32) -> bool {
    (instr & 0x9F00_0000) == 0x9000_0000
}

/// Returns true if bits 28..24 hold the ADD (immediate) opcode.
///
/// The op bit (30) is not checked, so SUB (immediate) and the flag-setting
/// forms match too.
#[inline]
pub fn is_add(instr: u32) -> bool {
    (instr & 0x1F00_0000) == 0x1100_0000
}

/// Returns true if the instruction is BL (branch with link).
#[inline]
pub fn is_bl(instr: u32) -> bool {
    (instr & 0xFC00_0000) == 0x9400_0000
}

/// Returns true if bits 30..24 hold the CBZ opcode (either width).
#[inline]
pub fn is_cbz(instr: u32) -> bool {
    (instr & 0x7F00_0000) == 0x3400_0000
}

/// Returns true if the instruction is RET with any register.
#[inline]
pub fn is_ret(instr: u32) -> bool {
    (instr | (0x1F << 5)) == 0xD65F_03E0
}

/// Returns true if bits 30..24 hold the TBNZ opcode.
#[inline]
pub fn is_tbnz(instr: u32) -> bool {
    (instr & 0x7F00_0000) == 0x3700_0000
}

/// Returns true if the instruction is NOP.
#[inline]
pub fn is_nop(instr: u32) -> bool {
    instr == NOP
}

/// Classifies an instruction word. The tests run in a fixed order and the
/// first match wins.
pub fn classify(instr: u32) -> InsnKind {
    if is_adrp(instr) {
        InsnKind::Adrp
    } else if is_add(instr) {
        InsnKind::Add
    } else if is_bl(instr) {
        InsnKind::Bl
    } else if is_cbz(instr) {
        InsnKind::Cbz
    } else if is_ret(instr) {
        InsnKind::Ret
    } else if is_tbnz(instr) {
        InsnKind::Tbnz
    } else {
        InsnKind::Unknown
    }
}

// =============================================================================
// Instruction Decoding
// =============================================================================

/// Sign-extends the low `bits` bits of `value` to 64 bits.
#[inline]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    debug_assert!((1..=64).contains(&bits));
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Decodes an ADRP instruction, returning the target page address.
pub fn decode_adrp(instr: u32, pc: u64) -> u64 {
    let immlo = ((instr >> 29) & 0x3) as u64;
    let immhi = ((instr >> 5) & 0x7_FFFF) as u64;
    let offset = sign_extend(((immhi << 2) | immlo) << 12, 33);
    align_down(pc, PAGE_SIZE).wrapping_add(offset as u64)
}

/// Decodes an ADD (immediate) instruction, returning the immediate value.
pub fn decode_add_imm(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let shift = (instr >> 22) & 0x1;
    imm12 << (shift * 12)
}

/// Decodes the word displacement of a BL instruction.
#[inline]
pub fn decode_bl_imm(instr: u32) -> i64 {
    sign_extend((instr & 0x03FF_FFFF) as u64, 26)
}

/// Decodes the word displacement of a CBZ instruction.
#[inline]
pub fn decode_cbz_imm(instr: u32) -> i64 {
    sign_extend(((instr >> 5) & 0x7_FFFF) as u64, 19)
}

/// Decodes the word displacement of a TBNZ instruction.
///
/// Bits 23..5 are read as a 19-bit displacement, the same field CBZ uses.
/// Architecturally TBZ/TBNZ hold a 14-bit offset in bits 18..5 and the low
/// five bits of the tested bit number in bits 23..19, so only a forward
/// branch testing bit 0 or 32 decodes to its real target.
#[inline]
pub fn decode_tbnz_imm(instr: u32) -> i64 {
    sign_extend(((instr >> 5) & 0x7_FFFF) as u64, 19)
}

/// Computes `pc + imm * 4` for a word displacement.
#[inline]
pub fn branch_target(pc: u64, imm: i64) -> u64 {
    pc.wrapping_add((imm as u64).wrapping_mul(INSN_SIZE))
}

/// Gets the destination register (bits 4..0).
#[inline]
pub fn reg_rd(instr: u32) -> u8 {
    (instr & 0x1F) as u8
}

/// Gets the first source register (bits 9..5).
#[inline]
pub fn reg_rn(instr: u32) -> u8 {
    ((instr >> 5) & 0x1F) as u8
}

/// Gets the tested register of CBZ/TBNZ (bits 4..0).
#[inline]
pub fn reg_rt(instr: u32) -> u8 {
    (instr & 0x1F) as u8
}

// =============================================================================
// Instruction Encoding
// =============================================================================

/// The canonical NOP encoding.
pub const NOP: u32 = 0xD503_201F;

/// Encodes an ADRP instruction.
pub fn encode_adrp(rd: u8, pc: u64, target: u64) -> u32 {
    let target_page = align_down(target, PAGE_SIZE);
    let pc_page = align_down(pc, PAGE_SIZE);
    let delta = target_page.wrapping_sub(pc_page) as i64;
    let imm = (delta >> 12) as u32;

    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_FFFF) << 5;

    0x9000_0000 | immlo | immhi | (rd as u32 & 0x1F)
}

/// Encodes a 64-bit ADD (immediate) instruction.
pub fn encode_add_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    let imm12 = (imm & 0xFFF) << 10;
    let sf = 1u32 << 31;

    0x1100_0000 | sf | imm12 | ((rn as u32 & 0x1F) << 5) | (rd as u32 & 0x1F)
}

/// Encodes a BL (branch with link) instruction.
pub fn encode_bl(pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    let imm26 = ((offset >> 2) & 0x03FF_FFFF) as u32;
    0x9400_0000 | imm26
}

/// Encodes a 64-bit CBZ instruction.
pub fn encode_cbz(rt: u8, pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    let imm19 = ((offset >> 2) & 0x7_FFFF) as u32;
    0xB400_0000 | (imm19 << 5) | (rt as u32 & 0x1F)
}

/// Encodes a TBNZ instruction testing `bit` of `rt`, with the architectural
/// 14-bit offset.
pub fn encode_tbnz(rt: u8, bit: u8, pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    let imm14 = ((offset >> 2) & 0x3FFF) as u32;
    let b5 = ((bit as u32) >> 5) & 0x1;
    let b40 = (bit as u32) & 0x1F;
    0x3700_0000 | (b5 << 31) | (b40 << 19) | (imm14 << 5) | (rt as u32 & 0x1F)
}

/// Encodes a RET instruction returning through `rn`.
pub fn encode_ret(rn: u8) -> u32 {
    0xD65F_0000 | ((rn as u32 & 0x1F) << 5)
}
