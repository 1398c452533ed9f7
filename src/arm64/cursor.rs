//! A movable instruction position over the image's segments.

use std::ops::{Add, Sub};
use std::rc::Rc;

use tracing::trace;

use super::*;
use crate::error::{Error, Result};
use crate::macho::Segment;
use crate::util::read_u32_le_at;

/// Scan direction for open-ended instruction walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher addresses
    Forward,
    /// Towards lower addresses
    Backward,
}

/// A position on a 4-byte instruction inside a sorted segment working set.
///
/// Cursors are cheap to clone; every clone moves independently. The working
/// set is shared between clones and never modified.
///
/// A position is valid when a whole instruction fits in its segment, so a
/// cursor always sits on a readable word. Moving off either end of the
/// working set fails with [`Error::OutOfRange`] and leaves the cursor where
/// it was.
#[derive(Debug, Clone)]
pub struct InsnCursor<'a> {
    segments: Rc<[Segment<'a>]>,
    index: usize,
    addr: u64,
    slide: u64,
}

impl<'a> InsnCursor<'a> {
    /// Creates a cursor over `segments`.
    ///
    /// `at` is a slid address (the same space [`pc`](Self::pc) reports); when
    /// `None` the cursor starts at the lowest segment's base. With
    /// `text_only` the working set only includes executable segments.
    pub fn new(
        segments: &[Segment<'a>],
        slide: u64,
        at: Option<u64>,
        text_only: bool,
    ) -> Result<Self> {
        Self::with_working_set(Self::working_set(segments, text_only), slide, at)
    }

    /// Creates a cursor over the executable segments at the given address.
    pub fn at(segments: &[Segment<'a>], slide: u64, at: u64) -> Result<Self> {
        Self::new(segments, slide, Some(at), true)
    }

    /// Creates a cursor on the first instruction of the executable segments.
    pub fn start(segments: &[Segment<'a>], slide: u64) -> Result<Self> {
        Self::new(segments, slide, None, true)
    }

    /// Builds a sorted working set from `segments`.
    ///
    /// Segments too small to hold an instruction are left out.
    pub fn working_set(segments: &[Segment<'a>], text_only: bool) -> Rc<[Segment<'a>]> {
        let mut set: Vec<Segment<'a>> = segments
            .iter()
            .filter(|seg| !text_only || seg.executable)
            .filter(|seg| seg.size >= INSN_SIZE)
            .copied()
            .collect();
        set.sort_by_key(|seg| seg.base);
        set.into()
    }

    /// Creates a cursor over a working set built by [`working_set`](Self::working_set).
    pub fn with_working_set(
        segments: Rc<[Segment<'a>]>,
        slide: u64,
        at: Option<u64>,
    ) -> Result<Self> {
        let first = segments.first().ok_or_else(|| {
            Error::out_of_range(at.unwrap_or_default(), "no segments to walk")
        })?;

        let (index, addr) = match at {
            None => (0, first.base),
            Some(at) => {
                let addr = at.wrapping_sub(slide);
                let index = segments
                    .iter()
                    .position(|seg| holds_insn(seg, addr))
                    .ok_or_else(|| Error::out_of_range(at, "address outside all segments"))?;
                (index, addr)
            }
        };

        Ok(Self {
            segments,
            index,
            addr,
            slide,
        })
    }

    // =========================================================================
    // Movement
    // =========================================================================

    /// Moves to the next instruction.
    pub fn advance(&mut self) -> Result<()> {
        let next = self.addr + INSN_SIZE;
        if holds_insn(&self.segments[self.index], next) {
            self.addr = next;
            return Ok(());
        }
        match self.segments.get(self.index + 1) {
            Some(seg) => {
                self.index += 1;
                self.addr = seg.base;
                Ok(())
            }
            None => Err(Error::out_of_range(
                next.wrapping_add(self.slide),
                "advanced past the last segment",
            )),
        }
    }

    /// Moves to the previous instruction.
    pub fn retreat(&mut self) -> Result<()> {
        let seg = &self.segments[self.index];
        if self.addr >= seg.base + INSN_SIZE {
            self.addr -= INSN_SIZE;
            return Ok(());
        }
        if self.index == 0 {
            return Err(Error::out_of_range(
                self.addr.wrapping_sub(INSN_SIZE).wrapping_add(self.slide),
                "retreated before the first segment",
            ));
        }
        self.index -= 1;
        self.addr = last_insn(&self.segments[self.index]);
        Ok(())
    }

    /// Moves one instruction in `direction`.
    #[inline]
    pub fn step(&mut self, direction: Direction) -> Result<()> {
        match direction {
            Direction::Forward => self.advance(),
            Direction::Backward => self.retreat(),
        }
    }

    /// Returns a copy moved by `n` instructions (backwards if negative).
    pub fn offset(&self, n: i64) -> Result<Self> {
        let mut cpy = self.clone();
        let direction = if n >= 0 {
            Direction::Forward
        } else {
            Direction::Backward
        };
        for _ in 0..n.unsigned_abs() {
            cpy.step(direction)?;
        }
        Ok(cpy)
    }

    /// Steps in `direction` until the instruction satisfies `pred`.
    ///
    /// The cursor always moves at least once. At most `limit` steps are
    /// taken; the cursor is left where the scan stopped on failure.
    pub fn seek_by(
        &mut self,
        direction: Direction,
        limit: usize,
        what: &'static str,
        mut pred: impl FnMut(&Self) -> bool,
    ) -> Result<()> {
        for _ in 0..limit {
            self.step(direction)?;
            if pred(self) {
                trace!("{} at {:#x}", what, self.pc());
                return Ok(());
            }
        }
        Err(Error::ScanLimitExceeded { what, limit })
    }

    /// Steps in `direction` to the nearest instruction of `kind`.
    pub fn seek(&mut self, kind: InsnKind, direction: Direction, limit: usize) -> Result<()> {
        self.seek_by(direction, limit, kind.name(), |c| c.kind() == kind)
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Returns the address of the current instruction, including the slide.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.addr.wrapping_add(self.slide)
    }

    /// Returns the raw little-endian word at the current position.
    ///
    /// Construction and movement keep a whole word in bounds. A position
    /// that breaks this reads as 0 and trips a debug assertion.
    pub fn value(&self) -> u32 {
        let seg = &self.segments[self.index];
        let word = read_u32_le_at(seg.data, self.addr.wrapping_sub(seg.base) as usize);
        debug_assert!(word.is_some(), "no instruction at {:#x}", self.pc());
        word.unwrap_or_default()
    }

    /// Classifies the current instruction.
    #[inline]
    pub fn kind(&self) -> InsnKind {
        classify(self.value())
    }

    /// Returns the supertype of the current instruction.
    #[inline]
    pub fn supertype(&self) -> Supertype {
        self.kind().supertype()
    }

    /// Returns the immediate of the current instruction.
    ///
    /// - ADRP: the absolute target page (computed from the slid pc)
    /// - ADD: the unsigned immediate, shifted when bit 22 is set
    /// - BL/CBZ/TBNZ: the signed word displacement, as two's complement
    pub fn imm(&self) -> Result<u64> {
        let instr = self.value();
        match classify(instr) {
            InsnKind::Adrp => Ok(decode_adrp(instr, self.pc())),
            InsnKind::Add => Ok(decode_add_imm(instr) as u64),
            InsnKind::Bl => Ok(decode_bl_imm(instr) as u64),
            InsnKind::Cbz => Ok(decode_cbz_imm(instr) as u64),
            InsnKind::Tbnz => Ok(decode_tbnz_imm(instr) as u64),
            kind => Err(self.invalid_operand("imm", kind)),
        }
    }

    /// Returns the destination register of ADRP/ADD.
    pub fn rd(&self) -> Result<u8> {
        match self.kind() {
            InsnKind::Adrp | InsnKind::Add => Ok(reg_rd(self.value())),
            kind => Err(self.invalid_operand("rd", kind)),
        }
    }

    /// Returns the source register of ADD/RET.
    pub fn rn(&self) -> Result<u8> {
        match self.kind() {
            InsnKind::Add | InsnKind::Ret => Ok(reg_rn(self.value())),
            kind => Err(self.invalid_operand("rn", kind)),
        }
    }

    /// Returns the tested register of CBZ/TBNZ.
    pub fn rt(&self) -> Result<u8> {
        match self.kind() {
            InsnKind::Cbz | InsnKind::Tbnz => Ok(reg_rt(self.value())),
            kind => Err(self.invalid_operand("rt", kind)),
        }
    }

    /// Returns the slid destination of a branch-class instruction.
    pub fn branch_target(&self) -> Result<u64> {
        match self.kind().supertype() {
            Supertype::Branch => Ok(branch_target(self.pc(), self.imm()? as i64)),
            Supertype::General => Err(self.invalid_operand("branch target", self.kind())),
        }
    }

    fn invalid_operand(&self, op: &'static str, kind: InsnKind) -> Error {
        Error::InvalidOperandAccess {
            op,
            kind: kind.name(),
            pc: self.pc(),
        }
    }
}

/// Returns true if a whole instruction at `addr` lies inside `seg`.
#[inline]
fn holds_insn(seg: &Segment<'_>, addr: u64) -> bool {
    addr >= seg.base
        && addr
            .checked_add(INSN_SIZE)
            .is_some_and(|end| end <= seg.end())
}

/// Address of the last whole instruction in `seg`, counted from its base.
#[inline]
fn last_insn(seg: &Segment<'_>) -> u64 {
    seg.base + (seg.size / INSN_SIZE - 1) * INSN_SIZE
}

impl PartialEq for InsnCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.addr == other.addr && self.slide == other.slide
    }
}

impl Eq for InsnCursor<'_> {}

impl<'a> Add<i64> for &InsnCursor<'a> {
    type Output = Result<InsnCursor<'a>>;

    fn add(self, n: i64) -> Self::Output {
        self.offset(n)
    }
}

impl<'a> Sub<i64> for &InsnCursor<'a> {
    type Output = Result<InsnCursor<'a>>;

    fn sub(self, n: i64) -> Self::Output {
        self.offset(n.wrapping_neg())
    }
}
