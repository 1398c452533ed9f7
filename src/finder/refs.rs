//! Reference resolution: code that materializes an address, and branches
//! that land on an instruction.

use tracing::trace;

use crate::arm64::{Direction, InsnCursor, InsnKind, Supertype};
use crate::error::Result;
use crate::macho::Segment;

/// Finds the first ADRP/ADD pair in executable code that builds `target`.
///
/// Code is walked in ascending address order. The most recent ADRP is
/// remembered; a later ADD whose destination register matches it and
/// whose immediate completes the page address to `target` is a hit, and
/// the ADRP's address is returned. `target` and the result are slid
/// addresses.
///
/// The walk covers every executable instruction once, so it always
/// terminates; running off the end yields `None`.
pub fn find_literal_ref(
    segments: &[Segment<'_>],
    slide: u64,
    target: u64,
) -> Result<Option<u64>> {
    let mut cursor = match InsnCursor::start(segments, slide) {
        Ok(cursor) => cursor,
        Err(e) if e.is_exhausted() => return Ok(None),
        Err(e) => return Err(e),
    };

    // (register, page address, adrp pc)
    let mut adrp: Option<(u8, u64, u64)> = None;

    loop {
        match cursor.kind() {
            InsnKind::Adrp => {
                adrp = Some((cursor.rd()?, cursor.imm()?, cursor.pc()));
            }
            InsnKind::Add => {
                if let Some((rd, page, pc)) = adrp {
                    if cursor.rd()? == rd && page.wrapping_add(cursor.imm()?) == target {
                        trace!("literal {:#x} built at {:#x}", target, pc);
                        return Ok(Some(pc));
                    }
                }
            }
            _ => {}
        }

        if cursor.advance().is_err() {
            return Ok(None);
        }
    }
}

/// Finds a relative branch whose target is the instruction under `dest`.
///
/// The search steps away from `dest`, toward lower addresses when
/// `search_up` is set, and examines at most `limit` instructions. Returns
/// the slid address of the first branch found.
pub fn find_rel_branch_source(dest: &InsnCursor<'_>, search_up: bool, limit: usize) -> Result<u64> {
    let target = dest.pc();
    let direction = if search_up {
        Direction::Backward
    } else {
        Direction::Forward
    };

    let mut src = dest.clone();
    src.seek_by(direction, limit, "branch source", |c| {
        c.supertype() == Supertype::Branch && c.branch_target().ok() == Some(target)
    })?;
    Ok(src.pc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::*;
    use crate::error::Error;
    use crate::macho::test_image::ImageBuilder;
    use crate::macho::{MachOContext, VmProt};

    const CODE: u64 = 0xFFFF_FFF0_0700_8000;
    const CSTRING: u64 = 0xFFFF_FFF0_0701_2340;

    #[test]
    fn test_literal_ref_adrp_add() {
        let code = [
            NOP,
            encode_adrp(2, CODE + 4, CSTRING),
            encode_add_imm(2, 2, (CSTRING & 0xFFF) as u32),
            NOP,
        ];
        let data = ImageBuilder::new()
            .code("__TEXT_EXEC", CODE, &code)
            .segment("__TEXT", CSTRING, VmProt::READ, b"csflags\0")
            .build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();

        assert_eq!(find_literal_ref(&segs, 0, CSTRING).unwrap(), Some(CODE + 4));
        assert_eq!(find_literal_ref(&segs, 0, CSTRING + 8).unwrap(), None);
    }

    #[test]
    fn test_literal_ref_requires_matching_register() {
        let code = [
            encode_adrp(2, CODE, CSTRING),
            encode_add_imm(3, 3, (CSTRING & 0xFFF) as u32),
            encode_add_imm(2, 4, (CSTRING & 0xFFF) as u32),
        ];
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();

        // The source register is not compared, so the third word hits.
        assert_eq!(find_literal_ref(&segs, 0, CSTRING).unwrap(), Some(CODE));

        let code = [
            encode_adrp(2, CODE, CSTRING),
            encode_add_imm(3, 2, (CSTRING & 0xFFF) as u32),
        ];
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();
        assert_eq!(find_literal_ref(&segs, 0, CSTRING).unwrap(), None);
    }

    #[test]
    fn test_literal_ref_with_slide() {
        let slide = 0x0420_0000;
        let code = [
            encode_adrp(8, CODE + slide, CSTRING + slide),
            encode_add_imm(8, 8, ((CSTRING + slide) & 0xFFF) as u32),
        ];
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();

        assert_eq!(
            find_literal_ref(&segs, slide, CSTRING + slide).unwrap(),
            Some(CODE + slide)
        );
    }

    #[test]
    fn test_literal_ref_without_code() {
        let data = ImageBuilder::new()
            .segment("__TEXT", CSTRING, VmProt::READ, b"csflags\0")
            .build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();

        assert_eq!(find_literal_ref(&segs, 0, CSTRING).unwrap(), None);
    }

    #[test]
    fn test_branch_source_backward_and_forward() {
        let code = [
            encode_cbz(0, CODE, CODE + 12),
            NOP,
            NOP,
            encode_ret(30),
            NOP,
            encode_bl(CODE + 20, CODE + 12),
        ];
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();
        let dest = InsnCursor::at(&segs, 0, CODE + 12).unwrap();

        assert_eq!(find_rel_branch_source(&dest, true, 16).unwrap(), CODE);
        assert_eq!(find_rel_branch_source(&dest, false, 16).unwrap(), CODE + 20);
        // The destination cursor is not moved.
        assert_eq!(dest.pc(), CODE + 12);
    }

    #[test]
    fn test_branch_source_tbnz() {
        let code = [encode_tbnz(1, 0, CODE, CODE + 8), NOP, NOP];
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();
        let dest = InsnCursor::at(&segs, 0, CODE + 8).unwrap();

        assert_eq!(find_rel_branch_source(&dest, true, 16).unwrap(), CODE);
    }

    #[test]
    fn test_branch_source_tbnz_reads_bit_number_as_offset() {
        // Testing bit 5 folds 5 << 14 into the 19-bit displacement, so this
        // branch is not taken as landing on its architectural target.
        let code = [encode_tbnz(1, 5, CODE, CODE + 8), NOP, NOP];
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();
        let dest = InsnCursor::at(&segs, 0, CODE + 8).unwrap();

        let src = InsnCursor::at(&segs, 0, CODE).unwrap();
        assert_eq!(src.branch_target().unwrap(), CODE + ((5 << 14) + 2) * 4);
        assert!(find_rel_branch_source(&dest, true, 16)
            .unwrap_err()
            .is_exhausted());
    }

    #[test]
    fn test_branch_source_is_bounded() {
        let mut code = vec![encode_cbz(0, CODE, CODE + 0x40)];
        code.extend(std::iter::repeat(NOP).take(0x20));
        let data = ImageBuilder::new().code("__TEXT_EXEC", CODE, &code).build();
        let macho = MachOContext::parse(&data).unwrap();
        let segs = macho.segment_views(&data).unwrap();
        let dest = InsnCursor::at(&segs, 0, CODE + 0x40).unwrap();

        assert!(matches!(
            find_rel_branch_source(&dest, true, 8),
            Err(Error::ScanLimitExceeded { limit: 8, .. })
        ));
        assert_eq!(find_rel_branch_source(&dest, true, 0x20).unwrap(), CODE);

        // Walking off the start of the code is reported the same way as
        // any other exhaustion.
        let first = InsnCursor::at(&segs, 0, CODE + 4).unwrap();
        assert!(find_rel_branch_source(&first, true, 16)
            .unwrap_err()
            .is_exhausted());
    }
}
