//! Byte-signature search over the loaded segments.

use tracing::trace;

use crate::macho::Segment;
use crate::util::find_bytes;

use super::PatchFinder;

/// Returns the slid virtual address of the first occurrence of `pattern`.
///
/// Segments are scanned in the order given, each from its first byte. A
/// match must lie entirely inside one segment. An empty pattern never
/// matches.
pub fn search_segments(segments: &[Segment<'_>], slide: u64, pattern: &[u8]) -> Option<u64> {
    segments.iter().find_map(|seg| {
        find_bytes(seg.data, pattern).map(|off| {
            let addr = seg.base.wrapping_add(off as u64).wrapping_add(slide);
            trace!("pattern matched in {} at {:#x}", seg.name, addr);
            addr
        })
    })
}

impl PatchFinder<'_> {
    /// Returns the slid virtual address of the first occurrence of
    /// `pattern` in any segment, in load-command order.
    pub fn search(&self, pattern: &[u8]) -> Option<u64> {
        search_segments(&self.segments(), self.slide(), pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::test_image::ImageBuilder;
    use crate::macho::VmProt;

    fn image() -> Vec<u8> {
        ImageBuilder::new()
            .segment("__TEXT", 0x8000, VmProt::READ, b"xxxxAAAAyyyyBB")
            .segment("__DATA", 0x2000, VmProt::READ | VmProt::WRITE, b"BBBBcsflags\0zz")
            .build()
    }

    #[test]
    fn test_search_reports_slid_address() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();
        assert_eq!(finder.search(b"AAAA"), Some(0x8004));

        let slid = PatchFinder::from_bytes(&data, 0x10_0000).unwrap();
        assert_eq!(slid.search(b"AAAA"), Some(0x10_8004));
    }

    #[test]
    fn test_search_in_later_segment() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        // Only present in the second segment: offset is relative to its base.
        assert_eq!(finder.search(b"csflags\0"), Some(0x2004));
    }

    #[test]
    fn test_search_follows_load_command_order() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        // "BB" ends __TEXT and starts __DATA; the first segment wins even
        // though __DATA has the lower address.
        assert_eq!(finder.search(b"BB"), Some(0x800C));
    }

    #[test]
    fn test_search_does_not_span_segments() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        assert_eq!(finder.search(b"yyyyBBBB"), None);
    }

    #[test]
    fn test_search_misses() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        assert_eq!(finder.search(b"Darwin Kernel"), None);
        assert_eq!(finder.search(b""), None);
    }
}
