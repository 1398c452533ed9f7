//! Small binary helpers shared by the image parser and the instruction walker.
//!
//! - Unaligned little-endian reads (byteorder)
//! - SIMD-accelerated byte and substring search (memchr)
//! - Page alignment

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// Returns `None` if fewer than four bytes remain.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    data.get(offset..end).map(LittleEndian::read_u32)
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Reads the NUL-terminated string starting at `offset`.
///
/// Returns `None` if `offset` is out of bounds or the bytes are not UTF-8.
pub fn c_str_at(data: &[u8], offset: usize) -> Option<&str> {
    let tail = data.get(offset..)?;
    std::str::from_utf8(&tail[..memchr_null(tail)]).ok()
}

/// Finds the first occurrence of `needle` in `haystack`.
///
/// An empty needle never matches.
#[inline]
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    memchr::memmem::find(haystack, needle)
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Size of a translation granule page used by ADRP.
pub const PAGE_SIZE: u64 = 0x1000;

/// Aligns a value down to the given power-of-two alignment.
#[inline(always)]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Checks if a value is aligned to the given power-of-two alignment.
#[inline(always)]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    (value & (alignment - 1)) == 0
}
