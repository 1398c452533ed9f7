//! Error types for the kernel patch finder.
//!
//! This module covers every failure the analysis can hit: opening the image,
//! walking its load commands, resolving symbols and running the instruction
//! heuristics that locate patch sites.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for patch-finding operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Image Format Errors ====================
    #[error("unsupported image format: magic {magic:#x} is not a 64-bit Mach-O")]
    UnsupportedImageFormat { magic: u32 },

    #[error("load command {cmd:#x} not found")]
    LoadCommandNotFound { cmd: u32 },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    // ==================== Symbol Errors ====================
    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },

    #[error("string table offset {offset} out of bounds (size: {size})")]
    StringTableOverflow { offset: u32, size: u32 },

    // ==================== Analysis Errors ====================
    #[error("signature not found: {pattern:?}")]
    PatternNotFound { pattern: String },

    #[error("no literal reference to {target:#x} ({pattern:?})")]
    LiteralRefNotFound { target: u64, pattern: String },

    #[error("address {addr:#x} out of range: {reason}")]
    OutOfRange { addr: u64, reason: &'static str },

    #[error("{what}: gave up after {limit} instructions")]
    ScanLimitExceeded { what: &'static str, limit: usize },

    #[error("cannot read {op} of {kind} instruction at {pc:#x}")]
    InvalidOperandAccess {
        op: &'static str,
        kind: &'static str,
        pc: u64,
    },

    #[error("locator '{locator}' is not implemented")]
    NotImplemented { locator: &'static str },
}

/// A specialized Result type for patch-finding operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error means an instruction walk ran out of input.
    ///
    /// Scans that look for "the next instruction of kind X" treat these as
    /// the normal end of the search rather than a hard failure.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. } | Error::ScanLimitExceeded { .. }
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an out of range error.
    #[inline]
    pub fn out_of_range(addr: u64, reason: &'static str) -> Self {
        Error::OutOfRange { addr, reason }
    }

    /// Creates a pattern not found error from a raw signature.
    pub fn pattern_not_found(pattern: &[u8]) -> Self {
        Error::PatternNotFound {
            pattern: String::from_utf8_lossy(pattern)
                .trim_end_matches('\0')
                .to_string(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_exhausted() {
        assert!(Error::out_of_range(0x1000, "overflow").is_exhausted());
        assert!(Error::ScanLimitExceeded {
            what: "branch source",
            limit: 16
        }
        .is_exhausted());
        assert!(!Error::NotImplemented { locator: "x" }.is_exhausted());
    }

    #[test]
    fn test_pattern_not_found_strips_terminator() {
        let err = Error::pattern_not_found(b"csflags\0");
        assert_eq!(err.to_string(), "signature not found: \"csflags\"");
    }
}
