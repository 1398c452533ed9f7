//! Mach-O image handling.
//!
//! This module parses the header and load commands of a raw 64-bit kernel
//! image into a segment map, and exposes the symbol table and sections.

mod constants;
mod context;
mod structs;

#[cfg(test)]
pub(crate) mod test_image;

pub use constants::*;
pub use context::*;
pub use structs::*;
