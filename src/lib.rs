//! kpatchfinder - Signature-based patch finder for 64-bit ARM kernel images.
//!
//! This library locates well-known patch sites in a raw, decompressed
//! Mach-O kernel. Each locator anchors on a distinctive string, follows the
//! code that references it and walks nearby instructions to the site that
//! needs changing. The result is a [`Patch`]: an address and the
//! replacement bytes. Nothing is ever written to the image.
//!
//! # Example
//!
//! ```no_run
//! use kpatchfinder::{Locator, PatchFinder};
//!
//! fn main() -> kpatchfinder::Result<()> {
//!     let finder = PatchFinder::open("/path/to/kernelcache.raw")?;
//!
//!     let patch = finder.find_patch(Locator::Sandbox)?;
//!     println!("{}", patch);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod error;
pub mod finder;
pub mod macho;
pub mod util;

// Re-export main types
pub use arm64::{Direction, InsnCursor, InsnKind};
pub use error::{Error, Result};
pub use finder::{FinderOptions, ImageData, Locator, Patch, PatchFinder};
pub use macho::{MachOContext, Segment};
