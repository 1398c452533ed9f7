//! Patch finding over a loaded kernel image.
//!
//! [`PatchFinder`] owns the session; the submodules add byte search,
//! reference resolution and the patch locators on top of it.

mod context;
mod patches;
mod refs;
mod search;

pub use context::*;
pub use patches::{Locator, Patch};
pub use refs::{find_literal_ref, find_rel_branch_source};
pub use search::search_segments;
