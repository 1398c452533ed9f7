//! Patch locators.
//!
//! Each locator anchors on a distinctive string in the image, finds the
//! code that references it and walks nearby instructions to the site that
//! gets patched. Locators only describe patches; applying them is left to
//! the caller.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, trace};

use crate::arm64::{Direction, InsnKind, INSN_SIZE, NOP};
use crate::error::{Error, Result};

use super::refs::{find_literal_ref, find_rel_branch_source};
use super::PatchFinder;

// =============================================================================
// Signatures
// =============================================================================

const SANDBOX_EXEC_DENIED: &[u8] = b"process-exec denied while updating label";
const AMFI_EXECVE_KILL: &[u8] = b"AMFI: hook..execve() killing pid %u: %s";
const CSFLAGS: &[u8] = b"csflags\0";
const DARWIN_KERNEL: &[u8] = b"Darwin Kernel";
const AMFI_VALIDATE_CD_HASH: &[u8] = b"int _validateCodeDirectoryHashInDaemon";

/// Replacement for the execve hook's flag test: nop; and w0, w0, #0xfffffdff;
/// nop; mov w0, #0; mov w9, #0xf.
const AMFI_SUBSTRATE_PATCH: [u8; 20] = [
    0x1F, 0x20, 0x03, 0xD5, 0x00, 0x78, 0x16, 0x12, 0x1F, 0x20, 0x03, 0xD5, 0x00, 0x00, 0x80,
    0x52, 0xE9, 0x01, 0x80, 0x52,
];

// =============================================================================
// Patch
// =============================================================================

/// A byte replacement at a slid virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Slid virtual address of the first patched byte
    pub address: u64,
    /// Replacement bytes
    pub bytes: Vec<u8>,
}

impl Patch {
    /// Creates a patch.
    pub fn new(address: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            bytes: bytes.into(),
        }
    }

    /// Creates a patch of `count` consecutive NOP instructions.
    pub fn nops(address: u64, count: usize) -> Self {
        let bytes = NOP.to_le_bytes().repeat(count);
        Self { address, bytes }
    }

    /// Number of bytes replaced.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the patch replaces nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the replacement bytes as a lowercase hex string.
    pub fn hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} {}", self.address, self.hex())
    }
}

// =============================================================================
// Locator
// =============================================================================

/// The known patch locators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locator {
    /// Branch that denies exec while the sandbox label is updated
    Sandbox,
    /// Flag test in AMFI's execve hook
    AmfiSubstrate,
    /// Code-signing enforcement check in AMFI
    CsEnforcement,
    /// Boot-arg byte read by the debugger gate
    Debugger,
    /// AMFI code-directory hash validation
    AmfiOffsets,
}

impl Locator {
    /// Every locator, in the order they are run.
    pub const ALL: [Locator; 5] = [
        Locator::Sandbox,
        Locator::AmfiSubstrate,
        Locator::CsEnforcement,
        Locator::Debugger,
        Locator::AmfiOffsets,
    ];

    /// Name used to select the locator from the command line.
    pub fn name(self) -> &'static str {
        match self {
            Locator::Sandbox => "sandbox",
            Locator::AmfiSubstrate => "amfi-substrate",
            Locator::CsEnforcement => "cs-enforcement",
            Locator::Debugger => "i-can-has-debugger",
            Locator::AmfiOffsets => "amfi-offsets",
        }
    }

    /// Returns false for locators that cannot produce a patch yet.
    pub fn is_implemented(self) -> bool {
        !matches!(self, Locator::AmfiOffsets)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Locator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Locator::ALL
            .into_iter()
            .find(|l| l.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Locator::ALL.iter().map(|l| l.name()).collect();
                format!("unknown patch '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

// =============================================================================
// Locators
// =============================================================================

impl PatchFinder<'_> {
    /// Returns every known locator.
    pub fn locators(&self) -> &'static [Locator] {
        &Locator::ALL
    }

    /// Runs a single locator.
    pub fn find_patch(&self, locator: Locator) -> Result<Patch> {
        let patch = match locator {
            Locator::Sandbox => self.find_sandbox_patch(),
            Locator::AmfiSubstrate => self.find_amfi_substrate_patch(),
            Locator::CsEnforcement => self.find_cs_enforcement_disable_amfi(),
            Locator::Debugger => self.find_i_can_has_debugger_patch_off(),
            Locator::AmfiOffsets => self.find_amfi_patch_offsets(),
        }?;

        self.info(&format!(
            "{}: {} bytes at {:#x}",
            locator,
            patch.len(),
            patch.address
        ));
        Ok(patch)
    }

    /// Runs every implemented locator and returns each result.
    ///
    /// A failing locator does not stop the others.
    pub fn find_all_patches(&self) -> Vec<(Locator, Result<Patch>)> {
        Locator::ALL
            .into_iter()
            .filter(|l| l.is_implemented())
            .map(|l| {
                let result = self.find_patch(l);
                if let Err(ref e) = result {
                    self.warn(&format!("{}: {}", l, e));
                }
                (l, result)
            })
            .collect()
    }

    /// NOPs the conditional branch that skips the sandbox's exec denial.
    pub fn find_sandbox_patch(&self) -> Result<Patch> {
        let xref = self.string_xref(SANDBOX_EXEC_DENIED)?;
        let limit = self.options().max_scan;

        // The denial path is entered just before the fourth call preceding
        // the string load.
        let mut bdst = self.cursor_at(xref)?;
        for _ in 0..4 {
            bdst.seek(InsnKind::Bl, Direction::Backward, limit)?;
        }
        bdst.retreat()?;
        debug!("sandbox: branch destination at {:#x}", bdst.pc());

        let branch = find_rel_branch_source(&bdst, true, limit)?;
        debug!("sandbox: branch at {:#x}", branch);

        Ok(Patch::nops(branch, 1))
    }

    /// Replaces the flag test in AMFI's execve hook.
    pub fn find_amfi_substrate_patch(&self) -> Result<Patch> {
        let xref = self.string_xref(AMFI_EXECVE_KILL)?;
        let limit = self.options().max_scan;

        let mut funcend = self.cursor_at(xref)?;
        funcend.seek(InsnKind::Ret, Direction::Forward, limit)?;
        debug!("amfi-substrate: function end at {:#x}", funcend.pc());

        let mut tbnz = funcend.clone();
        tbnz.seek(InsnKind::Tbnz, Direction::Backward, limit)?;
        debug!("amfi-substrate: tbnz at {:#x}", tbnz.pc());

        Ok(Patch::new(tbnz.pc(), AMFI_SUBSTRATE_PATCH))
    }

    /// NOPs AMFI's code-signing enforcement from its `cbz` through the
    /// following `ret`.
    pub fn find_cs_enforcement_disable_amfi(&self) -> Result<Patch> {
        let xref = self.string_xref(CSFLAGS)?;
        let limit = self.options().max_scan;

        let mut cbz = self.cursor_at(xref)?;
        cbz.seek(InsnKind::Cbz, Direction::Backward, limit)?;

        let mut ret = cbz.clone();
        ret.seek(InsnKind::Ret, Direction::Forward, limit)?;
        debug!("cs-enforcement: cbz at {:#x}, ret at {:#x}", cbz.pc(), ret.pc());

        let count = (ret.pc().wrapping_sub(cbz.pc()) / INSN_SIZE + 1) as usize;
        Ok(Patch::nops(cbz.pc(), count))
    }

    /// Sets the byte just before the kernel version string.
    pub fn find_i_can_has_debugger_patch_off(&self) -> Result<Patch> {
        let addr = self.require_string(DARWIN_KERNEL)?;
        Ok(Patch::new(addr.wrapping_sub(4), [1u8]))
    }

    /// Walks the calls after AMFI's code-directory hash validation string.
    ///
    /// No patch is derived from the walk; this always ends in
    /// `NotImplemented` once the string and its reference are found.
    pub fn find_amfi_patch_offsets(&self) -> Result<Patch> {
        let xref = self.string_xref(AMFI_VALIDATE_CD_HASH)?;
        let limit = self.options().max_scan;

        let mut bl = self.cursor_at(xref)?;
        for _ in 0..limit {
            if bl.advance().is_err() {
                break;
            }
            if bl.kind() != InsnKind::Bl {
                continue;
            }
            let target = bl.branch_target()?;
            let adrp = self
                .cursor_at(target)
                .map(|dst| dst.kind() == InsnKind::Adrp)
                .unwrap_or(false);
            trace!(
                "amfi-offsets: call at {:#x} to {:#x} (adrp: {})",
                bl.pc(),
                target,
                adrp
            );
        }

        Err(Error::NotImplemented {
            locator: Locator::AmfiOffsets.name(),
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn require_string(&self, pattern: &[u8]) -> Result<u64> {
        let addr = self
            .search(pattern)
            .ok_or_else(|| Error::pattern_not_found(pattern))?;
        debug!("string {:?} at {:#x}", String::from_utf8_lossy(pattern), addr);
        Ok(addr)
    }

    fn string_xref(&self, pattern: &[u8]) -> Result<u64> {
        let addr = self.require_string(pattern)?;
        let xref = find_literal_ref(&self.segments(), self.slide(), addr)?.ok_or_else(|| {
            Error::LiteralRefNotFound {
                target: addr,
                pattern: String::from_utf8_lossy(pattern)
                    .trim_end_matches('\0')
                    .to_string(),
            }
        })?;
        debug!("literal ref to {:#x} at {:#x}", addr, xref);
        Ok(xref)
    }
}
