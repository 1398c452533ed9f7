//! The analysis session: one kernel image plus the state shared by every
//! search over it.

use std::fs::File;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use once_cell::unsync::OnceCell;
use tracing::{info, warn};

use crate::arm64::{InsnCursor, INSN_SIZE};
use crate::error::{Error, Result};
use crate::macho::{MachOContext, Section64, Segment, SymtabCommand};
use crate::util::is_aligned;

/// Default bound on open-ended instruction walks.
pub const DEFAULT_MAX_SCAN: usize = 0x10000;

/// Options for a patch-finding session.
#[derive(Debug, Clone)]
pub struct FinderOptions {
    /// Maximum number of instructions any single heuristic walk may visit
    pub max_scan: usize,
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    pub verbosity: u8,
}

impl Default for FinderOptions {
    fn default() -> Self {
        Self {
            max_scan: DEFAULT_MAX_SCAN,
            verbosity: 1,
        }
    }
}

/// The bytes backing a session.
///
/// Ownership is fixed when the session is created: mapped and owned buffers
/// are released with the session, a borrowed buffer is left to the caller.
#[derive(Debug)]
pub enum ImageData<'a> {
    /// A memory-mapped file opened by the session
    Mapped(Mmap),
    /// A heap buffer handed over to the session
    Owned(Vec<u8>),
    /// A buffer that stays owned by the caller
    Borrowed(&'a [u8]),
}

impl ImageData<'_> {
    /// Returns the raw image bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ImageData::Mapped(mmap) => mmap,
            ImageData::Owned(data) => data,
            ImageData::Borrowed(data) => data,
        }
    }

    /// Returns true if the session releases the buffer when dropped.
    #[inline]
    pub fn is_owned(&self) -> bool {
        !matches!(self, ImageData::Borrowed(_))
    }
}

/// File bytes backing one segment, checked against the image on creation.
#[derive(Debug, Clone)]
struct SegmentExtent {
    base: u64,
    range: Range<usize>,
    executable: bool,
}

/// Patch-finding session over a raw, decompressed 64-bit kernel image.
///
/// The load commands are parsed and the segment extents validated once on
/// creation. The symbol table is located lazily on the first symbol lookup
/// and cached afterwards.
#[derive(Debug)]
pub struct PatchFinder<'a> {
    data: ImageData<'a>,
    macho: MachOContext,
    slide: u64,
    options: FinderOptions,
    symtab: OnceCell<SymtabCommand>,
    extents: Vec<SegmentExtent>,
}

impl<'a> PatchFinder<'a> {
    /// Creates a session over a caller-owned buffer.
    pub fn from_bytes(data: &'a [u8], slide: u64) -> Result<Self> {
        Self::new(ImageData::Borrowed(data), slide)
    }

    /// Creates a session from image data with an explicit ownership mode.
    pub fn new(data: ImageData<'a>, slide: u64) -> Result<Self> {
        let macho = MachOContext::parse(data.as_bytes())?;

        let segments = macho.segment_views(data.as_bytes())?;
        for (view, info) in segments.iter().zip(macho.segments()) {
            if view.size == 0 && info.command.vmsize > 0 {
                warn!("segment {} has no file data", view.name);
            } else if view.size < info.command.filesize {
                warn!(
                    "segment {} truncated to {:#x} of {:#x} bytes",
                    view.name, view.size, info.command.filesize
                );
            }
        }
        for view in segments.iter().filter(|s| s.executable) {
            if !is_aligned(view.base, INSN_SIZE) {
                warn!(
                    "executable segment {} at {:#x} is not instruction aligned",
                    view.name, view.base
                );
            }
        }
        let executable = segments.iter().filter(|s| s.executable).count();
        if executable == 0 {
            warn!("image has no executable segments; instruction scans will fail");
        }
        info!(
            "Loaded {} ({} segments, {} executable, slide {:#x}{})",
            macho.header,
            segments.len(),
            executable,
            slide,
            macho
                .uuid()
                .map(|u| format!(", uuid {}", u))
                .unwrap_or_default()
        );

        let extents = segments
            .iter()
            .zip(macho.segments())
            .map(|(view, info)| SegmentExtent {
                base: view.base,
                range: if view.size == 0 {
                    0..0
                } else {
                    let start = info.command.fileoff as usize;
                    start..start + view.data.len()
                },
                executable: view.executable,
            })
            .collect();

        Ok(Self {
            data,
            macho,
            slide,
            options: FinderOptions::default(),
            symtab: OnceCell::new(),
            extents,
        })
    }

    /// Sets the session options.
    pub fn with_options(mut self, options: FinderOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the session options.
    #[inline]
    pub fn options(&self) -> &FinderOptions {
        &self.options
    }

    /// Returns the slide applied to every reported address.
    #[inline]
    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Returns the parsed load commands.
    #[inline]
    pub fn macho(&self) -> &MachOContext {
        &self.macho
    }

    /// Returns the raw image bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Returns true if the session owns its image buffer.
    #[inline]
    pub fn owns_buffer(&self) -> bool {
        self.data.is_owned()
    }

    /// Returns the loadable segments in load-command order.
    pub fn segments(&self) -> Vec<Segment<'_>> {
        let bytes = self.data.as_bytes();
        self.macho
            .segments()
            .zip(&self.extents)
            .map(|(info, extent)| Segment {
                name: info.name(),
                base: extent.base,
                size: extent.range.len() as u64,
                data: &bytes[extent.range.clone()],
                executable: extent.executable,
            })
            .collect()
    }

    /// Creates an instruction cursor over the executable segments at a
    /// slid address.
    pub fn cursor_at(&self, addr: u64) -> Result<InsnCursor<'_>> {
        InsnCursor::at(&self.segments(), self.slide, addr)
    }

    /// Looks up a symbol and returns its slid address.
    pub fn find_symbol(&self, name: &str) -> Result<u64> {
        let symtab = self.symtab.get_or_try_init(|| self.macho.symtab())?;
        let value = self.macho.find_symbol(self.bytes(), symtab, name)?;
        Ok(value.wrapping_add(self.slide))
    }

    /// Returns a section header by segment and section name.
    pub fn find_section(&self, segment: &str, section: &str) -> Result<&Section64> {
        Ok(&self.macho.find_section(segment, section)?.section)
    }

    /// Logs a warning message if verbosity is high enough.
    pub fn warn(&self, message: &str) {
        if self.options.verbosity >= 1 {
            warn!("{}", message);
        }
    }

    /// Logs an info message if verbosity is high enough.
    pub fn info(&self, message: &str) {
        if self.options.verbosity >= 2 {
            info!("{}", message);
        }
    }
}

impl PatchFinder<'static> {
    /// Creates a session that takes ownership of `data`.
    pub fn from_vec(data: Vec<u8>, slide: u64) -> Result<Self> {
        Self::new(ImageData::Owned(data), slide)
    }

    /// Memory-maps a raw kernel image from disk. The slide is zero.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_slide(path, 0)
    }

    /// Memory-maps a raw kernel image from disk with a known slide.
    pub fn open_with_slide<P: AsRef<Path>>(path: P, slide: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        Self::new(ImageData::Mapped(mmap), slide)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::macho::test_image::ImageBuilder;
    use crate::macho::VmProt;

    fn image() -> Vec<u8> {
        ImageBuilder::new()
            .segment_with_section(
                "__TEXT",
                "__cstring",
                0xFFFF_FFF0_0700_4000,
                VmProt::READ,
                b"Darwin Kernel Version\0",
            )
            .code("__TEXT_EXEC", 0xFFFF_FFF0_0800_0000, &[0xD503201F, 0xD65F03C0])
            .symbol("_kernel_task", 0xFFFF_FFF0_0712_3450)
            .build()
    }

    #[test]
    fn test_borrowed_session() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        assert!(!finder.owns_buffer());
        assert_eq!(finder.segments().len(), 2);
        assert_eq!(finder.bytes().len(), data.len());
    }

    #[test]
    fn test_owned_session_with_slide() {
        let finder = PatchFinder::from_vec(image(), 0x1000).unwrap();

        assert!(finder.owns_buffer());
        assert_eq!(finder.slide(), 0x1000);
        assert_eq!(
            finder.find_symbol("_kernel_task").unwrap(),
            0xFFFF_FFF0_0712_4450
        );
        let cursor = finder.cursor_at(0xFFFF_FFF0_0800_1004).unwrap();
        assert_eq!(cursor.pc(), 0xFFFF_FFF0_0800_1004);
    }

    #[test]
    fn test_symbol_lookup_is_cached() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        assert!(finder.symtab.get().is_none());
        assert!(matches!(
            finder.find_symbol("_missing"),
            Err(Error::SymbolNotFound { .. })
        ));
        assert!(finder.symtab.get().is_some());
        assert_eq!(
            finder.find_symbol("_kernel_task").unwrap(),
            0xFFFF_FFF0_0712_3450
        );
    }

    #[test]
    fn test_segments_match_parsed_views() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();
        let views = finder.macho().segment_views(&data).unwrap();
        let segments = finder.segments();

        assert_eq!(segments.len(), views.len());
        for (seg, view) in segments.iter().zip(&views) {
            assert_eq!(seg.name, view.name);
            assert_eq!(seg.base, view.base);
            assert_eq!(seg.data, view.data);
            assert_eq!(seg.executable, view.executable);
        }
    }

    #[test]
    fn test_truncated_segment_keeps_present_bytes() {
        let code = [0xD503201Fu32; 10];
        let mut data = ImageBuilder::new()
            .code("__TEXT_EXEC", 0xFFFF_FFF0_0800_0000, &code)
            .build();
        // 40 code bytes padded to 48; keep the first 32.
        data.truncate(data.len() - 16);

        let finder = PatchFinder::from_vec(data, 0).unwrap();
        let segments = finder.segments();
        assert_eq!(segments[0].size, 32);
        assert!(finder.cursor_at(0xFFFF_FFF0_0800_001C).is_ok());
        assert!(finder.cursor_at(0xFFFF_FFF0_0800_0020).is_err());
    }

    #[test]
    fn test_find_section() {
        let data = image();
        let finder = PatchFinder::from_bytes(&data, 0).unwrap();

        let sect = finder.find_section("__TEXT", "__cstring").unwrap();
        assert_eq!(sect.addr, 0xFFFF_FFF0_0700_4000);
        assert!(finder.find_section("__DATA", "__data").is_err());
    }

    #[test]
    fn test_rejects_non_macho() {
        let data = vec![0u8; 64];
        assert!(matches!(
            PatchFinder::from_bytes(&data, 0),
            Err(Error::UnsupportedImageFormat { magic: 0 })
        ));
    }

    #[test]
    fn test_open_maps_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image()).unwrap();
        file.flush().unwrap();

        let finder = PatchFinder::open(file.path()).unwrap();
        assert!(finder.owns_buffer());
        assert_eq!(finder.slide(), 0);
        assert!(finder.find_symbol("_kernel_task").is_ok());

        let slid = PatchFinder::open_with_slide(file.path(), 0x4000).unwrap();
        assert_eq!(
            slid.find_symbol("_kernel_task").unwrap(),
            0xFFFF_FFF0_0712_7450
        );
    }

    #[test]
    fn test_open_missing_file() {
        assert!(matches!(
            PatchFinder::open("/nonexistent/kernelcache.raw"),
            Err(Error::FileOpen { .. })
        ));
    }
}
