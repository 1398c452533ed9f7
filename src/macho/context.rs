//! Segment map built from a kernel image's load commands.

use std::collections::HashMap;

use tracing::{debug, warn};
use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::c_str_at;

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure
    pub section: Section64,
    /// Offset of the section structure in the file
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        self.section.name()
    }

    /// Returns the full name (segment,section).
    pub fn full_name(&self) -> String {
        format!("{},{}", self.section.segment_name(), self.section.name())
    }
}

// =============================================================================
// Segment View
// =============================================================================

/// A loadable segment together with the image bytes backing it.
///
/// `base` is the link-time address; the slide is applied by whoever reports
/// addresses to the caller. `size` is the number of bytes present in the
/// file, which may be less than the segment's VM size.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Segment name (e.g. `__TEXT_EXEC`)
    pub name: &'a str,
    /// Link-time virtual address
    pub base: u64,
    /// Number of bytes backed by the image
    pub size: u64,
    /// The segment's bytes inside the image buffer
    pub data: &'a [u8],
    /// Whether the segment's maximum protection includes execute
    pub executable: bool,
}

impl<'a> Segment<'a> {
    /// Returns the first address past the end of the segment.
    #[inline]
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Returns true if the segment contains the given link-time address.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// Only the commands the patch finder consumes are decoded; everything else
/// is recorded as `Unknown`.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Uuid {
        command: UuidCommand,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command type.
    pub fn cmd(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(_) => LC_SEGMENT_64,
            LoadCommandInfo::Symtab { .. } => LC_SYMTAB,
            LoadCommandInfo::Uuid { .. } => LC_UUID,
            LoadCommandInfo::Unknown { cmd, .. } => *cmd,
        }
    }

    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. } => *offset,
            LoadCommandInfo::Uuid { offset, .. } => *offset,
            LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Parsed load-command view of a 64-bit Mach-O image.
///
/// The context does not hold the image bytes; methods that need them take
/// the buffer the context was parsed from.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Parsed load commands, in file order
    pub load_commands: Vec<LoadCommandInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

impl MachOContext {
    /// Parses the header and load commands of a raw 64-bit Mach-O image.
    ///
    /// Fails with [`Error::UnsupportedImageFormat`] if the magic is not
    /// `MH_MAGIC_64` and with [`Error::LoadCommandNotFound`] if the image has
    /// no `LC_SEGMENT_64` command.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::parse(0, "failed to parse mach header"))?
            .0;

        if header.magic == MH_CIGAM_64 {
            warn!("byte-swapped (big-endian) Mach-O images are not supported");
        }
        if !header.is_valid() {
            return Err(Error::UnsupportedImageFormat {
                magic: header.magic,
            });
        }
        if !header.is_arm64() {
            warn!("image cputype {:#x} is not arm64", header.cputype);
        }

        let mut ctx = Self {
            header,
            load_commands: Vec::with_capacity(header.ncmds as usize),
            segment_indices: HashMap::new(),
        };
        ctx.parse_load_commands(data)?;

        if ctx.segment_indices.is_empty() {
            return Err(Error::LoadCommandNotFound { cmd: LC_SEGMENT_64 });
        }

        Ok(ctx)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset || offset + LoadCommand::SIZE > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            if (lc.cmdsize as usize) < LoadCommand::SIZE {
                return Err(Error::parse(offset, "load command size too small"));
            }
            if offset + lc.cmdsize as usize > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &data[offset..offset + lc.cmdsize as usize];
            let cmd_info = Self::parse_load_command(lc, cmd_data, offset)?;

            if let LoadCommandInfo::Segment(ref seg) = cmd_info {
                debug!("{}", seg.command);
                self.segment_indices
                    .entry(seg.name().to_string())
                    .or_insert(self.load_commands.len());
            }

            self.load_commands.push(cmd_info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Parses a single load command. `data` covers exactly `lc.cmdsize` bytes.
    fn parse_load_command(lc: LoadCommand, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        match lc.cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut sect_offset = SegmentCommand64::SIZE;

                for _ in 0..seg.nsects {
                    let sect = data
                        .get(sect_offset..)
                        .and_then(|rest| Section64::read_from_prefix(rest).ok())
                        .ok_or_else(|| Error::parse(offset + sect_offset, "failed to parse section"))?
                        .0;

                    sections.push(SectionInfo {
                        section: sect,
                        struct_offset: offset + sect_offset,
                    });
                    sect_offset += Section64::SIZE;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SYMTAB => {
                let symtab = SymtabCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                    .0;
                Ok(LoadCommandInfo::Symtab {
                    command: symtab,
                    offset,
                })
            }

            LC_UUID => {
                let uuid = UuidCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse uuid command"))?
                    .0;
                Ok(LoadCommandInfo::Uuid {
                    command: uuid,
                    offset,
                })
            }

            cmd => Ok(LoadCommandInfo::Unknown {
                cmd,
                cmdsize: lc.cmdsize,
                offset,
            }),
        }
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments, in load-command order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns the first load command of the given type.
    pub fn find_load_command(&self, cmd: u32) -> Result<&LoadCommandInfo> {
        self.load_commands
            .iter()
            .find(|lc| lc.cmd() == cmd)
            .ok_or(Error::LoadCommandNotFound { cmd })
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Result<SymtabCommand> {
        match self.find_load_command(LC_SYMTAB)? {
            LoadCommandInfo::Symtab { command, .. } => Ok(*command),
            _ => Err(Error::LoadCommandNotFound { cmd: LC_SYMTAB }),
        }
    }

    /// Returns the image UUID, if the image carries one.
    pub fn uuid(&self) -> Option<String> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Uuid { command, .. } => Some(command.to_uuid_string()),
            _ => None,
        })
    }

    /// Returns a section by segment and section name.
    pub fn find_section(&self, segment: &str, section: &str) -> Result<&SectionInfo> {
        self.segments()
            .filter(|seg| seg.name() == segment)
            .find_map(|seg| seg.section(section))
            .ok_or_else(|| Error::SectionNotFound {
                segment: segment.to_string(),
                section: section.to_string(),
            })
    }

    /// Builds the segment views over `data`, in load-command order.
    ///
    /// A segment whose file range runs past the end of the buffer is
    /// truncated to what is present; one that starts past the end fails.
    pub fn segment_views<'a>(&'a self, data: &'a [u8]) -> Result<Vec<Segment<'a>>> {
        let mut views = Vec::with_capacity(self.segment_indices.len());

        for seg in self.segments() {
            let cmd = &seg.command;
            let start = cmd.fileoff as usize;
            if cmd.filesize > 0 && start > data.len() {
                return Err(Error::buffer_too_small(start, data.len()));
            }

            let end = start.saturating_add(cmd.filesize as usize);
            let bytes = if cmd.filesize == 0 {
                &data[..0]
            } else if end > data.len() {
                &data[start..]
            } else {
                &data[start..end]
            };

            views.push(Segment {
                name: seg.name(),
                base: cmd.vmaddr,
                size: bytes.len() as u64,
                data: bytes,
                executable: cmd.is_executable(),
            });
        }

        Ok(views)
    }

    /// Looks up a symbol by exact name with a linear scan of `symtab`.
    ///
    /// Debugging and undefined entries are skipped. Returns the symbol's
    /// `n_value` (a link-time address).
    pub fn find_symbol(&self, data: &[u8], symtab: &SymtabCommand, name: &str) -> Result<u64> {
        let symoff = symtab.symoff as usize;
        let strtab = symtab.stroff as usize;
        let table_end = symoff + symtab.nsyms as usize * Nlist64::SIZE;
        if table_end > data.len() {
            return Err(Error::buffer_too_small(table_end, data.len()));
        }

        for i in 0..symtab.nsyms as usize {
            let entry_offset = symoff + i * Nlist64::SIZE;
            let entry = Nlist64::read_from_prefix(&data[entry_offset..])
                .map_err(|_| Error::parse(entry_offset, "failed to parse nlist entry"))?
                .0;

            if entry.is_debug() || entry.is_undefined() {
                continue;
            }
            if entry.n_strx >= symtab.strsize {
                return Err(Error::StringTableOverflow {
                    offset: entry.n_strx,
                    size: symtab.strsize,
                });
            }
            if c_str_at(data, strtab + entry.n_strx as usize) == Some(name) {
                return Ok(entry.n_value);
            }
        }

        Err(Error::SymbolNotFound {
            name: name.to_string(),
        })
    }
}
