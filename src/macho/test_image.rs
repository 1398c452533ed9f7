//! Synthetic kernel images for unit tests.

use zerocopy::IntoBytes;

use super::constants::*;
use super::structs::*;

struct PendingSegment {
    name: String,
    section: Option<String>,
    vmaddr: u64,
    prot: VmProt,
    bytes: Vec<u8>,
}

/// Builds a minimal little-endian arm64 Mach-O with the given segments and
/// an optional symbol table.
///
/// Segment file data is laid out after the load commands in the order the
/// segments were added; the symbol and string tables follow.
#[derive(Default)]
pub(crate) struct ImageBuilder {
    segments: Vec<PendingSegment>,
    symbols: Vec<(String, u64)>,
}

impl ImageBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn segment(mut self, name: &str, vmaddr: u64, prot: VmProt, bytes: &[u8]) -> Self {
        self.segments.push(PendingSegment {
            name: name.to_string(),
            section: None,
            vmaddr,
            prot,
            bytes: bytes.to_vec(),
        });
        self
    }

    pub(crate) fn segment_with_section(
        mut self,
        name: &str,
        section: &str,
        vmaddr: u64,
        prot: VmProt,
        bytes: &[u8],
    ) -> Self {
        self.segments.push(PendingSegment {
            name: name.to_string(),
            section: Some(section.to_string()),
            vmaddr,
            prot,
            bytes: bytes.to_vec(),
        });
        self
    }

    /// Adds a code segment assembled from instruction words.
    pub(crate) fn code(self, name: &str, vmaddr: u64, words: &[u32]) -> Self {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.segment(name, vmaddr, VmProt::READ | VmProt::EXECUTE, &bytes)
    }

    pub(crate) fn symbol(mut self, name: &str, value: u64) -> Self {
        self.symbols.push((name.to_string(), value));
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let seg_cmds_size: usize = self
            .segments
            .iter()
            .map(|s| SegmentCommand64::SIZE + s.section.as_ref().map_or(0, |_| Section64::SIZE))
            .sum();
        let symtab_size = if self.symbols.is_empty() {
            0
        } else {
            SymtabCommand::SIZE
        };
        let ncmds = self.segments.len() + usize::from(!self.symbols.is_empty());
        let sizeofcmds = seg_cmds_size + symtab_size;

        let header = MachHeader64 {
            ncmds: ncmds as u32,
            sizeofcmds: sizeofcmds as u32,
            ..Default::default()
        };

        let mut cmds = Vec::with_capacity(sizeofcmds);
        let mut payload = Vec::new();
        let data_start = align16(MachHeader64::SIZE + sizeofcmds);

        for pending in &self.segments {
            let fileoff = data_start + payload.len();

            let mut seg = SegmentCommand64::default();
            seg.set_name(&pending.name);
            seg.vmaddr = pending.vmaddr;
            seg.vmsize = pending.bytes.len() as u64;
            seg.fileoff = fileoff as u64;
            seg.filesize = pending.bytes.len() as u64;
            seg.maxprot = pending.prot.bits();
            seg.initprot = pending.prot.bits();
            if pending.section.is_some() {
                seg.nsects = 1;
                seg.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;
            }
            cmds.extend_from_slice(seg.as_bytes());

            if let Some(ref sectname) = pending.section {
                let mut sect = Section64::default();
                sect.set_names(&pending.name, sectname);
                sect.addr = pending.vmaddr;
                sect.size = pending.bytes.len() as u64;
                sect.offset = fileoff as u32;
                cmds.extend_from_slice(sect.as_bytes());
            }

            payload.extend_from_slice(&pending.bytes);
            payload.resize(align16(payload.len()), 0);
        }

        if !self.symbols.is_empty() {
            let symoff = data_start + payload.len();
            let stroff = symoff + self.symbols.len() * Nlist64::SIZE;

            let mut strtab = vec![0u8];
            let mut nlists = Vec::new();
            for (name, value) in &self.symbols {
                let entry = Nlist64 {
                    n_strx: strtab.len() as u32,
                    n_type: N_EXT | 0x0E,
                    n_sect: 1,
                    n_desc: 0,
                    n_value: *value,
                };
                nlists.extend_from_slice(entry.as_bytes());
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
            }

            let symtab = SymtabCommand {
                symoff: symoff as u32,
                nsyms: self.symbols.len() as u32,
                stroff: stroff as u32,
                strsize: strtab.len() as u32,
                ..Default::default()
            };
            cmds.extend_from_slice(symtab.as_bytes());
            payload.extend_from_slice(&nlists);
            payload.extend_from_slice(&strtab);
        }

        let mut image = Vec::with_capacity(data_start + payload.len());
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(&cmds);
        image.resize(data_start, 0);
        image.extend_from_slice(&payload);
        image
    }
}

fn align16(n: usize) -> usize {
    (n + 15) & !15
}
