//! Mach-O image metadata.
//!
//! Parsing proper is goblin's job; this module distils a parsed image into
//! the owned [`ImageInfo`] the loader works from: segment layout, rebase and
//! bind records, export tables, the entry point and the Objective-C method
//! metadata that feeds dynamic marshalling. Rebase opcodes are walked by
//! hand since goblin does not surface them.
//!
//! All addresses recorded here are unslid file vmaddrs; the loader applies
//! the slide when the image is placed.

use goblin::mach::cputype::CpuType;
use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE, MH_PIE};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::MachO;
use tracing::{debug, trace, warn};

use crate::Result;

pub use goblin::mach::cputype::CPU_TYPE_ARM;
pub use goblin::mach::header::MH_SPLIT_SEGS;

const REBASE_TYPE_POINTER: u8 = 1;

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub initprot: u32,
}

/// One pointer to slide, located by segment and offset within it.
#[derive(Debug, Clone)]
pub struct RebaseEntry {
    pub segment_index: usize,
    pub segment_offset: u64,
}

/// One external symbol reference to resolve at load time.
#[derive(Debug, Clone)]
pub struct BindEntry {
    pub symbol: String,
    pub dylib: String,
    /// Unslid vmaddr of the pointer slot to patch.
    pub address: u64,
    pub addend: i64,
    pub weak: bool,
    pub lazy: bool,
}

#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub name: String,
    /// Unslid vmaddr of the exported definition.
    pub address: u64,
}

/// Objective-C method implementation with its type encoding.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// Unslid vmaddr of the implementation.
    pub imp: u64,
    pub types: String,
}

/// Everything the loader needs from a parsed image, owned.
pub struct ImageInfo {
    pub cputype: CpuType,
    pub filetype: u32,
    pub flags: u32,
    /// Unslid vmaddr of the entry point, 0 when the image has none.
    pub entry: u64,
    pub segments: Vec<SegmentInfo>,
    pub rebases: Vec<RebaseEntry>,
    pub binds: Vec<BindEntry>,
    pub exports: Vec<ExportEntry>,
    pub dylibs: Vec<String>,
    pub methods: Vec<MethodInfo>,
}

impl ImageInfo {
    pub fn parse(data: &[u8]) -> Result<ImageInfo> {
        let macho = MachO::parse(data, 0)?;

        let mut segments = Vec::new();
        for seg in &macho.segments {
            segments.push(SegmentInfo {
                name: seg.name().unwrap_or("").to_string(),
                vmaddr: seg.vmaddr,
                vmsize: seg.vmsize,
                fileoff: seg.fileoff,
                filesize: seg.filesize,
                initprot: seg.initprot,
            });
        }

        // The segment that maps the file header is the image base the export
        // trie and the entry point are relative to.
        let header_base = segments
            .iter()
            .find(|s| s.fileoff == 0 && s.filesize > 0)
            .map(|s| s.vmaddr)
            .unwrap_or(0);

        let mut entry = 0;
        let mut rebases = Vec::new();
        for cmd in &macho.load_commands {
            match &cmd.command {
                CommandVariant::Main(main) => {
                    entry = vmaddr_for_fileoff(&segments, main.entryoff).unwrap_or(0);
                }
                CommandVariant::DyldInfo(info) | CommandVariant::DyldInfoOnly(info) => {
                    if info.rebase_size > 0 {
                        let start = info.rebase_off as usize;
                        let end = start + info.rebase_size as usize;
                        match data.get(start..end) {
                            Some(opcodes) => rebases = parse_rebase_info(opcodes),
                            None => warn!("rebase info lies outside the file"),
                        }
                    }
                }
                _ => {}
            }
        }

        let mut binds = Vec::new();
        match macho.imports() {
            Ok(imports) => {
                for import in imports {
                    binds.push(BindEntry {
                        symbol: import.name.to_string(),
                        dylib: import.dylib.to_string(),
                        address: import.address,
                        addend: import.addend,
                        weak: import.is_weak,
                        lazy: import.is_lazy,
                    });
                }
            }
            Err(err) => warn!("couldn't parse bind info: {}", err),
        }

        let mut exports = Vec::new();
        if let Ok(parsed) = macho.exports() {
            for export in parsed {
                exports.push(ExportEntry {
                    name: export.name,
                    address: header_base + export.offset,
                });
            }
        }
        // Symtab fallback: defined external symbols carry their vmaddr
        // directly.
        for sym in macho.symbols() {
            if let Ok((name, nlist)) = sym {
                const N_EXT: u8 = 0x01;
                const N_TYPE: u8 = 0x0e;
                const N_SECT: u8 = 0x0e;
                if nlist.n_type & N_EXT != 0
                    && nlist.n_type & N_TYPE == N_SECT
                    && !exports.iter().any(|e| e.name == name)
                {
                    exports.push(ExportEntry {
                        name: name.to_string(),
                        address: nlist.n_value,
                    });
                }
            }
        }

        // Skip the "self" placeholder goblin reports at ordinal zero.
        let dylibs: Vec<String> = macho
            .libs
            .iter()
            .copied()
            .filter(|&l| l != "self")
            .map(str::to_string)
            .collect();

        let methods = collect_methods(&macho, data, &segments);

        Ok(ImageInfo {
            cputype: macho.header.cputype,
            filetype: macho.header.filetype,
            flags: macho.header.flags,
            entry,
            segments,
            rebases,
            binds,
            exports,
            dylibs,
            methods,
        })
    }

    /// Whether the image may be loaded at an address other than its
    /// preferred one: dylibs and bundles always can, executables only when
    /// built position-independent.
    pub fn can_slide(&self) -> bool {
        self.filetype == MH_DYLIB
            || self.filetype == MH_BUNDLE
            || (self.filetype == MH_EXECUTE && self.flags & MH_PIE != 0)
    }
}

fn vmaddr_for_fileoff(segments: &[SegmentInfo], fileoff: u64) -> Option<u64> {
    segments
        .iter()
        .find(|s| s.filesize > 0 && fileoff >= s.fileoff && fileoff < s.fileoff + s.filesize)
        .map(|s| s.vmaddr + (fileoff - s.fileoff))
}

fn file_off(segments: &[SegmentInfo], vmaddr: u64) -> Option<usize> {
    segments
        .iter()
        .find(|s| s.filesize > 0 && vmaddr >= s.vmaddr && vmaddr < s.vmaddr + s.filesize)
        .map(|s| (s.fileoff + (vmaddr - s.vmaddr)) as usize)
}

pub(crate) fn read_uleb128(data: &[u8], mut pos: usize) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0;
    let start = pos;
    loop {
        let byte = *data.get(pos)?;
        value |= ((byte & 0x7f) as u64) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            return Some((value, pos - start));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

/// Walk the compressed rebase opcodes of LC_DYLD_INFO.
///
/// Only pointer rebases are meaningful for a 32-bit image; entries of other
/// types are dropped with a warning. Pointer slots are 4 bytes wide, so
/// every implicit advance steps by 4.
pub(crate) fn parse_rebase_info(data: &[u8]) -> Vec<RebaseEntry> {
    const PTR: u64 = 4;

    let mut rebases = Vec::new();
    let mut i = 0;

    let mut rebase_type = REBASE_TYPE_POINTER;
    let mut segment_index = 0usize;
    let mut segment_offset = 0u64;

    let mut push = |rebases: &mut Vec<RebaseEntry>, ty: u8, index: usize, offset: u64| {
        if ty == REBASE_TYPE_POINTER {
            rebases.push(RebaseEntry {
                segment_index: index,
                segment_offset: offset,
            });
        } else {
            warn!("unsupported relocation type {}", ty);
        }
    };

    while i < data.len() {
        let opcode = data[i];
        let immediate = opcode & 0x0f;
        let command = opcode & 0xf0;

        match command {
            0x00 => break, // REBASE_OPCODE_DONE
            0x10 => {
                // REBASE_OPCODE_SET_TYPE_IMM
                rebase_type = immediate;
            }
            0x20 => {
                // REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB
                segment_index = immediate as usize;
                match read_uleb128(data, i + 1) {
                    Some((offset, consumed)) => {
                        segment_offset = offset;
                        i += consumed;
                    }
                    None => {
                        warn!("truncated rebase segment offset");
                        break;
                    }
                }
            }
            0x30 => {
                // REBASE_OPCODE_ADD_ADDR_ULEB
                match read_uleb128(data, i + 1) {
                    Some((add, consumed)) => {
                        segment_offset = segment_offset.wrapping_add(add);
                        i += consumed;
                    }
                    None => {
                        warn!("truncated rebase address add");
                        break;
                    }
                }
            }
            0x40 => {
                // REBASE_OPCODE_ADD_ADDR_IMM_SCALED
                segment_offset = segment_offset.wrapping_add(immediate as u64 * PTR);
            }
            0x50 => {
                // REBASE_OPCODE_DO_REBASE_IMM_TIMES
                for _ in 0..immediate {
                    push(&mut rebases, rebase_type, segment_index, segment_offset);
                    segment_offset = segment_offset.wrapping_add(PTR);
                }
            }
            0x60 => {
                // REBASE_OPCODE_DO_REBASE_ULEB_TIMES
                match read_uleb128(data, i + 1) {
                    Some((count, consumed)) => {
                        for _ in 0..count {
                            push(&mut rebases, rebase_type, segment_index, segment_offset);
                            segment_offset = segment_offset.wrapping_add(PTR);
                        }
                        i += consumed;
                    }
                    None => {
                        warn!("truncated rebase count");
                        break;
                    }
                }
            }
            0x70 => {
                // REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB
                push(&mut rebases, rebase_type, segment_index, segment_offset);
                match read_uleb128(data, i + 1) {
                    Some((add, consumed)) => {
                        segment_offset = segment_offset.wrapping_add(add).wrapping_add(PTR);
                        i += consumed;
                    }
                    None => {
                        warn!("truncated rebase address add");
                        break;
                    }
                }
            }
            0x80 => {
                // REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB
                let Some((count, count_bytes)) = read_uleb128(data, i + 1) else {
                    warn!("truncated rebase count");
                    break;
                };
                let Some((skip, skip_bytes)) = read_uleb128(data, i + 1 + count_bytes) else {
                    warn!("truncated rebase skip");
                    break;
                };
                for _ in 0..count {
                    push(&mut rebases, rebase_type, segment_index, segment_offset);
                    segment_offset = segment_offset.wrapping_add(skip).wrapping_add(PTR);
                }
                i += count_bytes + skip_bytes;
            }
            _ => {
                warn!("unknown rebase opcode {:#04x}", opcode);
            }
        }
        i += 1;
    }

    debug!("parsed {} rebase entries", rebases.len());
    rebases
}

// 32-bit Objective-C ABI layouts, all fields one word wide.
const CLASS_DATA_OFFSET: u64 = 16; // class_t.data
const CLASS_RO_METHODS_OFFSET: u64 = 20; // class_ro_t.baseMethods
const METHOD_SIZE: u64 = 12; // method_t {name, types, imp}
const METHOD_LIST_HEADER: u64 = 8; // method_list_t {entsize, count}
const METHOD_LIST_RELATIVE_FLAG: u32 = 0x8000_0000;
const METHOD_COUNT_LIMIT: u32 = 0x4000;

/// Recover method implementations and their type encodings from the image's
/// Objective-C metadata: class list, each class's method list, and the same
/// for its metaclass. Malformed metadata ends the walk for that class only.
fn collect_methods(macho: &MachO, data: &[u8], segments: &[SegmentInfo]) -> Vec<MethodInfo> {
    let mut methods = Vec::new();

    let Some((addr, size)) = find_section(macho, "__objc_classlist") else {
        return methods;
    };

    for i in 0..(size / 4) {
        let Some(slot) = file_off(segments, addr + i * 4) else {
            break;
        };
        let Some(class) = read_u32(data, slot) else {
            break;
        };
        collect_class_methods(data, segments, class as u64, &mut methods);
        // Class methods live on the metaclass, reached through `isa`.
        if let Some(off) = file_off(segments, class as u64) {
            if let Some(meta) = read_u32(data, off) {
                collect_class_methods(data, segments, meta as u64, &mut methods);
            }
        }
    }

    debug!("collected {} method type entries", methods.len());
    methods
}

fn collect_class_methods(
    data: &[u8],
    segments: &[SegmentInfo],
    class: u64,
    methods: &mut Vec<MethodInfo>,
) {
    let Some(data_slot) = file_off(segments, class + CLASS_DATA_OFFSET) else {
        return;
    };
    let Some(ro) = read_u32(data, data_slot) else {
        return;
    };
    // The low bits of the data pointer are runtime flags.
    let ro = (ro & !3) as u64;

    let Some(list_slot) = file_off(segments, ro + CLASS_RO_METHODS_OFFSET) else {
        return;
    };
    let Some(list) = read_u32(data, list_slot) else {
        return;
    };
    if list == 0 {
        return;
    }

    let Some(header) = file_off(segments, list as u64) else {
        return;
    };
    let (Some(entsize), Some(count)) = (read_u32(data, header), read_u32(data, header + 4)) else {
        return;
    };
    if entsize & METHOD_LIST_RELATIVE_FLAG != 0 {
        warn!("relative method lists are not supported");
        return;
    }
    if entsize & 0xfffc != METHOD_SIZE as u32 || count > METHOD_COUNT_LIMIT {
        warn!("implausible method list at {:#x}", list);
        return;
    }

    for i in 0..count as u64 {
        let entry = list as u64 + METHOD_LIST_HEADER + i * METHOD_SIZE;
        let Some(off) = file_off(segments, entry) else {
            return;
        };
        let (Some(types_ptr), Some(imp)) = (read_u32(data, off + 4), read_u32(data, off + 8))
        else {
            return;
        };
        let Some(types_off) = file_off(segments, types_ptr as u64) else {
            continue;
        };
        let Some(types) = read_cstr(data, types_off) else {
            continue;
        };
        trace!("method type {:?} at {:#x}", types, imp);
        methods.push(MethodInfo {
            imp: imp as u64,
            types: types.to_string(),
        });
    }
}

fn find_section(macho: &MachO, name: &str) -> Option<(u64, u64)> {
    for seg in &macho.segments {
        let segname = seg.name().unwrap_or("");
        if segname != "__DATA" && segname != "__DATA_CONST" {
            continue;
        }
        if let Ok(sections) = seg.sections() {
            for (section, _) in sections {
                if section.name().unwrap_or("") == name {
                    return Some((section.addr, section.size));
                }
            }
        }
    }
    None
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let bytes = data.get(off..off + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_cstr(data: &[u8], off: usize) -> Option<&str> {
    let tail = data.get(off..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..len]).ok()
}
