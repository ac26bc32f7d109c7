//! Shared fixtures: a synthetic 32-bit ARM Mach-O builder, a fake host and
//! a handful of hand-assembled guest instructions.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use armature::host::{Host, HostModule};

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;

pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_PIE: u32 = 0x0020_0000;

const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | 0x8000_0000;
const LC_MAIN: u32 = 0x28 | 0x8000_0000;

/// File offset the first segment's content is placed at; everything before
/// it is header and load commands.
pub const CODE_OFF: u32 = 0x400;

pub struct SegmentSpec {
    pub name: &'static str,
    pub vmaddr: u32,
    pub vmsize: u32,
    /// VM_PROT bits (1 read, 2 write, 4 execute).
    pub prot: u32,
    pub content: Vec<u8>,
}

#[derive(Default)]
pub struct ImageSpec {
    pub filetype: u32,
    pub flags: u32,
    /// First entry is the text segment; its content lands at [`CODE_OFF`]
    /// within the file (and so at `vmaddr + CODE_OFF` in memory).
    pub segments: Vec<SegmentSpec>,
    /// Entry point, as an offset into the first segment's content.
    pub entry_code_off: Option<u32>,
    /// Exported symbols as (name, vmaddr).
    pub symbols: Vec<(String, u32)>,
    /// Raw dyld rebase opcodes.
    pub rebase: Vec<u8>,
    /// Raw dyld bind opcodes.
    pub bind: Vec<u8>,
    /// Dependent library install names, ordinal order.
    pub dylibs: Vec<String>,
}

struct Buf(Vec<u8>);

impl Buf {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
    fn name16(&mut self, name: &str) {
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name.as_bytes());
        self.bytes(&field);
    }
    fn pad_to(&mut self, len: usize) {
        assert!(self.0.len() <= len, "fixture overflow");
        self.0.resize(len, 0);
    }
}

fn align4(v: usize) -> usize {
    (v + 3) & !3
}

/// Assemble a minimal 32-bit ARM Mach-O image in memory.
pub fn build_macho(spec: &ImageSpec) -> Vec<u8> {
    assert!(!spec.segments.is_empty());

    // Command sizes.
    let mut ncmds = spec.segments.len() as u32;
    let mut sizeofcmds = spec.segments.len() * 56;
    if spec.entry_code_off.is_some() {
        ncmds += 1;
        sizeofcmds += 24;
    }
    if !spec.symbols.is_empty() {
        ncmds += 1;
        sizeofcmds += 24;
    }
    if !spec.rebase.is_empty() || !spec.bind.is_empty() {
        ncmds += 1;
        sizeofcmds += 48;
    }
    let mut dylib_cmd_sizes = Vec::new();
    for dylib in &spec.dylibs {
        let size = align4(24 + dylib.len() + 1);
        dylib_cmd_sizes.push(size);
        ncmds += 1;
        sizeofcmds += size;
    }
    assert!(28 + sizeofcmds <= CODE_OFF as usize, "load commands overflow");

    // File layout.
    let text = &spec.segments[0];
    let text_filesize = CODE_OFF as usize + text.content.len();
    let mut pos = text_filesize;
    let mut file_offsets = vec![0usize];
    for seg in &spec.segments[1..] {
        pos = align4(pos);
        file_offsets.push(pos);
        pos += seg.content.len();
    }
    pos = align4(pos);
    let rebase_off = pos;
    pos += spec.rebase.len();
    pos = align4(pos);
    let bind_off = pos;
    pos += spec.bind.len();
    pos = align4(pos);
    let symoff = pos;
    pos += spec.symbols.len() * 12;
    let stroff = pos;
    let mut strtab = vec![0u8];
    let mut strx = Vec::new();
    for (name, _) in &spec.symbols {
        strx.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    // Header.
    let mut buf = Buf(Vec::new());
    buf.u32(MH_MAGIC);
    buf.u32(CPU_TYPE_ARM);
    buf.u32(CPU_SUBTYPE_ARM_V7);
    buf.u32(spec.filetype);
    buf.u32(ncmds);
    buf.u32(sizeofcmds as u32);
    buf.u32(spec.flags);

    // Segments.
    for (i, seg) in spec.segments.iter().enumerate() {
        let filesize = if i == 0 {
            text_filesize
        } else {
            seg.content.len()
        };
        assert!(seg.vmsize as usize >= filesize, "segment vmsize too small");
        buf.u32(LC_SEGMENT);
        buf.u32(56);
        buf.name16(seg.name);
        buf.u32(seg.vmaddr);
        buf.u32(seg.vmsize);
        buf.u32(file_offsets[i] as u32);
        buf.u32(filesize as u32);
        buf.u32(seg.prot);
        buf.u32(seg.prot);
        buf.u32(0); // nsects
        buf.u32(0); // flags
    }

    if let Some(entry) = spec.entry_code_off {
        buf.u32(LC_MAIN);
        buf.u32(24);
        buf.u64((CODE_OFF + entry) as u64);
        buf.u64(0);
    }

    if !spec.symbols.is_empty() {
        buf.u32(LC_SYMTAB);
        buf.u32(24);
        buf.u32(symoff as u32);
        buf.u32(spec.symbols.len() as u32);
        buf.u32(stroff as u32);
        buf.u32(strtab.len() as u32);
    }

    if !spec.rebase.is_empty() || !spec.bind.is_empty() {
        buf.u32(LC_DYLD_INFO_ONLY);
        buf.u32(48);
        buf.u32(if spec.rebase.is_empty() { 0 } else { rebase_off as u32 });
        buf.u32(spec.rebase.len() as u32);
        buf.u32(if spec.bind.is_empty() { 0 } else { bind_off as u32 });
        buf.u32(spec.bind.len() as u32);
        buf.u32(0); // weak_bind_off
        buf.u32(0);
        buf.u32(0); // lazy_bind_off
        buf.u32(0);
        buf.u32(0); // export_off
        buf.u32(0);
    }

    for (dylib, size) in spec.dylibs.iter().zip(&dylib_cmd_sizes) {
        let start = buf.0.len();
        buf.u32(LC_LOAD_DYLIB);
        buf.u32(*size as u32);
        buf.u32(24); // name offset
        buf.u32(2); // timestamp
        buf.u32(0); // current version
        buf.u32(0); // compatibility version
        buf.bytes(dylib.as_bytes());
        buf.u8(0);
        buf.pad_to(start + size);
    }

    // Content regions.
    buf.pad_to(CODE_OFF as usize);
    buf.bytes(&text.content);
    for (seg, off) in spec.segments[1..].iter().zip(&file_offsets[1..]) {
        buf.pad_to(*off);
        buf.bytes(&seg.content);
    }
    buf.pad_to(rebase_off);
    buf.bytes(&spec.rebase);
    buf.pad_to(bind_off);
    buf.bytes(&spec.bind);
    buf.pad_to(symoff);
    for ((_, vmaddr), strx) in spec.symbols.iter().zip(&strx) {
        buf.u32(*strx);
        buf.u8(0x0f); // N_SECT | N_EXT
        buf.u8(1);
        buf.u16(0);
        buf.u32(*vmaddr);
    }
    buf.pad_to(stroff);
    buf.bytes(&strtab);

    buf.0
}

pub fn uleb(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Rebase opcodes: pointer runs of `count` slots at (`segment`, `offset`).
pub fn rebase_program(runs: &[(u8, u64, u8)]) -> Vec<u8> {
    let mut v = vec![0x11]; // SET_TYPE_IMM pointer
    for &(segment, offset, count) in runs {
        v.push(0x20 | segment); // SET_SEGMENT_AND_OFFSET_ULEB
        v.extend(uleb(offset));
        v.push(0x50 | count); // DO_REBASE_IMM_TIMES
    }
    v.push(0x00); // DONE
    v
}

/// Bind opcodes: one pointer bind of `symbol` from library `ordinal` at
/// (`segment`, `offset`).
pub fn bind_program(ordinal: u8, symbol: &str, segment: u8, offset: u64) -> Vec<u8> {
    let mut v = vec![0x10 | ordinal]; // SET_DYLIB_ORDINAL_IMM
    v.push(0x40); // SET_SYMBOL_TRAILING_FLAGS_IMM, flags 0
    v.extend_from_slice(symbol.as_bytes());
    v.push(0);
    v.push(0x51); // SET_TYPE_IMM pointer
    v.push(0x70 | segment); // SET_SEGMENT_AND_OFFSET_ULEB
    v.extend(uleb(offset));
    v.push(0x90); // DO_BIND
    v.push(0x00); // DONE
    v
}

// Hand-assembled ARM (A32, little-endian when emitted).
pub const BX_LR: u32 = 0xe12f_ff1e;
pub const PUSH_LR: u32 = 0xe92d_4000;
pub const POP_PC: u32 = 0xe8bd_8000;
pub const BLX_R2: u32 = 0xe12f_ff32;
pub const ADD_R0_R0_R1: u32 = 0xe080_0001;
pub const STR_R1_AT_R2: u32 = 0xe582_1000;

pub fn mov_r0_imm(imm: u8) -> u32 {
    0xe3a0_0000 | imm as u32
}

/// `LDR r<rd>, [PC, #imm]`
pub fn ldr_pc_rel(rd: u8, imm: u16) -> u32 {
    0xe59f_0000 | ((rd as u32) << 12) | imm as u32
}

pub fn asm(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A host module fabricated for tests: a declared range plus a symbol table.
#[derive(Clone)]
pub struct FakeModule {
    pub base: u64,
    pub size: u64,
    pub symbols: HashMap<String, u64>,
}

impl FakeModule {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            symbols: HashMap::new(),
        }
    }

    pub fn symbol(mut self, name: &str, addr: u64) -> Self {
        self.symbols.insert(name.to_string(), addr);
        self
    }
}

/// [`Host`] over a temp directory of fixture files and a table of fabricated
/// modules keyed by file name.
pub struct FakeHost {
    pub root: PathBuf,
    pub modules: RefCell<HashMap<String, FakeModule>>,
}

impl FakeHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modules: RefCell::new(HashMap::new()),
        }
    }

    /// Register a fabricated module and create its placeholder file so the
    /// loader's existence check and magic sniff succeed.
    pub fn add_module(&self, rel_path: &str, module: FakeModule) {
        let name = Path::new(rel_path)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        write_file(&self.root, rel_path, b"MZ fake module");
        self.modules.borrow_mut().insert(name, module);
    }
}

impl Host for FakeHost {
    fn locate(&self, path: &str, relative: bool) -> Option<PathBuf> {
        let full = if relative {
            self.root.join(path)
        } else {
            PathBuf::from(path)
        };
        if full.is_file() {
            Some(full)
        } else {
            None
        }
    }

    fn open_module(&self, path: &Path) -> Option<HostModule> {
        let name = path.file_name()?.to_str()?;
        let modules = self.modules.borrow();
        let module = modules.get(name)?;
        Some(HostModule {
            handle: std::ptr::null_mut(),
            base: module.base,
            size: module.size,
        })
    }

    fn module_symbol(&self, module: &HostModule, name: &str) -> Option<u64> {
        let modules = self.modules.borrow();
        let fake = modules.values().find(|m| m.base == module.base)?;
        fake.symbols.get(name).copied()
    }
}

pub fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let full = root.join(rel);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, data).unwrap();
}

/// A dylib image that is nothing but code at `vmaddr 0`, text segment
/// protection r-x.
pub fn code_only_dylib(code: &[u32]) -> Vec<u8> {
    build_macho(&ImageSpec {
        filetype: MH_DYLIB,
        flags: 0,
        segments: vec![SegmentSpec {
            name: "__TEXT",
            vmaddr: 0,
            vmsize: 0x1000,
            prot: 0x5,
            content: asm(code),
        }],
        ..Default::default()
    })
}
