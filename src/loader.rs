//! Dynamic loader.
//!
//! Resolves, maps, relocates and binds Mach-O images into the guest address
//! space and opens host-native modules next to them. The loader owns the
//! library index (resolved path -> record), the kernel sentinel page and the
//! aggregate method-type registry the hooks consult.
//!
//! Loading is idempotent per resolved path. Failures below the fatal
//! threshold are logged and reported as `None`; the caller decides whether
//! to continue.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, MAIN_SEPARATOR};
use std::rc::Rc;

use tracing::{debug, error, info};
use unicorn_engine::unicorn_const::Prot;

use crate::emu::{self, Emu, PAGE_SIZE};
use crate::host::{Host, HostModule, MACH_HEADER_SYMBOL};
use crate::image::{ImageInfo, CPU_TYPE_ARM, MH_SPLIT_SEGS};
use crate::{Error, Result};

const VM_PROT_READ: u32 = 0x1;
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

/// A binary path after resolution: `path` keys the library index,
/// `relative` records whether it names a file inside the installed package.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryPath {
    pub path: String,
    pub relative: bool,
}

/// Resolve a load request to an index key.
///
/// An install-rooted iOS path such as
/// `/System/Library/Frameworks/Foundation.framework/Foundation` redirects
/// into the generated wrapper tree as a package-relative path; anything else
/// is taken verbatim.
pub fn resolve_path(path: &str) -> BinaryPath {
    if let Some(rest) = path.strip_prefix('/') {
        let mut joined = format!("gen/{}", rest);
        if MAIN_SEPARATOR != '/' {
            joined = joined.replace('/', &MAIN_SEPARATOR.to_string());
        }
        return BinaryPath {
            path: joined,
            relative: true,
        };
    }
    BinaryPath {
        path: path.to_string(),
        relative: Path::new(path).is_relative(),
    }
}

fn is_wrapper_dll(bp: &BinaryPath) -> bool {
    let prefix = format!("gen{}", MAIN_SEPARATOR);
    bp.relative && bp.path.starts_with(&prefix) && bp.path.ends_with(".wrapper.dll")
}

/// Wrapper DLL path for the framework at `path`.
pub fn wrapper_path_for(path: &str) -> String {
    let base = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    format!("gen{}{}.wrapper.dll", MAIN_SEPARATOR, base)
}

/// An emulated Mach-O image placed in guest memory.
pub struct DylibImage {
    pub image: ImageInfo,
    /// Lowest unslid vmaddr across the image's segments.
    pub low_addr: u64,
    /// Difference between placed and preferred addresses.
    pub slide: i64,
}

/// A host-native module registered in the library index.
pub struct NativeModule {
    pub module: HostModule,
    /// The module exports `_mh_dylib_header` and poses as a Mach-O image
    /// starting at that symbol.
    pub macho_poser: bool,
}

pub enum LibraryKind {
    Dylib(DylibImage),
    Native(NativeModule),
}

/// One loaded image, emulated or host-native.
pub struct Library {
    pub kind: LibraryKind,
    /// Guest address of the first byte this library claims.
    pub start: u64,
    pub size: u64,
    /// Set when the resolved path matches the generated wrapper naming
    /// scheme; wrapper DLLs are dispatched directly instead of being routed
    /// through another wrapper.
    pub wrapper_dll: Cell<bool>,
}

impl Library {
    pub fn is_dylib(&self) -> bool {
        matches!(self.kind, LibraryKind::Dylib(_))
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

/// Result of an address lookup: the owning library and its index path.
pub struct AddrInfo {
    pub path: String,
    pub lib: Rc<Library>,
}

pub struct DynamicLoader {
    host: Box<dyn Host>,
    libs: HashMap<String, Rc<Library>>,
    /// Aggregate method-type registry over all emulated dylibs, keyed by
    /// slid guest address.
    method_types: BTreeMap<u64, String>,
    kernel_addr: u64,
}

impl DynamicLoader {
    /// Create the loader and map the kernel sentinel: one no-permission
    /// guest page whose address doubles as the distinguished return target
    /// for every emulation entry.
    pub fn new(uc: &mut Emu, host: Box<dyn Host>) -> Result<Self> {
        let kernel_addr = emu::alloc_low_block(PAGE_SIZE).ok_or(Error::GuestAlloc)?;
        emu::map_host(uc, kernel_addr, PAGE_SIZE, Prot::NONE);
        debug!("kernel sentinel at {:#x}", kernel_addr);
        Ok(Self {
            host,
            libs: HashMap::new(),
            method_types: BTreeMap::new(),
            kernel_addr,
        })
    }

    pub fn kernel_addr(&self) -> u64 {
        self.kernel_addr
    }

    pub fn library_count(&self) -> usize {
        self.libs.len()
    }

    /// Load `path`, idempotently keyed on its resolved form.
    pub fn load(&mut self, uc: &mut Emu, path: &str) -> Option<Rc<Library>> {
        let bp = resolve_path(path);

        if let Some(lib) = self.libs.get(&bp.path) {
            return Some(lib.clone());
        }

        let file = match self.host.locate(&bp.path, bp.relative) {
            Some(file) => file,
            None => {
                error!("invalid file: {}", bp.path);
                return None;
            }
        };

        info!("loading library {}", bp.path);

        let data = match std::fs::read(&file) {
            Ok(data) => data,
            Err(err) => {
                error!("couldn't read {}: {}", bp.path, err);
                return None;
            }
        };

        let lib = if is_macho(&data) {
            self.load_dylib(uc, &bp, &data)
        } else if is_host_module(&data) {
            self.load_host_module(uc, &bp, &file)
        } else {
            error!("invalid binary type: {}", bp.path);
            return None;
        };

        if let Some(ref lib) = lib {
            lib.wrapper_dll.set(is_wrapper_dll(&bp));
        }
        lib
    }

    /// Map, relocate and bind a Mach-O image.
    fn load_dylib(&mut self, uc: &mut Emu, bp: &BinaryPath, data: &[u8]) -> Option<Rc<Library>> {
        let image = match ImageInfo::parse(data) {
            Ok(image) => image,
            Err(err) => {
                error!("couldn't parse {}: {}", bp.path, err);
                return None;
            }
        };

        if image.cputype != CPU_TYPE_ARM {
            error!("expected ARM binary: {}", bp.path);
            return None;
        }
        if image.flags & MH_SPLIT_SEGS != 0 {
            error!("MH_SPLIT_SEGS not supported: {}", bp.path);
            return None;
        }
        if !image.can_slide() {
            error!("the binary is not slideable: {}", bp.path);
            return None;
        }

        // Mach-O segments must slide together: place the whole image as one
        // block spanning the union of the page-rounded segment ranges. Any
        // two ranges overlapping after rounding make the image unloadable.
        let mut ranges: Vec<(u64, u64)> = image
            .segments
            .iter()
            .map(|seg| (seg.vmaddr, emu::page_ceil(seg.vmaddr + seg.vmsize)))
            .collect();
        ranges.sort_unstable();
        if ranges.windows(2).any(|pair| pair[1].0 < pair[0].1) {
            error!("overlapping segments (after rounding to page size): {}", bp.path);
            return None;
        }
        let (Some(&(low, _)), Some(&(_, high))) = (ranges.first(), ranges.last()) else {
            error!("image has no segments: {}", bp.path);
            return None;
        };

        let size = high - low;
        let base = emu::alloc_low_block(size)?;
        let slide = base as i64 - low as i64;

        let record = Rc::new(Library {
            kind: LibraryKind::Dylib(DylibImage {
                image,
                low_addr: low,
                slide,
            }),
            start: base,
            size,
            wrapper_dll: Cell::new(false),
        });
        // Insert before recursing into dependencies so cyclic references
        // resolve against this record instead of re-entering the load.
        self.libs.insert(bp.path.clone(), record.clone());

        let (deps, binds) = {
            let LibraryKind::Dylib(ref dylib) = record.kind else {
                unreachable!()
            };

            if let Err(err) = map_and_rebase(uc, dylib, data) {
                error!("couldn't place {}: {}", bp.path, err);
                self.libs.remove(&bp.path);
                return None;
            }

            for method in &dylib.image.methods {
                self.method_types
                    .insert((method.imp as i64 + slide) as u64, method.types.clone());
            }

            (dylib.image.dylibs.clone(), dylib.image.binds.clone())
        };

        for dep in &deps {
            self.load(uc, dep);
        }

        self.resolve_bindings(uc, &record, slide, &binds);

        Some(record)
    }

    /// Resolve and write the image's external pointer slots. Individual
    /// failures skip the binding and continue.
    fn resolve_bindings(
        &mut self,
        uc: &mut Emu,
        record: &Rc<Library>,
        slide: i64,
        binds: &[crate::image::BindEntry],
    ) {
        for bind in binds {
            if bind.weak || bind.addend != 0 {
                error!("unsupported binding info for {}", bind.symbol);
                continue;
            }
            if bind.dylib.is_empty() || bind.dylib == "self" {
                error!("flat-namespace symbols are not supported yet: {}", bind.symbol);
                continue;
            }

            let dep = match self.load(uc, &bind.dylib) {
                Some(dep) => dep,
                None => {
                    error!("symbol's library couldn't be loaded: {}", bind.dylib);
                    continue;
                }
            };

            let addr = match self.find_symbol(&dep, &bind.symbol) {
                Some(addr) => addr,
                None => {
                    error!(
                        "external symbol {} from library {} couldn't be resolved",
                        bind.symbol, bind.dylib
                    );
                    continue;
                }
            };

            let target = (bind.address as i64 + slide) as u64;
            if !record.contains(target) {
                error!("binding target {:#x} out of range", target);
                continue;
            }
            unsafe {
                *(target as *mut u32) = addr as u32;
            }
        }
    }

    /// Register a host-native module and expose its range to the guest.
    fn load_host_module(
        &mut self,
        uc: &mut Emu,
        bp: &BinaryPath,
        file: &Path,
    ) -> Option<Rc<Library>> {
        let module = self.host.open_module(file)?;

        // Modules posing as dylibs start at their Mach-O header symbol; the
        // PE header in front of it stays out of the guest-visible range.
        let (start, size, poser) = match self.host.module_symbol(&module, MACH_HEADER_SYMBOL) {
            Some(hdr) => (hdr, module.size - (hdr - module.base), true),
            None => (module.base, module.size, false),
        };

        let record = Rc::new(Library {
            kind: LibraryKind::Native(NativeModule {
                module,
                macho_poser: poser,
            }),
            start,
            size,
            wrapper_dll: Cell::new(false),
        });
        self.libs.insert(bp.path.clone(), record.clone());

        // Read+write but never executable: every guest jump into the module
        // must fault so the translator can take over.
        let map_start = emu::page_floor(start);
        let map_size = emu::page_ceil(size);
        if map_start + map_size <= u32::MAX as u64 + 1 {
            emu::map_host(uc, map_start, map_size, Prot::READ | Prot::WRITE);
        } else {
            debug!(
                "module {} lies above the guest address space; host-callable only",
                bp.path
            );
        }

        Some(record)
    }

    /// Library containing `addr` and its index path, by linear scan.
    pub fn lookup(&self, addr: u64) -> Option<AddrInfo> {
        self.libs
            .iter()
            .find(|(_, lib)| lib.contains(addr))
            .map(|(path, lib)| AddrInfo {
                path: path.clone(),
                lib: lib.clone(),
            })
    }

    /// Library containing `addr`, without materialising the path. The code
    /// hook runs this per executed instruction.
    pub fn library_at(&self, addr: u64) -> Option<Rc<Library>> {
        self.libs
            .values()
            .find(|lib| lib.contains(addr))
            .cloned()
    }

    /// Guest (or host) address of `name` inside `lib`.
    pub fn find_symbol(&self, lib: &Library, name: &str) -> Option<u64> {
        match &lib.kind {
            LibraryKind::Dylib(dylib) => dylib
                .image
                .exports
                .iter()
                .find(|e| e.name == name)
                .map(|e| (e.address as i64 + dylib.slide) as u64),
            LibraryKind::Native(native) => self.host.module_symbol(&native.module, name),
        }
    }

    /// Method-type encoding registered for the guest address `addr`.
    pub fn method_type(&self, addr: u64) -> Option<&str> {
        self.method_types.get(&addr).map(String::as_str)
    }

    /// Register a method-type encoding for a guest address. The Objective-C
    /// runtime stub feeds additions discovered after load time through this.
    pub fn register_method_type(&mut self, addr: u64, types: impl Into<String>) {
        self.method_types.insert(addr, types.into());
    }
}

fn is_macho(data: &[u8]) -> bool {
    const MH_MAGIC: [u8; 4] = 0xfeedfaceu32.to_le_bytes();
    const MH_CIGAM: [u8; 4] = 0xfeedfaceu32.to_be_bytes();
    const FAT_MAGIC: [u8; 4] = 0xcafebabeu32.to_be_bytes();
    data.len() >= 4 && (data[..4] == MH_MAGIC || data[..4] == MH_CIGAM || data[..4] == FAT_MAGIC)
}

fn is_host_module(data: &[u8]) -> bool {
    data.starts_with(b"MZ") || data.starts_with(b"\x7fELF")
}

/// Copy the image's segments to their slid addresses, expose them to the
/// guest with their declared protections, and slide its interior pointers.
fn map_and_rebase(uc: &mut Emu, dylib: &DylibImage, data: &[u8]) -> Result<()> {
    let slide = dylib.slide;

    for seg in &dylib.image.segments {
        let vaddr = (seg.vmaddr as i64 + slide) as u64;
        let vsize = emu::page_ceil(seg.vmsize);
        if vsize == 0 {
            continue;
        }

        let prot = prot_from_vm(seg.initprot);
        if prot == Prot::NONE {
            // Inaccessible segments need no content.
            emu::map_host(uc, vaddr, vsize, prot);
            continue;
        }

        let start = seg.fileoff as usize;
        let end = start + seg.filesize as usize;
        let Some(content) = data.get(start..end) else {
            error!("segment {} lies outside the file", seg.name);
            continue;
        };
        unsafe {
            // The backing block is fresh anonymous memory, so bytes past the
            // file content are already zero-filled.
            std::ptr::copy_nonoverlapping(content.as_ptr(), vaddr as *mut u8, content.len());
        }
        emu::map_host(uc, vaddr, vsize, prot);
    }

    if slide != 0 {
        for rebase in &dylib.image.rebases {
            let Some(seg) = dylib.image.segments.get(rebase.segment_index) else {
                error!("rebase names segment {} which doesn't exist", rebase.segment_index);
                continue;
            };
            let seg_start = (seg.vmaddr as i64 + slide) as u64;
            let target = seg_start + rebase.segment_offset;
            if target < seg_start || target + 4 > seg_start + seg.vmsize {
                return Err(Error::RebaseOutOfRange(target));
            }
            unsafe {
                let ptr = target as *mut u32;
                // NULLs stay untouched: the zero page slid too, but sliding
                // stored null pointers would turn them into live addresses.
                if *ptr != 0 {
                    *ptr = (*ptr as i64 + slide) as u32;
                }
            }
        }
    }

    Ok(())
}

fn prot_from_vm(initprot: u32) -> Prot {
    let mut prot = Prot::NONE;
    if initprot & VM_PROT_READ != 0 {
        prot |= Prot::READ;
    }
    if initprot & VM_PROT_WRITE != 0 {
        prot |= Prot::WRITE;
    }
    if initprot & VM_PROT_EXECUTE != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_rooted_paths_resolve_into_the_wrapper_tree() {
        let bp = resolve_path("/System/Library/Frameworks/Foundation.framework/Foundation");
        assert!(bp.relative);
        assert!(bp.path.starts_with("gen"));
    }

    #[test]
    fn resolution_is_idempotent() {
        for input in [
            "/usr/lib/libobjc.A.dylib",
            "gen/libobjc.dll",
            "plain.dylib",
        ] {
            let once = resolve_path(input);
            let twice = resolve_path(&once.path);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn wrapper_dlls_are_recognised_by_name() {
        assert!(is_wrapper_dll(&resolve_path(&wrapper_path_for(
            "/System/Library/Frameworks/Foundation.framework/Foundation"
        ))));
        assert!(!is_wrapper_dll(&resolve_path("gen/Foundation.dll")));
        assert!(!is_wrapper_dll(&resolve_path("Foundation.wrapper.dll")));
    }

    #[test]
    fn wrapper_paths_use_the_framework_basename() {
        assert_eq!(
            wrapper_path_for("gen/libobjc.dll"),
            format!("gen{}libobjc.dll.wrapper.dll", MAIN_SEPARATOR)
        );
    }

    #[test]
    fn vm_protections_translate() {
        assert_eq!(prot_from_vm(0), Prot::NONE);
        assert_eq!(prot_from_vm(0x1), Prot::READ);
        assert_eq!(prot_from_vm(0x3), Prot::READ | Prot::WRITE);
        assert_eq!(prot_from_vm(0x5), Prot::READ | Prot::EXEC);
    }

    #[test]
    fn magic_dispatch() {
        assert!(is_macho(&0xfeedfaceu32.to_le_bytes()));
        assert!(is_host_module(b"MZ\x90\x00"));
        assert!(is_host_module(b"\x7fELF\x02"));
        assert!(!is_macho(b"\x7fELF"));
        assert!(!is_host_module(&0xfeedfaceu32.to_le_bytes()));
    }
}
