//! Host-side collaborators.
//!
//! The loader depends on three platform services: file-existence queries for
//! (possibly package-relative) binary paths, the packaged-library loader for
//! host-native modules, and symbol lookup inside those modules. They sit
//! behind the [`Host`] trait so the execution core can also be exercised
//! against a synthetic host in tests.
//!
//! This module additionally defines the consumable ABI of the wrapper index
//! every generated wrapper DLL exports.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

/// Decorated name under which every wrapper DLL exports its index.
pub const WRAPPER_INDEX_SYMBOL: &str = "?Idx@@3UWrapperIndex@@A";

/// Export marking a host module that poses as a Mach-O image: the module's
/// guest-visible range starts at this symbol rather than at its real base.
pub const MACH_HEADER_SYMBOL: &str = "_mh_dylib_header";

/// A host-native module opened through the platform loader.
pub struct HostModule {
    pub handle: *mut c_void,
    /// Host address the module is loaded at.
    pub base: u64,
    /// Extent of the loaded image in bytes.
    pub size: u64,
}

/// Platform services the loader consumes.
pub trait Host {
    /// Resolve a binary path to a host filesystem path, or `None` when the
    /// file doesn't exist. `relative` paths name files inside the installed
    /// package; absolute paths are used verbatim.
    fn locate(&self, path: &str, relative: bool) -> Option<PathBuf>;

    /// Open a host-native module and report where it lies in memory.
    fn open_module(&self, path: &Path) -> Option<HostModule>;

    /// Address of `name` inside `module`, or `None`.
    fn module_symbol(&self, module: &HostModule, name: &str) -> Option<u64>;
}

/// [`Host`] backed by the platform's own dynamic loader, with package
/// lookups rooted at the install directory.
pub struct NativeHost {
    root: PathBuf,
}

impl NativeHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Host for NativeHost {
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
        let c_path = CString::new(path.to_str()?).ok()?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            error!("couldn't load host module {}", path.display());
            return None;
        }
        let (base, size) = match unsafe { module_extent(handle) } {
            Some(extent) => extent,
            None => {
                error!(
                    "couldn't determine load range of host module {}",
                    path.display()
                );
                return None;
            }
        };
        debug!(
            "host module {} at {:#x}, {:#x} bytes",
            path.display(),
            base,
            size
        );
        Some(HostModule { handle, base, size })
    }

    fn module_symbol(&self, module: &HostModule, name: &str) -> Option<u64> {
        let c_name = CString::new(name).ok()?;
        let sym = unsafe { libc::dlsym(module.handle, c_name.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(sym as u64)
        }
    }
}

/// Minimal prefix of the dynamic linker's `link_map` entry; only `l_addr`
/// is consumed.
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *const c_void,
    l_next: *const c_void,
    l_prev: *const c_void,
}

/// Base address and extent of a module opened with `dlopen`. The ELF header
/// of a shared object is mapped at its base, so the extent is the highest
/// PT_LOAD end found in its program headers.
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
unsafe fn module_extent(handle: *mut c_void) -> Option<(u64, u64)> {
    let mut map: *mut LinkMap = std::ptr::null_mut();
    if libc::dlinfo(
        handle,
        libc::RTLD_DI_LINKMAP,
        &mut map as *mut *mut LinkMap as *mut c_void,
    ) != 0
        || map.is_null()
    {
        return None;
    }
    let base = (*map).l_addr as u64;
    let ehdr = &*(base as *const libc::Elf64_Ehdr);
    let phdrs = std::slice::from_raw_parts(
        (base + ehdr.e_phoff) as *const libc::Elf64_Phdr,
        ehdr.e_phnum as usize,
    );
    let mut high = 0u64;
    for ph in phdrs {
        if ph.p_type == libc::PT_LOAD {
            high = high.max(ph.p_vaddr + ph.p_memsz);
        }
    }
    if high == 0 {
        return None;
    }
    Some((base, high))
}

#[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
unsafe fn module_extent(_handle: *mut c_void) -> Option<(u64, u64)> {
    None
}

/// Index exported by a wrapper DLL: maps relative virtual addresses inside
/// an impersonated framework to the wrapper dylib carrying the matching
/// alias symbol.
#[repr(C)]
pub struct WrapperIndex {
    pub entry_count: u32,
    pub entries: *const WrapperIndexEntry,
    pub dylib_count: u32,
    pub dylibs: *const *const c_char,
}

#[repr(C)]
pub struct WrapperIndexEntry {
    pub rva: u32,
    pub dylib: u32,
}

impl WrapperIndex {
    /// Name of the dylib owning the wrapper for `rva`, if the index has one.
    ///
    /// # Safety
    ///
    /// `self` must point into a live wrapper DLL whose entry and dylib
    /// tables are well-formed for the declared counts.
    pub unsafe fn lookup(&self, rva: u32) -> Option<&str> {
        let entries = std::slice::from_raw_parts(self.entries, self.entry_count as usize);
        let entry = entries.iter().find(|e| e.rva == rva)?;
        let dylibs = std::slice::from_raw_parts(self.dylibs, self.dylib_count as usize);
        let name = dylibs.get(entry.dylib as usize)?;
        CStr::from_ptr(*name).to_str().ok()
    }
}
