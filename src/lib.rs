//! Armature - a cross-ABI execution core for 32-bit ARM Mach-O binaries.
//!
//! Armature loads Mach-O dylibs and their dependencies into an emulated ARM
//! address space alongside host-native modules that impersonate iOS system
//! frameworks. Every control-flow transition between emulated code and host
//! code is trapped at a page-protection boundary, and call arguments are
//! marshalled across the two ABIs in both directions.
//!
//! # Modules
//!
//! - [`loader`] - Resolves, maps, relocates and binds Mach-O images; opens
//!   host modules next to them
//! - [`translator`] - The guest/host state machine: hooks, the kernel
//!   sentinel and the deferred-continuation driver loop
//! - [`marshal`] - Dynamic argument marshalling in both directions, plus
//!   trampoline synthesis for guest callbacks handed to host code
//! - [`typedec`] - Objective-C method-type decoding
//! - [`image`] - Mach-O metadata extraction
//! - [`host`] - Platform seam: file queries, native module loading, the
//!   wrapper-index ABI
//! - [`emu`] - Thin contract layer over the CPU emulator
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Loader-level problems
//! (bad files, unresolvable symbols) are logged and reported as `None` so a
//! single bad library doesn't tear down the session; emulator faults and
//! dispatch failures are typed errors returned from emulation entry.

pub mod emu;
pub mod host;
pub mod image;
pub mod loader;
pub mod marshal;
pub mod translator;
pub mod typedec;
pub mod vm;

use unicorn_engine::unicorn_const::uc_error;

/// Consolidated error type for all Armature operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mach-o parse error: {0}")]
    MachO(#[from] goblin::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("emulator error: {0:?}")]
    Emulator(uc_error),

    #[error("couldn't allocate guest-visible memory")]
    GuestAlloc,

    #[error("unmapped address {0:#x} fetched")]
    UnmappedFetch(u64),

    #[error("rebase target {0:#x} lies outside its segment")]
    RebaseOutOfRange(u64),

    #[error("kernel sentinel reached with no saved return address")]
    ReturnUnderflow,

    #[error("a continuation is already pending")]
    ContinuationPending,

    #[error("no callback metadata registered for {0:#x}")]
    CallbackMetadataMissing(u64),

    #[error("unsupported return type in method encoding {0:?}")]
    UnsupportedReturn(String),

    #[error("unsupported argument type in method encoding {0:?}")]
    UnsupportedArgument(String),

    #[error("malformed method type encoding {0:?}")]
    BadTypeEncoding(String),

    #[error("call has too many arguments ({0})")]
    ArityUnsupported(usize),

    #[error("couldn't load library {0}")]
    LibraryLoad(String),

    #[error("couldn't allocate call trampoline")]
    ClosureAlloc,
}

impl From<uc_error> for Error {
    fn from(err: uc_error) -> Self {
        Error::Emulator(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub use loader::{resolve_path, BinaryPath, DynamicLoader, Library};
pub use translator::Context;
pub use vm::Vm;
