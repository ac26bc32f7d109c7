//! Cross-ABI call marshalling.
//!
//! Three mechanisms cross the guest/host boundary:
//!
//! - [`DynamicCaller`] replays a guest AAPCS32 call as a host call, word by
//!   word, when no generated wrapper exists but the method's type encoding
//!   is known.
//! - [`call_back`] plays a host-initiated call into guest argument registers
//!   and enters emulation (or calls straight through when the target turns
//!   out to be host-native).
//! - [`translate`] synthesises a host-callable closure for a guest function
//!   pointer about to escape into native code.

use std::os::raw::c_void;
use std::rc::Rc;

use libffi::low::{closure_alloc, ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_type, prep_cif, prep_closure, types};
use libffi::raw::ffi_arg;
use tracing::{debug, error};
use unicorn_engine::RegisterARM;

use crate::emu::{self, Emu, ARG_REGS};
use crate::translator::{self, Context};
use crate::typedec::TypeDecoder;
use crate::vm;
use crate::{Error, Result};

#[cfg(all(windows, target_arch = "x86"))]
const CLOSURE_ABI: libffi::raw::ffi_abi = libffi::raw::ffi_abi_FFI_MS_CDECL;
#[cfg(not(all(windows, target_arch = "x86")))]
const CLOSURE_ABI: libffi::raw::ffi_abi = ffi_abi_FFI_DEFAULT_ABI;

/// Replays a guest call onto the host ABI.
///
/// Words are harvested in AAPCS32 order - R0..R3 first, then the stack in
/// 4-byte slots - and dispatched as one host call once the signature has
/// been fully decoded.
pub struct DynamicCaller {
    args: Vec<u32>,
}

impl DynamicCaller {
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    pub fn arg_words(&self) -> &[u32] {
        &self.args
    }

    /// Harvest the words of one argument of `size` bytes (a multiple of 4).
    pub fn load_arg(&mut self, uc: &mut Emu, size: usize) -> Result<()> {
        for _ in (0..size).step_by(4) {
            let index = self.args.len();
            let word = if index < ARG_REGS.len() {
                emu::reg32(uc, ARG_REGS[index])?
            } else {
                let sp = emu::reg32(uc, RegisterARM::SP)?;
                let slot = sp as u64 + ((index - ARG_REGS.len()) as u64) * 4;
                // Guest addresses are host pointers; the stack slot can be
                // read directly.
                unsafe { *(slot as *const u32) }
            };
            self.args.push(word);
        }
        Ok(())
    }

    /// Dispatch the staged words as a host call and write a 32-bit result
    /// back to guest R0 when the signature returns one.
    pub fn call(&self, uc: &mut Emu, returns: bool, addr: u64) -> Result<()> {
        let ret = unsafe { host_call(addr, &self.args, returns)? };
        if returns {
            emu::set_reg32(uc, RegisterARM::R0, ret)?;
        }
        Ok(())
    }
}

impl Default for DynamicCaller {
    fn default() -> Self {
        Self::new()
    }
}

/// Reinterpret `addr` as an `extern "C"` function taking `words.len()`
/// 32-bit arguments and call it. Every arity is a distinct compile-time call
/// shape so the slot width and order match the host ABI exactly; more than
/// six words is unsupported.
///
/// # Safety
///
/// `addr` must be a callable host function matching the described shape.
pub(crate) unsafe fn host_call(addr: u64, words: &[u32], returns: bool) -> Result<u32> {
    use std::mem::transmute;

    let p = addr as usize;
    let a = words;
    if returns {
        Ok(match a.len() {
            0 => transmute::<usize, extern "C" fn() -> u32>(p)(),
            1 => transmute::<usize, extern "C" fn(u32) -> u32>(p)(a[0]),
            2 => transmute::<usize, extern "C" fn(u32, u32) -> u32>(p)(a[0], a[1]),
            3 => transmute::<usize, extern "C" fn(u32, u32, u32) -> u32>(p)(a[0], a[1], a[2]),
            4 => transmute::<usize, extern "C" fn(u32, u32, u32, u32) -> u32>(p)(
                a[0], a[1], a[2], a[3],
            ),
            5 => transmute::<usize, extern "C" fn(u32, u32, u32, u32, u32) -> u32>(p)(
                a[0], a[1], a[2], a[3], a[4],
            ),
            6 => transmute::<usize, extern "C" fn(u32, u32, u32, u32, u32, u32) -> u32>(p)(
                a[0], a[1], a[2], a[3], a[4], a[5],
            ),
            n => return Err(Error::ArityUnsupported(n)),
        })
    } else {
        match a.len() {
            0 => transmute::<usize, extern "C" fn()>(p)(),
            1 => transmute::<usize, extern "C" fn(u32)>(p)(a[0]),
            2 => transmute::<usize, extern "C" fn(u32, u32)>(p)(a[0], a[1]),
            3 => transmute::<usize, extern "C" fn(u32, u32, u32)>(p)(a[0], a[1], a[2]),
            4 => transmute::<usize, extern "C" fn(u32, u32, u32, u32)>(p)(a[0], a[1], a[2], a[3]),
            5 => transmute::<usize, extern "C" fn(u32, u32, u32, u32, u32)>(p)(
                a[0], a[1], a[2], a[3], a[4],
            ),
            6 => transmute::<usize, extern "C" fn(u32, u32, u32, u32, u32, u32)>(p)(
                a[0], a[1], a[2], a[3], a[4], a[5],
            ),
            n => return Err(Error::ArityUnsupported(n)),
        }
        Ok(0)
    }
}

/// Call `fp` with up to four word-sized arguments.
///
/// Host-native targets are called directly; targets inside an emulated dylib
/// receive their arguments in R0..R3 and run under emulation. AAPCS32 has no
/// fifth argument register, so larger arities are rejected at compile time.
pub fn call_back<const N: usize>(
    ctx: &Rc<Context>,
    uc: &mut Emu,
    fp: u64,
    args: [u32; N],
) -> Result<()> {
    const {
        assert!(N <= 4, "callback has too many arguments");
    }

    let emulated = ctx
        .loader
        .borrow()
        .library_at(fp)
        .map(|lib| lib.is_dylib())
        .unwrap_or(false);

    if !emulated {
        unsafe {
            host_call(fp, &args, false)?;
        }
        return Ok(());
    }

    for (reg, arg) in ARG_REGS.iter().zip(args.iter()) {
        emu::set_reg32(uc, *reg, *arg)?;
    }
    translator::execute(ctx, uc, fp)
}

/// [`call_back`], then fetch the call's result from R0.
pub fn call_back_r<const N: usize>(
    ctx: &Rc<Context>,
    uc: &mut Emu,
    fp: u64,
    args: [u32; N],
) -> Result<u32> {
    call_back(ctx, uc, fp, args)?;
    emu::reg32(uc, RegisterARM::R0)
}

/// One synthesised host-callable entry into guest code.
///
/// Leaked on creation together with its closure: host code may hold the
/// pointer for the rest of the process, and there is no retirement protocol
/// to know when it lets go.
struct Trampoline {
    cif: ffi_cif,
    arg_types: [*mut ffi_type; 4],
    returns: bool,
    argc: usize,
    addr: u64,
}

unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut ffi_arg,
    args: *const *const c_void,
    tr: &Trampoline,
) {
    debug!(
        "handling trampoline into {:#x} (arguments: {}, returns: {})",
        tr.addr, tr.argc, tr.returns
    );

    let vm = &mut *vm::current();
    let (uc, ctx) = vm.parts();

    for i in 0..tr.argc {
        let word = *(*args.add(i) as *const u32);
        if let Err(err) = emu::set_reg32(uc, ARG_REGS[i], word) {
            error!("couldn't stage trampoline argument: {}", err);
            return;
        }
    }

    if let Err(err) = translator::execute(ctx, uc, tr.addr) {
        error!("trampoline execution failed: {}", err);
        return;
    }

    if tr.returns {
        match emu::reg32(uc, RegisterARM::R0) {
            Ok(value) => *result = value as ffi_arg,
            Err(err) => error!("couldn't fetch trampoline result: {}", err),
        }
    }
}

/// Rewrite a pointer about to cross into host code.
///
/// Pointers outside every emulated dylib pass through unchanged. A pointer
/// into guest code gets a freshly allocated closure whose invocation writes
/// the incoming words to R0.., re-enters emulation at the original address
/// and propagates R0 back; the method-type registry supplies the signature.
pub fn translate(ctx: &Rc<Context>, ptr: u64) -> Result<u64> {
    let ty = {
        let loader = ctx.loader.borrow();
        let Some(lib) = loader.library_at(ptr) else {
            return Ok(ptr);
        };
        if !lib.is_dylib() {
            return Ok(ptr);
        }
        match loader.method_type(ptr) {
            Some(ty) => ty.to_owned(),
            None => {
                error!("callback metadata missing for {:#x}", ptr);
                return Err(Error::CallbackMetadataMissing(ptr));
            }
        }
    };

    debug!("dynamically handling callback of type {}", ty);

    let mut td = TypeDecoder::new(&ty);
    let returns = match td.next_size() {
        Some(0) => false,
        Some(4) => true,
        _ => {
            error!("unsupported return type of callback");
            return Err(Error::UnsupportedReturn(ty));
        }
    };

    let mut argc = 0usize;
    while td.has_next() {
        match td.next_size() {
            Some(4) if argc < 4 => argc += 1,
            Some(4) => {
                error!("callback has too many arguments");
                return Err(Error::ArityUnsupported(argc + 1));
            }
            Some(_) => {
                error!("unsupported callback argument type");
                return Err(Error::UnsupportedArgument(ty));
            }
            None => return Err(Error::BadTypeEncoding(ty)),
        }
    }

    unsafe {
        let (closure, code) = closure_alloc();
        if closure.is_null() {
            error!("couldn't allocate closure");
            return Err(Error::ClosureAlloc);
        }

        // The record backs the closure for the rest of the process; it is
        // never reclaimed.
        let tr = Box::into_raw(Box::new(Trampoline {
            cif: std::mem::zeroed(),
            arg_types: [std::ptr::addr_of_mut!(types::uint32); 4],
            returns,
            argc,
            addr: ptr,
        }));

        let rtype: *mut ffi_type = if returns {
            std::ptr::addr_of_mut!(types::uint32)
        } else {
            std::ptr::addr_of_mut!(types::void)
        };

        if prep_cif(
            &mut (*tr).cif,
            CLOSURE_ABI,
            argc,
            rtype,
            (*tr).arg_types.as_mut_ptr(),
        )
        .is_err()
        {
            error!("couldn't prepare CIF");
            return Err(Error::ClosureAlloc);
        }
        if prep_closure(
            closure,
            &mut (*tr).cif,
            trampoline_entry,
            tr as *const Trampoline,
            code,
        )
        .is_err()
        {
            error!("couldn't prepare closure");
            return Err(Error::ClosureAlloc);
        }

        Ok(code.0 as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn sum3(a: u32, b: u32, c: u32) -> u32 {
        a.wrapping_add(b).wrapping_add(c)
    }

    #[test]
    fn host_calls_dispatch_by_arity() {
        let addr = sum3 as usize as u64;
        let ret = unsafe { host_call(addr, &[1, 2, 3], true) }.unwrap();
        assert_eq!(ret, 6);
    }

    #[test]
    fn arity_overflow_is_rejected() {
        let err = unsafe { host_call(0, &[0; 7], true) }.unwrap_err();
        assert!(matches!(err, Error::ArityUnsupported(7)));
        let err = unsafe { host_call(0, &[0; 7], false) }.unwrap_err();
        assert!(matches!(err, Error::ArityUnsupported(7)));
    }
}
