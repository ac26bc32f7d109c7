//! The guest/host state machine.
//!
//! Host modules are mapped into the guest without EXEC, so every transition
//! from emulated code into host code surfaces as a fetch-protection fault.
//! The hooks here classify the faulting address - kernel sentinel, wrapper
//! DLL, wrapped framework, or dynamically-marshalled method - and decide how
//! the call crosses the boundary.
//!
//! The emulator cannot be re-entered from inside one of its own hooks. Any
//! hook action that may itself need emulation is therefore deferred: the
//! hook stops the emulator, parks a continuation, and the driver loop in
//! [`execute`] runs it once the current start has unwound, restarting
//! afterwards at the guest's link register.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, trace};
use unicorn_engine::unicorn_const::{HookType, Prot};
use unicorn_engine::RegisterARM;

use crate::emu::{self, Emu};
use crate::host::{WrapperIndex, WRAPPER_INDEX_SYMBOL};
use crate::loader::{wrapper_path_for, DynamicLoader, Library, LibraryKind};
use crate::marshal::{self, DynamicCaller};
use crate::typedec::TypeDecoder;
use crate::{Error, Result};

/// Deferred host work, run between emulator invocations.
pub type Continuation = Box<dyn FnOnce(&mut Emu, &Rc<Context>) -> Result<()>>;

/// Shared state both worlds reach through. Hook callbacks and the driver
/// each hold an `Rc`; neither the loader nor the translator owns the other.
pub struct Context {
    pub loader: RefCell<DynamicLoader>,
    pub state: RefCell<Translator>,
}

/// Execution flags and the return-address stack.
///
/// `running` is a mutex on the emulator: at most one invocation is ever
/// active. `pending` holds at most one deferred thunk, and `restart` asks
/// the driver to resume at the guest's link register after running it.
pub struct Translator {
    lrs: Vec<u32>,
    running: bool,
    restart: bool,
    pending: Option<Continuation>,
}

impl Translator {
    pub fn new() -> Self {
        Self {
            lrs: Vec::new(),
            running: false,
            restart: false,
            pending: None,
        }
    }

    /// Number of emulation entries that have not yet returned.
    pub fn depth(&self) -> usize {
        self.lrs.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop the saved link register and stop the emulator: the guest returned to
/// the kernel sentinel, so the innermost emulation entry is complete.
fn return_to_kernel(ctx: &Rc<Context>, uc: &mut Emu) -> Result<()> {
    let lr = {
        let mut state = ctx.state.borrow_mut();
        let lr = state.lrs.pop().ok_or(Error::ReturnUnderflow)?;
        state.running = false;
        lr
    };
    emu::set_reg32(uc, RegisterARM::LR, lr)?;
    uc.emu_stop()?;
    Ok(())
}

/// Ask the driver to restart emulation once the pending continuation has
/// run. The resume address is re-read from the guest's link register.
pub fn return_to_emulation(ctx: &Rc<Context>) {
    let mut state = ctx.state.borrow_mut();
    debug_assert!(!state.running);
    state.restart = true;
}

/// Park `cont` to run after the current emulator invocation unwinds.
///
/// Only one continuation may be pending at a time; a second request before
/// the driver has drained the first is a contract violation.
pub fn continue_outside_emulation(ctx: &Rc<Context>, uc: &mut Emu, cont: Continuation) -> Result<()> {
    {
        let mut state = ctx.state.borrow_mut();
        if state.pending.is_some() {
            return Err(Error::ContinuationPending);
        }
        state.pending = Some(cont);
        state.running = false;
    }
    uc.emu_stop()?;
    Ok(())
}

/// Run guest code at `addr` until it returns to the kernel sentinel.
///
/// The caller's link register is saved and redirected at the sentinel; the
/// loop below is the only place the emulator is started. Hooks never start
/// it - they park work here instead.
pub fn execute(ctx: &Rc<Context>, uc: &mut Emu, mut addr: u64) -> Result<()> {
    debug!("starting emulation at {:#x}", addr);

    let kernel = ctx.loader.borrow().kernel_addr();
    {
        let lr = emu::reg32(uc, RegisterARM::LR)?;
        ctx.state.borrow_mut().lrs.push(lr);
    }
    emu::set_reg32(uc, RegisterARM::LR, kernel as u32)?;

    loop {
        ctx.state.borrow_mut().running = true;
        if let Err(err) = uc.emu_start(addr, 0, 0, 0) {
            ctx.state.borrow_mut().running = false;
            let pc = emu::reg32(uc, RegisterARM::PC).unwrap_or(0);
            error!("emulator fault {:?} at {:#x}", err, pc);
            return Err(Error::Emulator(err));
        }
        debug_assert!(
            !ctx.state.borrow().running,
            "emulator stopped without clearing the running flag"
        );

        let pending = ctx.state.borrow_mut().pending.take();
        if let Some(cont) = pending {
            cont(uc, ctx)?;
        }

        let restart = {
            let mut state = ctx.state.borrow_mut();
            std::mem::take(&mut state.restart)
        };
        if restart {
            // Continue where the guest left off.
            addr = emu::reg32(uc, RegisterARM::LR)? as u64;
        } else {
            break;
        }
    }

    Ok(())
}

/// Execute a loaded program image.
///
/// Sets up the guest stack, installs the boundary hooks, runs the dynamic
/// linker and Objective-C runtime initialisers, then enters the image's
/// entry point.
pub fn execute_image(ctx: &Rc<Context>, uc: &mut Emu, lib: &Rc<Library>) -> Result<()> {
    let LibraryKind::Dylib(ref dylib) = lib.kind else {
        error!("only emulated images can be executed");
        return Err(Error::LibraryLoad("not an emulated image".into()));
    };

    // 8 MiB guest stack. The top 12 bytes stay reserved as a read window for
    // the instruction logger.
    const STACK_SIZE: u64 = 8 * 1024 * 1024;
    let stack = emu::alloc_low_block(STACK_SIZE).ok_or(Error::GuestAlloc)?;
    emu::map_host(uc, stack, STACK_SIZE, Prot::READ | Prot::WRITE);
    emu::set_reg32(uc, RegisterARM::SP, (stack + STACK_SIZE - 12) as u32)?;

    install_hooks(ctx, uc)?;

    // Simulate the dyld initialiser: hand the executable's header to the
    // dynamic-linker stub, then bring up the Objective-C runtime.
    let hdr = ctx.loader.borrow().find_symbol(lib, "__mh_execute_header");
    match hdr {
        Some(hdr) => call_stub(ctx, uc, "libdyld.dll", "_dyld_initialize", &[hdr as u32])?,
        None => error!("executable has no __mh_execute_header symbol"),
    }
    call_stub(ctx, uc, "libobjc.dll", "_objc_init", &[])?;

    let entry = (dylib.image.entry as i64 + dylib.slide) as u64;
    execute(ctx, uc, entry)
}

/// Call an exported function of a host stub library directly on the host.
fn call_stub(ctx: &Rc<Context>, uc: &mut Emu, lib: &str, func: &str, args: &[u32]) -> Result<()> {
    let module = ctx.loader.borrow_mut().load(uc, lib);
    let Some(module) = module else {
        error!("runtime stub {} is unavailable", lib);
        return Ok(());
    };
    let Some(addr) = ctx.loader.borrow().find_symbol(&module, func) else {
        error!("runtime stub {} doesn't export {}", lib, func);
        return Ok(());
    };
    unsafe {
        marshal::host_call(addr, args, false)?;
    }
    Ok(())
}

/// Install the boundary hooks on the emulator.
pub fn install_hooks(ctx: &Rc<Context>, uc: &mut Emu) -> Result<()> {
    // Calls across the boundary surface as fetch-protection faults because
    // host modules are mapped non-executable.
    let fetch_ctx = ctx.clone();
    uc.add_mem_hook(HookType::MEM_FETCH_PROT, 1, 0, move |uc, _ty, addr, _size, _value| {
        handle_fetch_prot(&fetch_ctx, uc, addr)
    })?;

    // The emulator has been seen to miss fetch-protection faults; the code
    // hook re-checks every executed address so none slip through.
    let code_ctx = ctx.clone();
    uc.add_code_hook(1, 0, move |uc, addr, _size| {
        handle_code(&code_ctx, uc, addr);
    })?;

    uc.add_mem_hook(HookType::MEM_WRITE, 1, 0, |_uc, _ty, addr, size, value| {
        trace!("writing [{:#x}] := {:#x} ({})", addr, value, size);
        true
    })?;

    // The guest heap and foreign host objects live outside any mapped
    // image; reads and writes there get their page mapped on demand.
    let unmapped_ctx = ctx.clone();
    uc.add_mem_hook(
        HookType::MEM_READ_UNMAPPED | HookType::MEM_WRITE_UNMAPPED,
        1,
        0,
        move |uc, _ty, addr, size, _value| handle_mem_unmapped(&unmapped_ctx, uc, addr, size),
    )?;

    Ok(())
}

fn handle_fetch_prot(ctx: &Rc<Context>, uc: &mut Emu, addr: u64) -> bool {
    match fetch_prot_inner(ctx, uc, addr) {
        Ok(handled) => handled,
        Err(err) => {
            error!("couldn't handle guest transition at {:#x}: {}", addr, err);
            false
        }
    }
}

fn fetch_prot_inner(ctx: &Rc<Context>, uc: &mut Emu, mut addr: u64) -> Result<bool> {
    let kernel = ctx.loader.borrow().kernel_addr();
    let found = ctx.loader.borrow().lookup(addr);

    let Some(mut ai) = found else {
        if addr == kernel {
            trace!("executing kernel at {:#x} (as protected)", addr);
            return_to_kernel(ctx, uc)?;
            return Ok(true);
        }
        error!("unmapped address {:#x} fetched", addr);
        return Ok(false);
    };

    let mut wrapper = ai.lib.wrapper_dll.get();
    if !wrapper {
        // The guest is calling into an impersonated framework; route the
        // call through the framework's generated wrapper DLL.
        let wrapper_path = wrapper_path_for(&ai.path);
        let wrapper_lib = ctx.loader.borrow_mut().load(uc, &wrapper_path);
        let Some(wrapper_lib) = wrapper_lib else {
            return Ok(false);
        };

        let Some(idx_addr) = ctx
            .loader
            .borrow()
            .find_symbol(&wrapper_lib, WRAPPER_INDEX_SYMBOL)
        else {
            error!("wrapper index missing in {}", wrapper_path);
            return Ok(false);
        };

        // The wrapper image's first section begins one page in, after its
        // header.
        let rva = (addr - ai.lib.start + 0x1000) as u32;

        let dylib = unsafe { (*(idx_addr as *const WrapperIndex)).lookup(rva) }.map(str::to_owned);
        match dylib {
            None => {
                // No generated wrapper for this entry. Simple Objective-C
                // methods can still be marshalled dynamically from their
                // type encoding.
                let ty = ctx.loader.borrow().method_type(addr).map(str::to_owned);
                let Some(ty) = ty else {
                    error!(
                        "cannot find RVA {:#x} in the wrapper index of {}",
                        rva, wrapper_path
                    );
                    return Ok(false);
                };
                dynamic_dispatch(ctx, uc, addr, &ty)?;
                return Ok(true);
            }
            Some(dylib) => {
                let target = ctx.loader.borrow_mut().load(uc, &dylib);
                let Some(target) = target else {
                    return Ok(false);
                };
                let alias = format!("$__ipaSim_wraps_{}", rva);
                let Some(wrapped) = ctx.loader.borrow().find_symbol(&target, &alias) else {
                    error!("cannot find wrapper for RVA {:#x} in {}", rva, ai.path);
                    return Ok(false);
                };
                addr = wrapped;
                let relookup = ctx.loader.borrow().lookup(addr);
                let Some(relookup) = relookup else {
                    error!("wrapper symbol {} resolved outside every library", alias);
                    return Ok(false);
                };
                ai = relookup;
                wrapper = true;
            }
        }
    }

    trace!("fetch of protected memory at {:#x} in {}", addr, ai.path);

    if !wrapper {
        // Unwrapped native code that is directly callable: point the guest
        // at it and handle the dispatch when the fault re-fires there.
        emu::set_reg32(uc, RegisterARM::PC, addr as u32)?;
        return Ok(true);
    }

    // Wrapper convention: R0 carries a pointer to the caller-built block of
    // arguments and return slots; the wrapper itself is `void(uint32)`.
    let r0 = emu::reg32(uc, RegisterARM::R0)?;
    continue_outside_emulation(
        ctx,
        uc,
        Box::new(move |_uc, ctx| {
            unsafe {
                marshal::host_call(addr, &[r0], false)?;
            }
            return_to_emulation(ctx);
            Ok(())
        }),
    )?;
    Ok(true)
}

/// A framework entry with no generated wrapper but a known type encoding:
/// decode the signature, harvest the guest's argument words now, and defer
/// the host call.
fn dynamic_dispatch(ctx: &Rc<Context>, uc: &mut Emu, addr: u64, ty: &str) -> Result<()> {
    debug!("dynamically handling method of type {}", ty);

    let mut td = TypeDecoder::new(ty);
    let returns = match td.next_size() {
        Some(0) => false,
        Some(4) => true,
        _ => {
            error!("unsupported return type");
            return Err(Error::UnsupportedReturn(ty.to_owned()));
        }
    };

    let mut caller = DynamicCaller::new();
    while td.has_next() {
        let Some(size) = td.next_size() else {
            return Err(Error::BadTypeEncoding(ty.to_owned()));
        };
        caller.load_arg(uc, size)?;
    }

    continue_outside_emulation(
        ctx,
        uc,
        Box::new(move |uc, ctx| {
            if let Err(err) = caller.call(uc, returns, addr) {
                // The call can be skipped; the frame just never resumes.
                error!("dynamic dispatch to {:#x} failed: {}", addr, err);
                return Ok(());
            }
            return_to_emulation(ctx);
            Ok(())
        }),
    )
}

/// Per-instruction check covering for missed fetch-protection faults.
fn handle_code(ctx: &Rc<Context>, uc: &mut Emu, addr: u64) {
    let kernel = ctx.loader.borrow().kernel_addr();
    if addr == kernel {
        trace!("executing kernel at {:#x}", addr);
        if let Err(err) = return_to_kernel(ctx, uc) {
            error!("couldn't return to kernel: {}", err);
        }
        return;
    }

    let native = {
        let loader = ctx.loader.borrow();
        match loader.library_at(addr) {
            Some(lib) => !lib.is_dylib(),
            None => {
                error!("unmapped address {:#x} executed", addr);
                return;
            }
        }
    };
    if native {
        // A fetch-protection fault the emulator didn't deliver.
        handle_fetch_prot(ctx, uc, addr);
        return;
    }

    trace!("executing at {:#x}", addr);
}

fn handle_mem_unmapped(_ctx: &Rc<Context>, uc: &mut Emu, addr: u64, size: usize) -> bool {
    debug!("unmapped memory manipulation at {:#x} ({})", addr, size);

    // Map the surrounding pages read-write and let the access retry.
    let page = emu::page_floor(addr);
    let span = emu::page_ceil(size.max(1) as u64);
    emu::map_host(uc, page, span, Prot::READ | Prot::WRITE);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, HostModule};
    use std::path::{Path, PathBuf};
    use unicorn_engine::unicorn_const::{Arch, Mode};
    use unicorn_engine::Unicorn;

    struct NoFilesHost;

    impl Host for NoFilesHost {
        fn locate(&self, _path: &str, _relative: bool) -> Option<PathBuf> {
            None
        }
        fn open_module(&self, _path: &Path) -> Option<HostModule> {
            None
        }
        fn module_symbol(&self, _module: &HostModule, _name: &str) -> Option<u64> {
            None
        }
    }

    fn test_context() -> (Emu, Rc<Context>) {
        let mut uc = Unicorn::new(Arch::ARM, Mode::LITTLE_ENDIAN).unwrap();
        let loader = DynamicLoader::new(&mut uc, Box::new(NoFilesHost)).unwrap();
        let ctx = Rc::new(Context {
            loader: RefCell::new(loader),
            state: RefCell::new(Translator::new()),
        });
        (uc, ctx)
    }

    #[test]
    fn at_most_one_continuation_may_be_pending() {
        let (mut uc, ctx) = test_context();

        continue_outside_emulation(&ctx, &mut uc, Box::new(|_, _| Ok(()))).unwrap();
        let err = continue_outside_emulation(&ctx, &mut uc, Box::new(|_, _| Ok(())));
        assert!(matches!(err, Err(Error::ContinuationPending)));
    }

    #[test]
    fn kernel_return_without_entry_is_rejected() {
        let (mut uc, ctx) = test_context();
        let err = return_to_kernel(&ctx, &mut uc);
        assert!(matches!(err, Err(Error::ReturnUnderflow)));
    }

    #[test]
    fn lr_stack_is_lifo() {
        let (_uc, ctx) = test_context();
        let mut state = ctx.state.borrow_mut();
        state.lrs.push(0x1000);
        state.lrs.push(0x2000);
        assert_eq!(state.depth(), 2);
        assert_eq!(state.lrs.pop(), Some(0x2000));
        assert_eq!(state.lrs.pop(), Some(0x1000));
        assert_eq!(state.depth(), 0);
    }
}
