//! Top-level ownership.
//!
//! A [`Vm`] couples one emulator instance with the shared context the hooks
//! and the driver work through. FFI entry points - trampoline closures and
//! host wrapper code calling back in - cannot carry a borrow across the C
//! boundary, so the running instance is also published through a
//! thread-local handle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use unicorn_engine::unicorn_const::{Arch, Mode};
use unicorn_engine::Unicorn;

use crate::emu::Emu;
use crate::host::Host;
use crate::loader::{DynamicLoader, Library};
use crate::marshal;
use crate::translator::{self, Context, Translator};
use crate::Result;

thread_local! {
    static CURRENT_VM: Cell<Option<*mut Vm>> = const { Cell::new(None) };
}

/// Publish `vm` as the instance FFI entry points re-enter through.
pub fn set_current(vm: *mut Vm) {
    CURRENT_VM.with(|c| c.set(Some(vm)));
}

/// The published instance for this thread.
pub fn current() -> *mut Vm {
    CURRENT_VM.with(|c| c.get().expect("no current vm set"))
}

/// One simulated process: the emulator and the loader/translator context.
pub struct Vm {
    pub uc: Emu,
    pub ctx: Rc<Context>,
}

impl Vm {
    pub fn new(host: Box<dyn Host>) -> Result<Vm> {
        let mut uc = Unicorn::new(Arch::ARM, Mode::LITTLE_ENDIAN)?;
        let loader = DynamicLoader::new(&mut uc, host)?;
        let ctx = Rc::new(Context {
            loader: RefCell::new(loader),
            state: RefCell::new(Translator::new()),
        });
        Ok(Vm { uc, ctx })
    }

    pub fn load(&mut self, path: &str) -> Option<Rc<Library>> {
        self.ctx.loader.borrow_mut().load(&mut self.uc, path)
    }

    /// Run a loaded program image from its entry point.
    pub fn execute_image(&mut self, lib: &Rc<Library>) -> Result<()> {
        translator::execute_image(&self.ctx, &mut self.uc, lib)
    }

    /// Run guest code at `addr` until it returns.
    pub fn execute(&mut self, addr: u64) -> Result<()> {
        translator::execute(&self.ctx, &mut self.uc, addr)
    }

    /// Install the boundary hooks without entering a program image; callers
    /// that drive [`Vm::execute`] directly need them in place first.
    pub fn install_hooks(&mut self) -> Result<()> {
        translator::install_hooks(&self.ctx, &mut self.uc)
    }

    /// Rewrite a pointer about to escape into host code (see
    /// [`marshal::translate`]).
    pub fn translate(&self, ptr: u64) -> Result<u64> {
        marshal::translate(&self.ctx, ptr)
    }

    /// Call `fp` with up to four word-sized arguments, crossing into
    /// emulation when it targets guest code.
    pub fn call_back<const N: usize>(&mut self, fp: u64, args: [u32; N]) -> Result<()> {
        marshal::call_back(&self.ctx, &mut self.uc, fp, args)
    }

    /// [`Vm::call_back`], returning the call's R0.
    pub fn call_back_r<const N: usize>(&mut self, fp: u64, args: [u32; N]) -> Result<u32> {
        marshal::call_back_r(&self.ctx, &mut self.uc, fp, args)
    }

    /// Split borrow for FFI entry points.
    pub fn parts(&mut self) -> (&mut Emu, &Rc<Context>) {
        (&mut self.uc, &self.ctx)
    }
}
