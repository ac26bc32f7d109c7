//! Thin contract layer over the CPU emulator.
//!
//! The emulator owns the guest register file, the guest memory map and the
//! hook machinery; this module pins down the few operations the rest of the
//! crate relies on: 32-bit register access, identity memory mapping, page
//! arithmetic and page-aligned host allocations that stay reachable from a
//! 32-bit guest.
//!
//! Guest virtual addresses equal host pointers throughout - every mapping
//! installed here backs a guest range with the host memory at the same
//! address.

use std::os::raw::c_void;

use tracing::error;
use unicorn_engine::unicorn_const::Prot;
use unicorn_engine::{RegisterARM, Unicorn};

use crate::Result;

/// The emulator instance type used throughout the crate.
pub type Emu = Unicorn<'static, ()>;

pub const PAGE_SIZE: u64 = 0x1000;

/// AAPCS32 argument registers, in order.
pub const ARG_REGS: [RegisterARM; 4] = [
    RegisterARM::R0,
    RegisterARM::R1,
    RegisterARM::R2,
    RegisterARM::R3,
];

pub fn page_floor(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

pub fn page_ceil(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn reg32(uc: &Emu, reg: RegisterARM) -> Result<u32> {
    Ok(uc.reg_read(reg)? as u32)
}

pub fn set_reg32(uc: &mut Emu, reg: RegisterARM, value: u32) -> Result<()> {
    uc.reg_write(reg, value as u64)?;
    Ok(())
}

/// Identity-map host memory into the guest.
///
/// The guest virtual address of the mapping equals the host pointer; the
/// caller guarantees the host range is valid for `size` bytes. Address and
/// size must be page-aligned. Failures are logged and swallowed so one bad
/// range doesn't tear down the whole session.
pub fn map_host(uc: &mut Emu, addr: u64, size: u64, prot: Prot) {
    let res = unsafe { uc.mem_map_ptr(addr, size as usize, prot, addr as *mut c_void) };
    if let Err(err) = res {
        error!(
            "couldn't map memory at {:#x} of size {:#x}: {:?}",
            addr, size, err
        );
    }
}

/// Allocate a page-aligned block of host memory that a 32-bit guest can
/// address. Returns the block's address, which is both the host pointer and
/// the guest virtual address.
///
/// The block is never freed: images, stacks and the kernel page live for the
/// whole process.
pub fn alloc_low_block(size: u64) -> Option<u64> {
    let size = page_ceil(size).max(PAGE_SIZE) as usize;

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86")))]
    {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            error!(
                "couldn't allocate {:#x} guest-visible bytes: {}",
                size,
                std::io::Error::last_os_error()
            );
            return None;
        }
        Some(ptr as u64)
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86"))))]
    {
        // No MAP_32BIT on this target: probe a few low hint addresses and
        // take the first mapping the kernel actually places below 4 GiB.
        for hint in (0x1000_0000u64..0xf000_0000).step_by(0x1000_0000) {
            let ptr = unsafe {
                libc::mmap(
                    hint as *mut c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                continue;
            }
            if (ptr as u64) + (size as u64) <= u32::MAX as u64 + 1 {
                return Some(ptr as u64);
            }
            unsafe {
                libc::munmap(ptr, size);
            }
        }
        error!("couldn't allocate {:#x} guest-visible bytes", size);
        None
    }
}
