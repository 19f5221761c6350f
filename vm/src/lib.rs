//! Demand-paged virtual memory for user processes.
//!
//! Every user page is registered in its process's supplemental page table
//! and brought into a physical frame only when it faults. When the frame
//! pool runs dry, the clock algorithm picks a resident page to push out to
//! swap or its backing file, or to drop if it is clean.
//!
//! The kernel creates the subsystem once with [`init`], gives each process
//! an [`AddressSpace`], and forwards user page faults to [`page_fault`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod block;
pub mod config;
pub mod error;
pub mod fault;
pub mod file;
pub mod frame_table;
pub mod mem;
pub mod page;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;

#[cfg(test)]
mod tests;

pub use address_space::AddressSpace;
pub use config::VmConfig;
pub use error::{Result, VmError};
pub use fault::{FaultContext, FaultKind};
pub use page::{Backing, FileBacking};
pub use system::{VmStatsSnapshot, VmSystem};

use alloc::boxed::Box;
use alloc::sync::Arc;
use block::BlockDevice;
use core::sync::atomic::AtomicU16;
use log::{debug, error};
use mem::PhysicalAllocator;
use once_cell::race::OnceBox;

/// Process id.
pub type Pid = u16;
/// Thread id. 0 is never a valid thread.
pub type Tid = u16;
pub(crate) type AtomicTid = AtomicU16;

static VM_SYSTEM: OnceBox<Arc<VmSystem>> = OnceBox::new();

/// Sets up the subsystem for the whole kernel.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(
    config: VmConfig,
    memory: Arc<dyn PhysicalAllocator>,
    swap_device: Option<Box<dyn BlockDevice>>,
) -> &'static Arc<VmSystem> {
    let vm = Arc::new(VmSystem::new(config, memory, swap_device));
    assert!(
        VM_SYSTEM.set(Box::new(vm)).is_ok(),
        "vm::init called while the subsystem was already initialized"
    );
    system()
}

/// The subsystem set up by [`init`].
///
/// # Panics
///
/// Panics if [`init`] has not been called.
pub fn system() -> &'static Arc<VmSystem> {
    VM_SYSTEM
        .get()
        .expect("vm::system called before vm::init")
}

/// Handles a user page fault at `fault_addr`.
///
/// Returns `true` if the faulting instruction can be restarted and `false`
/// if the process must be killed.
///
/// # Panics
///
/// Halts the kernel if the fault cannot be resolved because memory is
/// exhausted or the swap device failed.
pub fn page_fault(space: &AddressSpace, fault_addr: usize, ctx: &FaultContext) -> bool {
    match space.fault(fault_addr, ctx) {
        Ok(_) => true,
        Err(err) if err.is_fatal() => {
            error!(
                "pid {} tid {}: page fault at {fault_addr:#X}: {err}",
                space.pid(),
                ctx.tid
            );
            panic!("unrecoverable page fault at {fault_addr:#X}: {err}");
        }
        Err(err) => {
            debug!("pid {}: killed by fault at {fault_addr:#X}: {err}", space.pid());
            false
        }
    }
}
