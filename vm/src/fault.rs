//! Page fault handling.

use crate::address_space::ProcessMemory;
use crate::error::{Result, VmError};
use crate::frame_table::Frame;
use crate::page::Backing;
use crate::system::{VmStats, VmSystem};
use crate::Tid;
use alloc::sync::Arc;
use kidneyos_shared::mem::page_round_down;
use log::{debug, warn};

/// What the trap handler knows about the faulting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    pub tid: Tid,
    /// User stack pointer at the time of the fault.
    pub esp: usize,
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A new zero page below the stack.
    StackGrowth,
    /// A registered page touched for the first time or after being
    /// discarded.
    Load,
    /// A page read back from swap.
    SwapIn,
    /// The page was already resident; only its mapping was missing.
    Remap,
}

impl VmSystem {
    pub(crate) fn handle_fault(
        &self,
        memory: &Arc<ProcessMemory>,
        addr: usize,
        ctx: &FaultContext,
    ) -> Result<FaultKind> {
        VmStats::bump(&self.stats.faults);
        let vaddr = page_round_down(addr);

        if self.remap_resident(memory, vaddr)? {
            return Ok(FaultKind::Remap);
        }

        let _evicting = self.evict_lock.lock();

        let load = {
            let mut pages = memory.pages.lock();
            let pages = pages.as_mut().ok_or(VmError::NoPageTable)?;
            let load = match pages.lookup(vaddr) {
                Some(page) if page.is_resident() => None,
                Some(page) => Some((page.writable(), page.slot(), page.backing().clone(), false)),
                None if self.config.is_stack_access(addr, ctx.esp) => {
                    pages.create(vaddr, true, Backing::Zero, memory.pid())?;
                    Some((true, None, Backing::Zero, true))
                }
                None => {
                    debug!("fault at {addr:#X} (esp {:#X}): not mapped", ctx.esp);
                    return Err(VmError::SegmentationFault);
                }
            };
            load
        };
        let Some((writable, slot, backing, grown)) = load else {
            // Loaded by another thread while we waited for the lock.
            self.remap_resident(memory, vaddr)?;
            return Ok(FaultKind::Remap);
        };

        let paddr = self.obtain_frame(ctx.tid)?;
        let discardable = match self.populate(paddr, slot, &backing, ctx.tid) {
            Ok(discardable) => discardable,
            Err(err) => {
                self.memory.free(paddr);
                return Err(err);
            }
        };

        let mut pages = memory.pages.lock();
        let Some(page) = pages.as_mut().and_then(|pages| pages.lookup_mut(vaddr)) else {
            // Teardown waits for the eviction lock, so the page is still here.
            self.memory.free(paddr);
            return Err(VmError::NoPageTable);
        };
        let id = self.frames.lock().allocate_frame(Frame {
            paddr,
            owner: ctx.tid,
            memory: memory.clone(),
            vaddr,
        });
        page.set_resident(id, discardable);
        if !memory.mapper().install(vaddr, paddr, writable) {
            warn!("fault at {addr:#X}: stale mapping replaced");
            memory.mapper().clear(vaddr);
            memory.mapper().install(vaddr, paddr, writable);
        }

        let kind = if grown {
            VmStats::bump(&self.stats.stack_growths);
            FaultKind::StackGrowth
        } else if slot.is_some() {
            FaultKind::SwapIn
        } else {
            FaultKind::Load
        };
        debug!("fault at {addr:#X}: {kind:?} into {paddr:#X}");
        Ok(kind)
    }

    /// Installs the mapping of `vaddr` if the page is resident. Returns
    /// `false` if it is not.
    fn remap_resident(&self, memory: &ProcessMemory, vaddr: usize) -> Result<bool> {
        let pages = memory.pages.lock();
        let pages = pages.as_ref().ok_or(VmError::NoPageTable)?;
        let Some(page) = pages.lookup(vaddr) else {
            return Ok(false);
        };
        let Some(id) = page.frame() else {
            return Ok(false);
        };
        let Some(paddr) = self.frames.lock().get(id).map(|frame| frame.paddr) else {
            return Ok(false);
        };

        // An existing mapping is left alone; clearing it would lose the
        // dirty bit.
        if memory.mapper().install(vaddr, paddr, page.writable()) {
            debug!("fault at {vaddr:#X}: remapped resident page");
        }
        Ok(true)
    }
}
