//! A process's view of virtual memory.

use crate::error::{Result, VmError};
use crate::fault::{FaultContext, FaultKind};
use crate::page::{Backing, Page, SupplementalPageTable};
use crate::paging::PageMapper;
use crate::sync::Mutex;
use crate::system::VmSystem;
use crate::{Pid, Tid};
use alloc::sync::Arc;
use kidneyos_shared::mem::page_round_down;
use log::{debug, info, warn};

/// The parts of an address space that frames point back to.
pub(crate) struct ProcessMemory {
    pid: Pid,
    mapper: Arc<dyn PageMapper>,
    /// `None` once the process has exited.
    pub(crate) pages: Mutex<Option<SupplementalPageTable>>,
}

impl ProcessMemory {
    pub(crate) fn new(pid: Pid, mapper: Arc<dyn PageMapper>) -> Self {
        Self {
            pid,
            mapper,
            pages: Mutex::new(Some(SupplementalPageTable::new())),
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn mapper(&self) -> &dyn PageMapper {
        &*self.mapper
    }
}

/// The user address space of one process.
///
/// Dropping it tears down any pages left, as [`exit`](Self::exit) does. With
/// no calling thread to charge, write backs on drop wait until nobody holds
/// the file lock.
pub struct AddressSpace {
    memory: Arc<ProcessMemory>,
    vm: Arc<VmSystem>,
}

impl AddressSpace {
    pub fn new(vm: Arc<VmSystem>, pid: Pid, mapper: Arc<dyn PageMapper>) -> Self {
        debug!("pid {pid}: new address space");
        Self {
            memory: Arc::new(ProcessMemory::new(pid, mapper)),
            vm,
        }
    }

    pub fn pid(&self) -> Pid {
        self.memory.pid()
    }

    pub fn vm(&self) -> &Arc<VmSystem> {
        &self.vm
    }

    /// Registers a page at `vaddr` without loading it. It is brought in by
    /// the first fault on it.
    pub fn register(&self, vaddr: usize, writable: bool, backing: Backing) -> Result<()> {
        let mut pages = self.memory.pages.lock();
        let pages = pages.as_mut().ok_or(VmError::NoPageTable)?;
        pages.create(page_round_down(vaddr), writable, backing, self.pid())?;
        Ok(())
    }

    /// A copy of the page containing `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<Page> {
        self.memory.pages.lock().as_ref()?.lookup(vaddr).cloned()
    }

    /// Unregisters the page containing `vaddr`, releasing its frame or swap
    /// slot.
    pub fn unmap(&self, vaddr: usize, tid: Tid) {
        let _evicting = self.vm.evict_lock.lock();
        let mut pages = self.memory.pages.lock();
        let Some(page) = pages.as_mut().and_then(|pages| pages.remove(vaddr)) else {
            warn!("pid {}: unmapping {vaddr:#X}, which is not mapped", self.pid());
            return;
        };
        self.vm.release_page(&self.memory, &page, Some(tid));
    }

    /// Resolves a fault at `addr`.
    pub fn fault(&self, addr: usize, ctx: &FaultContext) -> Result<FaultKind> {
        self.vm.handle_fault(&self.memory, addr, ctx)
    }

    /// Evicts the resident page containing `vaddr`.
    pub fn evict(&self, vaddr: usize, tid: Tid) -> Result<()> {
        let _evicting = self.vm.evict_lock.lock();
        self.vm.evict(&self.memory, page_round_down(vaddr), tid)
    }

    /// Tears down every page on behalf of thread `tid`. Later faults fail
    /// with [`VmError::NoPageTable`].
    pub fn exit(&self, tid: Tid) {
        self.teardown(Some(tid));
    }

    fn teardown(&self, tid: Option<Tid>) {
        let _evicting = self.vm.evict_lock.lock();
        let Some(pages) = self.memory.pages.lock().take() else {
            return;
        };

        let count = pages.len();
        for page in pages.into_pages() {
            self.vm.release_page(&self.memory, &page, tid);
        }
        info!("pid {}: released {count} pages", self.pid());
    }

    pub fn resident_pages(&self) -> usize {
        self.count_pages(Page::is_resident)
    }

    pub fn swapped_pages(&self) -> usize {
        self.count_pages(Page::is_swapped)
    }

    fn count_pages(&self, f: impl Fn(&Page) -> bool) -> usize {
        self.memory
            .pages
            .lock()
            .as_ref()
            .map_or(0, |pages| pages.iter().filter(|&page| f(page)).count())
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &Arc<ProcessMemory> {
        &self.memory
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown(None);
    }
}
