//! The hardware page table as seen by the virtual memory subsystem.

use crate::mem::{PhysAddr, PhysicalAllocator};
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::slice;
use kidneyos_shared::mem::{page_offset, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::{PageTableEntry, VirtualAddress};

/// Installs and inspects virtual-to-physical mappings of one address space.
///
/// All addresses are user virtual addresses; implementations round them
/// down to their page.
pub trait PageMapper: Send + Sync {
    /// Maps `vaddr` to the frame at `paddr`.
    ///
    /// Returns `false` if `vaddr` is already mapped.
    fn install(&self, vaddr: usize, paddr: PhysAddr, writable: bool) -> bool;

    /// Removes the mapping for `vaddr`. Returns `false` if there was none.
    fn clear(&self, vaddr: usize) -> bool;

    fn is_accessed(&self, vaddr: usize) -> bool;

    fn is_dirty(&self, vaddr: usize) -> bool;

    fn reset_accessed(&self, vaddr: usize);
}

/// A page table kept in software.
///
/// Hosted builds have no MMU, so user accesses go through
/// [`read_user`](Self::read_user) and [`write_user`](Self::write_user),
/// which update the accessed and dirty bits as the processor would.
///
/// Entries are the 32-bit x86 format, so virtual and physical addresses must
/// fit in 32 bits even on a wider host. Wider addresses panic instead of
/// being truncated into another page's entry.
pub struct SoftPageTable {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
    memory: Arc<dyn PhysicalAllocator>,
}

impl SoftPageTable {
    pub fn new(memory: Arc<dyn PhysicalAllocator>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            memory,
        }
    }

    fn page_number(vaddr: usize) -> usize {
        assert!(
            u32::try_from(vaddr).is_ok(),
            "virtual address {vaddr:#X} does not fit in 32 bits"
        );
        VirtualAddress::new(vaddr).page_number()
    }

    /// Physical address `vaddr` currently translates to.
    pub fn translate(&self, vaddr: usize) -> Option<PhysAddr> {
        let entries = self.entries.lock();
        let entry = entries.get(&Self::page_number(vaddr))?;
        Some(entry.phys_addr() + page_offset(vaddr))
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    /// Copies user memory at `vaddr` into `buf`, as a user-mode load would.
    ///
    /// Returns `false` without copying if the page is not mapped; the access
    /// would have faulted. The range must not cross a page boundary.
    pub fn read_user(&self, vaddr: usize, buf: &mut [u8]) -> bool {
        self.access(vaddr, buf.len(), false, |frame| buf.copy_from_slice(frame))
    }

    /// Copies `buf` to user memory at `vaddr`, as a user-mode store would.
    ///
    /// Returns `false` without copying if the page is not mapped or is read
    /// only. The range must not cross a page boundary.
    pub fn write_user(&self, vaddr: usize, buf: &[u8]) -> bool {
        self.access(vaddr, buf.len(), true, |frame| frame.copy_from_slice(buf))
    }

    fn access(&self, vaddr: usize, len: usize, write: bool, f: impl FnOnce(&mut [u8])) -> bool {
        let offset = page_offset(vaddr);
        assert!(offset + len <= PAGE_FRAME_SIZE, "user access crosses a page boundary");

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&Self::page_number(vaddr)) else {
            return false;
        };
        if write && !entry.read_write() {
            return false;
        }

        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        let frame = self.memory.kernel_view(entry.phys_addr());
        // SAFETY: The mapping keeps the frame allocated, and holding the table
        // lock orders this access against eviction clearing the mapping.
        let bytes = unsafe { slice::from_raw_parts_mut(frame.as_ptr().add(offset), len) };
        f(bytes);
        true
    }
}

impl PageMapper for SoftPageTable {
    fn install(&self, vaddr: usize, paddr: PhysAddr, writable: bool) -> bool {
        assert!(
            u32::try_from(paddr).is_ok(),
            "physical address {paddr:#X} does not fit in 32 bits"
        );
        let vpn = Self::page_number(vaddr);
        let mut entries = self.entries.lock();
        if entries.contains_key(&vpn) {
            return false;
        }
        entries.insert(vpn, PageTableEntry::user_mapping(paddr, writable));
        true
    }

    fn clear(&self, vaddr: usize) -> bool {
        self.entries.lock().remove(&Self::page_number(vaddr)).is_some()
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&Self::page_number(vaddr))
            .is_some_and(|entry| entry.accessed())
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&Self::page_number(vaddr))
            .is_some_and(|entry| entry.dirty())
    }

    fn reset_accessed(&self, vaddr: usize) {
        if let Some(entry) = self.entries.lock().get_mut(&Self::page_number(vaddr)) {
            *entry = entry.with_accessed(false);
        }
    }
}
