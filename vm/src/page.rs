//! Per-process records of every registered user page.

use crate::error::{Result, VmError};
use crate::file::{BackingFile, FileOffset};
use crate::frame_table::FrameId;
use crate::swapping::SwapSlot;
use crate::Pid;
use alloc::collections::btree_map::{BTreeMap, Entry};
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE};
use log::warn;

/// Where a page's contents come from the first time it is loaded, and after
/// it has been discarded.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Anonymous memory, zero filled.
    Zero,
    File(FileBacking),
}

/// A page-sized window of a file.
///
/// Loading reads `length` bytes at `offset` and zero fills the rest of the
/// page. Fewer than `min_length` bytes is an error.
#[derive(Clone)]
pub struct FileBacking {
    file: Arc<dyn BackingFile>,
    offset: FileOffset,
    length: usize,
    min_length: usize,
    writeback: bool,
}

impl FileBacking {
    /// `length` bytes of `file` at `offset`. With `writeback`, modified
    /// contents go back to the file instead of to swap.
    pub fn new(file: Arc<dyn BackingFile>, offset: FileOffset, length: usize, writeback: bool) -> Self {
        assert!(length <= PAGE_FRAME_SIZE, "file backing longer than a page");
        Self {
            file,
            offset,
            length,
            min_length: length,
            writeback,
        }
    }

    /// Tolerates reads that come up short, as long as `min_length` bytes
    /// arrive.
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        assert!(min_length <= self.length);
        self.min_length = min_length;
        self
    }

    pub fn offset(&self) -> FileOffset {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn writeback(&self) -> bool {
        self.writeback
    }

    /// Fills `frame` from the file.
    pub(crate) fn load(&self, frame: &mut [u8]) -> Result<()> {
        let read = self.file.read_at(self.offset, &mut frame[..self.length]);
        if read < self.min_length {
            return Err(VmError::ShortRead);
        }
        frame[read..].fill(0);
        Ok(())
    }

    pub(crate) fn write_back(&self, frame: &[u8]) {
        let written = self.file.write_at(self.offset, &frame[..self.length]);
        if written < self.length {
            warn!(
                "short write back at offset {:#X}: {written} of {} bytes",
                self.offset,
                self.length
            );
        }
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("min_length", &self.min_length)
            .field("writeback", &self.writeback)
            .finish_non_exhaustive()
    }
}

/// One registered user page.
///
/// At most one of `frame` and `slot` is set: a page is resident, swapped out,
/// or neither (its contents are regenerated from its backing).
#[derive(Clone, Debug)]
pub struct Page {
    vaddr: usize,
    writable: bool,
    owner: Pid,
    frame: Option<FrameId>,
    slot: Option<SwapSlot>,
    backing: Backing,
    /// The resident contents equal what reloading from `backing` would give.
    discardable: bool,
}

impl Page {
    fn new(vaddr: usize, writable: bool, owner: Pid, backing: Backing) -> Self {
        Self {
            vaddr,
            writable,
            owner,
            frame: None,
            slot: None,
            backing,
            discardable: false,
        }
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_swapped(&self) -> bool {
        self.slot.is_some()
    }

    pub(crate) fn is_discardable(&self) -> bool {
        self.discardable
    }

    /// Records that the page was loaded into `frame`. Any swap slot must have
    /// been read and freed already.
    pub(crate) fn set_resident(&mut self, frame: FrameId, discardable: bool) {
        assert!(self.frame.is_none(), "page {:#X} loaded twice", self.vaddr);
        self.slot = None;
        self.frame = Some(frame);
        self.discardable = discardable;
    }

    /// Records that the page lost its frame, with its contents in `slot` if
    /// they went to swap.
    pub(crate) fn set_evicted(&mut self, slot: Option<SwapSlot>) {
        assert!(self.frame.is_some(), "page {:#X} evicted while not resident", self.vaddr);
        self.frame = None;
        self.slot = slot;
        self.discardable = false;
    }
}

/// A process's pages, keyed by page-aligned virtual address.
#[derive(Default, Debug)]
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Registers a non-resident page at `vaddr`, which must be page aligned.
    pub fn create(
        &mut self,
        vaddr: usize,
        writable: bool,
        backing: Backing,
        owner: Pid,
    ) -> Result<&mut Page> {
        assert!(is_page_aligned(vaddr), "unaligned page address {vaddr:#X}");
        match self.pages.entry(vaddr) {
            Entry::Occupied(_) => Err(VmError::AlreadyMapped),
            Entry::Vacant(entry) => {
                Ok(entry.insert(Page::new(vaddr, writable, owner, backing)))
            }
        }
    }

    /// The page containing `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<&Page> {
        self.pages.get(&page_round_down(vaddr))
    }

    pub fn lookup_mut(&mut self, vaddr: usize) -> Option<&mut Page> {
        self.pages.get_mut(&page_round_down(vaddr))
    }

    /// Unregisters the page containing `vaddr`.
    pub fn remove(&mut self, vaddr: usize) -> Option<Page> {
        self.pages.remove(&page_round_down(vaddr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn into_pages(self) -> impl Iterator<Item = Page> {
        self.pages.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::test::MemoryFile;
    use alloc::vec;

    #[test]
    fn lookup_rounds_down() {
        let mut table = SupplementalPageTable::new();
        table.create(0x1000, true, Backing::Zero, 1).unwrap();

        assert_eq!(table.lookup(0x1000).unwrap().vaddr(), 0x1000);
        assert_eq!(table.lookup(0x1FFF).unwrap().vaddr(), 0x1000);
        assert!(table.lookup(0x2000).is_none());
        assert!(table.lookup(0xFFF).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut table = SupplementalPageTable::new();
        table.create(0x5000, false, Backing::Zero, 1).unwrap();
        assert_eq!(
            table.create(0x5000, true, Backing::Zero, 2).unwrap_err(),
            VmError::AlreadyMapped
        );
        assert_eq!(table.len(), 1);
        assert!(!table.lookup(0x5000).unwrap().writable());
    }

    #[test]
    fn new_pages_are_nowhere() {
        let mut table = SupplementalPageTable::new();
        let page = table.create(0x3000, true, Backing::Zero, 7).unwrap();
        assert!(!page.is_resident());
        assert!(!page.is_swapped());
        assert_eq!(page.owner(), 7);
    }

    #[test]
    fn remove_unregisters() {
        let mut table = SupplementalPageTable::new();
        table.create(0x3000, true, Backing::Zero, 1).unwrap();
        assert!(table.remove(0x3ABC).is_some());
        assert!(table.remove(0x3000).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn file_load_zero_fills_tail() {
        let file = Arc::new(MemoryFile::new(&[0xAB; 100]));
        let backing = FileBacking::new(file, 10, 50, false);
        let mut frame = vec![0xFF; PAGE_FRAME_SIZE];
        backing.load(&mut frame).unwrap();
        assert!(frame[..50].iter().all(|&b| b == 0xAB));
        assert!(frame[50..].iter().all(|&b| b == 0));
    }

    #[test]
    fn file_load_tolerates_reads_above_minimum() {
        let file = Arc::new(MemoryFile::new(&[7; 30]));
        let mut frame = vec![0xFF; PAGE_FRAME_SIZE];

        let strict = FileBacking::new(file.clone(), 0, 64, false);
        assert_eq!(strict.load(&mut frame).unwrap_err(), VmError::ShortRead);

        let lenient = strict.with_min_length(16);
        lenient.load(&mut frame).unwrap();
        assert!(frame[..30].iter().all(|&b| b == 7));
        assert!(frame[30..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_back_covers_length_only() {
        let file = Arc::new(MemoryFile::new(&[0; 8]));
        let backing = FileBacking::new(file.clone(), 2, 4, true);
        backing.write_back(&vec![9; PAGE_FRAME_SIZE]);
        assert_eq!(file.contents(), [0, 0, 9, 9, 9, 9, 0, 0]);
    }
}
