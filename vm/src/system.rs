//! State shared by every address space: the frame pool, the frame table and
//! swap, plus the locks that order eviction against faults.

use crate::address_space::ProcessMemory;
use crate::block::BlockDevice;
use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::frame_table::{FrameId, FrameTable};
use crate::mem::{PhysAddr, PhysicalAllocator};
use crate::page::{Backing, Page};
use crate::swapping::{SwapSlot, SwapSpace};
use crate::sync::{Mutex, ReentrantMutex};
use crate::Tid;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::slice;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, info};

/// Event counters, updated as the subsystem runs.
#[derive(Debug, Default)]
pub struct VmStats {
    pub(crate) faults: AtomicUsize,
    pub(crate) stack_growths: AtomicUsize,
    pub(crate) swap_ins: AtomicUsize,
    pub(crate) swap_outs: AtomicUsize,
    pub(crate) write_backs: AtomicUsize,
    pub(crate) clean_discards: AtomicUsize,
}

/// A copy of [`VmStats`] at one point in time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub faults: usize,
    pub stack_growths: usize,
    pub swap_ins: usize,
    pub swap_outs: usize,
    pub write_backs: usize,
    pub clean_discards: usize,
}

impl VmStats {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            clean_discards: self.clean_discards.load(Ordering::Relaxed),
        }
    }
}

pub struct VmSystem {
    pub(crate) config: VmConfig,
    pub(crate) memory: Arc<dyn PhysicalAllocator>,
    pub(crate) frames: Mutex<FrameTable>,
    pub(crate) swap: Mutex<SwapSpace>,
    /// Held for the whole of any fault or teardown that may evict, so that a
    /// victim cannot be chosen twice or freed while it is written out.
    pub(crate) evict_lock: Mutex<()>,
    /// Serializes backing file I/O. Reentrant because a thread may fault
    /// while it already holds it.
    pub(crate) file_lock: ReentrantMutex<()>,
    pub(crate) stats: VmStats,
}

impl VmSystem {
    pub fn new(
        config: VmConfig,
        memory: Arc<dyn PhysicalAllocator>,
        swap_device: Option<Box<dyn BlockDevice>>,
    ) -> Self {
        info!(
            "vm: {} user frames, stack limit {} pages",
            memory.capacity(),
            config.stack_max_pages
        );

        Self {
            config,
            memory,
            frames: Mutex::new(FrameTable::new()),
            swap: Mutex::new(SwapSpace::new(swap_device)),
            evict_lock: Mutex::new(()),
            file_lock: ReentrantMutex::new(()),
            stats: VmStats::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> VmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of frames holding user pages.
    pub fn resident_frames(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn free_frames(&self) -> usize {
        self.memory.free_frames()
    }

    pub fn swap_slots(&self) -> usize {
        self.swap.lock().slot_count()
    }

    pub fn free_swap_slots(&self) -> usize {
        self.swap.lock().free_slots()
    }

    /// Sectors read from and written to swap since boot.
    pub fn swap_io(&self) -> (u32, u32) {
        self.swap.lock().io_counts()
    }

    /// Kernel view of the frame at `paddr`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive use of the frame: either it is not yet
    /// mapped, or its mapping has been cleared and the eviction lock is held.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_bytes(&self, paddr: PhysAddr) -> &mut [u8] {
        slice::from_raw_parts_mut(self.memory.kernel_view(paddr).as_ptr(), PAGE_FRAME_SIZE)
    }

    /// Returns a zeroed frame, evicting a resident page if the pool is empty.
    ///
    /// The caller must hold the eviction lock and no page table lock.
    pub(crate) fn obtain_frame(&self, tid: Tid) -> Result<PhysAddr> {
        loop {
            if let Some(paddr) = self.memory.alloc_zeroed() {
                return Ok(paddr);
            }

            let victim = self
                .frames
                .lock()
                .find_victim()
                .ok_or(VmError::NoVictimAvailable)?;
            match self.evict_frame(victim, tid) {
                Err(VmError::SwapExhausted) => return Err(VmError::NoVictimAvailable),
                result => result?,
            }
        }
    }

    fn evict_frame(&self, id: FrameId, tid: Tid) -> Result<()> {
        let (memory, vaddr) = {
            let frames = self.frames.lock();
            let frame = frames.get(id).ok_or(VmError::NoVictimAvailable)?;
            (frame.memory.clone(), frame.vaddr)
        };
        self.evict(&memory, vaddr, tid)
    }

    /// Moves the resident page at `vaddr` out of its frame and frees the
    /// frame.
    ///
    /// Dirty pages with a write-back file go to the file, clean pages whose
    /// contents can be regenerated are dropped, and everything else goes to
    /// swap. The caller must hold the eviction lock and no page table lock.
    pub(crate) fn evict(&self, memory: &ProcessMemory, vaddr: usize, tid: Tid) -> Result<()> {
        let mut pages = memory.pages.lock();
        let page = pages
            .as_mut()
            .ok_or(VmError::NoPageTable)?
            .lookup_mut(vaddr)
            .ok_or(VmError::SegmentationFault)?;
        let id = page.frame().ok_or(VmError::SegmentationFault)?;
        let paddr = self
            .frames
            .lock()
            .get(id)
            .map(|frame| frame.paddr)
            .ok_or(VmError::SegmentationFault)?;

        let vaddr = page.vaddr();
        let mapper = memory.mapper();
        let dirty = mapper.is_dirty(vaddr) || !page.is_discardable();

        let slot = match page.backing() {
            Backing::File(file) if dirty && file.writeback() => {
                mapper.clear(vaddr);
                // SAFETY: The mapping is gone, and the eviction lock keeps the
                // frame from being handed out until it is released below.
                let frame = unsafe { self.frame_bytes(paddr) };
                let _file = self.file_lock.lock(tid);
                file.write_back(frame);
                VmStats::bump(&self.stats.write_backs);
                debug!("evict {vaddr:#X}: written back to file");
                None
            }
            _ if !dirty => {
                mapper.clear(vaddr);
                VmStats::bump(&self.stats.clean_discards);
                debug!("evict {vaddr:#X}: clean, discarded");
                None
            }
            _ => {
                let mut swap = self.swap.lock();
                if swap.is_full() {
                    return Err(VmError::SwapExhausted);
                }
                mapper.clear(vaddr);
                // SAFETY: As for the write back above.
                let frame = unsafe { self.frame_bytes(paddr) };
                let slot = swap.swap_out(frame)?;
                VmStats::bump(&self.stats.swap_outs);
                debug!("evict {vaddr:#X}: to {slot:?}");
                Some(slot)
            }
        };

        page.set_evicted(slot);
        drop(pages);

        self.frames.lock().release_frame(id);
        self.memory.free(paddr);
        Ok(())
    }

    /// Releases everything `page` holds: its frame, after writing it back if
    /// it is a dirty write-back page, or its swap slot. The page must already
    /// be unregistered, and the caller must hold the eviction lock.
    ///
    /// `tid` is the calling thread, or `None` if there is none, in which case
    /// file I/O waits for every other holder of the file lock.
    pub(crate) fn release_page(&self, memory: &ProcessMemory, page: &Page, tid: Option<Tid>) {
        let vaddr = page.vaddr();
        let mapper = memory.mapper();

        if let Some(id) = page.frame() {
            let dirty = mapper.is_dirty(vaddr);
            mapper.clear(vaddr);
            let Some(frame) = self.frames.lock().release_frame(id) else {
                return;
            };

            if let Backing::File(file) = page.backing() {
                if dirty && file.writeback() {
                    // SAFETY: The mapping is gone and the frame is out of the
                    // frame table, so nothing else can reach it.
                    let bytes = unsafe { self.frame_bytes(frame.paddr) };
                    let _file = match tid {
                        Some(tid) => self.file_lock.lock(tid),
                        None => self.file_lock.lock_exclusive(),
                    };
                    file.write_back(bytes);
                    VmStats::bump(&self.stats.write_backs);
                }
            }
            self.memory.free(frame.paddr);
        } else if let Some(slot) = page.slot() {
            self.swap.lock().free_slot(slot);
        }
    }

    /// Brings the contents of a non-resident page into the fresh frame at
    /// `paddr`. Returns whether the frame may later be discarded clean.
    pub(crate) fn populate(
        &self,
        paddr: PhysAddr,
        slot: Option<SwapSlot>,
        backing: &Backing,
        tid: Tid,
    ) -> Result<bool> {
        // SAFETY: `paddr` was just allocated and is not mapped anywhere yet.
        let frame = unsafe { self.frame_bytes(paddr) };
        match (slot, backing) {
            (Some(slot), _) => {
                self.swap.lock().swap_in(slot, frame)?;
                VmStats::bump(&self.stats.swap_ins);
                Ok(false)
            }
            (None, Backing::File(file)) => {
                let _file = self.file_lock.lock(tid);
                file.load(frame)?;
                Ok(true)
            }
            // Frames come from the pool zeroed.
            (None, Backing::Zero) => Ok(true),
        }
    }
}
