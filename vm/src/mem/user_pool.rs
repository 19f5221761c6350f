use super::{PhysAddr, PhysicalAllocator};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitbybit::bitfield;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kidneyos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};
use kidneyos_shared::sizes::MB;
use log::info;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

#[repr(C, align(4096))]
struct FrameBuf([u8; PAGE_FRAME_SIZE]);

enum Backing {
    /// Frames carved out of physical memory by the kernel allocator.
    Region(NonNull<u8>),
    /// Frames allocated on the heap, for hosted builds.
    Heap(Box<[UnsafeCell<FrameBuf>]>),
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    /// Where the next-fit search resumes.
    position: usize,
    frames_allocated: usize,
}

/// A fixed-size pool of frames reserved for user pages.
pub struct UserPool {
    backing: Backing,
    phys_base: PhysAddr,
    frames: usize,
    core_map: Mutex<CoreMap>,
}

// SAFETY: Frame contents are only reached through `kernel_view`, whose callers
// uphold exclusive ownership of each allocated frame.
unsafe impl Send for UserPool {}
unsafe impl Sync for UserPool {}

impl UserPool {
    /// Physical address reported for the first frame of a heap-backed pool.
    /// User memory on the real machine starts after the first megabyte too.
    pub const HEAP_PHYS_BASE: PhysAddr = MB;

    /// Creates a heap-backed pool of `frames` frames.
    pub fn new(frames: usize) -> Self {
        let buffers: Vec<UnsafeCell<FrameBuf>> = (0..frames)
            .map(|_| UnsafeCell::new(FrameBuf([0; PAGE_FRAME_SIZE])))
            .collect();
        Self::with_backing(Backing::Heap(buffers.into_boxed_slice()), Self::HEAP_PHYS_BASE, frames)
    }

    /// Creates a pool over `frames` frames of memory starting at `start`,
    /// whose physical address is `phys_base`.
    ///
    /// # Safety
    ///
    /// `start` must be page aligned and point to `frames * PAGE_FRAME_SIZE`
    /// bytes that nothing else uses for the lifetime of the pool.
    pub unsafe fn from_region(start: NonNull<u8>, phys_base: PhysAddr, frames: usize) -> Self {
        assert!(is_page_aligned(start.as_ptr() as usize));
        Self::with_backing(Backing::Region(start), phys_base, frames)
    }

    fn with_backing(backing: Backing, phys_base: PhysAddr, frames: usize) -> Self {
        assert!(is_page_aligned(phys_base));
        info!("user pool: {frames} frames at {phys_base:#X}");
        Self {
            backing,
            phys_base,
            frames,
            core_map: Mutex::new(CoreMap {
                entries: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                position: 0,
                frames_allocated: 0,
            }),
        }
    }

    fn frame_index(&self, paddr: PhysAddr) -> usize {
        assert!(
            paddr >= self.phys_base && is_page_aligned(paddr),
            "{paddr:#X} is not a frame of this pool"
        );
        let idx = (paddr - self.phys_base) / PAGE_FRAME_SIZE;
        assert!(idx < self.capacity(), "{paddr:#X} is past the end of the pool");
        idx
    }

    fn frame_ptr(&self, idx: usize) -> NonNull<u8> {
        match &self.backing {
            // SAFETY: `idx` is within the region the caller of `from_region` vouched for.
            Backing::Region(start) => unsafe { start.add(idx * PAGE_FRAME_SIZE) },
            Backing::Heap(frames) => NonNull::from(&frames[idx]).cast(),
        }
    }
}

/// Finds the first free frame at or after `position`, wrapping around once.
fn next_fit(core_map: &[CoreMapEntry], position: usize) -> Option<usize> {
    let total_frames = core_map.len();
    (0..total_frames)
        .map(|i| (position + i) % total_frames)
        .find(|&idx| !core_map[idx].allocated())
}

// SAFETY: The core map hands out each frame once until it is freed, and frame
// memory lives as long as the pool.
unsafe impl PhysicalAllocator for UserPool {
    fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let idx = {
            let mut core_map = self.core_map.lock();
            let idx = next_fit(&core_map.entries, core_map.position)?;
            core_map.entries[idx] = core_map.entries[idx].with_allocated(true);
            core_map.position = (idx + 1) % core_map.entries.len();
            core_map.frames_allocated += 1;
            idx
        };

        // SAFETY: We just took exclusive ownership of this frame.
        unsafe { self.frame_ptr(idx).write_bytes(0, PAGE_FRAME_SIZE) };
        Some(self.phys_base + idx * PAGE_FRAME_SIZE)
    }

    fn free(&self, paddr: PhysAddr) {
        let idx = self.frame_index(paddr);
        let mut core_map = self.core_map.lock();
        assert!(
            core_map.entries[idx].allocated(),
            "double free of frame {paddr:#X}"
        );
        core_map.entries[idx] = core_map.entries[idx].with_allocated(false);
        core_map.frames_allocated -= 1;
    }

    fn kernel_view(&self, paddr: PhysAddr) -> NonNull<u8> {
        self.frame_ptr(self.frame_index(paddr))
    }

    fn capacity(&self) -> usize {
        self.frames
    }

    fn free_frames(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.frames_allocated
    }
}
