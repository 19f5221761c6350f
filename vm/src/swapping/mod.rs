//! Swap space: page-sized slots on a block device.

mod page_replacement;

pub use page_replacement::{PageReplacementPolicy, ReferenceBits, SecondChance};

use crate::block::{BlockDevice, BlockSector, BLOCK_SECTOR_SIZE};
use crate::error::{Result, VmError};
use alloc::boxed::Box;
use core::fmt;
use kidneyos_shared::bitmap::Bitmap;
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
use log::{debug, info, warn};

/// A swap slot, identified by the first of its `SECTORS_PER_PAGE` sectors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(BlockSector);

impl SwapSlot {
    #[allow(clippy::cast_possible_truncation)]
    fn from_index(index: usize) -> Self {
        Self(index as BlockSector * SECTORS_PER_PAGE)
    }

    pub fn index(self) -> usize {
        (self.0 / SECTORS_PER_PAGE) as usize
    }

    pub fn first_sector(self) -> BlockSector {
        self.0
    }

    fn sectors(self) -> impl Iterator<Item = BlockSector> {
        self.0..self.0 + SECTORS_PER_PAGE
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.index())
    }
}

/// Bookkeeping for the swap device.
///
/// The caller serializes access (the subsystem keeps this behind the swap
/// lock), which also keeps slot state and device contents in step: a slot's
/// bit is set exactly while its sectors hold a page.
pub struct SwapSpace {
    device: Option<Box<dyn BlockDevice>>,
    used: Bitmap,
    sectors_read: u32,
    sectors_written: u32,
}

impl SwapSpace {
    /// Sets up swap on `device`. Without a device every swap-out fails.
    pub fn new(device: Option<Box<dyn BlockDevice>>) -> Self {
        let slots = match &device {
            Some(device) => (device.size() / SECTORS_PER_PAGE) as usize,
            None => {
                warn!("no swap device, swapping disabled");
                0
            }
        };
        info!("swap: {slots} slots");

        Self {
            device,
            used: Bitmap::new(slots),
            sectors_read: 0,
            sectors_written: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.used.len()
    }

    pub fn free_slots(&self) -> usize {
        self.used.len() - self.used.count_ones()
    }

    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    pub fn is_slot_used(&self, slot: SwapSlot) -> bool {
        self.used.test(slot.index())
    }

    /// Sectors read and written since boot.
    pub fn io_counts(&self) -> (u32, u32) {
        (self.sectors_read, self.sectors_written)
    }

    /// Writes `frame` to a free slot and returns it.
    pub fn swap_out(&mut self, frame: &[u8]) -> Result<SwapSlot> {
        assert_eq!(frame.len(), PAGE_FRAME_SIZE);

        let index = self.used.scan_and_flip().ok_or(VmError::SwapExhausted)?;
        let slot = SwapSlot::from_index(index);
        // `used` can only have bits if there is a device.
        let device = self.device.as_mut().ok_or(VmError::SwapExhausted)?;

        for (sector, chunk) in slot.sectors().zip(frame.chunks_exact(BLOCK_SECTOR_SIZE)) {
            if let Err(err) = device.write(sector, chunk) {
                self.used.reset(index);
                return Err(err.into());
            }
            self.sectors_written += 1;
        }

        debug!("swapped out to {slot:?}");
        Ok(slot)
    }

    /// Reads `slot` back into `frame` and frees the slot.
    pub fn swap_in(&mut self, slot: SwapSlot, frame: &mut [u8]) -> Result<()> {
        assert_eq!(frame.len(), PAGE_FRAME_SIZE);
        assert!(self.is_slot_used(slot), "swap in from free {slot:?}");

        let device = self.device.as_mut().ok_or(VmError::SwapExhausted)?;
        for (sector, chunk) in slot.sectors().zip(frame.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            device.read(sector, chunk)?;
            self.sectors_read += 1;
        }

        self.used.reset(slot.index());
        debug!("swapped in from {slot:?}");
        Ok(())
    }

    /// Frees `slot` without reading it, for pages destroyed while swapped out.
    pub fn free_slot(&mut self, slot: SwapSlot) {
        if slot.index() >= self.slot_count() || !self.used.reset(slot.index()) {
            warn!("freeing {slot:?}, which is not in use");
        }
    }
}
