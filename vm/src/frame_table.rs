//! Registry of the frames currently holding user pages.
//!
//! Frames live in an arena and are referred to by [`FrameId`]. A separate
//! ring fixes the order the clock sweeps them in; new frames are inserted just
//! behind the cursor so they are the last to be considered.

use crate::address_space::ProcessMemory;
use crate::mem::PhysAddr;
use crate::swapping::{PageReplacementPolicy, ReferenceBits, SecondChance};
use crate::Tid;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Stable index of a frame in the frame table.
pub type FrameId = usize;

/// A physical frame committed to one user page.
pub struct Frame {
    pub(crate) paddr: PhysAddr,
    pub(crate) owner: Tid,
    /// Address space and page address of the page held in this frame.
    pub(crate) memory: Arc<ProcessMemory>,
    pub(crate) vaddr: usize,
}

impl Frame {
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Thread whose fault brought the page in.
    pub fn owner(&self) -> Tid {
        self.owner
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    fn accessed(&self) -> bool {
        self.memory.mapper().is_accessed(self.vaddr)
    }

    fn dirty(&self) -> bool {
        self.memory.mapper().is_dirty(self.vaddr)
    }
}

#[derive(Default)]
pub struct FrameTable {
    slots: Vec<Option<Frame>>,
    free_ids: Vec<FrameId>,
    /// Clock order.
    ring: Vec<FrameId>,
    /// Position in `ring` the next sweep starts from; `None` iff `ring` is empty.
    cursor: Option<usize>,
    policy: SecondChance,
}

/// Reference bits of the frames in ring order, read from their page tables.
struct RingBits<'a> {
    ring: &'a [FrameId],
    slots: &'a [Option<Frame>],
}

impl RingBits<'_> {
    fn frame(&self, pos: usize) -> &Frame {
        self.slots[self.ring[pos]]
            .as_ref()
            .expect("frame table ring refers to an empty slot")
    }
}

impl ReferenceBits for RingBits<'_> {
    fn accessed(&self, pos: usize) -> bool {
        self.frame(pos).accessed()
    }

    fn dirty(&self, pos: usize) -> bool {
        self.frame(pos).dirty()
    }

    fn clear_accessed(&mut self, pos: usize) {
        let frame = self.frame(pos);
        frame.memory.mapper().reset_accessed(frame.vaddr);
    }
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.slots.get(id)?.as_ref()
    }

    /// The frames in clock order, starting from the cursor.
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        let start = self.cursor.unwrap_or(0);
        let len = self.ring.len();
        (0..len).map(move |i| {
            let id = self.ring[(start + i) % len];
            (id, self.slots[id].as_ref().expect("frame table ring refers to an empty slot"))
        })
    }

    /// The frame the next sweep will look at first.
    pub fn cursor(&self) -> Option<FrameId> {
        self.cursor.map(|pos| self.ring[pos])
    }

    /// Registers `frame` and returns its id.
    pub fn allocate_frame(&mut self, frame: Frame) -> FrameId {
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.slots[id] = Some(frame);
                id
            }
            None => {
                self.slots.push(Some(frame));
                self.slots.len() - 1
            }
        };

        self.cursor = Some(match self.cursor {
            None => {
                self.ring.push(id);
                0
            }
            Some(pos) => {
                self.ring.insert(pos, id);
                pos + 1
            }
        });

        id
    }

    /// Removes frame `id` from the table and returns it.
    pub fn release_frame(&mut self, id: FrameId) -> Option<Frame> {
        let frame = self.slots.get_mut(id)?.take()?;
        self.free_ids.push(id);

        let pos = self
            .ring
            .iter()
            .position(|&other| other == id)
            .expect("live frame missing from the ring");
        self.ring.remove(pos);

        self.cursor = match self.cursor {
            _ if self.ring.is_empty() => None,
            // Whatever followed the removed frame slides into its position.
            Some(cursor) if pos < cursor => Some(cursor - 1),
            Some(cursor) if cursor >= self.ring.len() => Some(0),
            cursor => cursor,
        };

        Some(frame)
    }

    /// Picks a frame to evict with the clock algorithm, leaving the cursor
    /// just past it. The frame stays registered until it is released.
    pub fn find_victim(&mut self) -> Option<FrameId> {
        let cursor = self.cursor?;
        let len = self.ring.len();
        let mut bits = RingBits {
            ring: &self.ring,
            slots: &self.slots,
        };
        let pos = self.policy.select_victim(len, cursor, &mut bits)?;

        self.cursor = Some((pos + 1) % len);
        Some(self.ring[pos])
    }
}
