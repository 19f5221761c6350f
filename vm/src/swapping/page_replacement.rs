use log::trace;

/// Per-frame reference bits, indexed by position in the replacement ring.
pub trait ReferenceBits {
    fn accessed(&self, pos: usize) -> bool;
    fn dirty(&self, pos: usize) -> bool;
    fn clear_accessed(&mut self, pos: usize);
}

pub trait PageReplacementPolicy {
    /// Picks the ring position of the frame to evict from a ring of `len`
    /// frames, scanning from `cursor`. Returns [`None`] only if `len` is 0.
    fn select_victim(
        &mut self,
        len: usize,
        cursor: usize,
        bits: &mut dyn ReferenceBits,
    ) -> Option<usize>;
}

/// The clock (second chance) algorithm.
///
/// The first pass looks for a frame that is neither accessed nor dirty, which
/// can be reclaimed without I/O. The second pass walks the whole ring,
/// clearing accessed bits, and settles for the first unaccessed dirty frame.
/// If that finds nothing too, the frame under the cursor has just lost its
/// accessed bit and is taken.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecondChance;

impl PageReplacementPolicy for SecondChance {
    fn select_victim(
        &mut self,
        len: usize,
        cursor: usize,
        bits: &mut dyn ReferenceBits,
    ) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let cursor = cursor % len;
        let ring = (0..len).map(|i| (cursor + i) % len);

        if let Some(pos) = ring
            .clone()
            .find(|&pos| !bits.accessed(pos) && !bits.dirty(pos))
        {
            trace!("clock: clean victim at {pos} on first pass");
            return Some(pos);
        }

        let mut victim = None;
        for pos in ring {
            if bits.accessed(pos) {
                bits.clear_accessed(pos);
            } else if victim.is_none() {
                victim = Some(pos);
            }
        }

        trace!("clock: second pass chose {victim:?}");
        Some(victim.unwrap_or(cursor))
    }
}
