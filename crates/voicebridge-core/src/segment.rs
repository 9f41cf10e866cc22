//! Segment reassembly: synthesized speech arrives out of order and is
//! released in strict generation order.
//!
//! The TTS collaborator completes requests at unpredictable latency, so the
//! segment for index 2 can easily land before index 1. The buffer holds early
//! arrivals and releases the longest in-order run it can on every delivery.

use std::collections::HashMap;
use tracing::{debug, warn};

/// One unit of synthesized speech awaiting playback.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Generation index, or `None` for segments that play immediately
    /// regardless of ordering (the greeting, tool acknowledgements).
    pub index: Option<u64>,
    /// Raw mu-law audio bytes, frame-ready.
    pub payload: Vec<u8>,
    /// Source text of the segment, kept for diagnostics.
    pub label: String,
    /// Conversational turn this segment belongs to.
    pub utterance: u32,
}

impl Segment {
    /// A segment with a position in the generation order.
    pub fn ordered(index: u64, payload: Vec<u8>, label: impl Into<String>, utterance: u32) -> Self {
        Self {
            index: Some(index),
            payload,
            label: label.into(),
            utterance,
        }
    }

    /// A sentinel segment that bypasses ordering entirely.
    pub fn immediate(payload: Vec<u8>, label: impl Into<String>, utterance: u32) -> Self {
        Self {
            index: None,
            payload,
            label: label.into(),
            utterance,
        }
    }
}

/// Reorders segments delivered out of submission order back into generation
/// order.
///
/// Invariants: every pending key is strictly greater than `next_expected`,
/// and no index is ever released twice. There is deliberately no upper bound
/// on how long a gap may be held open: a permanently missing index stalls
/// release until `reset()`. That matches the source system's behavior and is
/// documented rather than patched over with a timeout.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    next_expected: u64,
    pending: HashMap<u64, Segment>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one segment and return every segment now ready to play, in
    /// order. Sentinel segments are returned immediately and never touch
    /// `next_expected`.
    pub fn release(&mut self, segment: Segment) -> Vec<Segment> {
        let index = match segment.index {
            None => return vec![segment],
            Some(index) => index,
        };

        if index < self.next_expected {
            // Duplicate or stale arrival. An error condition, but never fatal.
            warn!(index, next_expected = self.next_expected, "dropping stale segment");
            return Vec::new();
        }

        if index > self.next_expected {
            debug!(index, next_expected = self.next_expected, "buffering early segment");
            self.pending.insert(index, segment);
            return Vec::new();
        }

        let mut ready = vec![segment];
        self.next_expected += 1;
        while let Some(buffered) = self.pending.remove(&self.next_expected) {
            ready.push(buffered);
            self.next_expected += 1;
        }
        ready
    }

    /// Clear pending segments and restart the expected index at 0. Used when
    /// a session (re)starts.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_expected = 0;
    }

    /// Next index eligible for immediate release.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of segments parked ahead of their turn.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: u64) -> Segment {
        Segment::ordered(index, vec![index as u8], format!("segment {index}"), 0)
    }

    fn released_indices(buffer: &mut ReassemblyBuffer, order: &[u64]) -> Vec<u64> {
        let mut out = Vec::new();
        for &i in order {
            for s in buffer.release(seg(i)) {
                out.push(s.index.unwrap());
            }
        }
        out
    }

    fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut all = Vec::new();
        for (i, &head) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                all.push(tail);
            }
        }
        all
    }

    #[test]
    fn releases_in_order_for_every_arrival_permutation() {
        let indices = [0u64, 1, 2, 3];
        for order in permutations(&indices) {
            let mut buffer = ReassemblyBuffer::new();
            let released = released_indices(&mut buffer, &order);
            assert_eq!(released, vec![0, 1, 2, 3], "arrival order {order:?}");
            assert_eq!(buffer.pending_len(), 0);
        }
    }

    #[test]
    fn out_of_order_pair_yields_zero_then_one() {
        let mut buffer = ReassemblyBuffer::new();
        assert!(buffer.release(seg(1)).is_empty());
        let released = buffer.release(seg(0));
        let indices: Vec<u64> = released.iter().map(|s| s.index.unwrap()).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn sentinel_is_released_immediately_without_touching_order() {
        let mut buffer = ReassemblyBuffer::new();
        assert!(buffer.release(seg(2)).is_empty());

        let greeting = Segment::immediate(vec![9], "hello", 0);
        let released = buffer.release(greeting);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].index, None);

        // The sentinel neither advanced nor unblocked the ordered stream.
        assert_eq!(buffer.next_expected(), 0);
        assert_eq!(buffer.pending_len(), 1);
    }

    #[test]
    fn duplicates_of_released_indices_are_dropped() {
        let mut buffer = ReassemblyBuffer::new();
        assert_eq!(buffer.release(seg(0)).len(), 1);
        assert!(buffer.release(seg(0)).is_empty());
        assert_eq!(buffer.next_expected(), 1);
    }

    #[test]
    fn missing_index_stalls_until_reset() {
        let mut buffer = ReassemblyBuffer::new();
        assert!(buffer.release(seg(1)).is_empty());
        assert!(buffer.release(seg(2)).is_empty());
        assert_eq!(buffer.pending_len(), 2);

        buffer.reset();
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.release(seg(0)).len(), 1);
    }
}
