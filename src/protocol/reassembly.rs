//! Out-of-order receive queue.

use std::collections::VecDeque;

use super::SeqNumber;

/// Data received ahead of `RCV.NXT`, kept until the gap before it is filled.
///
/// Fragments are kept sorted by sequence number. Overlapping or adjacent
/// fragments are merged on insertion, so consecutive fragments are always
/// separated by a hole.
#[derive(Debug, Default)]
pub struct ReassemblyQueue {
    fragments: VecDeque<(SeqNumber, Vec<u8>)>,
}

impl ReassemblyQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Returns the number of disjoint fragments queued.
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Returns the number of bytes queued.
    pub fn queued_bytes(&self) -> usize {
        self.fragments.iter().map(|(_, data)| data.len()).sum()
    }

    /// Returns the sequence number of the first queued byte.
    pub fn first_seq(&self) -> Option<SeqNumber> {
        self.fragments.front().map(|(seq, _)| *seq)
    }

    /// Queues `data` starting at `seq`, merging it with any fragment it
    /// overlaps or touches.
    pub fn insert(&mut self, seq: SeqNumber, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut start = seq;
        let mut merged = data.to_vec();
        let mut i = 0;

        while i < self.fragments.len() {
            let end = start + merged.len() as u32;
            let (frag_start, frag_len) = {
                let (s, d) = &self.fragments[i];
                (*s, d.len() as u32)
            };
            let frag_end = frag_start + frag_len;

            if frag_end.lt(start) {
                i += 1;
                continue;
            }

            if end.lt(frag_start) {
                break;
            }

            let Some((_, frag)) = self.fragments.remove(i) else {
                break;
            };

            if frag_start.lt(start) {
                let mut joined = frag[..start.distance(frag_start) as usize].to_vec();
                joined.extend_from_slice(&merged);
                merged = joined;
                start = frag_start;
            }

            let end = start + merged.len() as u32;
            if frag_end.gt(end) {
                merged.extend_from_slice(&frag[end.distance(frag_start) as usize..]);
            }
        }

        self.fragments.insert(i, (start, merged));
    }

    /// Removes and returns the queued bytes that continue directly from
    /// `rcv_nxt`, discarding any queued bytes that lie before it.
    pub fn take_contiguous(&mut self, rcv_nxt: SeqNumber) -> Option<Vec<u8>> {
        let mut next = rcv_nxt;
        let mut out: Option<Vec<u8>> = None;

        while let Some((start, data)) = self.fragments.front() {
            if start.gt(next) {
                break;
            }

            let end = *start + data.len() as u32;

            if end.gt(next) {
                let skip = next.distance(*start) as usize;
                out.get_or_insert_with(Vec::new)
                    .extend_from_slice(&data[skip..]);
                next = end;
            }

            self.fragments.pop_front();
        }

        out
    }

    /// Discards everything queued.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(range: std::ops::Range<u8>) -> Vec<u8> {
        range.collect()
    }

    #[test]
    fn reassembly_merges_adjacent_fragments() {
        let mut q = ReassemblyQueue::new();

        q.insert(SeqNumber::new(20), &bytes(20..30));
        q.insert(SeqNumber::new(40), &bytes(40..50));
        assert_eq!(q.fragment_count(), 2);

        q.insert(SeqNumber::new(30), &bytes(30..40));
        assert_eq!(q.fragment_count(), 1);
        assert_eq!(q.queued_bytes(), 30);
        assert_eq!(q.first_seq(), Some(SeqNumber::new(20)));

        assert_eq!(q.take_contiguous(SeqNumber::new(20)), Some(bytes(20..50)));
        assert!(q.is_empty());
    }

    #[test]
    fn reassembly_overlap_and_duplicates() {
        let mut q = ReassemblyQueue::new();

        q.insert(SeqNumber::new(10), &bytes(10..20));
        q.insert(SeqNumber::new(15), &bytes(15..25));
        q.insert(SeqNumber::new(5), &bytes(5..12));
        q.insert(SeqNumber::new(10), &bytes(10..20));

        assert_eq!(q.fragment_count(), 1);
        assert_eq!(q.take_contiguous(SeqNumber::new(5)), Some(bytes(5..25)));
    }

    #[test]
    fn reassembly_fragment_covering_existing() {
        let mut q = ReassemblyQueue::new();

        q.insert(SeqNumber::new(12), &bytes(12..14));
        q.insert(SeqNumber::new(10), &bytes(10..20));

        assert_eq!(q.fragment_count(), 1);
        assert_eq!(q.take_contiguous(SeqNumber::new(10)), Some(bytes(10..20)));
    }

    #[test]
    fn reassembly_take_stops_at_hole() {
        let mut q = ReassemblyQueue::new();

        q.insert(SeqNumber::new(10), &bytes(10..20));
        q.insert(SeqNumber::new(30), &bytes(30..40));

        assert_eq!(q.take_contiguous(SeqNumber::new(5)), None);
        assert_eq!(q.take_contiguous(SeqNumber::new(15)), Some(bytes(15..20)));
        assert_eq!(q.fragment_count(), 1);
        assert_eq!(q.take_contiguous(SeqNumber::new(25)), None);
    }

    #[test]
    fn reassembly_across_wraparound() {
        let mut q = ReassemblyQueue::new();
        let base = SeqNumber::new(u32::MAX - 4);

        q.insert(base + 10, &bytes(10..20));
        q.insert(base + 5, &bytes(5..10));

        assert_eq!(q.fragment_count(), 1);
        assert_eq!(q.first_seq(), Some(SeqNumber::new(0)));
        assert_eq!(q.take_contiguous(base + 5), Some(bytes(5..20)));
    }

    #[test]
    fn reassembly_discards_stale_data() {
        let mut q = ReassemblyQueue::new();

        q.insert(SeqNumber::new(10), &bytes(10..20));

        // Everything queued is already behind RCV.NXT.
        assert_eq!(q.take_contiguous(SeqNumber::new(20)), None);
        assert!(q.is_empty());

        q.insert(SeqNumber::new(30), &bytes(30..40));
        q.clear();
        assert!(q.is_empty());
    }
}
