//! Reorder buffer.

use std::collections::BTreeMap;

/// Reorder buffer implementation.
/// Accepts items tagged with a sequence number in any order and releases them strictly in sequence order.
/// An item is held until all lower-numbered items have been released.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> ReorderBuffer<T> {
    /// Creates an empty buffer expecting sequence number `0` first.
    pub fn new() -> Self {
        ReorderBuffer {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Adds an item with sequence number `seq`.
    /// Items with a sequence number already released are ignored.
    pub fn insert(&mut self, seq: usize, item: T) {
        if seq < self.next {
            log::warn!("sequence number {} already released, item dropped", seq);
            return;
        }
        self.pending.insert(seq, item);
    }

    /// Releases the next item in sequence if it has arrived.
    pub fn pop_ready(&mut self) -> Option<(usize, T)> {
        let item = self.pending.remove(&self.next)?;
        let seq = self.next;
        self.next += 1;

        return Some((seq, item));
    }

    /// Sequence number of the next item to be released.
    pub fn next_seq(&self) -> usize {
        self.next
    }

    /// Number of items waiting for a predecessor.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        ReorderBuffer::new()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::ReorderBuffer;

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![0, 1, 2], vec![vec![0], vec![1], vec![2]])]
    #[case(vec![2, 1, 0], vec![vec![], vec![], vec![0, 1, 2]])]
    #[case(vec![1, 0, 3, 2], vec![vec![], vec![0, 1], vec![], vec![2, 3]])]
    #[case(vec![0, 2, 3, 1, 4], vec![vec![0], vec![], vec![], vec![1, 2, 3], vec![4]])]
    fn test_reorder(#[case] arrivals: Vec<usize>, #[case] expected_releases: Vec<Vec<usize>>) {
        let mut buffer = ReorderBuffer::new();

        let mut actual_releases = Vec::new();
        for seq in arrivals {
            buffer.insert(seq, seq * 10);

            let mut released = Vec::new();
            while let Some((seq, item)) = buffer.pop_ready() {
                assert_eq!(item, seq * 10);
                released.push(seq);
            }
            actual_releases.push(released);
        }

        assert_eq!(actual_releases, expected_releases);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_released_sequence_ignored() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, "first");
        assert_eq!(buffer.pop_ready(), Some((0, "first")));

        buffer.insert(0, "again");
        assert_eq!(buffer.pop_ready(), None);
        assert_eq!(buffer.next_seq(), 1);
        assert_eq!(buffer.pending(), 0);
    }
}
