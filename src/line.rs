//! Line record and its ordering.

use std::cmp::Ordering;

use crate::collate::Collation;

/// A single record of a line file: `<index>.<text>\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Raw payload without the index prefix and the trailing newline.
    pub text: Vec<u8>,
    /// Caller-assigned ordinal, carried verbatim from input to output.
    pub index: i64,
    /// Byte offset of the record in the file it was last read from.
    pub position: u64,
}

impl Line {
    pub fn new(text: impl Into<Vec<u8>>, index: i64, position: u64) -> Self {
        Line {
            text: text.into(),
            index,
            position,
        }
    }

    /// Checks whether two lines carry the same record, ignoring where they were read from.
    pub fn same_record(&self, other: &Line) -> bool {
        self.index == other.index && self.text == other.text
    }

    /// Byte-wise ordering: text, then index, then position.
    pub fn cmp_bytes(&self, other: &Line) -> Ordering {
        self.text
            .cmp(&other.text)
            .then_with(|| self.tie_break(other))
    }

    /// Locale-aware ordering using `collation` for the payloads.
    ///
    /// The common byte prefix of both payloads is skipped (rounded down to a UTF-8 character
    /// boundary) and only the remaining suffixes are handed to the collation. A payload that is a
    /// strict prefix of the other sorts first. Ties fall back to index, then position.
    pub fn cmp_collated<C: Collation + ?Sized>(&self, other: &Line, collation: &C) -> Ordering {
        let (left, right) = (self.text.as_slice(), other.text.as_slice());
        let prefix = common_prefix_len(left, right);

        let ordering = if prefix == left.len() && prefix == right.len() {
            Ordering::Equal
        } else if prefix == left.len() {
            Ordering::Less
        } else if prefix == right.len() {
            Ordering::Greater
        } else {
            let start = floor_char_boundary(left, prefix);
            collation.compare(&left[start..], &right[start..])
        };

        ordering.then_with(|| self.tie_break(other))
    }

    /// Compares lines using `collation` if it is provided, otherwise byte-wise.
    pub fn cmp_with<C: Collation + ?Sized>(&self, other: &Line, collation: Option<&C>) -> Ordering {
        match collation {
            Some(collation) => self.cmp_collated(other, collation),
            None => self.cmp_bytes(other),
        }
    }

    pub fn less<C: Collation + ?Sized>(&self, other: &Line, collation: Option<&C>) -> bool {
        self.cmp_with(other, collation) == Ordering::Less
    }

    fn tie_break(&self, other: &Line) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.position.cmp(&other.position))
    }
}

fn common_prefix_len(left: &[u8], right: &[u8]) -> usize {
    left.iter().zip(right).take_while(|(l, r)| l == r).count()
}

/// Moves `pos` back until it no longer points at a UTF-8 continuation byte.
fn floor_char_boundary(text: &[u8], mut pos: usize) -> usize {
    while pos > 0 && pos < text.len() && (text[pos] & 0b1100_0000) == 0b1000_0000 {
        pos -= 1;
    }
    pos
}
