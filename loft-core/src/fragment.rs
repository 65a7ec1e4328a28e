//! Fragment layout: split a payload into fixed-size fragments, track received slots, reassemble.

use std::ops::Range;

/// Number of fragments for `total_length` bytes: `ceil(total / size)`.
/// `None` for a zero size or a count that does not fit a fragment index.
pub fn fragment_count(total_length: u64, fragment_size: u32) -> Option<u32> {
    if fragment_size == 0 {
        return None;
    }
    u32::try_from(total_length.div_ceil(fragment_size as u64)).ok()
}

/// Byte range of fragment `index`. The last fragment may be short.
pub fn fragment_range(index: u32, total_length: u64, fragment_size: u32) -> Range<usize> {
    let start = index as u64 * fragment_size as u64;
    let end = (start + fragment_size as u64).min(total_length);
    start.min(total_length) as usize..end as usize
}

/// Borrow fragment `index` out of the whole payload.
pub fn fragment_slice(data: &[u8], index: u32, fragment_size: u32) -> &[u8] {
    &data[fragment_range(index, data.len() as u64, fragment_size)]
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("fragment index {index} out of range (count {count})")]
    OutOfRange { index: u32, count: u32 },
    #[error("fragment {index} has {got} bytes, expected {expected}")]
    WrongLength {
        index: u32,
        got: usize,
        expected: usize,
    },
    #[error("reassembled {got} bytes, expected {expected}")]
    Incomplete { got: u64, expected: u64 },
    #[error("{total_length} bytes in {fragment_size}-byte fragments has no valid layout")]
    BadLayout { total_length: u64, fragment_size: u32 },
}

/// Receive-side slots: one per fragment index, `None` until that fragment arrives.
#[derive(Debug)]
pub struct FragmentSlots {
    total_length: u64,
    fragment_size: u32,
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
    received_bytes: u64,
}

impl FragmentSlots {
    pub fn new(total_length: u64, fragment_size: u32) -> Result<Self, FragmentError> {
        let count = fragment_count(total_length, fragment_size).ok_or(FragmentError::BadLayout {
            total_length,
            fragment_size,
        })?;
        Ok(Self {
            total_length,
            fragment_size,
            slots: vec![None; count as usize],
            filled: 0,
            received_bytes: 0,
        })
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Bytes covered by filled slots.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Store a fragment. Duplicates overwrite (last write wins).
    /// Returns true once every slot is filled.
    pub fn fill(&mut self, index: u32, bytes: Vec<u8>) -> Result<bool, FragmentError> {
        let count = self.len();
        if index >= count {
            return Err(FragmentError::OutOfRange { index, count });
        }
        let expected = fragment_range(index, self.total_length, self.fragment_size).len();
        if bytes.len() != expected {
            return Err(FragmentError::WrongLength {
                index,
                got: bytes.len(),
                expected,
            });
        }
        let slot = &mut self.slots[index as usize];
        if slot.is_none() {
            self.filled += 1;
            self.received_bytes += bytes.len() as u64;
        }
        *slot = Some(bytes);
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.len()
    }

    /// Still-empty slots in `[start, end)`, clamped to the slot count.
    pub fn missing_in_range(&self, start: u32, end: u32) -> u32 {
        let end = end.min(self.len());
        if start >= end {
            return 0;
        }
        self.slots[start as usize..end as usize]
            .iter()
            .filter(|s| s.is_none())
            .count() as u32
    }

    /// Every still-empty index, ascending.
    pub fn missing_indices(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Concatenate slots in index order. Fails unless every slot is filled and the lengths add up.
    pub fn reassemble(self) -> Result<Vec<u8>, FragmentError> {
        if !self.is_complete() {
            return Err(FragmentError::Incomplete {
                got: self.received_bytes,
                expected: self.total_length,
            });
        }
        let mut out = Vec::with_capacity(self.total_length as usize);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        if out.len() as u64 != self.total_length {
            return Err(FragmentError::Incomplete {
                got: out.len() as u64,
                expected: self.total_length,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_rounds_up() {
        assert_eq!(fragment_count(100, 30), Some(4));
        assert_eq!(fragment_count(90, 30), Some(3));
        assert_eq!(fragment_count(10, 100), Some(1));
        assert_eq!(fragment_count(0, 30), Some(0));
        assert_eq!(fragment_count(10, 0), None);
    }

    #[test]
    fn count_that_overflows_an_index_has_no_layout() {
        assert_eq!(fragment_count(1 << 40, 256), None);
        assert_eq!(fragment_count(u64::MAX, 1), None);
        assert_eq!(fragment_count(u32::MAX as u64, 1), Some(u32::MAX));
        assert!(matches!(
            FragmentSlots::new(1 << 40, 256),
            Err(FragmentError::BadLayout { fragment_size: 256, .. })
        ));
    }

    #[test]
    fn fifty_megabyte_snapshot_layout() {
        let total = 50_000_000u64;
        let size = 61_440u32;
        assert_eq!(fragment_count(total, size), Some(814));
        let last = fragment_range(813, total, size);
        assert_eq!(last.start, 813 * 61_440);
        assert_eq!(last.end, 50_000_000);
        assert_eq!(last.len(), 50_000_000 - 813 * 61_440);
    }

    #[test]
    fn slots_reassemble_out_of_order() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let mut slots = FragmentSlots::new(100, 30).unwrap();
        assert_eq!(slots.len(), 4);
        for index in [3u32, 1, 0, 2] {
            let done = slots
                .fill(index, fragment_slice(&data, index, 30).to_vec())
                .unwrap();
            assert_eq!(done, index == 2);
        }
        assert_eq!(slots.received_bytes(), 100);
        assert_eq!(slots.reassemble().unwrap(), data);
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let mut slots = FragmentSlots::new(50, 50).unwrap();
        assert!(slots.fill(0, vec![1u8; 50]).unwrap());
        assert!(slots.fill(0, vec![2u8; 50]).unwrap());
        assert_eq!(slots.received_bytes(), 50);
        assert_eq!(slots.reassemble().unwrap(), vec![2u8; 50]);
    }

    #[test]
    fn missing_counts_and_lists() {
        let mut slots = FragmentSlots::new(300, 10).unwrap();
        for i in (0..30).filter(|i| i % 4 != 0) {
            slots.fill(i, vec![0u8; 10]).unwrap();
        }
        assert_eq!(slots.missing_in_range(0, 25), 7);
        assert_eq!(slots.missing_in_range(25, 25), 0);
        assert_eq!(slots.missing_in_range(28, 1_000), 1);
        assert_eq!(slots.missing_indices(), vec![0, 4, 8, 12, 16, 20, 24, 28]);
    }

    #[test]
    fn rejects_bad_fragments() {
        let mut slots = FragmentSlots::new(100, 30).unwrap();
        assert!(matches!(
            slots.fill(4, vec![0u8; 10]),
            Err(FragmentError::OutOfRange { index: 4, count: 4 })
        ));
        assert!(matches!(
            slots.fill(3, vec![0u8; 30]),
            Err(FragmentError::WrongLength { expected: 10, .. })
        ));
    }

    #[test]
    fn reassemble_incomplete_fails() {
        let mut slots = FragmentSlots::new(60, 30).unwrap();
        slots.fill(0, vec![0u8; 30]).unwrap();
        assert!(matches!(
            slots.reassemble(),
            Err(FragmentError::Incomplete { got: 30, expected: 60 })
        ));
    }
}
