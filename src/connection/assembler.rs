use std::{cmp, collections::BTreeMap, ops::Bound};

use bytes::{Buf, Bytes};

/// Reassembles out-of-order byte-stream data for in-order delivery
///
/// Buffered chunks are keyed by offset and kept non-overlapping; duplicate
/// and overlapping receptions are trimmed on insert so memory use is bounded
/// by the amount of genuinely new data.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    data: BTreeMap<u64, Bytes>,
    bytes_read: u64,
}

impl Assembler {
    /// Buffer `data` received at `offset`, discarding anything already
    /// delivered or already buffered
    pub(crate) fn insert(&mut self, mut offset: u64, mut data: Bytes) {
        if data.is_empty() || offset + data.len() as u64 <= self.bytes_read {
            return;
        }
        if offset < self.bytes_read {
            data.advance((self.bytes_read - offset) as usize);
            offset = self.bytes_read;
        }
        // Trim against the entry starting at or before the new data
        if let Some((&start, existing)) = self
            .data
            .range((Bound::Unbounded, Bound::Included(offset)))
            .next_back()
        {
            let existing_end = start + existing.len() as u64;
            if existing_end >= offset + data.len() as u64 {
                return;
            }
            if existing_end > offset {
                data.advance((existing_end - offset) as usize);
                offset = existing_end;
            }
        }
        // Slot the remainder around any later entries it overlaps
        while !data.is_empty() {
            let next = self
                .data
                .range((Bound::Included(offset), Bound::Unbounded))
                .next()
                .map(|(&start, buffered)| (start, start + buffered.len() as u64));
            match next {
                Some((next_start, next_end)) if next_start < offset + data.len() as u64 => {
                    let chunk = data.split_to((next_start - offset) as usize);
                    if !chunk.is_empty() {
                        self.data.insert(offset, chunk);
                    }
                    let covered = cmp::min(data.len() as u64, next_end - next_start);
                    data.advance(covered as usize);
                    offset = next_end;
                }
                _ => {
                    self.data.insert(offset, data);
                    break;
                }
            }
        }
    }

    /// Pull the next contiguous chunk, if the data at the read offset has
    /// arrived
    pub(crate) fn read(&mut self) -> Option<Bytes> {
        let (&start, _) = self.data.iter().next()?;
        if start != self.bytes_read {
            return None;
        }
        let data = self.data.remove(&start).unwrap();
        self.bytes_read += data.len() as u64;
        Some(data)
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Offset of the earliest buffered chunk, if any
    pub(crate) fn first_offset(&self) -> Option<u64> {
        self.data.keys().next().copied()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
