use std::mem::size_of;

use super::*;

const BITS_IN_BYTE: usize = 8;
const BITS_IN_WORD: usize = size_of::<u64>() * BITS_IN_BYTE;

impl ClusterMap {
    /// Empty bitmap for `size` clusters stored at `start_cluster`
    pub fn new(start_cluster: u32, size: u32) -> Self {
        Self {
            start_cluster,
            size,
            words: vec![0; (size as usize).div_ceil(BITS_IN_WORD)],
            dirty: false,
        }
    }

    /// Bytes occupied on disk
    pub fn byte_size(&self) -> usize {
        (self.size as usize).div_ceil(BITS_IN_BYTE)
    }

    /// Modify occupancy of heap index `index`
    pub(crate) fn set(&mut self, index: u32, value: bool) {
        assert!(index < self.size, "bitmap index {index} out of {}", self.size);
        let row = index as usize / BITS_IN_WORD;
        let mask = 1u64 << (index as usize % BITS_IN_WORD);
        if value {
            self.words[row] |= mask;
        } else {
            self.words[row] &= !mask;
        }
        self.dirty = true;
    }

    /// Get occupancy of heap index `index`
    pub(crate) fn get(&self, index: u32) -> bool {
        let row = index as usize / BITS_IN_WORD;
        let mask = 1u64 << (index as usize % BITS_IN_WORD);
        self.words[row] & mask != 0
    }

    /// Mark the first clear index in `start..end` and return it as a cluster number
    pub(crate) fn find_and_set(&mut self, start: u32, end: u32) -> Option<u32> {
        let end = end.min(self.size);
        let first_row = start as usize / BITS_IN_WORD;
        let last_row = (end as usize).div_ceil(BITS_IN_WORD);
        for row in first_row..last_row {
            if self.words[row] == u64::MAX {
                continue;
            }
            let from = (row * BITS_IN_WORD).max(start as usize) as u32;
            let to = ((row + 1) * BITS_IN_WORD).min(end as usize) as u32;
            if let Some(index) = (from..to).find(|&index| !self.get(index)) {
                self.set(index, true);
                return Some(index + FIRST_DATA_CLUSTER);
            }
        }
        None
    }

    pub fn count_free(&self) -> u32 {
        (0..self.size).filter(|&index| !self.get(index)).count() as u32
    }

    /// Load bitfield from its on-disk representation
    pub(crate) fn load(&mut self, buffer: &[u8]) {
        self.words.iter_mut().for_each(|word| *word = 0);
        for (row, chunk) in buffer[..self.byte_size()].chunks(size_of::<u64>()).enumerate() {
            let mut bytes = [0u8; size_of::<u64>()];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.words[row] = u64::from_le_bytes(bytes);
        }
        if let Some(last) = self.words.last_mut() {
            let tail = self.size as usize % BITS_IN_WORD;
            if tail != 0 {
                *last &= (1u64 << tail) - 1;
            }
        }
        self.dirty = false;
    }

    /// On-disk representation of the bitfield
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut buffer: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        buffer.truncate(self.byte_size());
        buffer
    }

    /// Runs of used clusters as inclusive cluster ranges
    pub fn used_runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut index = 0u32;
        std::iter::from_fn(move || {
            while index < self.size && !self.get(index) {
                index += 1;
            }
            if index >= self.size {
                return None;
            }
            let first = index;
            while index < self.size && self.get(index) {
                index += 1;
            }
            Some((first + FIRST_DATA_CLUSTER, index - 1 + FIRST_DATA_CLUSTER))
        })
    }
}
