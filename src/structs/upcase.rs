use std::cmp::Ordering;
use std::fmt::Debug;

use super::*;

impl Upcase {
    /// Table mapping every unit to itself
    pub fn identity() -> Self {
        Self {
            table: (0..UPCASE_CHARS).map(|c| c as u16).collect(),
        }
    }

    /// Expand a compressed table, `0xFFFF n` skips `n` identity mappings
    pub fn decompress(source: &[u16]) -> Self {
        let mut upcase = Self::identity();
        let mut output = 0usize;
        let mut units = source.iter().copied().peekable();
        while let Some(c) = units.next() {
            if output >= UPCASE_CHARS {
                break;
            }
            match (c, units.peek()) {
                (0xFFFF, Some(&run)) => {
                    units.next();
                    output += run as usize;
                }
                _ => {
                    upcase.table[output] = c;
                    output += 1;
                }
            }
        }
        upcase
    }

    pub fn upcase(&self, c: u16) -> u16 {
        self.table[c as usize]
    }

    /// Case-insensitive ordering of two UTF-16 names
    pub fn compare(&self, a: &[u16], b: &[u16]) -> Ordering {
        let a = a.iter().map(|&c| self.upcase(c));
        let b = b.iter().map(|&c| self.upcase(c));
        a.cmp(b)
    }

    pub fn names_equal(&self, a: &[u16], b: &[u16]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Name hash stored in FILE_INFO entries
    pub fn name_hash(&self, name: &[u16]) -> u16 {
        name.iter().fold(0u16, |hash, &c| {
            let c = self.upcase(c);
            let hash = hash.rotate_right(1).wrapping_add(c & 0xff);
            hash.rotate_right(1).wrapping_add(c >> 8)
        })
    }
}

impl Debug for Upcase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapped = self
            .table
            .iter()
            .enumerate()
            .filter(|&(i, &c)| i as u16 != c)
            .count();
        write!(f, "Upcase {{ mapped: {mapped} }}")
    }
}
