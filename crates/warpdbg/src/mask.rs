//! Fixed-capacity membership sets for lanes, warps and SMs.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// A set of small integer indices backed by `WORDS` 64-bit words.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitMask<const WORDS: usize> {
    words: [u64; WORDS],
}

/// Lanes of a warp (at most 64).
pub type LaneMask = BitMask<1>;
/// Warps of an SM (at most 64).
pub type WarpMask = BitMask<1>;
/// SMs of a device (at most 256).
pub type SmMask = BitMask<4>;
/// Devices of the system (at most 64).
pub type DeviceMask = BitMask<1>;

impl<const WORDS: usize> BitMask<WORDS> {
    /// Number of indices the mask can hold.
    pub const CAPACITY: u32 = (WORDS * 64) as u32;

    pub const fn empty() -> Self {
        Self { words: [0; WORDS] }
    }

    /// A mask with the first `n` indices set.
    pub fn first_n(n: u32) -> Self {
        assert!(n <= Self::CAPACITY, "mask of {} exceeds capacity {}", n, Self::CAPACITY);
        let mut mask = Self::empty();
        for (i, word) in mask.words.iter_mut().enumerate() {
            let lo = (i * 64) as u32;
            if n >= lo + 64 {
                *word = u64::MAX;
            } else if n > lo {
                *word = (1u64 << (n - lo)) - 1;
            }
        }
        mask
    }

    /// A mask whose lowest word is `bits`.
    pub fn from_bits(bits: u64) -> Self {
        let mut mask = Self::empty();
        mask.words[0] = bits;
        mask
    }

    /// The lowest 64 indices as a raw word.
    pub fn bits(&self) -> u64 {
        self.words[0]
    }

    fn locate(index: u32) -> (usize, u64) {
        assert!(index < Self::CAPACITY, "index {} exceeds mask capacity {}", index, Self::CAPACITY);
        ((index / 64) as usize, 1u64 << (index % 64))
    }

    pub fn set(&mut self, index: u32) {
        let (w, bit) = Self::locate(index);
        self.words[w] |= bit;
    }

    pub fn clear(&mut self, index: u32) {
        let (w, bit) = Self::locate(index);
        self.words[w] &= !bit;
    }

    pub fn contains(&self, index: u32) -> bool {
        if index >= Self::CAPACITY {
            return false;
        }
        let (w, bit) = Self::locate(index);
        self.words[w] & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of members.
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Smallest member, if any.
    pub fn lowest(&self) -> Option<u32> {
        self.words
            .iter()
            .enumerate()
            .find(|&(_, &w)| w != 0)
            .map(|(i, w)| (i * 64) as u32 + w.trailing_zeros())
    }

    /// Members of `self` that are not in `other`.
    pub fn and_not(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
        out
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let base = (i * 64) as u32;
            (0..64u32).filter(move |b| word & (1u64 << b) != 0).map(move |b| base + b)
        })
    }
}

impl<const WORDS: usize> Default for BitMask<WORDS> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const WORDS: usize> BitOr for BitMask<WORDS> {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        for (w, r) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w |= r;
        }
        self
    }
}

impl<const WORDS: usize> BitAnd for BitMask<WORDS> {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        for (w, r) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w &= r;
        }
        self
    }
}

impl<const WORDS: usize> Not for BitMask<WORDS> {
    type Output = Self;

    fn not(mut self) -> Self {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self
    }
}

impl<const WORDS: usize> FromIterator<u32> for BitMask<WORDS> {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for i in iter {
            mask.set(i);
        }
        mask
    }
}

/// Hex, most significant word first.
impl<const WORDS: usize> fmt::Display for BitMask<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let top = self.words.iter().rposition(|&w| w != 0).unwrap_or(0);
        write!(f, "0x{:x}", self.words[top])?;
        for w in self.words[..top].iter().rev() {
            write!(f, "{:016x}", w)?;
        }
        Ok(())
    }
}

impl<const WORDS: usize> fmt::Debug for BitMask<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitMask({})", self)
    }
}
