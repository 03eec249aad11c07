//! Fixed-width integers packed into 64 bit words
//!
//! Block-state indices and heightmaps are stored as `long` arrays where each
//! element occupies `bits_per_value` bits. Two layouts exist in the wild:
//! older saves pack values as one continuous bit stream, newer saves never let
//! a value cross a word boundary and waste the leftover bits of every word.

/// Addressing convention used by a packed array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingMode {
    /// Values never span two words, trailing bits of each word are unused
    WordAligned,
    /// Values are packed back-to-back and may span two words
    Continuous,
}

/// Read-only view over bit-packed unsigned integers
#[derive(Debug, Clone)]
pub struct BitPackedArray {
    words: Vec<u64>,
    bits_per_value: u32,
    mask: u64,
    mode: PackingMode,
    values_per_word: u64,
    /// ceil(2^64 / values_per_word), used to replace the division
    divide_magic: u128,
}

impl BitPackedArray {
    /// Wrap `words` holding `bits_per_value` wide integers.
    ///
    /// `bits_per_value` is clamped into `1..=64`.
    pub fn new(words: Vec<u64>, bits_per_value: u32, mode: PackingMode) -> Self {
        let bits_per_value = bits_per_value.clamp(1, 64);
        let mask = if bits_per_value == 64 {
            u64::MAX
        } else {
            (1u64 << bits_per_value) - 1
        };
        let values_per_word = (64 / bits_per_value) as u64;
        let divide_magic = ((1u128 << 64) + values_per_word as u128 - 1) / values_per_word as u128;

        Self {
            words,
            bits_per_value,
            mask,
            mode,
            values_per_word,
            divide_magic,
        }
    }

    /// Build from the signed `long` array found in NBT data.
    pub fn from_longs(longs: &[i64], bits_per_value: u32, mode: PackingMode) -> Self {
        Self::new(longs.iter().map(|&l| l as u64).collect(), bits_per_value, mode)
    }

    pub fn bits_per_value(&self) -> u32 {
        self.bits_per_value
    }

    pub fn mode(&self) -> PackingMode {
        self.mode
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Number of values the backing words can hold
    pub fn capacity(&self) -> usize {
        match self.mode {
            PackingMode::WordAligned => self.words.len() * self.values_per_word as usize,
            PackingMode::Continuous => self.words.len() * 64 / self.bits_per_value as usize,
        }
    }

    /// Value at `index`, or 0 when the index lies outside the backing words.
    pub fn get(&self, index: usize) -> u64 {
        match self.mode {
            PackingMode::WordAligned => self.get_aligned(index),
            PackingMode::Continuous => self.get_continuous(index),
        }
    }

    fn get_aligned(&self, index: usize) -> u64 {
        let word_index = self.word_index(index);
        let Some(&word) = self.words.get(word_index) else {
            return 0;
        };

        let offset = (index as u64 - word_index as u64 * self.values_per_word) * self.bits_per_value as u64;
        (word >> offset) & self.mask
    }

    fn get_continuous(&self, index: usize) -> u64 {
        if index >= self.capacity() {
            return 0;
        }
        let bit_index = index as u64 * self.bits_per_value as u64;
        let word_index = (bit_index >> 6) as usize;
        let offset = (bit_index & 63) as u32;

        let Some(&word) = self.words.get(word_index) else {
            return 0;
        };

        let mut value = word >> offset;
        if offset + self.bits_per_value > 64 {
            // The tail of the value lives in the next word; a missing word reads as zero bits
            let next = self.words.get(word_index + 1).copied().unwrap_or(0);
            value |= next << (64 - offset);
        }

        value & self.mask
    }

    /// `index / values_per_word` via reciprocal multiplication.
    ///
    /// Exact for every index below 2^32, larger indices fall back to division.
    fn word_index(&self, index: usize) -> usize {
        if index as u64 > u32::MAX as u64 {
            return (index as u64 / self.values_per_word) as usize;
        }
        ((index as u128 * self.divide_magic) >> 64) as usize
    }
}
