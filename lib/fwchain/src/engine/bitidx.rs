// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Bitmap allocation of dense object indices.
//!
//! Each named-object table owns one [`IndexBitmap`] and hands every
//! object a small integer handle ("kidx") from it. Opcode streams
//! embed the kidx in place of a pointer, so the allocator must never
//! hand out the same index to two live objects, and index 0 is
//! permanently reserved to mean "no object".

/// Machine-word bit count; the bitmap is grouped into words so a scan
/// skips 32/64 indices per probe.
const WORD_BITS: usize = usize::BITS as usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitmapError {
    /// No free index remains. A hard limit, not a retry condition.
    Exhausted,
    /// The index is not currently allocated.
    DoubleFree(u32),
}

/// A fixed-capacity (growable under the owner's lock) bitmap of
/// allocatable indices. A set bit marks a free index.
#[derive(Debug)]
pub struct IndexBitmap {
    words: Vec<usize>,
    capacity: u32,
    /// Index of the first word that might contain a free bit. Never
    /// overshoots a free bit; may undershoot after allocations.
    hint: usize,
}

impl IndexBitmap {
    /// A bitmap holding indices `1..capacity`. Capacity below 2
    /// would leave nothing allocatable and is rounded up.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(2);
        let nwords = (capacity as usize).div_ceil(WORD_BITS);
        let mut bmap =
            Self { words: vec![0; nwords], capacity, hint: 0 };
        for idx in 1..capacity {
            bmap.set_bit(idx);
        }
        bmap
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take the lowest free index.
    pub fn alloc(&mut self) -> Result<u32, BitmapError> {
        for w in self.hint..self.words.len() {
            if self.words[w] == 0 {
                continue;
            }
            let bit = self.words[w].trailing_zeros() as usize;
            self.words[w] &= !(1 << bit);
            self.hint = w;
            return Ok((w * WORD_BITS + bit) as u32);
        }
        self.hint = self.words.len();
        Err(BitmapError::Exhausted)
    }

    /// Return `idx` to the free pool.
    pub fn free(&mut self, idx: u32) -> Result<(), BitmapError> {
        if idx == 0 || idx >= self.capacity || self.is_free(idx) {
            return Err(BitmapError::DoubleFree(idx));
        }
        self.set_bit(idx);
        let w = idx as usize / WORD_BITS;
        if w < self.hint {
            self.hint = w;
        }
        Ok(())
    }

    pub fn is_allocated(&self, idx: u32) -> bool {
        idx != 0 && idx < self.capacity && !self.is_free(idx)
    }

    /// Extend the index space. Existing allocations are preserved;
    /// a `new_capacity` at or below the current one is a no-op. The
    /// owner's mutation lock must be held, like every other method.
    pub fn grow(&mut self, new_capacity: u32) {
        if new_capacity <= self.capacity {
            return;
        }
        let nwords = (new_capacity as usize).div_ceil(WORD_BITS);
        let mut words = vec![0; nwords];
        words[..self.words.len()].copy_from_slice(&self.words);
        let old_capacity = self.capacity;
        self.words = words;
        self.capacity = new_capacity;
        for idx in old_capacity..new_capacity {
            self.set_bit(idx);
        }
        let first_new = old_capacity as usize / WORD_BITS;
        if first_new < self.hint {
            self.hint = first_new;
        }
    }

    fn is_free(&self, idx: u32) -> bool {
        let idx = idx as usize;
        self.words[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    fn set_bit(&mut self, idx: u32) {
        let idx = idx as usize;
        self.words[idx / WORD_BITS] |= 1 << (idx % WORD_BITS);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_is_never_allocated() {
        let mut bmap = IndexBitmap::new(64);
        let mut seen = std::collections::HashSet::new();
        while let Ok(idx) = bmap.alloc() {
            assert_ne!(idx, 0);
            assert!(seen.insert(idx), "index {idx} handed out twice");
        }
        assert_eq!(seen.len(), 63);
    }

    #[test]
    fn alloc_is_lowest_first() {
        let mut bmap = IndexBitmap::new(128);
        assert_eq!(bmap.alloc(), Ok(1));
        assert_eq!(bmap.alloc(), Ok(2));
        assert_eq!(bmap.alloc(), Ok(3));

        // Freed indices are preferred over fresh ones.
        bmap.free(2).unwrap();
        assert_eq!(bmap.alloc(), Ok(2));
        assert_eq!(bmap.alloc(), Ok(4));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut bmap = IndexBitmap::new(64);
        let idx = bmap.alloc().unwrap();
        bmap.free(idx).unwrap();
        assert_eq!(bmap.free(idx), Err(BitmapError::DoubleFree(idx)));
        assert_eq!(bmap.free(0), Err(BitmapError::DoubleFree(0)));
        assert_eq!(bmap.free(9999), Err(BitmapError::DoubleFree(9999)));

        // The rejected frees must not have corrupted anything: the
        // next alloc still returns the index we legitimately freed.
        assert_eq!(bmap.alloc(), Ok(idx));
    }

    #[test]
    fn exhaustion_is_hard() {
        let mut bmap = IndexBitmap::new(4);
        assert_eq!(bmap.alloc(), Ok(1));
        assert_eq!(bmap.alloc(), Ok(2));
        assert_eq!(bmap.alloc(), Ok(3));
        assert_eq!(bmap.alloc(), Err(BitmapError::Exhausted));
        assert_eq!(bmap.alloc(), Err(BitmapError::Exhausted));
    }

    #[test]
    fn grow_preserves_allocations() {
        let mut bmap = IndexBitmap::new(4);
        while bmap.alloc().is_ok() {}
        bmap.grow(8);
        assert_eq!(bmap.capacity(), 8);
        assert_eq!(bmap.alloc(), Ok(4));
        for idx in 1..4 {
            assert!(bmap.is_allocated(idx));
        }

        // Shrinking is a no-op.
        bmap.grow(2);
        assert_eq!(bmap.capacity(), 8);
    }

    #[test]
    fn hint_spans_many_words() {
        // Exercise the word-scan across a multi-word bitmap: drain
        // everything, free one index deep in the map, re-alloc it.
        let mut bmap = IndexBitmap::new(300);
        while bmap.alloc().is_ok() {}
        bmap.free(257).unwrap();
        assert_eq!(bmap.alloc(), Ok(257));
        assert_eq!(bmap.alloc(), Err(BitmapError::Exhausted));
    }
}
