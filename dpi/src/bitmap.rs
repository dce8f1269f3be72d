/// A fixed-capacity bitmap over `[0, capacity)`, stored as `u64` words. One
/// bit per virtual-server partition: `capacity <= 65_536` bounds it to 8
/// KiB (§4.1), which is why this is a flat word array rather than anything
/// fancier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    capacity: u32,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(capacity: u32) -> Self {
        let nwords = (capacity as usize + 63) / 64;
        Bitmap {
            capacity,
            words: vec![0u64; nwords.max(1)],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn get(&self, i: u32) -> bool {
        debug_assert!(i < self.capacity, "bit {} out of range {}", i, self.capacity);
        let (word, bit) = (i as usize / 64, i as usize % 64);
        (self.words[word] >> bit) & 1 == 1
    }

    #[inline]
    pub fn set(&mut self, i: u32) {
        debug_assert!(i < self.capacity, "bit {} out of range {}", i, self.capacity);
        let (word, bit) = (i as usize / 64, i as usize % 64);
        self.words[word] |= 1u64 << bit;
    }

    /// OR `other` into `self` in place, returning `true` iff any new bit
    /// was set (i.e. `self` actually changed).
    pub fn merge_from(&mut self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.capacity, other.capacity);
        let mut changed = false;
        for (w, ow) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *w | *ow;
            if merged != *w {
                changed = true;
                *w = merged;
            }
        }
        changed
    }

    /// `self` OR-ed with `other`, as a new value. Pure variant of
    /// [`Bitmap::merge_from`] used by the semilattice property tests.
    pub fn merged(&self, other: &Bitmap) -> Bitmap {
        let mut out = self.clone();
        out.merge_from(other);
        out
    }

    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.capacity, other.capacity);
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(s, o)| s & o == *s)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn from_bytes(capacity: u32, bytes: &[u8]) -> Option<Self> {
        let nwords = (capacity as usize + 63) / 64;
        if bytes.len() != nwords * 8 {
            return None;
        }
        let words = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Some(Bitmap { capacity, words })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut b = Bitmap::new(128);
        assert!(!b.get(5));
        b.set(5);
        assert!(b.get(5));
        assert!(!b.get(4));
    }

    #[test]
    fn merge_is_or_and_reports_change() {
        let mut a = Bitmap::new(64);
        let mut b = Bitmap::new(64);
        a.set(1);
        b.set(2);
        assert!(a.merge_from(&b));
        assert!(a.get(1) && a.get(2));
        // merging again changes nothing.
        assert!(!a.merge_from(&b));
    }

    #[test]
    fn roundtrips_through_bytes() {
        let mut b = Bitmap::new(200);
        b.set(0);
        b.set(199);
        b.set(64);
        let bytes = b.to_bytes();
        assert_eq!(Bitmap::from_bytes(200, &bytes).unwrap(), b);
    }

    #[test]
    fn subset_check() {
        let mut a = Bitmap::new(64);
        let mut b = Bitmap::new(64);
        a.set(3);
        b.set(3);
        b.set(4);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
    }
}
