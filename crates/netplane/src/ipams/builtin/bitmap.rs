//! Allocation bitmap over the host part of a subnet.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Host bits beyond this are not tracked.
pub const MAX_BITS: u32 = 64;

/// Set of allocated ordinals out of `0..=max_ordinal()`.
///
/// Serialized as a list of inclusive runs so a densely packed pool stays
/// small in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Runs", into = "Runs")]
pub struct Bitmap {
    bits: u32,
    set: BTreeSet<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Runs {
    bits: u32,
    runs: Vec<[u64; 2]>,
}

impl From<Bitmap> for Runs {
    fn from(bm: Bitmap) -> Self {
        let mut runs: Vec<[u64; 2]> = Vec::new();
        for ord in bm.set {
            match runs.last_mut() {
                Some(run) if run[1].checked_add(1) == Some(ord) => run[1] = ord,
                _ => runs.push([ord, ord]),
            }
        }
        Self { bits: bm.bits, runs }
    }
}

impl TryFrom<Runs> for Bitmap {
    type Error = String;

    fn try_from(runs: Runs) -> Result<Self, Self::Error> {
        let mut bm = Self::new(runs.bits);
        for [start, end] in runs.runs {
            if start > end || end > bm.max_ordinal() {
                return Err(format!("invalid run {start}-{end}"));
            }
            bm.set.extend(start..=end);
        }
        Ok(bm)
    }
}

impl Bitmap {
    /// Bitmap over `bits` host bits, capped at [`MAX_BITS`].
    #[must_use]
    pub fn new(bits: u32) -> Self {
        Self {
            bits: bits.min(MAX_BITS),
            set: BTreeSet::new(),
        }
    }

    /// Highest valid ordinal.
    #[must_use]
    pub const fn max_ordinal(&self) -> u64 {
        if self.bits >= MAX_BITS {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Whether `ord` is allocated.
    #[must_use]
    pub fn is_set(&self, ord: u64) -> bool {
        self.set.contains(&ord)
    }

    /// Mark `ord` allocated. Returns `false` if it already was or is out of
    /// range.
    pub fn set(&mut self, ord: u64) -> bool {
        ord <= self.max_ordinal() && self.set.insert(ord)
    }

    /// Mark `ord` free.
    pub fn unset(&mut self, ord: u64) {
        self.set.remove(&ord);
    }

    /// Lowest free ordinal within `start..=end`, if any.
    #[must_use]
    pub fn first_free(&self, start: u64, end: u64) -> Option<u64> {
        let end = end.min(self.max_ordinal());
        if start > end {
            return None;
        }
        let mut candidate = start;
        for &used in self.set.range(start..=end) {
            if used != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= end).then_some(candidate)
    }

    /// Number of allocated ordinals.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_free_skips_used() {
        let mut bm = Bitmap::new(8);
        assert_eq!(bm.max_ordinal(), 255);
        bm.set(0);
        bm.set(1);
        bm.set(3);
        assert_eq!(bm.first_free(0, 255), Some(2));
        assert_eq!(bm.first_free(3, 255), Some(4));
        assert_eq!(bm.first_free(3, 3), None);
        assert!(!bm.set(300));
    }

    #[test]
    fn wide_bitmap() {
        let mut bm = Bitmap::new(80);
        assert_eq!(bm.max_ordinal(), u64::MAX);
        assert!(bm.set(u64::MAX));
        assert_eq!(bm.first_free(u64::MAX, u64::MAX), None);
    }

    #[test]
    fn runs_format() {
        let mut bm = Bitmap::new(4);
        for ord in [0, 1, 2, 7, 15] {
            bm.set(ord);
        }
        let json = serde_json::to_string(&bm).unwrap();
        assert_eq!(json, r#"{"bits":4,"runs":[[0,2],[7,7],[15,15]]}"#);
        let back: Bitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bm);
        assert!(serde_json::from_str::<Bitmap>(r#"{"bits":4,"runs":[[3,16]]}"#).is_err());
    }

    proptest! {
        #[test]
        fn first_free_is_lowest_unset(ords in proptest::collection::btree_set(0u64..64, 0..64), start in 0u64..64) {
            let mut bm = Bitmap::new(6);
            for &o in &ords {
                bm.set(o);
            }
            let expected = (start..64).find(|o| !ords.contains(o));
            prop_assert_eq!(bm.first_free(start, 63), expected);
        }
    }
}
