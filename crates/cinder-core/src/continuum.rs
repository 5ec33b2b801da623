//! Shard continuum: hash ranges mapped to backend indices.
//!
//! Built once per pool configuration and read-only at request time.
//! The 32-bit hash space is divided into contiguous ranges, one slice
//! per unit of backend weight; lookup is a binary search over the
//! range starts.

/// Ordered table mapping hash ranges to backend identifiers.
#[derive(Debug, Clone)]
pub struct Continuum {
    /// Range start points, ascending; entry `i` covers
    /// `[points[i].0, points[i+1].0)`.
    points: Vec<(u32, u16)>,
    backends: u16,
}

impl Continuum {
    /// Builds a continuum with one equal range per backend.
    ///
    /// # Panics
    ///
    /// Panics if `backends` is zero.
    pub fn uniform(backends: u16) -> Self {
        Self::weighted(&vec![1; usize::from(backends)])
    }

    /// Builds a continuum with ranges proportional to `weights`.
    ///
    /// Zero-weight backends get no range and never receive traffic.
    ///
    /// # Panics
    ///
    /// Panics if `weights` is empty or sums to zero.
    pub fn weighted(weights: &[u32]) -> Self {
        assert!(!weights.is_empty(), "continuum requires at least one backend");
        let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
        assert!(total > 0, "continuum requires positive total weight");

        let mut points = Vec::with_capacity(weights.len());
        let mut cum: u128 = 0;
        for (idx, &w) in weights.iter().enumerate() {
            if w == 0 {
                continue;
            }
            let start = (cum << 32) / u128::from(total);
            points.push((start as u32, idx as u16));
            cum += u128::from(w);
        }
        debug_assert_eq!(points[0].0, 0);

        Self {
            points,
            backends: weights.len() as u16,
        }
    }

    /// Maps a 32-bit digest to a backend index.
    pub fn locate(&self, hash: u32) -> u16 {
        let i = self.points.partition_point(|&(start, _)| start <= hash);
        // i >= 1 because points[0].0 == 0
        self.points[i - 1].1
    }

    /// Number of configured backends (including zero-weight ones).
    pub fn backend_count(&self) -> u16 {
        self.backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashkit::HashKind;

    #[test]
    fn uniform_covers_the_whole_space() {
        let c = Continuum::uniform(4);
        assert_eq!(c.locate(0), 0);
        assert_eq!(c.locate(u32::MAX), 3);
        for backend in 0..4u32 {
            let mid = backend * (u32::MAX / 4) + (u32::MAX / 8);
            assert_eq!(u32::from(c.locate(mid)), backend);
        }
    }

    #[test]
    fn single_backend_takes_everything() {
        let c = Continuum::uniform(1);
        assert_eq!(c.locate(0), 0);
        assert_eq!(c.locate(u32::MAX), 0);
    }

    #[test]
    fn zero_weight_backend_gets_no_traffic() {
        let c = Continuum::weighted(&[1, 0, 1]);
        for h in (0..=u32::MAX).step_by(1 << 24) {
            assert_ne!(c.locate(h), 1);
        }
    }

    #[test]
    fn weighted_ranges_are_proportional() {
        let c = Continuum::weighted(&[3, 1]);
        // backend 1 owns the top quarter of the space
        assert_eq!(c.locate(0), 0);
        assert_eq!(c.locate(u32::MAX / 2), 0);
        assert_eq!(c.locate(u32::MAX), 1);
        let boundary = ((3u64 << 32) / 4) as u32;
        assert_eq!(c.locate(boundary - 1), 0);
        assert_eq!(c.locate(boundary), 1);
    }

    #[test]
    fn shard_selection_is_stable_and_roughly_balanced() {
        let c = Continuum::uniform(4);
        let kind = HashKind::Murmur;

        // same key, same shard, every time
        let first = c.locate(kind.digest(b"abc"));
        for _ in 0..100 {
            assert_eq!(c.locate(kind.digest(b"abc")), first);
        }

        // random-ish keys spread across all shards without gross skew
        let mut counts = [0usize; 4];
        for i in 0..10_000u32 {
            let key = format!("key-{i}");
            counts[usize::from(c.locate(kind.digest(key.as_bytes())))] += 1;
        }
        for &n in &counts {
            assert!(n > 1_500, "skewed distribution: {counts:?}");
        }
    }
}
