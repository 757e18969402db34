//! Ranked bookkeeping of the best parameter matches seen so far.
//!
//! Matches are ordered by a goodness key (lower is better); ties keep
//! their insertion order, so the ranking is fully deterministic. The
//! container is bounded and evicts its worst entry when full.

use serde::{Deserialize, Serialize};

use sumc_core::params::SamplingBounds;

/// Fraction of the component range within which two parameter values
/// count as the same match.
const MATCH_TOLERANCE_FRACTION: f64 = 0.01;

/// One ranked match: the goodness key and the parameter vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestMatch {
    /// Goodness-of-fit key, lower is better.
    pub key: f64,
    /// Ordinal parameter vector of the match.
    pub p: Vec<f64>,
    seq: u64,
}

/// Bounded, deterministically ordered collection of best matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestMatches {
    capacity: usize,
    tolerance: Vec<f64>,
    entries: Vec<BestMatch>,
    next_seq: u64,
}

impl BestMatches {
    /// Create an empty collection holding at most `capacity` matches,
    /// with per-component uniqueness tolerances derived from the
    /// sampling ranges.
    pub fn new(capacity: usize, bounds: &SamplingBounds) -> Self {
        let tolerance = (0..bounds.len())
            .map(|i| MATCH_TOLERANCE_FRACTION * bounds.range(i))
            .collect();
        Self::with_tolerances(capacity, tolerance)
    }

    /// Like [`BestMatches::new`] but with explicit per-component
    /// tolerances, for matches that carry extra components beyond the
    /// sampling box (such as categorical dummies, whose range is one).
    pub fn with_tolerances(capacity: usize, tolerance: Vec<f64>) -> Self {
        BestMatches {
            capacity,
            tolerance,
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Matches in rank order, best first.
    pub fn iter(&self) -> impl Iterator<Item = &BestMatch> {
        self.entries.iter()
    }

    /// The best match so far, if any.
    pub fn best(&self) -> Option<&BestMatch> {
        self.entries.first()
    }

    /// Key of the worst retained match.
    pub fn worst_key(&self) -> Option<f64> {
        self.entries.last().map(|e| e.key)
    }

    /// Whether `p` differs from every stored match by more than the
    /// tolerance in at least one component.
    pub fn is_unique(&self, p: &[f64]) -> bool {
        !self.entries.iter().any(|e| {
            e.p.iter()
                .zip(p)
                .zip(&self.tolerance)
                .all(|((a, b), tol)| (a - b).abs() <= *tol)
        })
    }

    /// Insert a match, keeping the collection sorted and bounded.
    ///
    /// Returns false when the collection is full and the key is no
    /// better than the current worst.
    pub fn insert(&mut self, key: f64, p: Vec<f64>) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.entries.len() >= self.capacity {
            match self.worst_key() {
                Some(worst) if key >= worst => return false,
                _ => {}
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let pos = self
            .entries
            .partition_point(|e| (e.key, e.seq) <= (key, seq));
        self.entries.insert(pos, BestMatch { key, p, seq });
        if self.entries.len() > self.capacity {
            self.entries.pop();
        }
        true
    }

    /// Insert only when the candidate is not a near-duplicate of a
    /// stored match.
    pub fn insert_unique(&mut self, key: f64, p: Vec<f64>) -> bool {
        if !self.is_unique(&p) {
            return false;
        }
        self.insert(key, p)
    }

    /// Drop all matches, keeping capacity and tolerances.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sumc_core::params::ParameterPrior;

    fn bounds() -> SamplingBounds {
        let prior = ParameterPrior::new(2, vec![0.0, 0.0], vec![1.0, 1.0], vec![]).unwrap();
        SamplingBounds::full(&prior)
    }

    #[test]
    fn test_insert_keeps_rank_order() {
        let mut bm = BestMatches::new(10, &bounds());
        assert!(bm.insert(3.0, vec![0.3, 0.3]));
        assert!(bm.insert(1.0, vec![0.1, 0.1]));
        assert!(bm.insert(2.0, vec![0.2, 0.2]));
        let keys: Vec<f64> = bm.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1.0, 2.0, 3.0]);
        assert_eq!(bm.best().unwrap().p, vec![0.1, 0.1]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut bm = BestMatches::new(10, &bounds());
        bm.insert(1.0, vec![0.1, 0.1]);
        bm.insert(1.0, vec![0.2, 0.2]);
        bm.insert(1.0, vec![0.3, 0.3]);
        let ps: Vec<&Vec<f64>> = bm.iter().map(|e| &e.p).collect();
        assert_eq!(*ps[0], vec![0.1, 0.1]);
        assert_eq!(*ps[1], vec![0.2, 0.2]);
        assert_eq!(*ps[2], vec![0.3, 0.3]);
    }

    #[test]
    fn test_capacity_evicts_worst() {
        let mut bm = BestMatches::new(2, &bounds());
        assert!(bm.insert(3.0, vec![0.3, 0.3]));
        assert!(bm.insert(1.0, vec![0.1, 0.1]));
        assert!(bm.insert(2.0, vec![0.2, 0.2]));
        assert_eq!(bm.len(), 2);
        assert_eq!(bm.worst_key(), Some(2.0));
        // No better than the current worst
        assert!(!bm.insert(2.5, vec![0.25, 0.25]));
    }

    #[test]
    fn test_unique_match_tolerance() {
        let mut bm = BestMatches::new(10, &bounds());
        bm.insert(1.0, vec![0.5, 0.5]);
        // Within 1% of the range in every component: duplicate
        assert!(!bm.is_unique(&[0.505, 0.495]));
        // One component clearly apart: unique
        assert!(bm.is_unique(&[0.52, 0.5]));
        assert!(!bm.insert_unique(0.5, vec![0.501, 0.499]));
        assert!(bm.insert_unique(0.5, vec![0.55, 0.5]));
        assert_eq!(bm.len(), 2);
    }

    #[test]
    fn test_clear_resets() {
        let mut bm = BestMatches::new(2, &bounds());
        bm.insert(1.0, vec![0.1, 0.1]);
        bm.clear();
        assert!(bm.is_empty());
        assert!(bm.is_unique(&[0.1, 0.1]));
    }
}
