//! Randomness collaborator injected into the provider and orchestrator.
//!
//! Every random draw in the loop goes through [`Sampler`], so a run is
//! reproducible from its seed and tests can pin values with
//! [`FixedSampler`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait Sampler: Send {
    /// Uniform draw in `[lo, hi]`.
    fn uniform(&mut self, lo: f64, hi: f64) -> f64;

    /// Uniform index in `0..len`. `len` must be non-zero.
    fn index(&mut self, len: usize) -> usize;

    /// Uniform integer in `[lo, hi]`.
    fn integer(&mut self, lo: u64, hi: u64) -> u64;
}

/// `StdRng`-backed sampler.
#[derive(Debug, Clone)]
pub struct RngSampler {
    rng: StdRng,
}

impl RngSampler {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seeded from `seed + stream` when a seed is configured, OS entropy otherwise.
    /// Distinct streams keep the provider and orchestrator draws independent.
    pub fn for_stream(seed: Option<u64>, stream: u64) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed.wrapping_add(stream)),
            None => Self {
                rng: StdRng::from_entropy(),
            },
        }
    }
}

impl Sampler for RngSampler {
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        self.rng.gen_range(lo..=hi)
    }

    fn index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.rng.gen_range(0..len)
    }

    fn integer(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        self.rng.gen_range(lo..=hi)
    }
}

/// Deterministic sampler for tests: every draw sits at the same relative
/// position of its range.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler {
    /// Position in `[0, 1]` within each uniform range.
    pub position: f64,
    /// Index returned (modulo `len`).
    pub index: usize,
}

impl FixedSampler {
    pub fn at(position: f64) -> Self {
        Self {
            position: position.clamp(0.0, 1.0),
            index: 0,
        }
    }
}

impl Sampler for FixedSampler {
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.position
    }

    fn index(&mut self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            self.index % len
        }
    }

    fn integer(&mut self, lo: u64, hi: u64) -> u64 {
        lo + ((hi.saturating_sub(lo)) as f64 * self.position).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_samplers_repeat() {
        let mut a = RngSampler::seeded(42);
        let mut b = RngSampler::seeded(42);
        for _ in 0..16 {
            assert_eq!(a.uniform(0.0, 1.0), b.uniform(0.0, 1.0));
            assert_eq!(a.index(7), b.index(7));
        }
    }

    #[test]
    fn draws_stay_in_range() {
        let mut s = RngSampler::seeded(1);
        for _ in 0..200 {
            let v = s.uniform(0.5, 1.0);
            assert!((0.5..=1.0).contains(&v));
            assert!(s.index(3) < 3);
            assert!((500..=3000).contains(&s.integer(500, 3000)));
        }
        assert_eq!(s.uniform(0.7, 0.7), 0.7);
    }

    #[test]
    fn fixed_sampler_is_positional() {
        let mut s = FixedSampler::at(1.0);
        assert_eq!(s.uniform(0.5, 1.0), 1.0);
        assert_eq!(s.integer(10, 20), 20);
        let mut s = FixedSampler::at(0.0);
        assert_eq!(s.uniform(0.5, 1.0), 0.5);
        assert_eq!(s.index(4), 0);
    }
}
