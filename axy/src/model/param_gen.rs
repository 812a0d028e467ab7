//! Initial value patterns written straight into blocks of the model vector.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{AxyErr, Result};

/// Overwrites a block of parameters with an initial pattern.
pub trait ParamGen {
    fn fill(&mut self, out: &mut [f32]);
}

/// Every value set to the same number.
#[derive(Debug, Clone, Copy)]
pub struct FixedValue(pub f32);

impl ParamGen for FixedValue {
    fn fill(&mut self, out: &mut [f32]) {
        out.fill(self.0);
    }
}

/// Hinge positions spread evenly over `[low, high]`.
///
/// Position `k` of a block gets point `k % period` of the sweep, so a layer's shifts
/// cover the interval once and later layers repeat it. A single point sits in the middle.
#[derive(Debug, Clone, Copy)]
pub struct EvenSpread {
    low: f32,
    high: f32,
    period: usize,
}

impl EvenSpread {
    pub fn new(low: f32, high: f32, period: usize) -> Self {
        Self {
            low,
            high,
            period: period.max(1),
        }
    }

    fn point(&self, k: usize) -> f32 {
        if self.period == 1 {
            return (self.low + self.high) / 2.;
        }
        let t = k as f32 / (self.period - 1) as f32;
        self.low + t * (self.high - self.low)
    }
}

impl ParamGen for EvenSpread {
    fn fill(&mut self, out: &mut [f32]) {
        for (k, v) in out.iter_mut().enumerate() {
            *v = self.point(k % self.period);
        }
    }
}

/// Independent draws from `dist`, sharing the caller's generator.
pub struct Sampled<'r, R: Rng, D: Distribution<f32>> {
    rng: &'r mut R,
    dist: D,
}

impl<'r, R: Rng> Sampled<'r, R, Uniform<f32>> {
    /// Draws from `[low, high)`, failing when the interval is empty.
    pub fn uniform(rng: &'r mut R, low: f32, high: f32) -> Result<Self> {
        let dist = Uniform::new(low, high)
            .map_err(|e| AxyErr::config("uniform range", e.to_string()))?;
        Ok(Self { rng, dist })
    }
}

impl<'r, R: Rng> Sampled<'r, R, Normal<f32>> {
    /// Draws from a normal distribution, failing on a non-finite deviation.
    pub fn normal(rng: &'r mut R, mean: f32, std_dev: f32) -> Result<Self> {
        let dist = Normal::new(mean, std_dev)
            .map_err(|e| AxyErr::config("normal deviation", e.to_string()))?;
        Ok(Self { rng, dist })
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for Sampled<'_, R, D> {
    fn fill(&mut self, out: &mut [f32]) {
        for v in out.iter_mut() {
            *v = self.dist.sample(&mut *self.rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn fixed_values_cover_the_block() {
        let mut out = [3.; 4];
        FixedValue(0.5).fill(&mut out);
        assert_eq!(out, [0.5; 4]);
    }

    #[test]
    fn spreads_repeat_every_period() {
        let mut out = [9.; 7];
        EvenSpread::new(-1., 1., 3).fill(&mut out);
        assert_eq!(out, [-1., 0., 1., -1., 0., 1., -1.]);
    }

    #[test]
    fn single_point_spread_sits_in_the_middle() {
        let mut out = [0.; 2];
        EvenSpread::new(-2., 4., 1).fill(&mut out);
        assert_eq!(out, [1., 1.]);
    }

    #[test]
    fn uniform_draws_stay_in_range_and_follow_the_seed() {
        let mut first = [0.; 10];
        let mut rng = StdRng::seed_from_u64(42);
        Sampled::uniform(&mut rng, -1., 1.).unwrap().fill(&mut first);
        assert!(first.iter().all(|v| (-1. ..1.).contains(v)));

        let mut second = [0.; 10];
        let mut rng = StdRng::seed_from_u64(42);
        Sampled::uniform(&mut rng, -1., 1.).unwrap().fill(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_ranges_are_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Sampled::uniform(&mut rng, 1., 1.).is_err());
        assert!(Sampled::normal(&mut rng, 0., f32::NAN).is_err());
    }
}
