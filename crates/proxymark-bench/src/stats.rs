//! Streaming statistics over trial aggregates.
//!
//! Uses Welford's online algorithm so precision holds up at high throughput
//! magnitudes; the naive sum-of-squares formulation loses digits once the
//! samples are large and close together.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    /// Sample standard deviation divides by `n - 1`.
    #[error("standard deviation is undefined for fewer than two samples")]
    Undefined,
}

/// Welford accumulator for mean and sample variance.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Bessel-corrected sample variance (divisor `n - 1`).
    pub fn sample_variance(&self) -> Result<f64, StatsError> {
        if self.count < 2 {
            return Err(StatsError::Undefined);
        }
        Ok(self.m2 / (self.count - 1) as f64)
    }

    pub fn sample_stddev(&self) -> Result<f64, StatsError> {
        self.sample_variance().map(f64::sqrt)
    }
}

/// Final mean/stddev over all trial aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub stddev: f64,
}

/// Fold a full sample set into a [`Summary`]. Errors with a single sample
/// rather than dividing by zero.
pub fn summarize(samples: &[f64]) -> Result<Summary, StatsError> {
    let mut stats = RunningStats::new();
    for &s in samples {
        stats.push(s);
    }
    Ok(Summary {
        mean: stats.mean(),
        stddev: stats.sample_stddev()?,
    })
}
