//! Minimum-of-N measurement.
//!
//! Device timing noise is one-sided: contention only ever adds latency. The
//! minimum over N trials is therefore the reported figure; max and mean are
//! kept for diagnostics only.

use serde::Serialize;

use crate::autotuning::config::DEFAULT_ITERATIONS;
use crate::error::{ExploreError, ExploreResult};

/// Result of benchmarking a single configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchResult {
    /// Minimum observed time in milliseconds
    pub min_ms: f32,
    pub max_ms: f32,
    pub mean_ms: f32,
    /// Number of trials run
    pub samples: usize,
}

impl std::fmt::Display for BenchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min={:.5}ms max={:.5}ms mean={:.5}ms ({} samples)",
            self.min_ms, self.max_ms, self.mean_ms, self.samples
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    pub iterations: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl BenchConfig {
    pub fn new(iterations: usize) -> Self {
        BenchConfig { iterations }
    }
}

/// Run `trial` `config.iterations` times and collect its timings.
///
/// `trial` receives the iteration index and returns the elapsed device time
/// of one run. The first failing trial aborts the measurement.
pub fn bench_min<F>(config: &BenchConfig, mut trial: F) -> ExploreResult<BenchResult>
where
    F: FnMut(usize) -> ExploreResult<f32>,
{
    if config.iterations == 0 {
        return Err(ExploreError::InvalidConfig(
            "benchmark needs at least one iteration".into(),
        ));
    }

    let mut min_ms = f32::MAX;
    let mut max_ms = f32::MIN;
    let mut total = 0.0f64;
    for i in 0..config.iterations {
        let ms = trial(i)?;
        min_ms = min_ms.min(ms);
        max_ms = max_ms.max(ms);
        total += ms as f64;
    }

    Ok(BenchResult {
        min_ms,
        max_ms,
        mean_ms: (total / config.iterations as f64) as f32,
        samples: config.iterations,
    })
}
