//! Exploration results.
//!
//! One [`TimingResult`] per measured configuration, kept in visit order. The
//! report is a measurement record only; it never picks a winner.

use serde::Serialize;

use crate::autotuning::search_space::TileConfig;
use crate::error::ExploreResult;

/// Reduction tuning parameter: image rows folded by one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PixelsPerThread(pub u32);

impl std::fmt::Display for PixelsPerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator-visible line for one measured configuration.
pub trait ReportLine {
    fn report_line(&self, min_ms: f32) -> String;
}

impl ReportLine for TileConfig {
    fn report_line(&self, min_ms: f32) -> String {
        format!("{}x{} ({}): {min_ms:.5} ms", self.width, self.height, self.threads())
    }
}

impl ReportLine for PixelsPerThread {
    fn report_line(&self, min_ms: f32) -> String {
        format!("PPT: {}, {min_ms:.5} ms", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingResult<P> {
    pub config: P,
    pub min_ms: f32,
}

impl<P: ReportLine> TimingResult<P> {
    /// Formatted stderr line for this result.
    pub fn line(&self) -> String {
        self.config.report_line(self.min_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplorationReport<P> {
    pub kernel: String,
    pub results: Vec<TimingResult<P>>,
    /// Candidates rejected by the feasibility filters.
    pub skipped: usize,
    /// Host wall-clock time of the whole run, compiles included.
    pub elapsed_ms: f64,
}

impl<P> ExplorationReport<P> {
    /// Empty report for `kernel`.
    pub fn new(kernel: impl Into<String>) -> Self {
        ExplorationReport {
            kernel: kernel.into(),
            results: Vec::new(),
            skipped: 0,
            elapsed_ms: 0.0,
        }
    }

    /// Append a measured configuration; keeps visit order.
    pub fn push(&mut self, config: P, min_ms: f32) {
        self.results.push(TimingResult { config, min_ms });
    }

    /// Number of measured configurations.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Measured configurations in visit order.
    pub fn configs(&self) -> impl Iterator<Item = &P> {
        self.results.iter().map(|r| &r.config)
    }
}

impl<P: PartialEq> ExplorationReport<P> {
    /// Minimum timing recorded for `config`, if it was measured.
    pub fn timing_of(&self, config: &P) -> Option<f32> {
        self.results
            .iter()
            .find(|r| &r.config == config)
            .map(|r| r.min_ms)
    }
}

impl<P: ReportLine> ExplorationReport<P> {
    /// One report line per result, as printed during the run.
    pub fn lines(&self) -> Vec<String> {
        self.results.iter().map(TimingResult::line).collect()
    }
}

impl<P: Serialize> ExplorationReport<P> {
    /// Pretty-printed JSON of the whole report.
    pub fn to_json(&self) -> ExploreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl<P: ReportLine> std::fmt::Display for ExplorationReport<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "=== Exploration: {} ({} measured, {} skipped, {:.1}ms) ===",
            self.kernel,
            self.results.len(),
            self.skipped,
            self.elapsed_ms
        )?;
        for result in &self.results {
            writeln!(f, "{}", result.line())?;
        }
        Ok(())
    }
}
