//! Exploration settings.
//!
//! Resolved from defaults, an optional JSON file and `KERNEL_EXPLORER_*`
//! environment variables, in that order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compiler::nvcc::DEFAULT_FLAGS;
use crate::error::{ExploreError, ExploreResult};

/// Timing trials per configuration.
pub const DEFAULT_ITERATIONS: usize = 10;

pub const ENV_ITERATIONS: &str = "KERNEL_EXPLORER_ITERATIONS";
pub const ENV_NVCC: &str = "KERNEL_EXPLORER_NVCC";
pub const ENV_QUIET: &str = "KERNEL_EXPLORER_QUIET";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: PathBuf,
    pub flags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            program: PathBuf::from("nvcc"),
            flags: DEFAULT_FLAGS.iter().map(|f| f.to_string()).collect(),
            include_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExploreConfig {
    /// Trials per configuration; the minimum is reported.
    pub iterations: usize,
    /// Write one report line per configuration to stderr.
    pub print_results: bool,
    pub compiler: CompilerConfig,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        ExploreConfig {
            iterations: DEFAULT_ITERATIONS,
            print_results: true,
            compiler: CompilerConfig::default(),
        }
    }
}

impl ExploreConfig {
    /// Few trials, no report lines. For smoke runs.
    pub fn fast() -> Self {
        ExploreConfig {
            iterations: 3,
            print_results: false,
            ..Self::default()
        }
    }

    /// More trials per configuration for final numbers.
    pub fn thorough() -> Self {
        ExploreConfig {
            iterations: 25,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> ExploreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExploreConfig = serde_json::from_str(&content)?;
        log::debug!("loaded explore config from {}", path.display());
        Ok(config)
    }

    /// Apply `KERNEL_EXPLORER_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> ExploreResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> ExploreResult<Self> {
        if let Some(value) = var(ENV_ITERATIONS) {
            self.iterations = value.trim().parse().map_err(|_| {
                ExploreError::InvalidConfig(format!("{ENV_ITERATIONS}={value} is not a count"))
            })?;
        }
        if let Some(program) = var(ENV_NVCC).filter(|p| !p.is_empty()) {
            self.compiler.program = PathBuf::from(program);
        }
        if let Some(value) = var(ENV_QUIET) {
            self.print_results = matches!(value.as_str(), "" | "0" | "false");
        }
        Ok(self)
    }

    /// Reject zero iterations or an empty compiler program.
    pub fn validate(&self) -> ExploreResult<()> {
        if self.iterations == 0 {
            return Err(ExploreError::InvalidConfig(
                "iterations must be at least 1".into(),
            ));
        }
        if self.compiler.program.as_os_str().is_empty() {
            return Err(ExploreError::InvalidConfig(
                "compiler program must not be empty".into(),
            ));
        }
        Ok(())
    }
}
