//! Tile-configuration exploration for image kernels.
//!
//! Measures every feasible thread-block shape of a kernel whose tile size is
//! a compile-time constant, and reports the minimum device time of each.
//!
//! # Architecture
//!
//! ```text
//! config        -- iterations, report output, compiler settings
//! search_space  -- warp-stepped tile grid + thread / scratch-memory filters
//! measure       -- minimum-of-N harness
//! search        -- kernel explorer: compile, bind, launch per tile
//! reduction     -- two-phase reduction explorer (pixels per thread)
//! report        -- per-configuration timings, text lines and JSON
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use kernel_explorer::autotuning::{
//!     ExploreConfig, ExploreConstraints, Explorer, KernelExploration,
//! };
//! use kernel_explorer::autotuning::search_space::SmemDescriptor;
//! use kernel_explorer::device::SimDevice;
//! use kernel_explorer::registry::DeviceRegistry;
//!
//! let mut device = SimDevice::new(SimDevice::default_properties());
//! let mut registry = DeviceRegistry::new();
//! let mut explorer = Explorer::new(&mut device, &mut registry, ExploreConfig::default())?;
//!
//! let constraints = ExploreConstraints::new(4096, 4096, 512);
//! let request = KernelExploration::new("blur.cu", "blur", constraints)
//!     .with_smem(SmemDescriptor::new(2, 2, 4));
//! let report = explorer.explore_kernel(&request)?;
//! println!("{report}");
//! # Ok::<(), kernel_explorer::error::ExploreError>(())
//! ```

pub mod config;
pub mod measure;
pub mod reduction;
pub mod report;
pub mod search;
pub mod search_space;

pub use config::{CompilerConfig, ExploreConfig};
pub use measure::{BenchConfig, BenchResult};
pub use reduction::{ReductionExploration, ReductionOutcome, ReductionRegion, ReductionStrategy};
pub use report::{ExplorationReport, PixelsPerThread, ReportLine, TimingResult};
pub use search::{ExploreConstraints, KernelExploration};
pub use search_space::{Feasibility, SmemDescriptor, TileConfig, TileSearchSpace};

use crate::compiler::{KernelCompiler, NvccCompiler};
use crate::device::Device;
use crate::error::ExploreResult;
use crate::registry::DeviceRegistry;

/// Drives exploration runs against one device.
///
/// Borrows the device and the registry for its lifetime; every run aborts on
/// the first device or compiler error and returns it.
pub struct Explorer<'a, D: Device, C = NvccCompiler> {
    device: &'a mut D,
    registry: &'a mut DeviceRegistry,
    compiler: C,
    config: ExploreConfig,
}

impl<'a, D: Device> Explorer<'a, D, NvccCompiler> {
    /// Explorer compiling through `nvcc` as configured in `config.compiler`.
    pub fn new(
        device: &'a mut D,
        registry: &'a mut DeviceRegistry,
        config: ExploreConfig,
    ) -> ExploreResult<Self> {
        let compiler = NvccCompiler::from_config(&config.compiler);
        Self::with_compiler(device, registry, compiler, config)
    }
}

impl<'a, D: Device, C: KernelCompiler> Explorer<'a, D, C> {
    /// Explorer with a caller-supplied compiler. Fails if `config` is invalid.
    pub fn with_compiler(
        device: &'a mut D,
        registry: &'a mut DeviceRegistry,
        compiler: C,
        config: ExploreConfig,
    ) -> ExploreResult<Self> {
        config.validate()?;
        Ok(Explorer {
            device,
            registry,
            compiler,
            config,
        })
    }

    pub fn config(&self) -> &ExploreConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &*self.device
    }

    /// Device access between runs, e.g. to upload inputs.
    pub fn device_mut(&mut self) -> &mut D {
        &mut *self.device
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &*self.registry
    }

    /// Registry access for allocations made outside the explorer.
    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut *self.registry
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    fn bench_config(&self) -> BenchConfig {
        BenchConfig::new(self.config.iterations)
    }

    /// Operator-visible report output.
    fn emit(&self, line: &str) {
        if self.config.print_results {
            eprintln!("[kernel-explorer] {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDevice;

    #[test]
    fn test_explorer_rejects_invalid_config() {
        let mut device = SimDevice::new(SimDevice::default_properties());
        let mut registry = DeviceRegistry::new();
        let config = ExploreConfig {
            iterations: 0,
            ..ExploreConfig::default()
        };
        assert!(Explorer::new(&mut device, &mut registry, config).is_err());
    }

    #[test]
    fn test_explorer_uses_configured_compiler() {
        let mut device = SimDevice::new(SimDevice::default_properties());
        let mut registry = DeviceRegistry::new();
        let mut config = ExploreConfig::fast();
        config.compiler.program = "/opt/cuda/bin/nvcc".into();
        let explorer = Explorer::new(&mut device, &mut registry, config).unwrap();
        assert_eq!(explorer.compiler().program(), std::path::Path::new("/opt/cuda/bin/nvcc"));
        assert_eq!(explorer.bench_config().iterations, 3);
    }
}
