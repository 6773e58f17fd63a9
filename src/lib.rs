//! kernel-explorer: tile-configuration auto-tuning for image kernels.
//!
//! Image kernels with a compile-time tile shape are rebuilt and relaunched
//! for every feasible thread-block configuration, and the minimum device
//! time of each is reported:
//! - **Search space**: warp-stepped tile widths, thread-ceiling and
//!   scratch-memory feasibility filters
//! - **Recompilation**: external `nvcc` per candidate, fresh module, constants
//!   and textures bound before timing
//! - **Timing**: device-clock events around a fully synchronized launch,
//!   minimum of N trials
//! - **Reductions**: pixels-per-thread sweep over a two-phase or thread-fence
//!   reduction
//!
//! The CUDA driver backend lives behind the `cuda` feature; without it the
//! crate runs against [`device::SimDevice`].
//!
//! # Quick Start
//!
//! ```ignore
//! use kernel_explorer::{CudaDriver, DeviceRegistry, Explorer, ExploreConfig};
//! use kernel_explorer::autotuning::{ExploreConstraints, KernelExploration, SmemDescriptor};
//!
//! let mut device = CudaDriver::new(0)?;
//! let mut registry = DeviceRegistry::new();
//! let config = ExploreConfig::default().with_env_overrides()?;
//! let mut explorer = Explorer::new(&mut device, &mut registry, config)?;
//!
//! let constraints = ExploreConstraints::new(4096, 4096, 512);
//! let request = KernelExploration::new("blur.cu", "blur", constraints)
//!     .with_smem(SmemDescriptor::new(2, 2, 4));
//! let report = explorer.explore_kernel(&request)?;
//! ```

pub mod autotuning;
pub mod compiler;
pub mod device;
pub mod error;
pub mod launch;
pub mod memory;
pub mod registry;

pub use autotuning::{
    ExplorationReport, ExploreConfig, ExploreConstraints, Explorer, KernelExploration,
    ReductionExploration, ReductionOutcome, ReductionStrategy, TileConfig,
};
pub use compiler::{Capability, KernelCompiler, MacroDefines, NvccCompiler, RecompilationPipeline};
pub use device::{Device, DevicePtr, DeviceProperties, Dim3, SimDevice};
pub use error::{ErrorKind, ExploreError, ExploreResult};
pub use launch::{launch_benchmark, launch_timed, KernelArgs, TimingSession};
pub use registry::{AllocDims, DeviceRegistry};

#[cfg(feature = "cuda")]
pub use device::CudaDriver;
