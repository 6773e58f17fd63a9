//! Kernel explorer: exhaustive sweep over feasible tile shapes.
//!
//! For each feasible tile the kernel is rebuilt with the tile shape baked in,
//! bound, launched `iterations` times, and its minimum device time recorded.
//! There is no pruning and no early exit; the whole feasible space is
//! measured, in visit order.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::autotuning::measure::bench_min;
use crate::autotuning::report::{ExplorationReport, ReportLine};
use crate::autotuning::search_space::{Feasibility, SmemDescriptor, TileConfig, TileSearchSpace};
use crate::autotuning::Explorer;
use crate::compiler::{
    ConstantBinding, KernelCompiler, MacroDefines, RecompilationPipeline, TextureDescriptor,
};
use crate::device::{Device, Dim3};
use crate::error::{ExploreError, ExploreResult};
use crate::launch::{launch_timed, KernelArgs, TimingSession};

/// Problem-side limits of one kernel exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploreConstraints {
    /// Interest region the kernel writes, in pixels.
    pub region_width: u32,
    pub region_height: u32,
    /// Halo extents used to derive the border block counts.
    pub max_size_x: u32,
    pub max_size_y: u32,
    /// Thread ceiling of this kernel (register pressure etc.).
    pub max_threads_for_kernel: u32,
    pub pixels_per_thread: u32,
    /// Configuration the code generator would pick; reported, never enforced.
    pub optimal: Option<TileConfig>,
}

impl ExploreConstraints {
    /// Region of `region_width` x `region_height` pixels, no halo, one pixel per thread.
    pub fn new(region_width: u32, region_height: u32, max_threads_for_kernel: u32) -> Self {
        ExploreConstraints {
            region_width,
            region_height,
            max_size_x: 0,
            max_size_y: 0,
            max_threads_for_kernel,
            pixels_per_thread: 1,
            optimal: None,
        }
    }

    /// Halo extents for the `BHX_EXPLORE`/`BHY_EXPLORE` border block counts.
    pub fn with_halo(mut self, max_size_x: u32, max_size_y: u32) -> Self {
        self.max_size_x = max_size_x;
        self.max_size_y = max_size_y;
        self
    }

    /// Rows each thread processes; scales the block's vertical coverage.
    pub fn with_pixels_per_thread(mut self, ppt: u32) -> Self {
        self.pixels_per_thread = ppt;
        self
    }

    /// Record the generator's pick so the report can mark it.
    pub fn with_optimal(mut self, tile: TileConfig) -> Self {
        self.optimal = Some(tile);
        self
    }

    fn validate(&self) -> ExploreResult<()> {
        if self.region_width == 0 || self.region_height == 0 {
            return Err(ExploreError::InvalidConfig(format!(
                "empty interest region {}x{}",
                self.region_width, self.region_height
            )));
        }
        if self.pixels_per_thread == 0 {
            return Err(ExploreError::InvalidConfig(
                "pixels per thread must be at least 1".into(),
            ));
        }
        // Tile heights never exceed the thread ceiling.
        if self
            .max_threads_for_kernel
            .checked_mul(self.pixels_per_thread)
            .is_none()
        {
            return Err(ExploreError::InvalidConfig(format!(
                "{} pixels per thread overflow the row count of a {}-thread tile",
                self.pixels_per_thread, self.max_threads_for_kernel
            )));
        }
        Ok(())
    }

    /// Launch grid covering the interest region with `tile`.
    pub fn grid_for(&self, tile: TileConfig) -> Dim3 {
        Dim3::xy(
            self.region_width.div_ceil(tile.width),
            self.region_height.div_ceil(self.rows_per_block(tile)),
        )
    }

    /// Image rows one block covers: `height * pixels_per_thread`, saturating.
    fn rows_per_block(&self, tile: TileConfig) -> u32 {
        tile.height.saturating_mul(self.pixels_per_thread).max(1)
    }

    /// Macro definitions baking `tile` into the kernel body.
    pub fn defines_for(&self, tile: TileConfig, defines: &mut MacroDefines) {
        defines
            .define("BSX_EXPLORE", tile.width)
            .define("BSY_EXPLORE", tile.height)
            .define("BHX_EXPLORE", self.max_size_x.div_ceil(tile.width))
            .define("BHY_EXPLORE", self.max_size_y.div_ceil(self.rows_per_block(tile)));
    }
}

/// Everything needed to explore one kernel entry point.
#[derive(Debug, Clone)]
pub struct KernelExploration {
    pub source: PathBuf,
    pub kernel: String,
    pub constraints: ExploreConstraints,
    /// Launch arguments, identical for every candidate.
    pub args: KernelArgs,
    pub constants: Vec<ConstantBinding>,
    pub textures: Vec<TextureDescriptor>,
    pub smem: Vec<SmemDescriptor>,
    /// Extra definitions passed to every compile.
    pub defines: MacroDefines,
}

impl KernelExploration {
    /// Exploration of `kernel` in `source` with no args, constants or textures.
    pub fn new(
        source: impl Into<PathBuf>,
        kernel: impl Into<String>,
        constraints: ExploreConstraints,
    ) -> Self {
        KernelExploration {
            source: source.into(),
            kernel: kernel.into(),
            constraints,
            args: KernelArgs::new(),
            constants: Vec::new(),
            textures: Vec::new(),
            smem: Vec::new(),
            defines: MacroDefines::new(),
        }
    }

    /// Launch arguments, shared by every candidate.
    pub fn with_args(mut self, args: KernelArgs) -> Self {
        self.args = args;
        self
    }

    /// Constant uploaded into each freshly loaded module.
    pub fn with_constant(mut self, constant: ConstantBinding) -> Self {
        self.constants.push(constant);
        self
    }

    /// Texture bound into each freshly loaded module.
    pub fn with_texture(mut self, texture: TextureDescriptor) -> Self {
        self.textures.push(texture);
        self
    }

    /// Scratch buffer counted against the per-block shared memory budget.
    pub fn with_smem(mut self, smem: SmemDescriptor) -> Self {
        self.smem.push(smem);
        self
    }

    /// Extra macro passed to every compile.
    pub fn with_define(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.defines.define(name, value);
        self
    }
}

impl<D: Device, C: KernelCompiler> Explorer<'_, D, C> {
    /// Measure every feasible tile shape of `request.kernel`.
    ///
    /// Returns one result per feasible tile, width ascending outer, height
    /// ascending inner. The first compile, bind or launch failure aborts the
    /// run.
    pub fn explore_kernel(
        &mut self,
        request: &KernelExploration,
    ) -> ExploreResult<ExplorationReport<TileConfig>> {
        let started = Instant::now();
        let constraints = &request.constraints;
        constraints.validate()?;

        let properties = self.device.properties().clone();
        let space = TileSearchSpace::new(
            &properties,
            constraints.max_threads_for_kernel,
            &request.smem,
        )?;
        let pipeline =
            RecompilationPipeline::new(&self.compiler, &request.source, properties.capability);
        let bench = self.bench_config();

        let header = match constraints.optimal {
            Some(opt) => format!(
                "Exploring configurations for kernel '{}': optimal configuration {} ({}).",
                request.kernel,
                opt.threads(),
                opt
            ),
            None => format!("Exploring configurations for kernel '{}'.", request.kernel),
        };
        self.emit(&header);
        log::info!(
            "exploring {} on {} ({} candidates, ceiling {} threads, {} bytes scratch)",
            request.kernel,
            properties.name,
            space.grid_size(),
            space.max_threads,
            space.smem_budget
        );

        let mut report = ExplorationReport::new(request.kernel.as_str());
        for tile in space.candidates() {
            match space.check(tile) {
                Feasibility::Feasible => {}
                Feasibility::TooManyThreads => {
                    report.skipped += 1;
                    continue;
                }
                Feasibility::SharedMemory { bytes } => {
                    log::trace!("{tile}: {bytes} bytes scratch over budget");
                    report.skipped += 1;
                    continue;
                }
            }

            let mut defines = request.defines.clone();
            constraints.defines_for(tile, &mut defines);
            let loaded = pipeline.build(
                &mut *self.device,
                &*self.registry,
                &[request.kernel.as_str()],
                &defines,
                &request.constants,
                &request.textures,
            )?;

            let function = loaded.entry();
            let grid = constraints.grid_for(tile);
            let block = Dim3::xy(tile.width, tile.height);
            let device = &mut *self.device;
            let timed = bench_min(&bench, |_| {
                let mut session = TimingSession::new();
                launch_timed(
                    device,
                    function,
                    &request.kernel,
                    grid,
                    block,
                    &request.args,
                    &mut session,
                )
            });
            let unloaded = loaded.unload(&mut *self.device);
            let result = timed?;
            unloaded?;

            log::debug!("{tile}: grid {grid}, {result}");
            self.emit(&format!("Kernel config: {}", tile.report_line(result.min_ms)));
            report.push(tile, result.min_ms);
        }

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        log::info!(
            "explored {}: {} configurations measured, {} skipped in {:.1}ms",
            request.kernel,
            report.len(),
            report.skipped,
            report.elapsed_ms
        );
        Ok(report)
    }
}
