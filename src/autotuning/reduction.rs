//! Two-phase reductions and the pixels-per-thread explorer.
//!
//! Phase 1 folds the image (or a sub-rectangle of it) into one partial
//! result per block. Phase 2 collapses the partial buffer in place: either
//! as a single launch ([`apply_reduction`]) or, while exploring, as a loop
//! that shrinks the active block count until one block is left.
//!
//! The thread-fence strategy merges across blocks inside the phase-1 kernel,
//! so a trial is a single launch.

use std::path::PathBuf;
use std::time::Instant;

use bytemuck::Pod;

use crate::autotuning::measure::bench_min;
use crate::autotuning::report::{ExplorationReport, PixelsPerThread, ReportLine};
use crate::autotuning::Explorer;
use crate::compiler::{
    ConstantBinding, KernelCompiler, LoadedKernel, MacroDefines, RecompilationPipeline,
    TextureDescriptor,
};
use crate::device::{Device, DevicePtr, Dim3};
use crate::error::{ExploreError, ExploreResult};
use crate::launch::{launch_timed, KernelArgs, TimingSession};
use crate::memory::{create_memory, release_memory};
use crate::registry::{AllocDims, DeviceRegistry};

/// Smallest power of two `>= x`, but never below `warp`.
pub fn next_pow2_warp(x: u32, warp: u32) -> u32 {
    x.max(1).next_power_of_two().max(warp)
}

/// One launch of the inter-block reduction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionStep {
    pub block: u32,
    pub grid: u32,
    /// Active partial results consumed by this launch.
    pub blocks_in: u32,
}

/// Launch shapes of the inter-block loop for a starting block count.
///
/// Each step uses `max_threads` threads while more blocks than that remain,
/// otherwise the next power of two of half the count (at least one warp),
/// and leaves `ceil(blocks / (block * ppt))` partial results. Because a
/// block is always at least two threads wide, every step at least halves
/// the count, so the loop ends after at most `ceil(log2(B))` steps.
#[derive(Debug, Clone)]
pub struct ReductionSchedule {
    remaining: u32,
    max_threads: u32,
    warp: u32,
    ppt: u32,
}

impl ReductionSchedule {
    pub fn new(num_blocks: u32, max_threads: u32, warp: u32, ppt: u32) -> Self {
        ReductionSchedule {
            remaining: num_blocks,
            max_threads,
            warp: warp.max(2),
            ppt: ppt.max(1),
        }
    }

    fn block_for(&self, blocks: u32) -> u32 {
        if blocks < self.max_threads {
            next_pow2_warp(blocks.div_ceil(2), self.warp)
        } else {
            self.max_threads
        }
    }
}

impl Iterator for ReductionSchedule {
    type Item = ReductionStep;

    fn next(&mut self) -> Option<ReductionStep> {
        if self.remaining <= 1 {
            return None;
        }
        let blocks_in = self.remaining;
        let block = self.block_for(blocks_in).max(2);
        let grid = blocks_in.div_ceil(block.saturating_mul(self.ppt));
        self.remaining = grid;
        Some(ReductionStep {
            block,
            grid,
            blocks_in,
        })
    }
}

/// Image geometry and interest region of a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionRegion {
    pub width: u32,
    pub height: u32,
    /// Row stride in elements.
    pub stride: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub region_width: u32,
    pub region_height: u32,
}

impl ReductionRegion {
    /// The whole image.
    pub fn full(width: u32, height: u32, stride: u32) -> Self {
        ReductionRegion {
            width,
            height,
            stride,
            offset_x: 0,
            offset_y: 0,
            region_width: width,
            region_height: height,
        }
    }

    pub fn from_dims(dims: &AllocDims) -> Self {
        Self::full(dims.width as u32, dims.height as u32, dims.stride as u32)
    }

    pub fn with_region(mut self, offset_x: u32, offset_y: u32, width: u32, height: u32) -> Self {
        self.offset_x = offset_x;
        self.offset_y = offset_y;
        self.region_width = width;
        self.region_height = height;
        self
    }

    /// Whether the phase-1 kernel can run without region arguments.
    pub fn is_full(&self) -> bool {
        let offset = self.offset_x != 0 || self.offset_y != 0;
        let smaller = self.region_width != self.width || self.region_height != self.height;
        !(offset && smaller)
    }

    fn validate(&self) -> ExploreResult<()> {
        if self.width == 0 || self.height == 0 || self.region_width == 0 || self.region_height == 0
        {
            return Err(ExploreError::InvalidConfig(format!(
                "empty reduction region {}x{} of {}x{}",
                self.region_width, self.region_height, self.width, self.height
            )));
        }
        if self.stride < self.width {
            return Err(ExploreError::InvalidConfig(format!(
                "stride {} is narrower than width {}",
                self.stride, self.width
            )));
        }
        Ok(())
    }

    /// Phase-1 launch shape: each thread folds two columns, each block `ppt` rows.
    pub fn phase1_shape(&self, max_threads: u32, ppt: u32) -> (Dim3, Dim3) {
        let grid = Dim3::xy(
            self.width.div_ceil(max_threads * 2),
            self.region_height.div_ceil(ppt),
        );
        (grid, Dim3::xy(max_threads, 1))
    }

    fn phase1_args<T: Pod>(
        &self,
        image: DevicePtr,
        output: DevicePtr,
        neutral: &T,
        with_region: bool,
    ) -> KernelArgs {
        let mut args = KernelArgs::with_capacity(10);
        args.push_ptr(image)
            .push_ptr(output)
            .push(neutral)
            .push(&self.width)
            .push(&self.height)
            .push(&self.stride);
        if with_region {
            args.push(&self.offset_x)
                .push(&self.offset_y)
                .push(&self.region_width)
                .push(&self.region_height);
        }
        args
    }
}

/// Launch sequence of a reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionStrategy {
    /// Image to partial results, then partial results to one value.
    TwoPhase { kernel_2d: String, kernel_1d: String },
    /// One kernel that merges across blocks with device-wide memory fences.
    ThreadFence { kernel: String },
}

impl ReductionStrategy {
    pub fn two_phase(kernel_2d: impl Into<String>, kernel_1d: impl Into<String>) -> Self {
        ReductionStrategy::TwoPhase {
            kernel_2d: kernel_2d.into(),
            kernel_1d: kernel_1d.into(),
        }
    }

    pub fn thread_fence(kernel: impl Into<String>) -> Self {
        ReductionStrategy::ThreadFence {
            kernel: kernel.into(),
        }
    }

    pub fn entry_points(&self) -> Vec<&str> {
        match self {
            ReductionStrategy::TwoPhase {
                kernel_2d,
                kernel_1d,
            } => vec![kernel_2d.as_str(), kernel_1d.as_str()],
            ReductionStrategy::ThreadFence { kernel } => vec![kernel.as_str()],
        }
    }

    /// Name of the kernel that reads the image.
    pub fn image_kernel(&self) -> &str {
        match self {
            ReductionStrategy::TwoPhase { kernel_2d, .. } => kernel_2d,
            ReductionStrategy::ThreadFence { kernel } => kernel,
        }
    }
}

fn check_max_threads<D: Device>(device: &D, max_threads: u32) -> ExploreResult<()> {
    let limit = device.properties().max_threads_per_block;
    if max_threads == 0 || max_threads > limit {
        return Err(ExploreError::InvalidConfig(format!(
            "reduction block of {max_threads} threads, device allows 1..={limit}"
        )));
    }
    Ok(())
}

fn read_value<D: Device, T: Pod>(device: &mut D, ptr: DevicePtr) -> ExploreResult<T> {
    let mut value = T::zeroed();
    device.copy_dtoh(bytemuck::bytes_of_mut(&mut value), ptr)?;
    Ok(value)
}

/// Reduce `image` to one value with an already loaded module.
///
/// The partial buffer is allocated through the registry for this call only.
/// Region arguments are passed to the phase-1 kernel only when the region
/// is offset and smaller than the image.
#[allow(clippy::too_many_arguments)]
pub fn apply_reduction<D: Device, T: Pod>(
    device: &mut D,
    registry: &mut DeviceRegistry,
    loaded: &LoadedKernel<D>,
    strategy: &ReductionStrategy,
    image: DevicePtr,
    neutral: T,
    region: &ReductionRegion,
    max_threads: u32,
    ppt: u32,
) -> ExploreResult<T> {
    region.validate()?;
    check_max_threads(device, max_threads)?;
    if ppt == 0 {
        return Err(ExploreError::InvalidConfig("pixels per thread must be at least 1".into()));
    }
    registry.dims_of(image)?;

    let (grid, block) = region.phase1_shape(max_threads, ppt);
    let num_blocks = grid.x * grid.y;
    let elem = std::mem::size_of::<T>();
    let (output, _) = create_memory(device, registry, num_blocks as usize, 1, elem, None)?;

    let reduced = run_apply(
        device, loaded, strategy, image, output, &neutral, region, grid, block, num_blocks,
    );
    let released = release_memory(device, registry, output);
    let value = reduced?;
    released?;
    Ok(value)
}

#[allow(clippy::too_many_arguments)]
fn run_apply<D: Device, T: Pod>(
    device: &mut D,
    loaded: &LoadedKernel<D>,
    strategy: &ReductionStrategy,
    image: DevicePtr,
    output: DevicePtr,
    neutral: &T,
    region: &ReductionRegion,
    grid: Dim3,
    block: Dim3,
    num_blocks: u32,
) -> ExploreResult<T> {
    let mut session = TimingSession::new();
    let image_kernel = strategy.image_kernel();
    let args = region.phase1_args(image, output, neutral, !region.is_full());
    launch_timed(
        device,
        loaded.function(image_kernel)?,
        image_kernel,
        grid,
        block,
        &args,
        &mut session,
    )?;

    if let ReductionStrategy::TwoPhase { kernel_1d, .. } = strategy {
        let max_threads = block.x;
        let warp = device.properties().warp_size;
        let block_x = if num_blocks < max_threads {
            next_pow2_warp(num_blocks.div_ceil(2), warp)
        } else {
            max_threads
        };
        let num_steps = num_blocks.div_ceil(block_x);
        let mut args = KernelArgs::with_capacity(5);
        args.push_ptr(output)
            .push_ptr(output)
            .push(neutral)
            .push(&num_blocks)
            .push(&num_steps);
        launch_timed(
            device,
            loaded.function(kernel_1d)?,
            kernel_1d,
            Dim3::xy(1, 1),
            Dim3::xy(block_x, 1),
            &args,
            &mut session,
        )?;
    }

    log::debug!(
        "reduction {}: {num_blocks} blocks, {} launches, {} ms",
        image_kernel,
        session.launches,
        session.total_ms
    );
    read_value(device, output)
}

/// Everything needed to explore the pixels-per-thread parameter of a
/// reduction.
#[derive(Debug, Clone)]
pub struct ReductionExploration<T> {
    pub source: PathBuf,
    pub strategy: ReductionStrategy,
    pub image: DevicePtr,
    pub neutral: T,
    pub region: ReductionRegion,
    /// Threads per phase-1 block (`BS`).
    pub max_threads: u32,
    pub constants: Vec<ConstantBinding>,
    pub textures: Vec<TextureDescriptor>,
    pub defines: MacroDefines,
}

impl<T: Pod> ReductionExploration<T> {
    pub fn new(
        source: impl Into<PathBuf>,
        strategy: ReductionStrategy,
        image: DevicePtr,
        neutral: T,
        region: ReductionRegion,
        max_threads: u32,
    ) -> Self {
        ReductionExploration {
            source: source.into(),
            strategy,
            image,
            neutral,
            region,
            max_threads,
            constants: Vec::new(),
            textures: Vec::new(),
            defines: MacroDefines::new(),
        }
    }

    pub fn with_constant(mut self, constant: ConstantBinding) -> Self {
        self.constants.push(constant);
        self
    }

    pub fn with_texture(mut self, texture: TextureDescriptor) -> Self {
        self.textures.push(texture);
        self
    }

    pub fn with_define(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.defines.define(name, value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReductionOutcome<T> {
    pub report: ExplorationReport<PixelsPerThread>,
    /// Reduced value left in the partial buffer by the last trial.
    pub value: T,
}

impl<D: Device, C: KernelCompiler> Explorer<'_, D, C> {
    /// Measure every pixels-per-thread value from 1 to the region height.
    ///
    /// Each value gets its own compile (`PPT`, `BS` defined) and module.
    /// A trial runs phase 1 once and then, for the two-phase strategy, the
    /// inter-block loop until one block is left; its time is the sum over
    /// all launches of the trial.
    pub fn explore_reduction<T: Pod>(
        &mut self,
        request: &ReductionExploration<T>,
    ) -> ExploreResult<ReductionOutcome<T>> {
        let started = Instant::now();
        let region = &request.region;
        region.validate()?;
        check_max_threads(&*self.device, request.max_threads)?;
        self.registry.dims_of(request.image)?;

        let entry_points = request.strategy.entry_points();
        self.emit(&format!(
            "Exploring pixels per thread for '{}'",
            entry_points.join(", ")
        ));

        // Sized for ppt = 1, the largest phase-1 grid.
        let (grid1, _) = region.phase1_shape(request.max_threads, 1);
        let capacity = (grid1.x * grid1.y) as usize;
        let (output, _) = create_memory(
            &mut *self.device,
            &mut *self.registry,
            capacity,
            1,
            std::mem::size_of::<T>(),
            None,
        )?;

        let mut report = ExplorationReport::new(entry_points.join(", "));
        let value = self
            .sweep_pixels_per_thread(request, output, &mut report)
            .and_then(|_| read_value::<D, T>(&mut *self.device, output));
        let released = release_memory(&mut *self.device, &mut *self.registry, output);
        let value = value?;
        released?;

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        log::info!(
            "explored {}: {} values of pixels per thread in {:.1}ms",
            report.kernel,
            report.len(),
            report.elapsed_ms
        );
        Ok(ReductionOutcome { report, value })
    }

    fn sweep_pixels_per_thread<T: Pod>(
        &mut self,
        request: &ReductionExploration<T>,
        output: DevicePtr,
        report: &mut ExplorationReport<PixelsPerThread>,
    ) -> ExploreResult<()> {
        let capability = self.device.properties().capability;
        let pipeline = RecompilationPipeline::new(&self.compiler, &request.source, capability);
        let bench = self.bench_config();
        let entry_points = request.strategy.entry_points();

        for ppt in 1..=request.region.region_height {
            let mut defines = request.defines.clone();
            defines.define("PPT", ppt).define("BS", request.max_threads);
            let loaded = pipeline.build(
                &mut *self.device,
                &*self.registry,
                &entry_points,
                &defines,
                &request.constants,
                &request.textures,
            )?;

            let device = &mut *self.device;
            let timed = bench_min(&bench, |_| {
                reduction_trial(device, &loaded, request, output, ppt)
            });
            let unloaded = loaded.unload(&mut *self.device);
            let result = timed?;
            unloaded?;

            let ppt = PixelsPerThread(ppt);
            log::debug!("ppt {ppt}: {result}");
            self.emit(&ppt.report_line(result.min_ms));
            report.push(ppt, result.min_ms);
        }
        Ok(())
    }
}

/// One timed trial: phase 1, then the inter-block loop for two-phase
/// reductions. Returns the summed device time.
fn reduction_trial<D: Device, T: Pod>(
    device: &mut D,
    loaded: &LoadedKernel<D>,
    request: &ReductionExploration<T>,
    output: DevicePtr,
    ppt: u32,
) -> ExploreResult<f32> {
    let region = &request.region;
    let mut session = TimingSession::new();

    let (grid, block) = region.phase1_shape(request.max_threads, ppt);
    let image_kernel = request.strategy.image_kernel();
    let args = region.phase1_args(request.image, output, &request.neutral, true);
    launch_timed(
        device,
        loaded.function(image_kernel)?,
        image_kernel,
        grid,
        block,
        &args,
        &mut session,
    )?;

    if let ReductionStrategy::TwoPhase { kernel_1d, .. } = &request.strategy {
        let function = loaded.function(kernel_1d)?;
        let warp = device.properties().warp_size;
        let schedule = ReductionSchedule::new(grid.x * grid.y, request.max_threads, warp, ppt);
        for step in schedule {
            let mut args = KernelArgs::with_capacity(5);
            args.push_ptr(output)
                .push_ptr(output)
                .push(&request.neutral)
                .push(&step.blocks_in)
                .push(&ppt);
            launch_timed(
                device,
                function,
                kernel_1d,
                Dim3::xy(step.grid, 1),
                Dim3::xy(step.block, 1),
                &args,
                &mut session,
            )?;
        }
    }

    Ok(session.total_ms)
}
