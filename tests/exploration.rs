//! End-to-end exploration runs against the simulated device.
//!
//! A recording compiler stands in for nvcc; the simulated device runs host
//! closures for the reduction kernels so that results can be checked.

use std::cell::RefCell;
use std::path::Path;

use kernel_explorer::autotuning::reduction::apply_reduction;
use kernel_explorer::autotuning::{
    ExploreConfig, ExploreConstraints, Explorer, KernelExploration, PixelsPerThread,
    ReductionExploration, ReductionRegion, ReductionStrategy, SmemDescriptor, TileConfig,
    TileSearchSpace,
};
use kernel_explorer::compiler::{
    Capability, ConstantBinding, KernelCompiler, MacroDefines, RecompilationPipeline,
    TextureDescriptor,
};
use kernel_explorer::device::sim::{SimLaunch, SimMemory};
use kernel_explorer::device::{DevicePtr, Dim3, SimDevice, TextureFormat};
use kernel_explorer::error::{ErrorKind, ExploreResult};
use kernel_explorer::launch::KernelArgs;
use kernel_explorer::memory::{create_memory, write_memory};
use kernel_explorer::registry::DeviceRegistry;

#[derive(Default)]
struct RecordingCompiler {
    builds: RefCell<Vec<MacroDefines>>,
}

impl RecordingCompiler {
    fn builds(&self) -> Vec<MacroDefines> {
        self.builds.borrow().clone()
    }
}

impl KernelCompiler for RecordingCompiler {
    fn compile(
        &self,
        source: &Path,
        capability: Capability,
        defines: &MacroDefines,
    ) -> ExploreResult<Vec<u8>> {
        self.builds.borrow_mut().push(defines.clone());
        Ok(format!("// {} {capability} [{defines}]\0", source.display()).into_bytes())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Kernel exploration
// ═══════════════════════════════════════════════════════════════════════

fn fast_explorer<'a>(
    device: &'a mut SimDevice,
    registry: &'a mut DeviceRegistry,
    compiler: &'a RecordingCompiler,
) -> Explorer<'a, SimDevice, &'a RecordingCompiler> {
    Explorer::with_compiler(device, registry, compiler, ExploreConfig::fast()).unwrap()
}

/// Fastest at 128x1, slower the further a tile is from it.
fn tile_cost(launch: &SimLaunch) -> f32 {
    1.0 + (launch.block.x as f32 - 128.0).abs() / 1000.0 + (launch.block.y - 1) as f32 / 100.0
}

fn blur_request(image: DevicePtr) -> KernelExploration {
    let mut args = KernelArgs::new();
    args.push_ptr(image).push(&4096u32).push(&4096u32);
    KernelExploration::new(
        "blur.cu",
        "blur",
        ExploreConstraints::new(4096, 4096, 512)
            .with_halo(2, 2)
            .with_optimal(TileConfig::new(128, 1)),
    )
    .with_args(args)
    .with_smem(SmemDescriptor::new(2, 2, 4))
    .with_constant(ConstantBinding::new("mask", &[1.0f32 / 9.0; 9]))
    .with_texture(TextureDescriptor::new("input", TextureFormat::F32, image))
}

fn blur_device() -> SimDevice {
    SimDevice::new(SimDevice::default_properties())
        .with_global("mask", 36)
        .with_cost_model(tile_cost)
}

#[test]
fn test_reference_scenario_visits_every_feasible_tile() {
    let mut device = blur_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let (image, _) = create_memory(&mut device, &mut registry, 64, 64, 4, None).unwrap();

    let report = {
        let mut explorer = fast_explorer(&mut device, &mut registry, &compiler);
        explorer.explore_kernel(&blur_request(image)).unwrap()
    };

    let expected = TileSearchSpace::new(
        &SimDevice::default_properties(),
        512,
        &[SmemDescriptor::new(2, 2, 4)],
    )
    .unwrap()
    .feasible();
    assert_eq!(report.len(), 50);
    assert_eq!(report.configs().copied().collect::<Vec<_>>(), expected);
    assert_eq!(report.kernel, "blur");

    // One compile per tile, with the tile baked in.
    let builds = compiler.builds();
    assert_eq!(builds.len(), 50);
    assert_eq!(
        builds[0].to_string(),
        "BSX_EXPLORE=32 BSY_EXPLORE=1 BHX_EXPLORE=1 BHY_EXPLORE=2"
    );
    assert_eq!(builds[16].get("BSX_EXPLORE"), Some("64"));

    // Three trials per tile, each launch covering the interest region.
    assert_eq!(device.launches().len(), 150);
    let first = &device.launches()[0];
    assert_eq!(first.function, "blur");
    assert_eq!(first.block, Dim3::xy(32, 1));
    assert_eq!(first.grid, Dim3::xy(128, 4096));
    assert_eq!(first.args.read::<u64>(0), Some(image.0));

    let (best, best_ms) = report
        .results
        .iter()
        .map(|r| (r.config, r.min_ms))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap();
    assert_eq!(best, TileConfig::new(128, 1));
    assert!((best_ms - 1.0).abs() < 1e-3);

    assert_eq!(device.live_modules(), 0);
    assert_eq!(device.live_events(), 0);
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(device.loaded_images().len(), 50);
}

#[test]
fn test_report_lines_follow_visit_order() {
    let mut device = blur_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let (image, _) = create_memory(&mut device, &mut registry, 64, 64, 4, None).unwrap();
    let request = KernelExploration::new("blur.cu", "blur", ExploreConstraints::new(64, 64, 64))
        .with_args({
            let mut args = KernelArgs::new();
            args.push_ptr(image);
            args
        });

    let report = fast_explorer(&mut device, &mut registry, &compiler)
        .explore_kernel(&request)
        .unwrap();

    // 32x1, 32x2, 64x1 fit under a 64-thread ceiling.
    let lines = report.lines();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("32x1 (32): "), "{}", lines[0]);
    assert!(lines[1].starts_with("32x2 (64): "), "{}", lines[1]);
    assert!(lines[2].starts_with("64x1 (64): "), "{}", lines[2]);
    assert!(lines.iter().all(|l| l.ends_with(" ms")));
    assert_eq!(report.skipped, 32 * 1024 - 3);

    let json = report.to_json().unwrap();
    assert!(json.contains("\"kernel\": \"blur\""));
}

#[test]
fn test_launch_failure_aborts_and_cleans_up() {
    // Tile 32x1 uses launches 0..3, tile 32x2 fails on its second trial.
    let mut device = blur_device().fail_launch_at(4);
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let (image, _) = create_memory(&mut device, &mut registry, 64, 64, 4, None).unwrap();

    let err = fast_explorer(&mut device, &mut registry, &compiler)
        .explore_kernel(&blur_request(image))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(err.op(), Some("launch(blur)"));
    assert_eq!(compiler.builds().len(), 2);
    assert_eq!(device.live_modules(), 0);
    assert_eq!(device.live_events(), 0);
    // Only the image survives; module globals were released with their modules.
    assert_eq!(device.live_allocations(), 1);
}

#[test]
fn test_missing_texture_symbol_aborts_before_launch() {
    let mut device = blur_device().with_missing_symbol("input");
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let (image, _) = create_memory(&mut device, &mut registry, 64, 64, 4, None).unwrap();

    let err = fast_explorer(&mut device, &mut registry, &compiler)
        .explore_kernel(&blur_request(image))
        .unwrap_err();

    assert_eq!(err.op(), Some("cuTexObjectCreate(input)"));
    assert!(device.launches().is_empty());
    assert_eq!(device.live_modules(), 0);
}

#[test]
fn test_module_load_failure_is_a_compiler_error() {
    let mut device = blur_device().fail_module_load("ptxas fatal: Unresolved extern function");
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let (image, _) = create_memory(&mut device, &mut registry, 64, 64, 4, None).unwrap();

    let err = fast_explorer(&mut device, &mut registry, &compiler)
        .explore_kernel(&blur_request(image))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Compiler);
    assert!(err.to_string().contains("Unresolved extern function"));
}

// ═══════════════════════════════════════════════════════════════════════
// Reductions
// ═══════════════════════════════════════════════════════════════════════

const WIDTH: u32 = 64;
const HEIGHT: u32 = 16;

fn arg_ptr(launch: &SimLaunch, index: usize) -> DevicePtr {
    DevicePtr(launch.args.read::<u64>(index).unwrap_or_default())
}

fn arg_u32(launch: &SimLaunch, index: usize) -> u32 {
    launch.args.read::<u32>(index).unwrap_or_default()
}

fn at(ptr: DevicePtr, index: u32) -> DevicePtr {
    ptr.offset(index as usize * 4)
}

/// Sum of the (optional) region, one partial per block. Each block covers
/// `block.x * 2` columns and `ceil(rows / grid.y)` rows.
fn reduce2d(mem: &mut SimMemory, launch: &SimLaunch) -> ExploreResult<()> {
    let image = arg_ptr(launch, 0);
    let output = arg_ptr(launch, 1);
    let neutral = launch.args.read::<f32>(2).unwrap_or_default();
    let (width, height, stride) = (arg_u32(launch, 3), arg_u32(launch, 4), arg_u32(launch, 5));
    let (ox, oy, rw, rh) = if launch.args.len() == 10 {
        (arg_u32(launch, 6), arg_u32(launch, 7), arg_u32(launch, 8), arg_u32(launch, 9))
    } else {
        (0, 0, width, height)
    };

    let cols = launch.block.x * 2;
    let rows = rh.div_ceil(launch.grid.y);
    for by in 0..launch.grid.y {
        for bx in 0..launch.grid.x {
            let mut acc = neutral;
            for y in by * rows..((by + 1) * rows).min(rh) {
                for x in bx * cols..((bx + 1) * cols).min(rw) {
                    acc += mem.read_pod::<f32>(at(image, (oy + y) * stride + ox + x))?;
                }
            }
            mem.write_pod(at(output, by * launch.grid.x + bx), acc)?;
        }
    }
    Ok(())
}

/// In-place sum of `count` partials into one partial per block.
fn reduce1d(mem: &mut SimMemory, launch: &SimLaunch) -> ExploreResult<()> {
    let input = arg_ptr(launch, 0);
    let output = arg_ptr(launch, 1);
    let neutral = launch.args.read::<f32>(2).unwrap_or_default();
    let count = arg_u32(launch, 3);

    let mut partials = Vec::with_capacity(count as usize);
    for i in 0..count {
        partials.push(mem.read_pod::<f32>(at(input, i))?);
    }
    let chunk = count.div_ceil(launch.grid.x) as usize;
    for (block, values) in partials.chunks(chunk.max(1)).enumerate() {
        let sum = values.iter().fold(neutral, |acc, v| acc + v);
        mem.write_pod(at(output, block as u32), sum)?;
    }
    Ok(())
}

/// Whole reduction in one launch; the result lands in the first partial.
fn reduce_fence(mem: &mut SimMemory, launch: &SimLaunch) -> ExploreResult<()> {
    let single = SimLaunch {
        grid: Dim3::xy(1, 1),
        block: Dim3::xy(launch.grid.x * launch.block.x, 1),
        ..launch.clone()
    };
    reduce2d(mem, &single)
}

fn reduction_device() -> SimDevice {
    SimDevice::new(SimDevice::default_properties())
        .with_kernel("reduce2d", reduce2d)
        .with_kernel("reduce1d", reduce1d)
        .with_kernel("reduce_fence", reduce_fence)
}

fn pixel(x: u32, y: u32) -> f32 {
    (x % 7 + y) as f32
}

fn upload_image(device: &mut SimDevice, registry: &mut DeviceRegistry) -> DevicePtr {
    let (image, _) = create_memory(
        device,
        registry,
        WIDTH as usize,
        HEIGHT as usize,
        4,
        Some(256),
    )
    .unwrap();
    let host: Vec<f32> = (0..HEIGHT)
        .flat_map(|y| (0..WIDTH).map(move |x| pixel(x, y)))
        .collect();
    write_memory(device, registry, image, &host).unwrap();
    image
}

fn region_sum(ox: u32, oy: u32, w: u32, h: u32) -> f32 {
    (oy..oy + h)
        .flat_map(|y| (ox..ox + w).map(move |x| pixel(x, y)))
        .sum()
}

#[test]
fn test_explore_reduction_sweeps_pixels_per_thread() {
    let mut device = reduction_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let image = upload_image(&mut device, &mut registry);
    let region = ReductionRegion::from_dims(&registry.dims_of(image).unwrap());
    let request = ReductionExploration::new(
        "reduce.cu",
        ReductionStrategy::two_phase("reduce2d", "reduce1d"),
        image,
        0.0f32,
        region,
        16,
    );

    let outcome = fast_explorer(&mut device, &mut registry, &compiler)
        .explore_reduction(&request)
        .unwrap();

    assert_eq!(outcome.report.len(), HEIGHT as usize);
    assert_eq!(outcome.report.kernel, "reduce2d, reduce1d");
    let ppts: Vec<u32> = outcome.report.configs().map(|p| p.0).collect();
    assert_eq!(ppts, (1..=HEIGHT).collect::<Vec<_>>());
    assert!(outcome.report.lines()[0].starts_with("PPT: 1, "));
    assert_eq!(outcome.value, region_sum(0, 0, WIDTH, HEIGHT));

    let builds = compiler.builds();
    assert_eq!(builds.len(), HEIGHT as usize);
    assert_eq!(builds[3].get("PPT"), Some("4"));
    assert!(builds.iter().all(|b| b.get("BS") == Some("16")));

    // Phase 1 at ppt = 1: 64 / (16 * 2) x 16 blocks, always with region arguments.
    let first = &device.launches()[0];
    assert_eq!(first.function, "reduce2d");
    assert_eq!(first.grid, Dim3::xy(2, 16));
    assert_eq!(first.block, Dim3::xy(16, 1));
    assert_eq!(first.args.len(), 10);
    // 32 partials: a full 16-thread step, then one block for the last two.
    assert_eq!(device.launches()[1].grid, Dim3::xy(2, 1));
    assert_eq!(device.launches()[2].grid, Dim3::xy(1, 1));
    assert_eq!(device.launches()[2].args.read::<u32>(3), Some(2));

    // Partial buffer released, image still registered.
    assert_eq!(registry.len(), 1);
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(device.live_modules(), 0);
}

#[test]
fn test_thread_fence_trial_is_one_launch() {
    let mut device = reduction_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let image = upload_image(&mut device, &mut registry);
    let request = ReductionExploration::new(
        "reduce.cu",
        ReductionStrategy::thread_fence("reduce_fence"),
        image,
        0.0f32,
        ReductionRegion::full(WIDTH, HEIGHT, WIDTH),
        32,
    );

    let outcome = fast_explorer(&mut device, &mut registry, &compiler)
        .explore_reduction(&request)
        .unwrap();

    assert_eq!(outcome.report.len(), HEIGHT as usize);
    assert_eq!(outcome.report.timing_of(&PixelsPerThread(2)).map(|t| t > 0.0), Some(true));
    assert_eq!(device.launches().len(), HEIGHT as usize * 3);
    assert!(device.launches().iter().all(|l| l.function == "reduce_fence"));
    assert_eq!(outcome.value, region_sum(0, 0, WIDTH, HEIGHT));
}

#[test]
fn test_apply_reduction_over_region() {
    let mut device = reduction_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let image = upload_image(&mut device, &mut registry);
    let stride = registry.dims_of(image).unwrap().stride as u32;
    let strategy = ReductionStrategy::two_phase("reduce2d", "reduce1d");

    let loaded = RecompilationPipeline::new(&compiler, "reduce.cu", Capability::Sm86)
        .build(
            &mut device,
            &registry,
            &strategy.entry_points(),
            &MacroDefines::new(),
            &[],
            &[],
        )
        .unwrap();

    let full = ReductionRegion::full(WIDTH, HEIGHT, stride);
    let total =
        apply_reduction(&mut device, &mut registry, &loaded, &strategy, image, 0.0f32, &full, 16, 1)
            .unwrap();
    assert_eq!(total, region_sum(0, 0, WIDTH, HEIGHT));
    assert_eq!(device.launches()[0].args.len(), 6);
    // 32 partials fold in a single 16-thread block, two elements per thread.
    let phase2 = &device.launches()[1];
    assert_eq!(phase2.grid, Dim3::xy(1, 1));
    assert_eq!(phase2.block, Dim3::xy(16, 1));
    assert_eq!(phase2.args.read::<u32>(3), Some(32));
    assert_eq!(phase2.args.read::<u32>(4), Some(2));

    let sub = full.with_region(8, 4, 32, 8);
    let partial =
        apply_reduction(&mut device, &mut registry, &loaded, &strategy, image, 0.0f32, &sub, 16, 2)
            .unwrap();
    assert_eq!(partial, region_sum(8, 4, 32, 8));
    assert_eq!(device.launches()[2].args.len(), 10);
    assert_eq!(device.launches()[2].grid, Dim3::xy(2, 4));

    loaded.unload(&mut device).unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(device.live_allocations(), 1);
}

#[test]
fn test_apply_reduction_thread_fence() {
    let mut device = reduction_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let image = upload_image(&mut device, &mut registry);
    let stride = registry.dims_of(image).unwrap().stride as u32;
    let strategy = ReductionStrategy::thread_fence("reduce_fence");

    let loaded = RecompilationPipeline::new(&compiler, "reduce.cu", Capability::Sm86)
        .build(&mut device, &registry, &strategy.entry_points(), &MacroDefines::new(), &[], &[])
        .unwrap();

    let full = ReductionRegion::full(WIDTH, HEIGHT, stride);
    let total =
        apply_reduction(&mut device, &mut registry, &loaded, &strategy, image, 0.0f32, &full, 16, 1)
            .unwrap();
    assert_eq!(total, region_sum(0, 0, WIDTH, HEIGHT));
    // No second phase: the fence kernel finishes the reduction itself.
    assert_eq!(device.launches().len(), 1);
    assert_eq!(device.launches()[0].function, "reduce_fence");
    assert_eq!(device.launches()[0].args.len(), 6);

    let sub = full.with_region(8, 4, 32, 8);
    let partial =
        apply_reduction(&mut device, &mut registry, &loaded, &strategy, image, 0.0f32, &sub, 16, 2)
            .unwrap();
    assert_eq!(partial, region_sum(8, 4, 32, 8));
    assert_eq!(device.launches().len(), 2);
    assert_eq!(device.launches()[1].args.len(), 10);

    loaded.unload(&mut device).unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(device.live_allocations(), 1);
}

#[test]
fn test_apply_reduction_rejects_unknown_image() {
    let mut device = reduction_device();
    let mut registry = DeviceRegistry::new();
    let compiler = RecordingCompiler::default();
    let strategy = ReductionStrategy::two_phase("reduce2d", "reduce1d");
    let loaded = RecompilationPipeline::new(&compiler, "reduce.cu", Capability::Sm86)
        .build(&mut device, &registry, &strategy.entry_points(), &MacroDefines::new(), &[], &[])
        .unwrap();

    let region = ReductionRegion::full(WIDTH, HEIGHT, WIDTH);
    let err = apply_reduction(
        &mut device,
        &mut registry,
        &loaded,
        &strategy,
        DevicePtr(0xdead_0000),
        0.0f32,
        &region,
        16,
        1,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(device.launches().is_empty());
    loaded.unload(&mut device).unwrap();
}
