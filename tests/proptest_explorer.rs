//! Property-based tests for the explorer's invariants.
//!
//! - Every feasible tile respects the thread ceiling and the scratch budget
//! - Visit order is width-major, height-minor
//! - Bench results report the minimum of all trials
//! - The inter-block reduction loop converges in at most ceil(log2 B) steps
//! - Registered geometry survives until released

use proptest::prelude::*;

use kernel_explorer::autotuning::measure::{bench_min, BenchConfig};
use kernel_explorer::autotuning::reduction::{next_pow2_warp, ReductionSchedule};
use kernel_explorer::autotuning::{SmemDescriptor, TileConfig, TileSearchSpace};
use kernel_explorer::compiler::Capability;
use kernel_explorer::device::{DevicePtr, DeviceProperties};
use kernel_explorer::registry::{AllocDims, DeviceRegistry};

fn props(warp: u32, max_threads: u32, smem: usize) -> DeviceProperties {
    DeviceProperties {
        name: "prop".into(),
        warp_size: warp,
        max_threads_per_block: max_threads,
        max_shared_mem_per_block: smem,
        capability: Capability::Sm80,
    }
}

fn arb_smem() -> impl Strategy<Value = SmemDescriptor> {
    (0u32..8, 0u32..8, prop_oneof![Just(1usize), Just(2), Just(4), Just(8)])
        .prop_map(|(hx, hy, elem)| SmemDescriptor::new(hx, hy, elem))
}

// ═══════════════════════════════════════════════════════════════════════
// 1. Search space
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_feasible_tiles_respect_limits(
        warp in prop_oneof![Just(16u32), Just(32), Just(64)],
        ceiling in 1u32..1024,
        budget in 256usize..65536,
        smem in prop::collection::vec(arb_smem(), 0..3),
    ) {
        let space = TileSearchSpace::new(&props(warp, 1024, budget), ceiling, &smem).unwrap();
        for tile in space.feasible() {
            prop_assert!(tile.threads() <= ceiling);
            prop_assert_eq!(tile.width % warp, 0);
            let bytes: usize = smem.iter().map(|d| d.bytes_for(tile)).sum();
            prop_assert!(bytes < budget);
        }
    }

    #[test]
    fn prop_visit_order_is_width_major(
        ceiling in 32u32..1024,
        smem in prop::collection::vec(arb_smem(), 0..2),
    ) {
        let space = TileSearchSpace::new(&props(32, 1024, 49152), ceiling, &smem).unwrap();
        let feasible = space.feasible();
        for pair in feasible.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            prop_assert!(a.width < b.width || (a.width == b.width && a.height < b.height));
        }
    }

    #[test]
    fn prop_filter_matches_exhaustive_check(ceiling in 1u32..512, budget in 1usize..8192) {
        let smem = [SmemDescriptor::new(2, 2, 4)];
        let space = TileSearchSpace::new(&props(32, 512, budget), ceiling, &smem).unwrap();
        let mut expected = Vec::new();
        for w in (32..=512u32).step_by(32) {
            for h in 1..=512u32 {
                let tile = TileConfig::new(w, h);
                let bytes = (w as usize + 2) * (h as usize + 1) * 4;
                if tile.threads() <= ceiling && bytes < budget {
                    expected.push(tile);
                }
            }
        }
        prop_assert_eq!(space.feasible(), expected);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 2. Measurement
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn prop_bench_reports_minimum(timings in prop::collection::vec(0.001f32..100.0, 1..32)) {
        let config = BenchConfig::new(timings.len());
        let result = bench_min(&config, |i| Ok(timings[i])).unwrap();
        let min = timings.iter().copied().fold(f32::MAX, f32::min);
        let max = timings.iter().copied().fold(f32::MIN, f32::max);
        prop_assert_eq!(result.min_ms, min);
        prop_assert_eq!(result.max_ms, max);
        prop_assert!(result.mean_ms >= min * 0.999 && result.mean_ms <= max * 1.001);
        prop_assert_eq!(result.samples, timings.len());
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 3. Reduction schedule
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn prop_schedule_converges(
        blocks in 2u32..5_000_000,
        max_threads in prop_oneof![Just(64u32), Just(128), Just(256), Just(512), Just(1024)],
        ppt in 1u32..64,
    ) {
        let steps: Vec<_> = ReductionSchedule::new(blocks, max_threads, 32, ppt).collect();
        let bound = 32 - (blocks - 1).leading_zeros();
        prop_assert!(steps.len() as u32 <= bound);
        prop_assert_eq!(steps.last().map(|s| s.grid), Some(1));

        let mut remaining = blocks;
        for step in &steps {
            prop_assert_eq!(step.blocks_in, remaining);
            prop_assert!(step.grid < step.blocks_in);
            prop_assert!(step.block >= 2);
            remaining = step.grid;
        }
    }

    #[test]
    fn prop_next_pow2_floor(x in 0u32..1_000_000) {
        let p = next_pow2_warp(x, 32);
        prop_assert!(p.is_power_of_two());
        prop_assert!(p >= 32);
        prop_assert!(p >= x);
        if p > 32 {
            prop_assert!(p / 2 < x);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 4. Registry
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn prop_registry_roundtrip(
        entries in prop::collection::btree_map(
            1u64..1_000_000,
            (1usize..4096, 1usize..4096),
            1..16,
        ),
    ) {
        let mut registry = DeviceRegistry::new();
        for (&handle, &(w, h)) in &entries {
            registry.register(DevicePtr(handle * 256), AllocDims::packed(w, h, 4)).unwrap();
        }
        prop_assert_eq!(registry.len(), entries.len());
        for (&handle, &(w, h)) in &entries {
            let dims = registry.dims_of(DevicePtr(handle * 256)).unwrap();
            prop_assert_eq!((dims.width, dims.height, dims.stride), (w, h, w));
        }
        for &handle in entries.keys() {
            registry.release(DevicePtr(handle * 256)).unwrap();
            prop_assert!(!registry.contains(DevicePtr(handle * 256)));
        }
        prop_assert!(registry.is_empty());
    }

    #[test]
    fn prop_aligned_rows_start_on_boundary(
        width in 1usize..5000,
        elem in prop_oneof![Just(1usize), Just(2), Just(4), Just(8)],
        align_elems in 1usize..64,
    ) {
        let alignment = elem * align_elems;
        let dims = AllocDims::aligned(width, 3, elem, alignment).unwrap();
        prop_assert!(dims.stride >= width);
        prop_assert_eq!(dims.pitch_bytes() % alignment, 0);
        prop_assert!(dims.stride - width < align_elems);
    }
}
