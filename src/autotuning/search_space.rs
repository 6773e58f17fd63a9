//! Tile-shape search space.
//!
//! Tile widths step through multiples of the warp size, tile heights through
//! every positive integer, both bounded by the device's per-block thread
//! limit. Two feasibility filters prune the grid before anything is compiled:
//! the kernel's thread ceiling and the per-block scratch-memory budget.

use serde::{Deserialize, Serialize};

use crate::device::DeviceProperties;
use crate::error::{ExploreError, ExploreResult};

/// A single tunable parameter with its valid range and step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRange {
    pub name: &'static str,
    pub min: usize,
    pub max: usize,
    pub step: usize,
}

impl ParamRange {
    /// Number of discrete values in this range.
    pub fn count(&self) -> usize {
        if self.max < self.min || self.step == 0 {
            return 0;
        }
        (self.max - self.min) / self.step + 1
    }

    pub fn values(&self) -> impl Iterator<Item = usize> + '_ {
        let step = self.step.max(1);
        (0..self.count()).map(move |i| self.min + i * step)
    }
}

/// Thread-block shape of one kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileConfig {
    pub width: u32,
    pub height: u32,
}

impl TileConfig {
    pub const fn new(width: u32, height: u32) -> Self {
        TileConfig { width, height }
    }

    pub fn threads(&self) -> u32 {
        self.width * self.height
    }
}

impl std::fmt::Display for TileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One buffer a kernel stages through on-chip scratch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmemDescriptor {
    pub halo_x: u32,
    pub halo_y: u32,
    pub elem_size: usize,
}

impl SmemDescriptor {
    pub const fn new(halo_x: u32, halo_y: u32, elem_size: usize) -> Self {
        SmemDescriptor {
            halo_x,
            halo_y,
            elem_size,
        }
    }

    /// Scratch bytes this buffer needs for `tile`:
    /// `(width + halo_x) * (height + halo_y - 1) * elem_size`.
    pub fn bytes_for(&self, tile: TileConfig) -> usize {
        let cols = (tile.width + self.halo_x) as usize;
        let rows = (tile.height + self.halo_y).saturating_sub(1) as usize;
        cols * rows * self.elem_size
    }
}

/// Outcome of the feasibility filters for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feasibility {
    Feasible,
    /// `width * height` is over the kernel's thread ceiling.
    TooManyThreads,
    /// Scratch usage meets or exceeds the per-block budget.
    SharedMemory { bytes: usize },
}

impl Feasibility {
    pub fn is_feasible(&self) -> bool {
        matches!(self, Feasibility::Feasible)
    }
}

#[derive(Debug, Clone)]
pub struct TileSearchSpace {
    pub width_range: ParamRange,
    pub height_range: ParamRange,
    /// Effective thread ceiling: the kernel's, capped at the device limit.
    pub max_threads: u32,
    pub smem_budget: usize,
    pub smem: Vec<SmemDescriptor>,
}

impl TileSearchSpace {
    pub fn new(
        properties: &DeviceProperties,
        max_threads_for_kernel: u32,
        smem: &[SmemDescriptor],
    ) -> ExploreResult<Self> {
        if properties.warp_size == 0 || properties.max_threads_per_block == 0 {
            return Err(ExploreError::InvalidConfig(format!(
                "device {} reports warp size {} and {} threads per block",
                properties.name, properties.warp_size, properties.max_threads_per_block
            )));
        }
        let max_tpb = properties.max_threads_per_block as usize;
        Ok(TileSearchSpace {
            width_range: ParamRange {
                name: "BSX_EXPLORE",
                min: properties.warp_size as usize,
                max: max_tpb,
                step: properties.warp_size as usize,
            },
            height_range: ParamRange {
                name: "BSY_EXPLORE",
                min: 1,
                max: max_tpb,
                step: 1,
            },
            max_threads: max_threads_for_kernel.min(properties.max_threads_per_block),
            smem_budget: properties.max_shared_mem_per_block,
            smem: smem.to_vec(),
        })
    }

    /// Total scratch bytes of every declared buffer for `tile`.
    pub fn smem_bytes(&self, tile: TileConfig) -> usize {
        self.smem.iter().map(|d| d.bytes_for(tile)).sum()
    }

    pub fn check(&self, tile: TileConfig) -> Feasibility {
        if tile.threads() > self.max_threads {
            return Feasibility::TooManyThreads;
        }
        let bytes = self.smem_bytes(tile);
        if bytes >= self.smem_budget {
            return Feasibility::SharedMemory { bytes };
        }
        Feasibility::Feasible
    }

    /// Every tile of the grid in visit order: width ascending outer, height
    /// ascending inner.
    pub fn candidates(&self) -> impl Iterator<Item = TileConfig> + '_ {
        self.width_range.values().flat_map(move |w| {
            self.height_range
                .values()
                .map(move |h| TileConfig::new(w as u32, h as u32))
        })
    }

    pub fn feasible(&self) -> Vec<TileConfig> {
        self.candidates()
            .filter(|t| self.check(*t).is_feasible())
            .collect()
    }

    /// Size of the unfiltered grid.
    pub fn grid_size(&self) -> usize {
        self.width_range.count() * self.height_range.count()
    }
}
