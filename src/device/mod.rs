//! Device abstraction consumed by the explorer.
//!
//! The explorer never talks to a driver directly. Everything it needs from the
//! accelerator (memory, module loading, symbol lookup, launches and event
//! timing) goes through the [`Device`] trait:
//!
//! ```text
//! sim   -- deterministic in-process device (tests, dry runs)
//! cuda  -- CUDA driver API through cudarc (feature "cuda")
//! ```

pub mod sim;

#[cfg(feature = "cuda")]
pub mod cuda;

use serde::{Deserialize, Serialize};

use crate::compiler::Capability;
use crate::error::ExploreResult;
use crate::launch::KernelArgs;

pub use sim::SimDevice;

#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;

/// Opaque handle of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Handle offset by `bytes`.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Grid or block shape of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    pub const fn xy(x: u32, y: u32) -> Self {
        Dim3 { x, y, z: 1 }
    }

    /// Total number of threads (block) or blocks (grid).
    pub fn product(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    pub fn as_tuple(&self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }
}

impl std::fmt::Display for Dim3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Limits of the device that bound the search space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub name: String,
    pub warp_size: u32,
    pub max_threads_per_block: u32,
    /// On-chip scratch memory budget per block, in bytes.
    pub max_shared_mem_per_block: usize,
    pub capability: Capability,
}

/// Pixel format a texture reads its backing memory as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F16,
    F32,
}

impl TextureFormat {
    pub fn channel_bytes(self) -> usize {
        match self {
            TextureFormat::U8 | TextureFormat::I8 => 1,
            TextureFormat::U16 | TextureFormat::I16 | TextureFormat::F16 => 2,
            TextureFormat::U32 | TextureFormat::I32 | TextureFormat::F32 => 4,
        }
    }
}

/// A texture symbol bound to linear device memory, with geometry taken from
/// the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBinding {
    pub ptr: DevicePtr,
    pub format: TextureFormat,
    /// Channels per pixel (`elem_size / format.channel_bytes()`).
    pub channels: u32,
    pub width: usize,
    pub height: usize,
    pub pitch_bytes: usize,
    pub size_bytes: usize,
}

/// Primitive operations of an accelerator, as used by the explorer.
///
/// All operations are synchronous from the host's point of view except
/// [`Device::launch`], which only enqueues; callers pair it with
/// [`Device::synchronize`].
pub trait Device {
    type Module;
    type Function: Copy;
    type Event;

    fn properties(&self) -> &DeviceProperties;

    fn mem_alloc(&mut self, bytes: usize) -> ExploreResult<DevicePtr>;
    fn mem_free(&mut self, ptr: DevicePtr) -> ExploreResult<()>;

    fn copy_htod(&mut self, dst: DevicePtr, src: &[u8]) -> ExploreResult<()>;
    fn copy_dtoh(&mut self, dst: &mut [u8], src: DevicePtr) -> ExploreResult<()>;

    /// Strided host-to-device copy of `height` rows of `width_bytes` each.
    fn copy_htod_2d(
        &mut self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: &[u8],
        src_pitch: usize,
        width_bytes: usize,
        height: usize,
    ) -> ExploreResult<()>;

    /// Strided device-to-host copy of `height` rows of `width_bytes` each.
    fn copy_dtoh_2d(
        &mut self,
        dst: &mut [u8],
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width_bytes: usize,
        height: usize,
    ) -> ExploreResult<()>;

    /// Load a compiled image into a fresh module. A failure carries the
    /// device-side error log.
    fn load_module(&mut self, image: &[u8], target: Capability) -> ExploreResult<Self::Module>;
    fn unload_module(&mut self, module: Self::Module) -> ExploreResult<()>;

    fn get_function(&mut self, module: &Self::Module, name: &str) -> ExploreResult<Self::Function>;

    /// Address and size of a module-scope global (constant memory symbol).
    fn get_global(
        &mut self,
        module: &Self::Module,
        name: &str,
    ) -> ExploreResult<(DevicePtr, usize)>;

    fn bind_texture(
        &mut self,
        module: &mut Self::Module,
        name: &str,
        binding: &TextureBinding,
    ) -> ExploreResult<()>;

    /// Enqueue one launch on the default stream.
    fn launch(
        &mut self,
        function: Self::Function,
        grid: Dim3,
        block: Dim3,
        args: &KernelArgs,
    ) -> ExploreResult<()>;

    /// Wait for all outstanding device work.
    fn synchronize(&mut self) -> ExploreResult<()>;

    fn event_create(&mut self) -> ExploreResult<Self::Event>;
    fn event_record(&mut self, event: &Self::Event) -> ExploreResult<()>;
    fn event_synchronize(&mut self, event: &Self::Event) -> ExploreResult<()>;
    /// Device-clock milliseconds between two recorded events.
    fn event_elapsed_ms(&mut self, start: &Self::Event, end: &Self::Event) -> ExploreResult<f32>;
    fn event_destroy(&mut self, event: Self::Event) -> ExploreResult<()>;
}
