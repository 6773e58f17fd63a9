//! Deterministic in-process device.
//!
//! Backs allocations with host memory, advances a simulated device clock by a
//! pluggable cost model on every launch, and can run host closures in place
//! of kernels. Used by the test-suite and for dry runs of an exploration
//! without an accelerator.

use std::collections::HashMap;

use crate::compiler::Capability;
use crate::device::{Device, DevicePtr, DeviceProperties, Dim3, TextureBinding};
use crate::error::{ExploreError, ExploreResult};
use crate::launch::KernelArgs;

const BASE_ADDRESS: u64 = 0x7000_0000;
const ALLOC_ALIGN: u64 = 256;

/// One launch as seen by the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimLaunch {
    pub function: String,
    pub grid: Dim3,
    pub block: Dim3,
    pub args: KernelArgs,
    pub elapsed_ms: f32,
}

/// Module produced by [`SimDevice::load_module`].
#[derive(Debug)]
pub struct SimModule {
    id: usize,
    image: Vec<u8>,
    globals: Vec<(String, DevicePtr, usize)>,
    textures: Vec<(String, TextureBinding)>,
}

impl SimModule {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn texture(&self, name: &str) -> Option<&TextureBinding> {
        self.textures.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimFunction(usize);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimEvent(usize);

/// Byte-addressable view of the simulated device memory.
#[derive(Debug, Default)]
pub struct SimMemory {
    allocations: HashMap<u64, Vec<u8>>,
}

impl SimMemory {
    fn locate(&self, ptr: DevicePtr, len: usize) -> ExploreResult<(u64, usize)> {
        self.allocations
            .iter()
            .find(|(&base, buf)| ptr.0 >= base && ptr.0 + len as u64 <= base + buf.len() as u64)
            .map(|(&base, _)| (base, (ptr.0 - base) as usize))
            .ok_or_else(|| {
                ExploreError::device(
                    "memory access",
                    format!("{len} bytes at {ptr} are outside every allocation"),
                )
            })
    }

    pub fn read(&self, ptr: DevicePtr, len: usize) -> ExploreResult<&[u8]> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base][offset..offset + len])
    }

    pub fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> ExploreResult<()> {
        let (base, offset) = self.locate(ptr, bytes.len())?;
        let buf = self
            .allocations
            .get_mut(&base)
            .ok_or(ExploreError::UnknownAllocation(DevicePtr(base)))?;
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_pod<T: bytemuck::Pod>(&self, ptr: DevicePtr) -> ExploreResult<T> {
        let bytes = self.read(ptr, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, ptr: DevicePtr, value: T) -> ExploreResult<()> {
        self.write(ptr, bytemuck::bytes_of(&value))
    }
}

type CostModel = Box<dyn FnMut(&SimLaunch) -> f32>;
type KernelBehaviour = Box<dyn FnMut(&mut SimMemory, &SimLaunch) -> ExploreResult<()>>;

pub struct SimDevice {
    properties: DeviceProperties,
    memory: SimMemory,
    next_address: u64,
    clock_ms: f64,
    cost_model: CostModel,
    kernels: HashMap<String, KernelBehaviour>,
    globals: Vec<(String, usize)>,
    missing_symbols: Vec<String>,
    functions: Vec<String>,
    next_module: usize,
    live_modules: usize,
    loaded_images: Vec<Vec<u8>>,
    events: HashMap<usize, Option<f64>>,
    next_event: usize,
    launches: Vec<SimLaunch>,
    fail_launch_at: Option<usize>,
    fail_event_at: Option<usize>,
    load_error_log: Option<String>,
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("properties", &self.properties)
            .field("clock_ms", &self.clock_ms)
            .field("allocations", &self.memory.allocations.len())
            .field("launches", &self.launches.len())
            .finish()
    }
}

impl SimDevice {
    pub fn new(properties: DeviceProperties) -> Self {
        SimDevice {
            properties,
            memory: SimMemory::default(),
            next_address: BASE_ADDRESS,
            clock_ms: 0.0,
            cost_model: Box::new(default_cost),
            kernels: HashMap::new(),
            globals: Vec::new(),
            missing_symbols: Vec::new(),
            functions: Vec::new(),
            next_module: 0,
            live_modules: 0,
            loaded_images: Vec::new(),
            events: HashMap::new(),
            next_event: 0,
            launches: Vec::new(),
            fail_launch_at: None,
            fail_event_at: None,
            load_error_log: None,
        }
    }

    /// A Fermi-class-sized device: warp 32, 1024 threads and 48 KiB of
    /// scratch memory per block.
    pub fn default_properties() -> DeviceProperties {
        DeviceProperties {
            name: "simulated device".to_string(),
            warp_size: 32,
            max_threads_per_block: 1024,
            max_shared_mem_per_block: 49152,
            capability: Capability::Sm86,
        }
    }

    /// Milliseconds charged per launch.
    pub fn with_cost_model(mut self, model: impl FnMut(&SimLaunch) -> f32 + 'static) -> Self {
        self.cost_model = Box::new(model);
        self
    }

    /// Run `behaviour` whenever a function called `name` is launched.
    pub fn with_kernel(
        mut self,
        name: &str,
        behaviour: impl FnMut(&mut SimMemory, &SimLaunch) -> ExploreResult<()> + 'static,
    ) -> Self {
        self.kernels.insert(name.to_string(), Box::new(behaviour));
        self
    }

    /// Declare a module-scope global of `size` bytes in every loaded module.
    pub fn with_global(mut self, name: &str, size: usize) -> Self {
        self.globals.push((name.to_string(), size));
        self
    }

    /// Make lookups of `name` fail as if the symbol were absent.
    pub fn with_missing_symbol(mut self, name: &str) -> Self {
        self.missing_symbols.push(name.to_string());
        self
    }

    /// Fail the `index`-th launch (0-based).
    pub fn fail_launch_at(mut self, index: usize) -> Self {
        self.fail_launch_at = Some(index);
        self
    }

    /// Fail the `index`-th event creation (0-based).
    pub fn fail_event_at(mut self, index: usize) -> Self {
        self.fail_event_at = Some(index);
        self
    }

    /// Reject every module load with the given JIT error log.
    pub fn fail_module_load(mut self, log: &str) -> Self {
        self.load_error_log = Some(log.to_string());
        self
    }

    pub fn memory(&self) -> &SimMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SimMemory {
        &mut self.memory
    }

    pub fn launches(&self) -> &[SimLaunch] {
        &self.launches
    }

    pub fn loaded_images(&self) -> &[Vec<u8>] {
        &self.loaded_images
    }

    pub fn live_modules(&self) -> usize {
        self.live_modules
    }

    pub fn live_events(&self) -> usize {
        self.events.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.memory.allocations.len()
    }

    pub fn clock_ms(&self) -> f64 {
        self.clock_ms
    }

    fn function_name(&self, function: SimFunction) -> ExploreResult<&str> {
        self.functions
            .get(function.0)
            .map(String::as_str)
            .ok_or_else(|| ExploreError::device("cuLaunchKernel", "CUDA_ERROR_INVALID_HANDLE"))
    }

    fn event_time(&self, event: &SimEvent, op: &str) -> ExploreResult<f64> {
        match self.events.get(&event.0) {
            Some(Some(t)) => Ok(*t),
            Some(None) => Err(ExploreError::device(op, "CUDA_ERROR_NOT_READY")),
            None => Err(ExploreError::device(op, "CUDA_ERROR_INVALID_HANDLE")),
        }
    }
}

fn default_cost(launch: &SimLaunch) -> f32 {
    0.01 + (launch.grid.product() * launch.block.product()) as f32 * 1e-6
}

impl Device for SimDevice {
    type Module = SimModule;
    type Function = SimFunction;
    type Event = SimEvent;

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn mem_alloc(&mut self, bytes: usize) -> ExploreResult<DevicePtr> {
        let ptr = DevicePtr(self.next_address);
        let span = (bytes as u64).max(1).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        self.next_address += span;
        self.memory.allocations.insert(ptr.0, vec![0u8; bytes]);
        Ok(ptr)
    }

    fn mem_free(&mut self, ptr: DevicePtr) -> ExploreResult<()> {
        self.memory
            .allocations
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or_else(|| ExploreError::device("cuMemFree", "CUDA_ERROR_INVALID_VALUE"))
    }

    fn copy_htod(&mut self, dst: DevicePtr, src: &[u8]) -> ExploreResult<()> {
        self.memory.write(dst, src)
    }

    fn copy_dtoh(&mut self, dst: &mut [u8], src: DevicePtr) -> ExploreResult<()> {
        let bytes = self.memory.read(src, dst.len())?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn copy_htod_2d(
        &mut self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: &[u8],
        src_pitch: usize,
        width_bytes: usize,
        height: usize,
    ) -> ExploreResult<()> {
        check_pitches(dst_pitch, src_pitch, width_bytes, "cuMemcpy2D")?;
        for row in 0..height {
            let from = row * src_pitch;
            let bytes = src.get(from..from + width_bytes).ok_or_else(|| {
                ExploreError::device("cuMemcpy2D", "host buffer shorter than copy extent")
            })?;
            self.memory.write(dst.offset(row * dst_pitch), bytes)?;
        }
        Ok(())
    }

    fn copy_dtoh_2d(
        &mut self,
        dst: &mut [u8],
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width_bytes: usize,
        height: usize,
    ) -> ExploreResult<()> {
        check_pitches(dst_pitch, src_pitch, width_bytes, "cuMemcpy2D")?;
        for row in 0..height {
            let to = row * dst_pitch;
            let bytes = self.memory.read(src.offset(row * src_pitch), width_bytes)?;
            dst.get_mut(to..to + width_bytes)
                .ok_or_else(|| {
                    ExploreError::device("cuMemcpy2D", "host buffer shorter than copy extent")
                })?
                .copy_from_slice(bytes);
        }
        Ok(())
    }

    fn load_module(&mut self, image: &[u8], target: Capability) -> ExploreResult<SimModule> {
        if let Some(log) = &self.load_error_log {
            return Err(ExploreError::ModuleLoad {
                message: format!("cuModuleLoadDataEx({target}): CUDA_ERROR_INVALID_PTX"),
                log: log.clone(),
            });
        }
        let mut globals = Vec::with_capacity(self.globals.len());
        for (name, size) in self.globals.clone() {
            let ptr = self.mem_alloc(size)?;
            globals.push((name, ptr, size));
        }
        let id = self.next_module;
        self.next_module += 1;
        self.live_modules += 1;
        self.loaded_images.push(image.to_vec());
        Ok(SimModule {
            id,
            image: image.to_vec(),
            globals,
            textures: Vec::new(),
        })
    }

    fn unload_module(&mut self, module: SimModule) -> ExploreResult<()> {
        for (_, ptr, _) in &module.globals {
            self.mem_free(*ptr)?;
        }
        self.live_modules -= 1;
        Ok(())
    }

    fn get_function(&mut self, _module: &SimModule, name: &str) -> ExploreResult<SimFunction> {
        if self.missing_symbols.iter().any(|s| s == name) {
            return Err(ExploreError::device(
                format!("cuModuleGetFunction({name})"),
                "CUDA_ERROR_NOT_FOUND",
            ));
        }
        let index = match self.functions.iter().position(|f| f == name) {
            Some(index) => index,
            None => {
                self.functions.push(name.to_string());
                self.functions.len() - 1
            }
        };
        Ok(SimFunction(index))
    }

    fn get_global(&mut self, module: &SimModule, name: &str) -> ExploreResult<(DevicePtr, usize)> {
        module
            .globals
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, ptr, size)| (*ptr, *size))
            .ok_or_else(|| {
                ExploreError::device(format!("cuModuleGetGlobal({name})"), "CUDA_ERROR_NOT_FOUND")
            })
    }

    fn bind_texture(
        &mut self,
        module: &mut SimModule,
        name: &str,
        binding: &TextureBinding,
    ) -> ExploreResult<()> {
        if self.missing_symbols.iter().any(|s| s == name) {
            return Err(ExploreError::device(
                format!("cuTexObjectCreate({name})"),
                "CUDA_ERROR_NOT_FOUND",
            ));
        }
        self.memory.read(binding.ptr, binding.size_bytes)?;
        module.textures.retain(|(n, _)| n != name);
        module.textures.push((name.to_string(), binding.clone()));
        Ok(())
    }

    fn launch(
        &mut self,
        function: SimFunction,
        grid: Dim3,
        block: Dim3,
        args: &KernelArgs,
    ) -> ExploreResult<()> {
        let name = self.function_name(function)?.to_string();
        let index = self.launches.len();
        if self.fail_launch_at == Some(index) {
            return Err(ExploreError::device("cuLaunchKernel", "CUDA_ERROR_LAUNCH_FAILED"));
        }
        if block.product() > self.properties.max_threads_per_block as u64
            || block.product() == 0
            || grid.product() == 0
        {
            return Err(ExploreError::device("cuLaunchKernel", "CUDA_ERROR_INVALID_VALUE"));
        }

        let mut launch = SimLaunch {
            function: name,
            grid,
            block,
            args: args.clone(),
            elapsed_ms: 0.0,
        };
        launch.elapsed_ms = (self.cost_model)(&launch).max(0.0);
        if let Some(behaviour) = self.kernels.get_mut(&launch.function) {
            behaviour(&mut self.memory, &launch)?;
        }
        self.clock_ms += launch.elapsed_ms as f64;
        self.launches.push(launch);
        Ok(())
    }

    fn synchronize(&mut self) -> ExploreResult<()> {
        Ok(())
    }

    fn event_create(&mut self) -> ExploreResult<SimEvent> {
        let id = self.next_event;
        if self.fail_event_at == Some(id) {
            return Err(ExploreError::device("cuEventCreate", "CUDA_ERROR_OUT_OF_MEMORY"));
        }
        self.next_event += 1;
        self.events.insert(id, None);
        Ok(SimEvent(id))
    }

    fn event_record(&mut self, event: &SimEvent) -> ExploreResult<()> {
        match self.events.get_mut(&event.0) {
            Some(slot) => {
                *slot = Some(self.clock_ms);
                Ok(())
            }
            None => Err(ExploreError::device("cuEventRecord", "CUDA_ERROR_INVALID_HANDLE")),
        }
    }

    fn event_synchronize(&mut self, event: &SimEvent) -> ExploreResult<()> {
        self.event_time(event, "cuEventSynchronize").map(|_| ())
    }

    fn event_elapsed_ms(&mut self, start: &SimEvent, end: &SimEvent) -> ExploreResult<f32> {
        let t0 = self.event_time(start, "cuEventElapsedTime")?;
        let t1 = self.event_time(end, "cuEventElapsedTime")?;
        Ok((t1 - t0) as f32)
    }

    fn event_destroy(&mut self, event: SimEvent) -> ExploreResult<()> {
        self.events
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| ExploreError::device("cuEventDestroy", "CUDA_ERROR_INVALID_HANDLE"))
    }
}

fn check_pitches(
    dst_pitch: usize,
    src_pitch: usize,
    width_bytes: usize,
    op: &str,
) -> ExploreResult<()> {
    if width_bytes > dst_pitch || width_bytes > src_pitch {
        return Err(ExploreError::device(op, "CUDA_ERROR_INVALID_VALUE"));
    }
    Ok(())
}
