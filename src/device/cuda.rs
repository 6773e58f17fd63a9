//! CUDA driver-API device (feature `cuda`).
//!
//! Runs on the primary context of one device and uses the default stream
//! only. Texture bindings are texture objects whose handles are written into
//! the module-scope global of the same name.

use std::ffi::{c_void, CString};
use std::ptr;

use cudarc::driver::{result, sys, DriverError};

use crate::compiler::Capability;
use crate::device::{Device, DevicePtr, DeviceProperties, Dim3, TextureBinding, TextureFormat};
use crate::error::{ExploreError, ExploreResult};
use crate::launch::KernelArgs;

const JIT_LOG_SIZE: usize = 10240;

trait DriverContext<T> {
    fn op(self, name: &str) -> ExploreResult<T>;
}

impl<T> DriverContext<T> for Result<T, DriverError> {
    #[track_caller]
    fn op(self, name: &str) -> ExploreResult<T> {
        match self {
            Ok(value) => Ok(value),
            Err(e) => Err(ExploreError::device(name, e.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct CudaModule {
    raw: sys::CUmodule,
    textures: Vec<(String, sys::CUtexObject)>,
}

#[derive(Debug, Clone, Copy)]
pub struct CudaFunction(sys::CUfunction);

#[derive(Debug)]
pub struct CudaEvent(sys::CUevent);

#[derive(Debug)]
pub struct CudaDriver {
    device: sys::CUdevice,
    properties: DeviceProperties,
}

impl CudaDriver {
    /// Bind the primary context of device `ordinal` to the calling thread.
    ///
    /// Disables the driver's JIT cache for the process so that every
    /// candidate module is JIT-compiled from its own PTX.
    pub fn new(ordinal: usize) -> ExploreResult<Self> {
        std::env::set_var("CUDA_CACHE_DISABLE", "1");

        result::init().op("cuInit")?;
        let device = result::device::get(ordinal as i32).op("cuDeviceGet")?;
        let attr = |attrib: sys::CUdevice_attribute| unsafe {
            result::device::get_attribute(device, attrib)
        };
        let major = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .op("cuDeviceGetAttribute")?;
        let minor = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .op("cuDeviceGetAttribute")?;
        let warp_size = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE)
            .op("cuDeviceGetAttribute")?;
        let max_threads = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .op("cuDeviceGetAttribute")?;
        let max_smem =
            attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)
                .op("cuDeviceGetAttribute")?;
        let name = result::device::get_name(device).op("cuDeviceGetName")?;

        let properties = DeviceProperties {
            name,
            warp_size: warp_size as u32,
            max_threads_per_block: max_threads as u32,
            max_shared_mem_per_block: max_smem as usize,
            capability: Capability::from_compute_capability(major, minor)?,
        };

        unsafe {
            let ctx = result::primary_ctx::retain(device).op("cuDevicePrimaryCtxRetain")?;
            result::ctx::set_current(ctx).op("cuCtxSetCurrent")?;
        }
        log::info!(
            "CUDA device {ordinal}: {} ({}, warp {}, {} threads/block, {} bytes smem/block)",
            properties.name,
            properties.capability,
            properties.warp_size,
            properties.max_threads_per_block,
            properties.max_shared_mem_per_block
        );
        Ok(CudaDriver { device, properties })
    }

    fn copy_2d(
        &mut self,
        op: &str,
        mut copy: sys::CUDA_MEMCPY2D,
        width_bytes: usize,
        height: usize,
    ) -> ExploreResult<()> {
        copy.WidthInBytes = width_bytes;
        copy.Height = height;
        unsafe { sys::cuMemcpy2D_v2(&copy).result() }.op(op)
    }

    fn global(&self, module: &CudaModule, name: &str) -> ExploreResult<(DevicePtr, usize)> {
        let symbol = symbol(name)?;
        let mut ptr: sys::CUdeviceptr = 0;
        let mut bytes: usize = 0;
        let status =
            unsafe { sys::cuModuleGetGlobal_v2(&mut ptr, &mut bytes, module.raw, symbol.as_ptr()) };
        status.result().op(&format!("cuModuleGetGlobal({name})"))?;
        Ok((DevicePtr(ptr), bytes))
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if let Err(e) = unsafe { result::primary_ctx::release(self.device) } {
            log::warn!("releasing primary context: {e}");
        }
    }
}

fn symbol(name: &str) -> ExploreResult<CString> {
    CString::new(name)
        .map_err(|_| ExploreError::InvalidConfig(format!("invalid symbol name: {name}")))
}

fn array_format(format: TextureFormat) -> sys::CUarray_format {
    use sys::CUarray_format::*;
    match format {
        TextureFormat::U8 => CU_AD_FORMAT_UNSIGNED_INT8,
        TextureFormat::U16 => CU_AD_FORMAT_UNSIGNED_INT16,
        TextureFormat::U32 => CU_AD_FORMAT_UNSIGNED_INT32,
        TextureFormat::I8 => CU_AD_FORMAT_SIGNED_INT8,
        TextureFormat::I16 => CU_AD_FORMAT_SIGNED_INT16,
        TextureFormat::I32 => CU_AD_FORMAT_SIGNED_INT32,
        TextureFormat::F16 => CU_AD_FORMAT_HALF,
        TextureFormat::F32 => CU_AD_FORMAT_FLOAT,
    }
}

impl Device for CudaDriver {
    type Module = CudaModule;
    type Function = CudaFunction;
    type Event = CudaEvent;

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn mem_alloc(&mut self, bytes: usize) -> ExploreResult<DevicePtr> {
        let ptr = unsafe { result::malloc_sync(bytes) }.op("cuMemAlloc")?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free(&mut self, ptr: DevicePtr) -> ExploreResult<()> {
        unsafe { result::free_sync(ptr.0) }.op("cuMemFree")
    }

    fn copy_htod(&mut self, dst: DevicePtr, src: &[u8]) -> ExploreResult<()> {
        unsafe { result::memcpy_htod_sync(dst.0, src) }.op("cuMemcpyHtoD")
    }

    fn copy_dtoh(&mut self, dst: &mut [u8], src: DevicePtr) -> ExploreResult<()> {
        unsafe { result::memcpy_dtoh_sync(dst, src.0) }.op("cuMemcpyDtoH")
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
        if height > 0 && src.len() < src_pitch * (height - 1) + width_bytes {
            return Err(ExploreError::device("cuMemcpy2D", "host buffer shorter than copy extent"));
        }
        let mut copy: sys::CUDA_MEMCPY2D = unsafe { std::mem::zeroed() };
        copy.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
        copy.srcHost = src.as_ptr() as *const c_void;
        copy.srcPitch = src_pitch;
        copy.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_DEVICE;
        copy.dstDevice = dst.0;
        copy.dstPitch = dst_pitch;
        self.copy_2d("cuMemcpy2D", copy, width_bytes, height)
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
        if height > 0 && dst.len() < dst_pitch * (height - 1) + width_bytes {
            return Err(ExploreError::device("cuMemcpy2D", "host buffer shorter than copy extent"));
        }
        let mut copy: sys::CUDA_MEMCPY2D = unsafe { std::mem::zeroed() };
        copy.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_DEVICE;
        copy.srcDevice = src.0;
        copy.srcPitch = src_pitch;
        copy.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
        copy.dstHost = dst.as_mut_ptr() as *mut c_void;
        copy.dstPitch = dst_pitch;
        self.copy_2d("cuMemcpy2D", copy, width_bytes, height)
    }

    fn load_module(&mut self, image: &[u8], target: Capability) -> ExploreResult<CudaModule> {
        let mut log = vec![0u8; JIT_LOG_SIZE];
        let mut options = [
            sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER,
            sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
            sys::CUjit_option::CU_JIT_TARGET,
        ];
        let mut values = [
            log.as_mut_ptr() as *mut c_void,
            JIT_LOG_SIZE as *mut c_void,
            target.jit_target() as usize as *mut c_void,
        ];
        let mut raw: sys::CUmodule = ptr::null_mut();
        let loaded = unsafe {
            sys::cuModuleLoadDataEx(
                &mut raw,
                image.as_ptr() as *const c_void,
                options.len() as u32,
                options.as_mut_ptr(),
                values.as_mut_ptr(),
            )
            .result()
        };
        if let Err(e) = loaded {
            let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
            return Err(ExploreError::ModuleLoad {
                message: format!("cuModuleLoadDataEx({target}): {e}"),
                log: String::from_utf8_lossy(&log[..end]).into_owned(),
            });
        }
        Ok(CudaModule {
            raw,
            textures: Vec::new(),
        })
    }

    fn unload_module(&mut self, module: CudaModule) -> ExploreResult<()> {
        for (name, tex) in &module.textures {
            unsafe { sys::cuTexObjectDestroy(*tex).result() }
                .op(&format!("cuTexObjectDestroy({name})"))?;
        }
        unsafe { result::module::unload(module.raw) }.op("cuModuleUnload")
    }

    fn get_function(&mut self, module: &CudaModule, name: &str) -> ExploreResult<CudaFunction> {
        let function = unsafe { result::module::get_function(module.raw, symbol(name)?) }
            .op(&format!("cuModuleGetFunction({name})"))?;
        Ok(CudaFunction(function))
    }

    fn get_global(&mut self, module: &CudaModule, name: &str) -> ExploreResult<(DevicePtr, usize)> {
        self.global(module, name)
    }

    fn bind_texture(
        &mut self,
        module: &mut CudaModule,
        name: &str,
        binding: &TextureBinding,
    ) -> ExploreResult<()> {
        let (slot, slot_bytes) = self.global(module, name)?;
        if slot_bytes != std::mem::size_of::<sys::CUtexObject>() {
            return Err(ExploreError::InvalidConfig(format!(
                "texture symbol {name} is {slot_bytes} bytes, expected a texture object"
            )));
        }

        let mut tex: sys::CUtexObject = 0;
        unsafe {
            let mut res: sys::CUDA_RESOURCE_DESC = std::mem::zeroed();
            res.resType = sys::CUresourcetype::CU_RESOURCE_TYPE_LINEAR;
            res.res.linear.devPtr = binding.ptr.0;
            res.res.linear.format = array_format(binding.format);
            res.res.linear.numChannels = binding.channels;
            res.res.linear.sizeInBytes = binding.size_bytes;

            let mut desc: sys::CUDA_TEXTURE_DESC = std::mem::zeroed();
            desc.flags = sys::CU_TRSF_READ_AS_INTEGER;

            sys::cuTexObjectCreate(&mut tex, &res, &desc, ptr::null())
                .result()
                .op(&format!("cuTexObjectCreate({name})"))?;
        }
        module.textures.push((name.to_string(), tex));
        self.copy_htod(slot, bytemuck::bytes_of(&tex))
    }

    fn launch(
        &mut self,
        function: CudaFunction,
        grid: Dim3,
        block: Dim3,
        args: &KernelArgs,
    ) -> ExploreResult<()> {
        let mut storage: Vec<Vec<u8>> = args.iter().map(<[u8]>::to_vec).collect();
        let mut params: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|arg| arg.as_mut_ptr() as *mut c_void)
            .collect();
        unsafe {
            result::launch_kernel(
                function.0,
                grid.as_tuple(),
                block.as_tuple(),
                0,
                ptr::null_mut(),
                &mut params,
            )
        }
        .op("cuLaunchKernel")
    }

    fn synchronize(&mut self) -> ExploreResult<()> {
        result::ctx::synchronize().op("cuCtxSynchronize")
    }

    fn event_create(&mut self) -> ExploreResult<CudaEvent> {
        let event = result::event::create(sys::CUevent_flags::CU_EVENT_DEFAULT)
            .op("cuEventCreate")?;
        Ok(CudaEvent(event))
    }

    fn event_record(&mut self, event: &CudaEvent) -> ExploreResult<()> {
        unsafe { result::event::record(event.0, ptr::null_mut()) }.op("cuEventRecord")
    }

    fn event_synchronize(&mut self, event: &CudaEvent) -> ExploreResult<()> {
        unsafe { sys::cuEventSynchronize(event.0).result() }.op("cuEventSynchronize")
    }

    fn event_elapsed_ms(&mut self, start: &CudaEvent, end: &CudaEvent) -> ExploreResult<f32> {
        unsafe { result::event::elapsed(start.0, end.0) }.op("cuEventElapsedTime")
    }

    fn event_destroy(&mut self, event: CudaEvent) -> ExploreResult<()> {
        unsafe { result::event::destroy(event.0) }.op("cuEventDestroy")
    }
}
