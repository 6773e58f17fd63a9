//! Registered device buffers.
//!
//! Thin helpers over [`Device`] that keep the [`DeviceRegistry`] in step with
//! every allocation, and pick a contiguous or strided copy from the
//! registered geometry.

use bytemuck::Pod;

use crate::device::{Device, DevicePtr};
use crate::error::{ExploreError, ExploreResult};
use crate::registry::{AllocDims, DeviceRegistry};

/// Allocate a `width` x `height` buffer of `elem_size`-byte elements.
/// With `alignment`, every row starts on an `alignment`-byte boundary.
pub fn create_memory<D: Device>(
    device: &mut D,
    registry: &mut DeviceRegistry,
    width: usize,
    height: usize,
    elem_size: usize,
    alignment: Option<usize>,
) -> ExploreResult<(DevicePtr, AllocDims)> {
    let dims = match alignment {
        Some(alignment) => AllocDims::aligned(width, height, elem_size, alignment)?,
        None => AllocDims::packed(width, height, elem_size),
    };
    let ptr = device.mem_alloc(dims.size_bytes())?;
    if let Err(e) = registry.register(ptr, dims) {
        if let Err(free) = device.mem_free(ptr) {
            log::warn!("freeing {ptr} after failed registration: {free}");
        }
        return Err(e);
    }
    log::debug!(
        "allocated {ptr}: {}x{} stride {} ({} bytes)",
        dims.width,
        dims.height,
        dims.stride,
        dims.size_bytes()
    );
    Ok((ptr, dims))
}

fn checked_dims<T: Pod>(
    registry: &DeviceRegistry,
    ptr: DevicePtr,
    host_len: usize,
) -> ExploreResult<AllocDims> {
    let dims = registry.dims_of(ptr)?;
    if std::mem::size_of::<T>() != dims.elem_size {
        return Err(ExploreError::InvalidConfig(format!(
            "host element is {} bytes, {ptr} holds {}-byte elements",
            std::mem::size_of::<T>(),
            dims.elem_size
        )));
    }
    if host_len != dims.width * dims.height {
        return Err(ExploreError::InvalidConfig(format!(
            "host buffer has {host_len} elements, {ptr} is {}x{}",
            dims.width, dims.height
        )));
    }
    Ok(dims)
}

/// Copy a packed `width * height` host image into `ptr`.
pub fn write_memory<D: Device, T: Pod>(
    device: &mut D,
    registry: &DeviceRegistry,
    ptr: DevicePtr,
    host: &[T],
) -> ExploreResult<()> {
    let dims = checked_dims::<T>(registry, ptr, host.len())?;
    let bytes: &[u8] = bytemuck::cast_slice(host);
    if dims.stride == dims.width {
        device.copy_htod(ptr, bytes)
    } else {
        device.copy_htod_2d(
            ptr,
            dims.pitch_bytes(),
            bytes,
            dims.row_bytes(),
            dims.row_bytes(),
            dims.height,
        )
    }
}

/// Copy the contents of `ptr` into a packed `width * height` host image.
pub fn read_memory<D: Device, T: Pod>(
    device: &mut D,
    registry: &DeviceRegistry,
    ptr: DevicePtr,
    host: &mut [T],
) -> ExploreResult<()> {
    let dims = checked_dims::<T>(registry, ptr, host.len())?;
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(host);
    if dims.stride == dims.width {
        device.copy_dtoh(bytes, ptr)
    } else {
        device.copy_dtoh_2d(
            bytes,
            dims.row_bytes(),
            ptr,
            dims.pitch_bytes(),
            dims.row_bytes(),
            dims.height,
        )
    }
}

pub fn release_memory<D: Device>(
    device: &mut D,
    registry: &mut DeviceRegistry,
    ptr: DevicePtr,
) -> ExploreResult<()> {
    registry.release(ptr)?;
    device.mem_free(ptr)
}
