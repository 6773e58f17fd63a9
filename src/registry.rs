//! Device resource registry.
//!
//! Remembers the logical geometry of every live device allocation so that
//! later steps (strided copies, texture binding) can recover it from a raw
//! handle. The explorer keeps at most a handful of buffers alive, so lookup
//! is a linear scan.

use serde::{Deserialize, Serialize};

use crate::device::DevicePtr;
use crate::error::{ExploreError, ExploreResult};

/// Logical dimensions of one allocation. `width`, `height` and `stride` are
/// in elements; `alignment` is in bytes (0 = unaligned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocDims {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub alignment: usize,
    pub elem_size: usize,
}

impl AllocDims {
    /// Rows packed back to back (`stride == width`).
    pub fn packed(width: usize, height: usize, elem_size: usize) -> Self {
        AllocDims {
            width,
            height,
            stride: width,
            alignment: 0,
            elem_size,
        }
    }

    /// Rows padded so that each row starts on an `alignment`-byte boundary.
    pub fn aligned(
        width: usize,
        height: usize,
        elem_size: usize,
        alignment: usize,
    ) -> ExploreResult<Self> {
        if elem_size == 0 || alignment == 0 || alignment % elem_size != 0 {
            return Err(ExploreError::InvalidConfig(format!(
                "alignment {alignment} is not a positive multiple of element size {elem_size}"
            )));
        }
        let per_row = alignment / elem_size;
        Ok(AllocDims {
            width,
            height,
            stride: width.div_ceil(per_row) * per_row,
            alignment,
            elem_size,
        })
    }

    /// Bytes of payload per row.
    pub fn row_bytes(&self) -> usize {
        self.width * self.elem_size
    }

    /// Bytes between the starts of consecutive rows.
    pub fn pitch_bytes(&self) -> usize {
        self.stride * self.elem_size
    }

    /// Bytes of the whole allocation.
    pub fn size_bytes(&self) -> usize {
        self.pitch_bytes() * self.height
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: Vec<(DevicePtr, AllocDims)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: DevicePtr, dims: AllocDims) -> ExploreResult<()> {
        if self.contains(handle) {
            return Err(ExploreError::DuplicateAllocation(handle));
        }
        log::trace!("register {handle}: {dims:?}");
        self.entries.push((handle, dims));
        Ok(())
    }

    pub fn dims_of(&self, handle: DevicePtr) -> ExploreResult<AllocDims> {
        self.entries
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, dims)| *dims)
            .ok_or(ExploreError::UnknownAllocation(handle))
    }

    /// Forget `handle`, returning its geometry.
    pub fn release(&mut self, handle: DevicePtr) -> ExploreResult<AllocDims> {
        let index = self
            .entries
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(ExploreError::UnknownAllocation(handle))?;
        Ok(self.entries.remove(index).1)
    }

    pub fn contains(&self, handle: DevicePtr) -> bool {
        self.entries.iter().any(|(h, _)| *h == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DevicePtr, &AllocDims)> {
        self.entries.iter().map(|(h, d)| (*h, d))
    }
}
