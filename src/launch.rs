//! Kernel argument lists and the timed launch primitive.

use bytemuck::Pod;

use crate::device::{Device, DevicePtr, Dim3};
use crate::error::{ExploreError, ExploreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelArg {
    bytes: Vec<u8>,
    offset: usize,
}

/// Ordered kernel parameters. Each argument starts at an offset divisible by
/// its own size; padding is inserted as needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
    offset: usize,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        KernelArgs {
            args: Vec::with_capacity(capacity),
            offset: 0,
        }
    }

    pub fn push<T: Pod>(&mut self, value: &T) -> &mut Self {
        self.push_bytes(bytemuck::bytes_of(value))
    }

    pub fn push_ptr(&mut self, ptr: DevicePtr) -> &mut Self {
        self.push(&ptr.0)
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let size = bytes.len();
        if size > 0 && self.offset % size != 0 {
            self.offset = self.offset.div_ceil(size) * size;
        }
        log::trace!("kernel arg #{}: {size} bytes at offset {}", self.args.len(), self.offset);
        self.args.push(KernelArg {
            bytes: bytes.to_vec(),
            offset: self.offset,
        });
        self.offset += size;
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Byte offset of every argument in the parameter buffer.
    pub fn offsets(&self) -> Vec<usize> {
        self.args.iter().map(|a| a.offset).collect()
    }

    /// Size of the parameter buffer including padding.
    pub fn total_size(&self) -> usize {
        self.offset
    }

    /// Raw bytes of each argument, in order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().map(|a| a.bytes.as_slice())
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|a| a.bytes.as_slice())
    }

    /// Decode argument `index` as a `T`, if the sizes match.
    pub fn read<T: Pod>(&self, index: usize) -> Option<T> {
        self.get(index)
            .filter(|b| b.len() == std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }

    /// Parameter buffer with padding, as a driver would lay it out.
    pub fn packed(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.offset];
        for arg in &self.args {
            buffer[arg.offset..arg.offset + arg.bytes.len()].copy_from_slice(&arg.bytes);
        }
        buffer
    }
}

/// Accumulated device time of the launches of one trial.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingSession {
    pub total_ms: f32,
    pub last_ms: f32,
    pub launches: u32,
}

impl TimingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed_ms: f32) {
        self.total_ms += elapsed_ms;
        self.last_ms = elapsed_ms;
        self.launches += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Launch `function` once, wait for the device, and return the elapsed
/// device time in milliseconds.
///
/// The start marker is recorded right before the launch and the end marker
/// right after a full device synchronization, so the measurement never
/// includes work queued by earlier launches.
pub fn launch_timed<D: Device>(
    device: &mut D,
    function: D::Function,
    name: &str,
    grid: Dim3,
    block: Dim3,
    args: &KernelArgs,
    session: &mut TimingSession,
) -> ExploreResult<f32> {
    let start = device.event_create()?;
    let end = match device.event_create() {
        Ok(end) => end,
        Err(e) => {
            if let Err(destroy) = device.event_destroy(start) {
                log::warn!("destroying start event after failed create: {destroy}");
            }
            return Err(e);
        }
    };

    let timed = time_between(device, &start, &end, function, name, grid, block, args);

    let destroyed = device
        .event_destroy(start)
        .and_then(|_| device.event_destroy(end));
    let elapsed = timed?;
    destroyed?;

    session.record(elapsed);
    log::debug!(
        "kernel timing ({}: {}x{}): {elapsed} ms",
        block.product(),
        block.x,
        block.y
    );
    Ok(elapsed)
}

#[allow(clippy::too_many_arguments)]
fn time_between<D: Device>(
    device: &mut D,
    start: &D::Event,
    end: &D::Event,
    function: D::Function,
    name: &str,
    grid: Dim3,
    block: Dim3,
    args: &KernelArgs,
) -> ExploreResult<f32> {
    device.event_record(start)?;
    device
        .launch(function, grid, block, args)
        .map_err(|e| with_op(e, format!("launch({name})")))?;
    device
        .synchronize()
        .map_err(|e| with_op(e, format!("synchronize({name})")))?;
    device.event_record(end)?;
    device.event_synchronize(end)?;
    device.event_elapsed_ms(start, end)
}

/// Run [`launch_timed`] `iterations` times and return the minimum.
#[allow(clippy::too_many_arguments)]
pub fn launch_benchmark<D: Device>(
    device: &mut D,
    function: D::Function,
    name: &str,
    grid: Dim3,
    block: Dim3,
    args: &KernelArgs,
    iterations: usize,
) -> ExploreResult<f32> {
    if iterations == 0 {
        return Err(ExploreError::InvalidConfig(
            "benchmark needs at least one iteration".into(),
        ));
    }
    let mut session = TimingSession::new();
    let mut min_ms = f32::MAX;
    for _ in 0..iterations {
        let ms = launch_timed(device, function, name, grid, block, args, &mut session)?;
        min_ms = min_ms.min(ms);
    }
    log::debug!(
        "kernel timing benchmark ({}: {}x{}): {min_ms} ms",
        block.product(),
        block.x,
        block.y
    );
    Ok(min_ms)
}

/// Re-attribute a device error to the named kernel operation, keeping the
/// original location.
fn with_op(err: ExploreError, op: String) -> ExploreError {
    match err {
        ExploreError::Device {
            op: inner,
            message,
            location,
        } => ExploreError::Device {
            op,
            message: format!("{inner}: {message}"),
            location,
        },
        other => other,
    }
}
