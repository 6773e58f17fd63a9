use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::DevicePtr;

/// Coarse classification of an [`ExploreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Non-success status from an allocate, copy, launch, synchronize or bind call.
    Device,
    /// The external compile step or the module load rejected the kernel.
    Compiler,
    /// Bad input: unsupported capability, unknown handle, invalid settings.
    Configuration,
}

#[derive(Debug, Error)]
pub enum ExploreError {
    #[error("{op} failed [{location}]: {message}")]
    Device {
        op: String,
        message: String,
        location: &'static Location<'static>,
    },
    #[error("compiling {source_path:?} failed (exit status {status:?}):\n{diagnostics}")]
    Compiler {
        source_path: PathBuf,
        status: Option<i32>,
        diagnostics: String,
    },
    #[error("module load failed: {message}\nerror log: {log}")]
    ModuleLoad { message: String, log: String },
    #[error("specified compute capability '{0}' is not supported")]
    UnsupportedCapability(u32),
    #[error("unknown device memory requested: {0}")]
    UnknownAllocation(DevicePtr),
    #[error("device memory {0} is already registered")]
    DuplicateAllocation(DevicePtr),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("config file error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExploreResult<T> = Result<T, ExploreError>;

impl ExploreError {
    /// Device error attributed to the caller's source location.
    #[track_caller]
    pub fn device(op: impl Into<String>, message: impl Into<String>) -> Self {
        ExploreError::Device {
            op: op.into(),
            message: message.into(),
            location: Location::caller(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExploreError::Device { .. } => ErrorKind::Device,
            ExploreError::Compiler { .. } | ExploreError::ModuleLoad { .. } => ErrorKind::Compiler,
            ExploreError::UnsupportedCapability(_)
            | ExploreError::UnknownAllocation(_)
            | ExploreError::DuplicateAllocation(_)
            | ExploreError::InvalidConfig(_)
            | ExploreError::Config(_)
            | ExploreError::Io(_) => ErrorKind::Configuration,
        }
    }

    /// Name of the device operation that failed, if this is a device error.
    pub fn op(&self) -> Option<&str> {
        match self {
            ExploreError::Device { op, .. } => Some(op),
            _ => None,
        }
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for ExploreError {
    #[track_caller]
    fn from(err: cudarc::driver::DriverError) -> Self {
        ExploreError::device("cuda driver", format!("{err:?}"))
    }
}
