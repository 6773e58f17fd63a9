//! Recompilation of tile-parameterized kernels.
//!
//! Tile shape and halo extents are compile-time constants of the kernel
//! body, so every candidate configuration needs its own compile:
//!
//! ```text
//! MacroDefines  -- BSX_EXPLORE=32, BSY_EXPLORE=4, ...
//! nvcc          -- external compiler subprocess, source -> PTX
//! pipeline      -- compile, load module, resolve entry points, bind
//!                  constants and textures
//! ```

pub mod nvcc;
pub mod pipeline;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExploreError, ExploreResult};

pub use nvcc::NvccCompiler;
pub use pipeline::{ConstantBinding, LoadedKernel, RecompilationPipeline, TextureDescriptor};

/// Target SM architectures the compile step knows how to select.
/// Listed in ascending order.
pub const SUPPORTED_SM_VERSIONS: &[u32] = &[61, 75, 80, 86, 89, 90, 100, 120];

/// Compute capability of the compile/JIT target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum Capability {
    Sm61 = 61,
    Sm75 = 75,
    Sm80 = 80,
    Sm86 = 86,
    Sm89 = 89,
    Sm90 = 90,
    Sm100 = 100,
    Sm120 = 120,
}

impl Capability {
    /// Parse a numeric capability such as `86`.
    pub fn from_cc(cc: u32) -> ExploreResult<Self> {
        match cc {
            61 => Ok(Capability::Sm61),
            75 => Ok(Capability::Sm75),
            80 => Ok(Capability::Sm80),
            86 => Ok(Capability::Sm86),
            89 => Ok(Capability::Sm89),
            90 => Ok(Capability::Sm90),
            100 => Ok(Capability::Sm100),
            120 => Ok(Capability::Sm120),
            other => Err(ExploreError::UnsupportedCapability(other)),
        }
    }

    pub fn from_compute_capability(major: i32, minor: i32) -> ExploreResult<Self> {
        if major < 0 || minor < 0 {
            return Err(ExploreError::UnsupportedCapability(0));
        }
        Self::from_cc((major * 10 + minor) as u32)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Sm61 => "sm_61",
            Capability::Sm75 => "sm_75",
            Capability::Sm80 => "sm_80",
            Capability::Sm86 => "sm_86",
            Capability::Sm89 => "sm_89",
            Capability::Sm90 => "sm_90",
            Capability::Sm100 => "sm_100",
            Capability::Sm120 => "sm_120",
        }
    }

    /// `-gencode` selector passed to the compiler.
    pub fn gencode_flag(self) -> String {
        let cc = self.as_u32();
        format!("-gencode=arch=compute_{cc},code=[sm_{cc},compute_{cc}]")
    }

    /// JIT target value for module loading (`CU_TARGET_COMPUTE_<cc>`).
    pub fn jit_target(self) -> u32 {
        self.as_u32()
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered preprocessor definitions injected into one compile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDefines {
    defines: Vec<(String, String)>,
}

impl MacroDefines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing an earlier definition of the same name.
    pub fn define(&mut self, name: &str, value: impl std::fmt::Display) -> &mut Self {
        let value = value.to_string();
        match self.defines.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.defines.push((name.to_string(), value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.defines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defines.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Command-line form: `["-D", "NAME=VALUE", ...]`.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::with_capacity(self.defines.len() * 2);
        for (name, value) in &self.defines {
            flags.push("-D".to_string());
            flags.push(format!("{name}={value}"));
        }
        flags
    }
}

impl std::fmt::Display for MacroDefines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (name, value)) in self.defines.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// Produces a loadable device image for one parameter set.
pub trait KernelCompiler {
    fn compile(
        &self,
        source: &Path,
        capability: Capability,
        defines: &MacroDefines,
    ) -> ExploreResult<Vec<u8>>;
}

impl<C: KernelCompiler + ?Sized> KernelCompiler for &C {
    fn compile(
        &self,
        source: &Path,
        capability: Capability,
        defines: &MacroDefines,
    ) -> ExploreResult<Vec<u8>> {
        (**self).compile(source, capability, defines)
    }
}
