//! Compile, load and bind one kernel variant.

use std::path::{Path, PathBuf};

use bytemuck::Pod;

use crate::compiler::{Capability, KernelCompiler, MacroDefines};
use crate::device::{Device, DevicePtr, TextureBinding, TextureFormat};
use crate::error::{ExploreError, ExploreResult};
use crate::registry::DeviceRegistry;

/// Host value copied into a module-scope constant before each trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantBinding {
    pub name: String,
    pub data: Vec<u8>,
}

impl ConstantBinding {
    pub fn new<T: Pod>(name: impl Into<String>, values: &[T]) -> Self {
        ConstantBinding {
            name: name.into(),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    pub fn scalar<T: Pod>(name: impl Into<String>, value: &T) -> Self {
        ConstantBinding {
            name: name.into(),
            data: bytemuck::bytes_of(value).to_vec(),
        }
    }
}

/// Texture symbol backed by a registered allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub name: String,
    pub format: TextureFormat,
    pub image: DevicePtr,
}

impl TextureDescriptor {
    pub fn new(name: impl Into<String>, format: TextureFormat, image: DevicePtr) -> Self {
        TextureDescriptor {
            name: name.into(),
            format,
            image,
        }
    }

    /// Geometry of the binding, recovered from the registry.
    pub fn binding(&self, registry: &DeviceRegistry) -> ExploreResult<TextureBinding> {
        let dims = registry.dims_of(self.image)?;
        let channel_bytes = self.format.channel_bytes();
        let channels = dims.elem_size / channel_bytes;
        if dims.elem_size % channel_bytes != 0 || !matches!(channels, 1 | 2 | 4) {
            return Err(ExploreError::InvalidConfig(format!(
                "texture {}: {}-byte pixels can't be read as {:?} channels",
                self.name, dims.elem_size, self.format
            )));
        }
        Ok(TextureBinding {
            ptr: self.image,
            format: self.format,
            channels: channels as u32,
            width: dims.width,
            height: dims.height,
            pitch_bytes: dims.pitch_bytes(),
            size_bytes: dims.size_bytes(),
        })
    }
}

/// A freshly loaded module with its resolved entry points.
pub struct LoadedKernel<D: Device> {
    module: D::Module,
    functions: Vec<(String, D::Function)>,
}

impl<D: Device> std::fmt::Debug for LoadedKernel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.functions.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("LoadedKernel").field("functions", &names).finish()
    }
}

impl<D: Device> LoadedKernel<D> {
    pub fn function(&self, name: &str) -> ExploreResult<D::Function> {
        self.functions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| *f)
            .ok_or_else(|| {
                ExploreError::InvalidConfig(format!("entry point {name} was not resolved"))
            })
    }

    /// The first entry point passed to [`RecompilationPipeline::build`].
    pub fn entry(&self) -> D::Function {
        self.functions[0].1
    }

    pub fn module(&self) -> &D::Module {
        &self.module
    }

    pub fn unload(self, device: &mut D) -> ExploreResult<()> {
        device.unload_module(self.module)
    }
}

/// Source file + target capability, rebuilt once per parameter set.
#[derive(Debug, Clone)]
pub struct RecompilationPipeline<C> {
    compiler: C,
    source: PathBuf,
    capability: Capability,
}

impl<C: KernelCompiler> RecompilationPipeline<C> {
    pub fn new(compiler: C, source: impl Into<PathBuf>, capability: Capability) -> Self {
        RecompilationPipeline {
            compiler,
            source: source.into(),
            capability,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    /// Compile with `defines`, load the image into a new module, resolve
    /// `entry_points`, then copy `constants` and bind `textures` into it.
    ///
    /// On failure after loading, the module is unloaded before returning.
    pub fn build<D: Device>(
        &self,
        device: &mut D,
        registry: &DeviceRegistry,
        entry_points: &[&str],
        defines: &MacroDefines,
        constants: &[ConstantBinding],
        textures: &[TextureDescriptor],
    ) -> ExploreResult<LoadedKernel<D>> {
        if entry_points.is_empty() {
            return Err(ExploreError::InvalidConfig("no kernel entry point given".into()));
        }

        let image = self.compiler.compile(&self.source, self.capability, defines)?;
        let mut module = device.load_module(&image, self.capability)?;
        log::info!(
            "loaded {} for {} ({} bytes) [{}]",
            self.source.display(),
            self.capability,
            image.len(),
            defines
        );

        match bind_module(device, &mut module, registry, entry_points, constants, textures) {
            Ok(functions) => Ok(LoadedKernel { module, functions }),
            Err(e) => {
                if let Err(unload) = device.unload_module(module) {
                    log::warn!("unloading module after failed bind: {unload}");
                }
                Err(e)
            }
        }
    }
}

fn bind_module<D: Device>(
    device: &mut D,
    module: &mut D::Module,
    registry: &DeviceRegistry,
    entry_points: &[&str],
    constants: &[ConstantBinding],
    textures: &[TextureDescriptor],
) -> ExploreResult<Vec<(String, D::Function)>> {
    let mut functions = Vec::with_capacity(entry_points.len());
    for &name in entry_points {
        let function = device.get_function(module, name)?;
        functions.push((name.to_string(), function));
    }

    for constant in constants {
        let (ptr, size) = device.get_global(module, &constant.name)?;
        if constant.data.len() > size {
            return Err(ExploreError::InvalidConfig(format!(
                "constant {} is {} bytes, the module declares {size}",
                constant.name,
                constant.data.len()
            )));
        }
        device.copy_htod(ptr, &constant.data)?;
        log::trace!("constant {}: {} bytes -> {ptr}", constant.name, constant.data.len());
    }

    for texture in textures {
        let binding = texture.binding(registry)?;
        device.bind_texture(module, &texture.name, &binding)?;
        log::trace!("texture {} bound to {}", texture.name, texture.image);
    }

    Ok(functions)
}
