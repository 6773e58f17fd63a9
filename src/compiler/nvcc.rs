//! External compiler invocation.
//!
//! Runs `nvcc -ptx` as a subprocess for one source file and one set of macro
//! definitions. The PTX lands next to the source (`<source>.ptx`) and is read
//! back NUL-terminated, ready for module loading.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::autotuning::config::CompilerConfig;
use crate::compiler::{Capability, KernelCompiler, MacroDefines};
use crate::error::{ExploreError, ExploreResult};

/// Compiler flags applied to every build unless overridden.
pub const DEFAULT_FLAGS: &[&str] = &["-ftz=true", "-prec-sqrt=false", "-prec-div=false"];

#[derive(Debug, Clone)]
pub struct NvccCompiler {
    program: PathBuf,
    flags: Vec<String>,
    include_dirs: Vec<PathBuf>,
}

impl Default for NvccCompiler {
    fn default() -> Self {
        NvccCompiler {
            program: PathBuf::from("nvcc"),
            flags: DEFAULT_FLAGS.iter().map(|f| f.to_string()).collect(),
            include_dirs: Vec::new(),
        }
    }
}

impl NvccCompiler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        NvccCompiler {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        NvccCompiler {
            program: config.program.clone(),
            flags: config.flags.clone(),
            include_dirs: config.include_dirs.clone(),
        }
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Where the compiled PTX for `source` is written.
    pub fn output_path(source: &Path) -> PathBuf {
        let mut path: OsString = source.as_os_str().to_owned();
        path.push(".ptx");
        PathBuf::from(path)
    }

    /// Full argument list for one compile.
    pub fn command_args(
        &self,
        source: &Path,
        capability: Capability,
        defines: &MacroDefines,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-ptx".into(), capability.gencode_flag().into()];
        args.extend(self.flags.iter().map(OsString::from));
        for dir in &self.include_dirs {
            let mut flag = OsString::from("-I");
            flag.push(dir);
            args.push(flag);
        }
        args.extend(defines.to_flags().into_iter().map(OsString::from));
        args.push(source.as_os_str().to_owned());
        args.push("-o".into());
        args.push(Self::output_path(source).into_os_string());
        args
    }
}

impl KernelCompiler for NvccCompiler {
    fn compile(
        &self,
        source: &Path,
        capability: Capability,
        defines: &MacroDefines,
    ) -> ExploreResult<Vec<u8>> {
        let args = self.command_args(source, capability, defines);
        log::debug!(
            "compiling {} for {} with [{}]",
            source.display(),
            capability,
            defines
        );

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| ExploreError::Compiler {
                source_path: source.to_path_buf(),
                status: None,
                diagnostics: format!("failed to run {}: {e}", self.program.display()),
            })?;

        let mut diagnostics = String::from_utf8_lossy(&output.stdout).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&output.stderr));
        for line in diagnostics.lines().filter(|l| !l.trim().is_empty()) {
            log::warn!("{}: {line}", self.program.display());
        }

        if !output.status.success() {
            return Err(ExploreError::Compiler {
                source_path: source.to_path_buf(),
                status: output.status.code(),
                diagnostics,
            });
        }

        let ptx_path = Self::output_path(source);
        let mut image = std::fs::read(&ptx_path).map_err(|e| ExploreError::Compiler {
            source_path: source.to_path_buf(),
            status: output.status.code(),
            diagnostics: format!("can't open PTX file {}: {e}", ptx_path.display()),
        })?;
        // Module loading expects a NUL-terminated PTX string.
        if image.last() != Some(&0) {
            image.push(0);
        }
        Ok(image)
    }
}
