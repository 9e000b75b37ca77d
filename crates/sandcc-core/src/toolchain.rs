//! Compile, link and run user code with the sandboxed toolchain.
//!
//! The orchestrator owns the engine, the memfs instance and a cache of
//! compiled tool modules. A run writes the user's files into memfs, runs the
//! compiler and the linker as guest processes, then runs the linked program.
//! A program that asks for frames stays installed as the current process until
//! the next run supersedes it.

use crate::assets::AssetSource;
use crate::config::ToolchainConfig;
use crate::process::{CurrentProcess, GuestProcess, SchedulingToken};
use crate::protocol::SourceFile;
use crate::tar;
use crate::vfs::{GuestVfs, HostIo};
use crate::{Result, SandccError};
use std::collections::HashMap;
use std::path::Path;
use wasmtime::{Engine, Module};

/// Source language, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    C,
    Cxx,
}

impl Dialect {
    #[must_use]
    pub fn from_filename(name: &str) -> Self {
        match Path::new(name).extension().and_then(|ext| ext.to_str()) {
            Some("cc" | "cpp" | "cxx" | "c++") => Self::Cxx,
            _ => Self::C,
        }
    }

    const fn language(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cxx => "c++",
        }
    }

    const fn driver(self) -> &'static str {
        match self {
            Self::C => "clang",
            Self::Cxx => "clang++",
        }
    }

    fn standard(self, config: &ToolchainConfig) -> &str {
        match self {
            Self::C => &config.c_standard,
            Self::Cxx => &config.cxx_standard,
        }
    }
}

/// File names and command lines for building one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub source: String,
    pub stem: String,
    pub dialect: Dialect,
    pub object: String,
    pub executable: String,
}

impl BuildPlan {
    #[must_use]
    pub fn new(source: &str) -> Self {
        let stem = Path::new(source)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .unwrap_or("a.out")
            .to_owned();
        Self {
            source: source.to_owned(),
            object: format!("{stem}.o"),
            executable: format!("{stem}.wasm"),
            dialect: Dialect::from_filename(source),
            stem,
        }
    }

    /// The command line a user would type for the same build.
    #[must_use]
    pub fn echo(&self, config: &ToolchainConfig) -> String {
        let werror = if config.warnings_as_errors { " -Werror" } else { "" };
        format!(
            "$ {} -O{}{werror} -std={} {} -o {}\n",
            self.dialect.driver(),
            config.optimization,
            self.dialect.standard(config),
            self.source,
            self.stem
        )
    }

    /// Compiler arguments after `argv[0]`.
    #[must_use]
    pub fn compile_args(&self, config: &ToolchainConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["-cc1".into(), "-emit-obj".into()];
        if self.dialect == Dialect::Cxx {
            args.extend(["-internal-isystem".into(), "/include/c++/v1".into()]);
        }
        args.extend(config.clang_args.iter().cloned());
        args.push(format!("-O{}", config.optimization));
        if config.warnings_as_errors {
            args.push("-Werror".into());
        }
        args.push(format!("-std={}", self.dialect.standard(config)));
        args.extend([
            "-o".into(),
            self.object.clone(),
            "-x".into(),
            self.dialect.language().into(),
            self.source.clone(),
        ]);
        args
    }

    /// Linker arguments after `argv[0]`.
    #[must_use]
    pub fn link_args(&self, config: &ToolchainConfig) -> Vec<String> {
        let libdir = &config.libdir;
        let mut args: Vec<String> = vec![
            "--no-threads".into(),
            "--export-dynamic".into(),
            "-z".into(),
            format!("stack-size={}", config.stack_size),
            format!("-L{libdir}"),
            format!("{libdir}/crt1.o"),
            self.object.clone(),
            "-lc".into(),
        ];
        if self.dialect == Dialect::Cxx {
            args.extend(["-lc++".into(), "-lc++abi".into()]);
        }
        args.extend(["-o".into(), self.executable.clone()]);
        args
    }
}

/// Compiled modules by asset name. Each asset is loaded and compiled once.
#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: HashMap<String, Module>,
}

impl ModuleCache {
    pub fn get_or_compile(&mut self, engine: &Engine, assets: &dyn AssetSource, name: &str) -> Result<Module> {
        if let Some(module) = self.modules.get(name) {
            tracing::debug!(module = name, "module cache hit");
            return Ok(module.clone());
        }
        let bytes = assets.load(name)?;
        let module = Module::new(engine, &bytes)
            .map_err(|e| SandccError::Wasm(format!("compiling {name}: {e:#}")))?;
        tracing::debug!(module = name, bytes = bytes.len(), "module compiled");
        self.modules.insert(name.to_owned(), module.clone());
        Ok(module)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Runs a closure when dropped, including during unwinding.
struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pub struct Toolchain {
    engine: Engine,
    config: ToolchainConfig,
    assets: Box<dyn AssetSource>,
    cache: ModuleCache,
    vfs: GuestVfs,
    ready: bool,
    current: CurrentProcess,
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("ready", &self.ready)
            .field("cache", &self.cache)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl Toolchain {
    /// Compile and instantiate memfs. Nothing else is loaded until
    /// [`Toolchain::ensure_ready`].
    pub fn new(config: ToolchainConfig, assets: Box<dyn AssetSource>, io: Box<dyn HostIo>) -> Result<Self> {
        let engine = Engine::default();
        let mut cache = ModuleCache::default();
        let memfs = cache.get_or_compile(&engine, assets.as_ref(), &config.memfs_module)?;
        let vfs = GuestVfs::new(&engine, &memfs, io)?;
        Ok(Self {
            engine,
            config,
            assets,
            cache,
            vfs,
            ready: false,
            current: CurrentProcess::default(),
        })
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub const fn vfs(&self) -> &GuestVfs {
        &self.vfs
    }

    #[must_use]
    pub const fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Extract the sysroot and compile the compiler and linker, once.
    pub fn ensure_ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let archive = self.assets.load(&self.config.sysroot_archive)?;
        let entries = tar::extract_into(&archive, &mut self.vfs)?;
        tracing::info!(entries, archive = %self.config.sysroot_archive, "sysroot extracted");

        for name in [&self.config.compiler_module, &self.config.linker_module] {
            self.cache.get_or_compile(&self.engine, self.assets.as_ref(), name)?;
        }
        self.ready = true;
        Ok(())
    }

    /// Build and run `active`, one of `files`.
    ///
    /// Any previously scheduled program is revoked first. `on_complete` runs
    /// exactly once however this returns. Returns the program's token if it
    /// asked for frames.
    pub fn run_user_code(
        &mut self,
        active: &str,
        files: &[SourceFile],
        on_complete: impl FnOnce(),
    ) -> Result<Option<SchedulingToken>> {
        let _complete = OnDrop(Some(on_complete));
        self.current.supersede();

        let outcome = self.build_and_run(active, files);
        if let Err(e) = &outcome {
            if !e.is_reported_by_guest() {
                self.vfs.write_output(&format!("\x1b[91mError: {e}\x1b[0m\n"));
            }
        }
        outcome
    }

    fn build_and_run(&mut self, active: &str, files: &[SourceFile]) -> Result<Option<SchedulingToken>> {
        self.ensure_ready()?;
        self.vfs.reset_stdin();

        let source = files
            .iter()
            .find(|file| file.name == active)
            .ok_or_else(|| SandccError::NotFound(active.to_owned()))?;
        let plan = BuildPlan::new(&source.name);
        self.vfs.write_output(&plan.echo(&self.config));

        for file in files {
            self.vfs.add_file(&file.name, file.content.as_bytes())?;
        }

        let compiler = self.config.compiler_module.clone();
        self.run_tool(&compiler, "clang", &plan.compile_args(&self.config))?;
        let linker = self.config.linker_module.clone();
        self.run_tool(&linker, "wasm-ld", &plan.link_args(&self.config))?;

        let binary = self.vfs.get_file_contents(&plan.executable)?;
        let module = Module::new(&self.engine, &binary)?;
        let mut process = GuestProcess::instantiate(
            &self.engine,
            &module,
            &self.vfs,
            &plan.stem,
            &[],
            &self.config.environment,
        )?;
        if process.run()? {
            tracing::debug!(program = %plan.stem, "program scheduled for frames");
            Ok(Some(self.current.install(process)))
        } else {
            Ok(None)
        }
    }

    fn run_tool(&mut self, module_name: &str, argv0: &str, args: &[String]) -> Result<()> {
        let module = self
            .cache
            .get_or_compile(&self.engine, self.assets.as_ref(), module_name)?;
        tracing::debug!(tool = argv0, ?args, "running tool");
        let mut process = GuestProcess::instantiate(
            &self.engine,
            &module,
            &self.vfs,
            argv0,
            args,
            &self.config.environment,
        )?;
        process.run()?;
        Ok(())
    }

    /// Tick the scheduled program. Returns whether it is still scheduled.
    pub fn frame(&mut self, timestamp_ms: f64) -> Result<bool> {
        let Some(process) = self.current.get_mut() else {
            return Ok(false);
        };
        let outcome = process.frame(&self.config.frame_export, timestamp_ms);
        if !matches!(outcome, Ok(true)) {
            self.current.supersede();
        }
        outcome
    }
}
