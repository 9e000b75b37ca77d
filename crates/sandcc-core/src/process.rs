//! Guest processes: one instantiated guest module with its argv, environment
//! and syscall wiring.
//!
//! Guests run to completion on the calling thread. Frame-driven programs ask to
//! be scheduled again by exiting with [`KEEP_SCHEDULING_EXIT_CODE`]; the host
//! stops scheduling them by revoking their [`SchedulingToken`].

use crate::error::SyscallError;
use crate::memory::MemoryView;
use crate::vfs::GuestVfs;
use crate::wasi::{self, GuestMemory, SHIM_FUNCTIONS, SyscallResult, Syscalls, WASI_MODULES};
use crate::{Result, SandccError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wasmtime::{Caller, Engine, ExternType, Instance, Linker, Memory, Module, Store, Val};

/// Exit code a guest uses to say "keep calling my frame export".
pub const KEEP_SCHEDULING_EXIT_CODE: i32 = 0xC0C0A;

/// Permission for a process to receive further frames. Clones share the flag.
#[derive(Debug, Clone)]
pub struct SchedulingToken(Arc<AtomicBool>);

impl SchedulingToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for SchedulingToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Instantiated,
    Running,
    /// `_start` or the frame export returned normally.
    Completed,
    Trapped,
    Exited(i32),
}

/// argv and environment strings as the guest sees them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnv {
    pub argv: Vec<String>,
    pub environ: Vec<String>,
}

impl ProcessEnv {
    fn sizes(list: &[String], mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        let size: usize = list.iter().map(|s| s.len() + 1).sum();
        mem.write32(count_out, list.len() as u32)?;
        mem.write32(size_out, size as u32)?;
        Ok(())
    }

    fn strings(list: &[String], mem: &mut MemoryView<'_>, ptrs: u32, buf: u32) -> SyscallResult<()> {
        let mut cursor = buf;
        for (i, s) in list.iter().enumerate() {
            mem.write32(ptrs + 4 * i as u32, cursor)?;
            cursor += mem.write_string(cursor, s)?;
        }
        Ok(())
    }
}

impl Syscalls for ProcessEnv {
    fn environ_sizes_get(&mut self, mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        Self::sizes(&self.environ, mem, count_out, size_out)
    }

    fn environ_get(&mut self, mem: &mut MemoryView<'_>, environ: u32, environ_buf: u32) -> SyscallResult<()> {
        Self::strings(&self.environ, mem, environ, environ_buf)
    }

    fn args_sizes_get(&mut self, mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        Self::sizes(&self.argv, mem, count_out, size_out)
    }

    fn args_get(&mut self, mem: &mut MemoryView<'_>, argv: u32, argv_buf: u32) -> SyscallResult<()> {
        Self::strings(&self.argv, mem, argv, argv_buf)
    }

    fn random_get(&mut self, mem: &mut MemoryView<'_>, buf: u32, len: u32) -> SyscallResult<()> {
        getrandom::getrandom(mem.bytes_mut(buf, len as usize)?)
            .map_err(|e| SyscallError::Assertion(format!("random_get: {e}")))?;
        Ok(())
    }
}

struct ProcessState {
    env: ProcessEnv,
    vfs: GuestVfs,
    memory: Option<Memory>,
}

impl GuestMemory for ProcessState {
    fn memory(&self) -> Option<Memory> {
        self.memory
    }
}

impl Syscalls for ProcessState {
    fn environ_sizes_get(&mut self, mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        self.env.environ_sizes_get(mem, count_out, size_out)
    }

    fn environ_get(&mut self, mem: &mut MemoryView<'_>, environ: u32, environ_buf: u32) -> SyscallResult<()> {
        self.env.environ_get(mem, environ, environ_buf)
    }

    fn args_sizes_get(&mut self, mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        self.env.args_sizes_get(mem, count_out, size_out)
    }

    fn args_get(&mut self, mem: &mut MemoryView<'_>, argv: u32, argv_buf: u32) -> SyscallResult<()> {
        self.env.args_get(mem, argv, argv_buf)
    }

    fn random_get(&mut self, mem: &mut MemoryView<'_>, buf: u32, len: u32) -> SyscallResult<()> {
        self.env.random_get(mem, buf, len)
    }
}

/// A running (or finished) guest instance.
pub struct GuestProcess {
    name: String,
    store: Store<ProcessState>,
    instance: Instance,
    token: SchedulingToken,
    status: ProcessStatus,
    vfs: GuestVfs,
}

impl std::fmt::Debug for GuestProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestProcess")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("scheduled", &self.token.is_active())
            .finish_non_exhaustive()
    }
}

impl GuestProcess {
    /// Instantiate `module` as a process called `name`.
    ///
    /// `argv[0]` is `name`, followed by `args`. WASI imports outside the shim
    /// go to memfs when it exports them; any other import fails when called.
    pub fn instantiate(
        engine: &Engine,
        module: &Module,
        vfs: &GuestVfs,
        name: &str,
        args: &[String],
        environment: &[String],
    ) -> Result<Self> {
        let argv = std::iter::once(name.to_owned())
            .chain(args.iter().cloned())
            .collect();
        let mut store = Store::new(
            engine,
            ProcessState {
                env: ProcessEnv {
                    argv,
                    environ: environment.to_vec(),
                },
                vfs: vfs.clone(),
                memory: None,
            },
        );

        let mut linker = Linker::new(engine);
        wasi::add_to_linker(&mut linker)?;
        for import in module.imports() {
            let ExternType::Func(ty) = import.ty() else {
                continue;
            };
            let (namespace, function) = (import.module(), import.name());
            if !WASI_MODULES.contains(&namespace)
                || SHIM_FUNCTIONS.contains(&function)
                || !vfs.exports_function(function)
                || linker.get(&mut store, namespace, function).is_some()
            {
                continue;
            }
            let export = function.to_owned();
            linker.func_new(
                namespace,
                function,
                ty,
                move |mut caller: Caller<'_, ProcessState>, params: &[Val], results: &mut [Val]| {
                    let memory = caller.data().memory.ok_or(SyscallError::MissingMemory)?;
                    let (bytes, state) = memory.data_and_store_mut(&mut caller);
                    state.vfs.forward(&export, bytes, params, results)
                },
            )?;
        }
        wasi::stub_unresolved_imports(&mut linker, &mut store, module)?;

        let instance = linker.instantiate(&mut store, module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| SandccError::Wasm(format!("{name} does not export a linear memory")))?;
        store.data_mut().memory = Some(memory);
        tracing::debug!(process = name, "instantiated");

        Ok(Self {
            name: name.to_owned(),
            store,
            instance,
            token: SchedulingToken::new(),
            status: ProcessStatus::Instantiated,
            vfs: vfs.clone(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn status(&self) -> ProcessStatus {
        self.status
    }

    #[must_use]
    pub fn token(&self) -> SchedulingToken {
        self.token.clone()
    }

    /// A view of the guest's memory as it is now.
    pub fn memory(&mut self) -> Result<MemoryView<'_>> {
        let memory = self.store.data().memory.ok_or(SyscallError::MissingMemory)?;
        Ok(MemoryView::refresh(memory, &mut self.store))
    }

    /// Run `_start`. Returns whether the process wants further frames.
    pub fn run(&mut self) -> Result<bool> {
        self.status = ProcessStatus::Running;
        let outcome = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "_start")
            .and_then(|start| start.call(&mut self.store, ()));
        self.settle(outcome)
    }

    /// Deliver one frame. A revoked token or a missing export makes this a no-op.
    pub fn frame(&mut self, export: &str, timestamp_ms: f64) -> Result<bool> {
        if !self.token.is_active() {
            return Ok(false);
        }
        let Ok(func) = self.instance.get_typed_func::<f64, ()>(&mut self.store, export) else {
            tracing::debug!(process = %self.name, export, "no frame export, unscheduling");
            self.token.revoke();
            return Ok(false);
        };
        self.status = ProcessStatus::Running;
        let outcome = func.call(&mut self.store, timestamp_ms);
        self.settle(outcome)
    }

    fn settle(&mut self, outcome: wasmtime::Result<()>) -> Result<bool> {
        self.vfs.flush_output();
        let Err(err) = outcome else {
            self.status = ProcessStatus::Completed;
            return Ok(true);
        };
        match err.downcast_ref::<SyscallError>() {
            Some(SyscallError::Exit(KEEP_SCHEDULING_EXIT_CODE)) => {
                self.status = ProcessStatus::Exited(KEEP_SCHEDULING_EXIT_CODE);
                Ok(true)
            }
            Some(&SyscallError::Exit(code)) => {
                self.status = ProcessStatus::Exited(code);
                self.token.revoke();
                tracing::debug!(process = %self.name, code, "exited");
                if code == 0 {
                    Ok(false)
                } else {
                    Err(SandccError::Exited {
                        process: self.name.clone(),
                        code,
                    })
                }
            }
            _ => Err(self.trap(&err)),
        }
    }

    fn trap(&mut self, err: &wasmtime::Error) -> SandccError {
        self.status = ProcessStatus::Trapped;
        self.token.revoke();
        tracing::debug!(process = %self.name, error = ?err, "guest trapped");

        let cause = err.root_cause().to_string();
        let line = cause.lines().next().unwrap_or_default();
        self.vfs.write_output(&format!("\x1b[91mError: {line}\x1b[0m\n"));

        match err.downcast_ref::<SyscallError>() {
            Some(syscall) => SandccError::Syscall(syscall.clone()),
            None => SandccError::Trapped {
                process: self.name.clone(),
                message: line.to_owned(),
            },
        }
    }
}

/// The one process allowed to receive frames.
#[derive(Debug, Default)]
pub struct CurrentProcess {
    slot: Option<GuestProcess>,
}

impl CurrentProcess {
    /// Revoke and drop whatever process held the slot.
    pub fn supersede(&mut self) {
        if let Some(old) = self.slot.take() {
            old.token.revoke();
            tracing::debug!(process = %old.name, "superseded");
        }
    }

    pub fn install(&mut self, process: GuestProcess) -> SchedulingToken {
        self.supersede();
        let token = process.token();
        self.slot = Some(process);
        token
    }

    pub fn get_mut(&mut self) -> Option<&mut GuestProcess> {
        self.slot.as_mut()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}
