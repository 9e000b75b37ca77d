//! The syscall surface guests may call.
//!
//! Only the handful of WASI functions the toolchain binaries need are served
//! here. File I/O is forwarded to memfs by the process loader, and anything
//! else resolves to a stub that fails with [`SyscallError::Unsupported`].

use crate::error::SyscallError;
use crate::memory::MemoryView;
use wasmtime::{AsContextMut, Caller, ExternType, Linker, Memory, Module};

/// Namespaces WASI imports may come from.
pub const WASI_MODULES: [&str; 2] = ["wasi_unstable", "wasi_snapshot_preview1"];

/// Functions served by [`Syscalls`] rather than forwarded to memfs.
pub const SHIM_FUNCTIONS: [&str; 8] = [
    "proc_exit",
    "environ_sizes_get",
    "environ_get",
    "args_sizes_get",
    "args_get",
    "random_get",
    "clock_time_get",
    "poll_oneoff",
];

pub mod errno {
    pub const SUCCESS: i32 = 0;
}

pub type SyscallResult<T> = std::result::Result<T, SyscallError>;

const NAMESPACE: &str = "wasi";

fn unsupported<T>(name: &str) -> SyscallResult<T> {
    Err(SyscallError::unsupported(NAMESPACE, name))
}

/// Host side of the guest syscalls. Every method defaults to failing with an
/// unsupported error naming the call, so implementors only write what they serve.
#[allow(unused_variables)]
pub trait Syscalls {
    fn proc_exit(&mut self, code: i32) -> SyscallResult<()> {
        Err(SyscallError::Exit(code))
    }

    fn environ_sizes_get(&mut self, mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        unsupported("environ_sizes_get")
    }

    fn environ_get(&mut self, mem: &mut MemoryView<'_>, environ: u32, environ_buf: u32) -> SyscallResult<()> {
        unsupported("environ_get")
    }

    fn args_sizes_get(&mut self, mem: &mut MemoryView<'_>, count_out: u32, size_out: u32) -> SyscallResult<()> {
        unsupported("args_sizes_get")
    }

    fn args_get(&mut self, mem: &mut MemoryView<'_>, argv: u32, argv_buf: u32) -> SyscallResult<()> {
        unsupported("args_get")
    }

    fn random_get(&mut self, mem: &mut MemoryView<'_>, buf: u32, len: u32) -> SyscallResult<()> {
        unsupported("random_get")
    }

    fn clock_time_get(
        &mut self,
        mem: &mut MemoryView<'_>,
        clock_id: i32,
        precision: u64,
        time_out: u32,
    ) -> SyscallResult<()> {
        unsupported("clock_time_get")
    }

    fn poll_oneoff(
        &mut self,
        mem: &mut MemoryView<'_>,
        subscriptions: u32,
        events: u32,
        nsubscriptions: u32,
        nevents_out: u32,
    ) -> SyscallResult<()> {
        unsupported("poll_oneoff")
    }
}

/// Access to the linear memory a store's guest exported.
pub trait GuestMemory {
    fn memory(&self) -> Option<Memory>;
}

fn with_memory<T, R>(
    caller: &mut Caller<'_, T>,
    f: impl FnOnce(&mut T, &mut MemoryView<'_>) -> SyscallResult<R>,
) -> wasmtime::Result<R>
where
    T: GuestMemory,
{
    let memory = caller.data().memory().ok_or(SyscallError::MissingMemory)?;
    let (bytes, state) = memory.data_and_store_mut(caller);
    let mut view = MemoryView::new(bytes);
    Ok(f(state, &mut view)?)
}

/// Define the shim functions under every WASI namespace.
pub fn add_to_linker<T>(linker: &mut Linker<T>) -> wasmtime::Result<()>
where
    T: Syscalls + GuestMemory + 'static,
{
    for module in WASI_MODULES {
        linker.func_wrap(module, "proc_exit", |mut caller: Caller<'_, T>, code: i32| -> wasmtime::Result<()> {
            caller.data_mut().proc_exit(code)?;
            Ok(())
        })?;

        linker.func_wrap(
            module,
            "environ_sizes_get",
            |mut caller: Caller<'_, T>, count_out: i32, size_out: i32| -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| {
                    state.environ_sizes_get(mem, count_out as u32, size_out as u32)
                })?;
                Ok(errno::SUCCESS)
            },
        )?;

        linker.func_wrap(
            module,
            "environ_get",
            |mut caller: Caller<'_, T>, environ: i32, environ_buf: i32| -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| {
                    state.environ_get(mem, environ as u32, environ_buf as u32)
                })?;
                Ok(errno::SUCCESS)
            },
        )?;

        linker.func_wrap(
            module,
            "args_sizes_get",
            |mut caller: Caller<'_, T>, count_out: i32, size_out: i32| -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| {
                    state.args_sizes_get(mem, count_out as u32, size_out as u32)
                })?;
                Ok(errno::SUCCESS)
            },
        )?;

        linker.func_wrap(
            module,
            "args_get",
            |mut caller: Caller<'_, T>, argv: i32, argv_buf: i32| -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| state.args_get(mem, argv as u32, argv_buf as u32))?;
                Ok(errno::SUCCESS)
            },
        )?;

        linker.func_wrap(
            module,
            "random_get",
            |mut caller: Caller<'_, T>, buf: i32, len: i32| -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| state.random_get(mem, buf as u32, len as u32))?;
                Ok(errno::SUCCESS)
            },
        )?;

        linker.func_wrap(
            module,
            "clock_time_get",
            |mut caller: Caller<'_, T>, clock_id: i32, precision: i64, time_out: i32| -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| {
                    state.clock_time_get(mem, clock_id, precision as u64, time_out as u32)
                })?;
                Ok(errno::SUCCESS)
            },
        )?;

        linker.func_wrap(
            module,
            "poll_oneoff",
            |mut caller: Caller<'_, T>,
             subscriptions: i32,
             events: i32,
             nsubscriptions: i32,
             nevents_out: i32|
             -> wasmtime::Result<i32> {
                with_memory(&mut caller, |state, mem| {
                    state.poll_oneoff(
                        mem,
                        subscriptions as u32,
                        events as u32,
                        nsubscriptions as u32,
                        nevents_out as u32,
                    )
                })?;
                Ok(errno::SUCCESS)
            },
        )?;
    }
    Ok(())
}

/// Define a failing stub for every function import of `module` the linker
/// cannot resolve yet. Instantiation then always succeeds, and the guest only
/// fails if it actually calls one.
pub fn stub_unresolved_imports<T: 'static>(
    linker: &mut Linker<T>,
    mut store: impl AsContextMut<Data = T>,
    module: &Module,
) -> wasmtime::Result<()> {
    for import in module.imports() {
        let ExternType::Func(ty) = import.ty() else {
            continue;
        };
        if linker
            .get(&mut store, import.module(), import.name())
            .is_some()
        {
            continue;
        }
        let (namespace, name) = (import.module().to_owned(), import.name().to_owned());
        linker.func_new(import.module(), import.name(), ty, move |_caller, _params, _results| {
            Err(SyscallError::unsupported(&namespace, &name).into())
        })?;
    }
    Ok(())
}
