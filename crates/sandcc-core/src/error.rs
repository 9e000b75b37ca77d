//! Error types for sandcc-core

use thiserror::Error;

/// Crate-level error.
#[derive(Error, Debug)]
pub enum SandccError {
    #[error("archive error: {0}")]
    Archive(String),

    #[error("unsupported archive entry '{path}' (type {kind:?})")]
    UnsupportedEntry { path: String, kind: char },

    #[error(transparent)]
    Syscall(#[from] SyscallError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("{process} trapped: {message}")]
    Trapped { process: String, message: String },

    #[error("{process} exited with code {code}")]
    Exited { process: String, code: i32 },

    #[error("no such file in guest filesystem: {0}")]
    NotFound(String),

    #[error("guest filesystem error: {0}")]
    Vfs(String),

    #[error("wasm runtime error: {0}")]
    Wasm(String),

    #[error("missing asset '{name}': {source}")]
    Asset {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl SandccError {
    /// Whether the guest already told the user about this failure, either with
    /// its own diagnostics or through the trap line.
    #[must_use]
    pub const fn is_reported_by_guest(&self) -> bool {
        matches!(self, Self::Syscall(_) | Self::Trapped { .. } | Self::Exited { .. })
    }
}

impl From<wasmtime::Error> for SandccError {
    fn from(err: wasmtime::Error) -> Self {
        Self::Wasm(format!("{err:#}"))
    }
}

/// Errors raised by host functions while a guest is running.
///
/// These travel through wasmtime as the error payload of a failed call and are
/// recovered with `downcast_ref` once the guest call returns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    /// The guest called `proc_exit`.
    #[error("process exited with code {0}")]
    Exit(i32),

    #[error("not implemented: {module}.{name}")]
    Unsupported { module: String, name: String },

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("aborted")]
    Aborted,

    #[error("guest does not export a linear memory")]
    MissingMemory,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl SyscallError {
    pub fn unsupported(module: &str, name: &str) -> Self {
        Self::Unsupported {
            module: module.to_owned(),
            name: name.to_owned(),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory access out of bounds: offset {offset} + {len} > size {size}")]
    OutOfBounds { offset: u64, len: usize, size: usize },
}
