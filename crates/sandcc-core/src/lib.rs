//! # sandcc-core
//!
//! Sandboxed C/C++ toolchain engine built on WebAssembly guests.
//!
//! This crate provides:
//! - Bounds-checked views over guest linear memory
//! - A ustar reader for unpacking the sysroot into the guest filesystem
//! - A bridge to the `memfs` guest that owns the file tree
//! - Guest processes with a small WASI syscall shim
//! - The compile/link/run orchestrator and a worker thread that serves it
//! - A message protocol and framed transport for out-of-process hosts

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod assets;
pub mod config;
pub mod error;
pub mod input;
pub mod memory;
pub mod pipe;
pub mod process;
pub mod protocol;
pub mod tar;
pub mod toolchain;
pub mod vfs;
pub mod wasi;
pub mod worker;

pub use assets::{AssetSource, DirectoryAssets, MemoryAssets};
pub use config::ToolchainConfig;
pub use error::{MemoryError, SandccError, SyscallError};
pub use memory::MemoryView;
pub use process::{GuestProcess, SchedulingToken, KEEP_SCHEDULING_EXIT_CODE};
pub use protocol::{Request, Response, SourceFile};
pub use toolchain::Toolchain;
pub use vfs::{BufferedIo, GuestVfs, HostIo};
pub use worker::{WorkerHandle, WorkerState};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SandccError>;
