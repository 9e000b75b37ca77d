//! Bridge to the `memfs` guest module, which owns the toolchain's file tree.
//!
//! The engine never keeps file bytes itself. Every operation writes a path into
//! the buffer memfs exports, calls the matching export with the path length,
//! and reads results back out of memfs memory.
//!
//! memfs also implements the WASI file syscalls for the other guests. When a
//! guest calls one of them, [`GuestVfs::forward`] lends the guest's memory to
//! memfs for the duration of the call so memfs can reach the guest's buffers
//! through its `host_write`, `host_read`, `copy_in` and `copy_out` imports.

use crate::error::SyscallError;
use crate::input::StdinBuffer;
use crate::memory::MemoryView;
use crate::tar::VfsSink;
use crate::wasi::{self, errno};
use crate::{Result, SandccError};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wasmtime::{Caller, Engine, Func, Linker, Memory, Module, Store, Val};

/// Longest path (in bytes, without terminator) the memfs path buffer takes.
pub const PATH_BUFFER_CAPACITY: usize = 1024;

/// Where guest standard streams end up.
pub trait HostIo: Send {
    /// Append text to the host's terminal.
    fn write_output(&mut self, text: &str);

    /// Block until the host supplies stdin bytes. Empty means end of input.
    fn request_input(&mut self) -> Vec<u8>;
}

/// `HostIo` that collects output in memory and serves a fixed queue of input
/// chunks. Clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferedIo {
    output: Arc<Mutex<String>>,
    input: Arc<Mutex<VecDeque<Vec<u8>>>>,
    requests: Arc<AtomicUsize>,
}

impl BufferedIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_input<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let io = Self::new();
        io.input.lock().extend(chunks.into_iter().map(Into::into));
        io
    }

    #[must_use]
    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    /// How many times a guest blocked for input.
    #[must_use]
    pub fn input_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl HostIo for BufferedIo {
    fn write_output(&mut self, text: &str) {
        self.output.lock().push_str(text);
    }

    fn request_input(&mut self) -> Vec<u8> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.input.lock().pop_front().unwrap_or_default()
    }
}

/// Handle to a memfs node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inode(NonZeroU32);

impl Inode {
    fn from_raw(raw: i32) -> Option<Self> {
        NonZeroU32::new(raw as u32).map(Self)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    const fn raw(self) -> i32 {
        self.0.get() as i32
    }
}

/// A guest's memory, lent to memfs while it serves one forwarded syscall.
struct HostLease {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostLease {
    fn new(bytes: &mut [u8]) -> Self {
        let len = bytes.len();
        Self {
            ptr: NonNull::from(bytes).cast(),
            len,
        }
    }

    fn view(&mut self) -> MemoryView<'_> {
        // SAFETY: a lease only exists inside `GuestVfs::forward`, which holds the
        // exclusive borrow of these bytes for the whole memfs call and clears the
        // lease before returning. The guest cannot run (or grow its memory) while
        // memfs is executing.
        #[allow(unsafe_code)]
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        MemoryView::new(bytes)
    }
}

/// Reassembles guest output into UTF-8 text per stream.
///
/// A character split across two writes is held back until its last byte
/// arrives. Bytes that can never form a character become U+FFFD.
#[derive(Debug, Default)]
struct OutputDecoder {
    tails: [Vec<u8>; 3],
}

impl OutputDecoder {
    fn decode(&mut self, fd: usize, bytes: &[u8]) -> String {
        let pending = &mut self.tails[fd];
        pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(pending.as_slice()) {
                Ok(valid) => {
                    text.push_str(valid);
                    pending.clear();
                    return text;
                }
                Err(e) => {
                    // `None` means the buffer ends inside a character.
                    let end = match e.error_len() {
                        Some(bad) => e.valid_up_to() + bad,
                        None => e.valid_up_to(),
                    };
                    text.push_str(&String::from_utf8_lossy(&pending[..end]));
                    pending.drain(..end);
                    if e.error_len().is_none() {
                        return text;
                    }
                }
            }
        }
    }

    /// Whatever is still held back, decoded lossily.
    fn finish(&mut self) -> String {
        self.tails
            .iter_mut()
            .map(|tail| String::from_utf8_lossy(&std::mem::take(tail)).into_owned())
            .collect()
    }
}

struct MemfsState {
    io: Box<dyn HostIo>,
    output: OutputDecoder,
    stdin: StdinBuffer,
    host: Option<HostLease>,
    memory: Option<Memory>,
}

struct MemfsBridge {
    store: Store<MemfsState>,
    memory: Memory,
    exports: HashMap<String, Func>,
    path_buf: u32,
}

impl MemfsBridge {
    fn view(&mut self) -> MemoryView<'_> {
        MemoryView::refresh(self.memory, &mut self.store)
    }

    fn call(&mut self, name: &str, params: &[Val]) -> Result<Option<i32>> {
        let func = *self
            .exports
            .get(name)
            .ok_or_else(|| SandccError::Vfs(format!("memfs does not export {name}")))?;
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];
        func.call(&mut self.store, params, &mut results)?;
        Ok(results.first().and_then(Val::i32))
    }

    fn call_i32(&mut self, name: &str, params: &[Val]) -> Result<i32> {
        self.call(name, params)?
            .ok_or_else(|| SandccError::Vfs(format!("memfs {name} returned nothing")))
    }

    /// Write `path` into the path buffer and return its length.
    fn write_path(&mut self, path: &str) -> Result<i32> {
        if path.len() >= PATH_BUFFER_CAPACITY {
            return Err(SandccError::Vfs(format!(
                "path of {} bytes exceeds the {PATH_BUFFER_CAPACITY}-byte path buffer",
                path.len()
            )));
        }
        let buf = self.path_buf;
        self.view().write_string(buf, path)?;
        Ok(path.len() as i32)
    }

    fn find(&mut self, path: &str) -> Result<Option<Inode>> {
        let len = self.write_path(path)?;
        Ok(Inode::from_raw(self.call_i32("FindNode", &[Val::I32(len)])?))
    }

    fn file_address(&mut self, inode: Inode) -> Result<u32> {
        Ok(self.call_i32("GetFileNodeAddress", &[Val::I32(inode.raw())])? as u32)
    }

    fn file_size(&mut self, inode: Inode) -> Result<u32> {
        Ok(self.call_i32("GetFileNodeSize", &[Val::I32(inode.raw())])? as u32)
    }
}

/// Shared handle to the memfs instance.
///
/// The instance lives as long as the orchestrator; every guest process holds a
/// clone of this handle. All access happens on the worker thread.
#[derive(Clone)]
pub struct GuestVfs {
    inner: Rc<RefCell<MemfsBridge>>,
}

impl std::fmt::Debug for GuestVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestVfs").finish_non_exhaustive()
    }
}

impl GuestVfs {
    /// Instantiate memfs from its compiled module and run its `init` export.
    pub fn new(engine: &Engine, module: &Module, io: Box<dyn HostIo>) -> Result<Self> {
        let mut store = Store::new(
            engine,
            MemfsState {
                io,
                output: OutputDecoder::default(),
                stdin: StdinBuffer::default(),
                host: None,
                memory: None,
            },
        );
        let mut linker = Linker::new(engine);
        add_memfs_imports(&mut linker)?;
        wasi::stub_unresolved_imports(&mut linker, &mut store, module)?;

        let instance = linker.instantiate(&mut store, module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(SyscallError::MissingMemory)?;
        store.data_mut().memory = Some(memory);

        let exports: HashMap<String, Func> = instance
            .exports(&mut store)
            .filter_map(|export| {
                let name = export.name().to_owned();
                export.into_func().map(|func| (name, func))
            })
            .collect();

        let mut bridge = MemfsBridge {
            store,
            memory,
            exports,
            path_buf: 0,
        };
        if bridge.exports.contains_key("init") {
            bridge.call("init", &[])?;
        }
        bridge.path_buf = bridge.call_i32("GetPathBuf", &[])? as u32;
        tracing::debug!(
            exports = bridge.exports.len(),
            path_buf = bridge.path_buf,
            "memfs instantiated"
        );

        Ok(Self {
            inner: Rc::new(RefCell::new(bridge)),
        })
    }

    pub fn add_directory(&self, path: &str) -> Result<()> {
        let mut bridge = self.inner.borrow_mut();
        let len = bridge.write_path(path)?;
        bridge.call("AddDirectoryNode", &[Val::I32(len)])?;
        Ok(())
    }

    /// Create (or shadow) the file at `path` with `contents`.
    pub fn add_file(&self, path: &str, contents: &[u8]) -> Result<Inode> {
        let mut bridge = self.inner.borrow_mut();
        let len = bridge.write_path(path)?;
        let size = u32::try_from(contents.len())
            .map_err(|_| SandccError::Vfs(format!("{path} is too large for memfs")))?;
        let inode = Inode::from_raw(bridge.call_i32("AddFileNode", &[Val::I32(len), Val::I32(size as i32)])?)
            .ok_or_else(|| SandccError::Vfs(format!("memfs refused to create {path}")))?;
        let addr = bridge.file_address(inode)?;
        // AddFileNode may have grown memfs memory, so take a fresh view.
        bridge.view().write_bytes(addr, contents)?;
        Ok(inode)
    }

    pub fn find(&self, path: &str) -> Result<Option<Inode>> {
        self.inner.borrow_mut().find(path)
    }

    pub fn file_address(&self, inode: Inode) -> Result<u32> {
        self.inner.borrow_mut().file_address(inode)
    }

    pub fn file_size(&self, inode: Inode) -> Result<u32> {
        self.inner.borrow_mut().file_size(inode)
    }

    /// Copy a file's bytes out of memfs.
    pub fn get_file_contents(&self, path: &str) -> Result<Vec<u8>> {
        let mut bridge = self.inner.borrow_mut();
        let inode = bridge
            .find(path)?
            .ok_or_else(|| SandccError::NotFound(path.to_owned()))?;
        let addr = bridge.file_address(inode)?;
        let size = bridge.file_size(inode)?;
        Ok(bridge.view().read_bytes(addr, size as usize)?.to_vec())
    }

    /// Whether memfs exports a function called `name`.
    #[must_use]
    pub fn exports_function(&self, name: &str) -> bool {
        self.inner.borrow().exports.contains_key(name)
    }

    pub fn write_output(&self, text: &str) {
        self.inner.borrow_mut().store.data_mut().io.write_output(text);
    }

    /// Emit output held back for an unfinished character.
    pub fn flush_output(&self) {
        let mut bridge = self.inner.borrow_mut();
        let state = bridge.store.data_mut();
        let rest = state.output.finish();
        if !rest.is_empty() {
            state.io.write_output(&rest);
        }
    }

    /// Drop buffered stdin so a new run starts with fresh input.
    pub fn reset_stdin(&self) {
        self.inner.borrow_mut().store.data_mut().stdin = StdinBuffer::default();
    }

    /// Call memfs's export `name` on behalf of a guest whose memory is `host`.
    pub(crate) fn forward(
        &self,
        name: &str,
        host: &mut [u8],
        params: &[Val],
        results: &mut [Val],
    ) -> wasmtime::Result<()> {
        let mut bridge = self.inner.borrow_mut();
        let func = bridge
            .exports
            .get(name)
            .copied()
            .ok_or_else(|| SyscallError::unsupported("memfs", name))?;
        bridge.store.data_mut().host = Some(HostLease::new(host));
        let outcome = func.call(&mut bridge.store, params, results);
        bridge.store.data_mut().host = None;
        outcome
    }
}

impl VfsSink for GuestVfs {
    fn add_directory(&mut self, path: &str) -> Result<()> {
        Self::add_directory(self, path)
    }

    fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        Self::add_file(self, path, contents).map(|_| ())
    }
}

/// Read an iovec array (`{ buf: u32, len: u32 }` pairs) out of guest memory.
fn iovecs(view: &MemoryView<'_>, iovs: u32, count: u32) -> std::result::Result<Vec<(u32, u32)>, SyscallError> {
    (0..count)
        .map(|i| {
            let at = iovs + i * 8;
            Ok((view.read32(at)?, view.read32(at + 4)?))
        })
        .collect()
}

fn host_view(host: &mut Option<HostLease>) -> std::result::Result<MemoryView<'_>, SyscallError> {
    host.as_mut().map(HostLease::view).ok_or(SyscallError::MissingMemory)
}

fn add_memfs_imports(linker: &mut Linker<MemfsState>) -> wasmtime::Result<()> {
    linker.func_wrap("env", "abort", || -> wasmtime::Result<()> {
        Err(SyscallError::Aborted.into())
    })?;

    linker.func_wrap(
        "env",
        "host_write",
        |mut caller: Caller<'_, MemfsState>, fd: i32, iovs: i32, iovs_len: i32, nwritten_out: i32| -> wasmtime::Result<i32> {
            if !(0..=2).contains(&fd) {
                return Err(SyscallError::Assertion(format!("host_write on fd {fd}")).into());
            }
            let MemfsState { io, output, host, .. } = caller.data_mut();
            let mut view = host_view(host)?;
            let mut bytes = Vec::new();
            for (buf, len) in iovecs(&view, iovs as u32, iovs_len as u32)? {
                bytes.extend_from_slice(view.read_bytes(buf, len as usize)?);
            }
            view.write32(nwritten_out as u32, bytes.len() as u32)?;
            let text = output.decode(fd as usize, &bytes);
            if !text.is_empty() {
                io.write_output(&text);
            }
            Ok(errno::SUCCESS)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_read",
        |mut caller: Caller<'_, MemfsState>, fd: i32, iovs: i32, iovs_len: i32, nread_out: i32| -> wasmtime::Result<i32> {
            if fd != 0 {
                return Err(SyscallError::Assertion(format!("host_read on fd {fd}")).into());
            }
            let MemfsState {
                io, host, stdin, ..
            } = caller.data_mut();
            let mut view = host_view(host)?;
            let vectors = iovecs(&view, iovs as u32, iovs_len as u32)?;

            if stdin.remaining() == 0 && !stdin.at_eof() && vectors.iter().any(|&(_, len)| len > 0) {
                let delivered = io.request_input();
                stdin.push(&delivered);
            }

            let mut total = 0usize;
            for (buf, len) in vectors {
                if len == 0 {
                    continue;
                }
                let chunk = stdin.take(len as usize);
                view.write_bytes(buf, chunk)?;
                total += chunk.len();
                if chunk.len() < len as usize {
                    break;
                }
            }
            view.write32(nread_out as u32, total as u32)?;
            Ok(errno::SUCCESS)
        },
    )?;

    linker.func_wrap(
        "env",
        "copy_in",
        |mut caller: Caller<'_, MemfsState>, memfs_dst: i32, host_src: i32, size: i32| -> wasmtime::Result<()> {
            let memory = caller.data().memory.ok_or(SyscallError::MissingMemory)?;
            let (memfs_bytes, state) = memory.data_and_store_mut(&mut caller);
            let host = host_view(&mut state.host)?;
            let mut memfs = MemoryView::new(memfs_bytes);
            memfs.write_bytes(memfs_dst as u32, host.read_bytes(host_src as u32, size as usize)?)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "copy_out",
        |mut caller: Caller<'_, MemfsState>, host_dst: i32, memfs_src: i32, size: i32| -> wasmtime::Result<()> {
            let memory = caller.data().memory.ok_or(SyscallError::MissingMemory)?;
            let (memfs_bytes, state) = memory.data_and_store_mut(&mut caller);
            let mut host = host_view(&mut state.host)?;
            let memfs = MemoryView::new(memfs_bytes);
            host.write_bytes(host_dst as u32, memfs.read_bytes(memfs_src as u32, size as usize)?)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "memfs_log",
        |mut caller: Caller<'_, MemfsState>, buf: i32, len: i32| -> wasmtime::Result<()> {
            let memory = caller.data().memory.ok_or(SyscallError::MissingMemory)?;
            let view = MemoryView::refresh(memory, &mut caller);
            let line = view.read_string(buf as u32, len as usize)?;
            tracing::debug!(target: "sandcc::memfs", "{line}");
            Ok(())
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMFS: &str = include_str!("../tests/fixtures/memfs.wat");

    fn vfs() -> GuestVfs {
        let engine = Engine::default();
        let module = Module::new(&engine, MEMFS).unwrap();
        GuestVfs::new(&engine, &module, Box::new(BufferedIo::new())).unwrap()
    }

    #[test]
    fn files_roundtrip_through_guest_memory() {
        let vfs = vfs();
        let inode = vfs.add_file("hello.c", b"int main(void){return 0;}").unwrap();

        assert_eq!(vfs.find("hello.c").unwrap(), Some(inode));
        assert_eq!(vfs.file_size(inode).unwrap(), 25);
        assert_eq!(
            vfs.get_file_contents("hello.c").unwrap(),
            b"int main(void){return 0;}"
        );
    }

    #[test]
    fn missing_files_are_reported() {
        let vfs = vfs();
        assert_eq!(vfs.find("nope.o").unwrap(), None);
        assert!(matches!(
            vfs.get_file_contents("nope.o"),
            Err(SandccError::NotFound(path)) if path == "nope.o"
        ));
    }

    #[test]
    fn large_files_survive_memfs_growth() {
        let vfs = vfs();
        vfs.add_file("small.h", b"#define X 1\n").unwrap();
        let big: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        vfs.add_file("lib/libc.a", &big).unwrap();

        assert_eq!(vfs.get_file_contents("lib/libc.a").unwrap(), big);
        assert_eq!(vfs.get_file_contents("small.h").unwrap(), b"#define X 1\n");
    }

    #[test]
    fn re_adding_a_path_shadows_the_old_contents() {
        let vfs = vfs();
        vfs.add_file("main.c", b"old").unwrap();
        vfs.add_file("main.c", b"newer").unwrap();
        assert_eq!(vfs.get_file_contents("main.c").unwrap(), b"newer");
    }

    #[test]
    fn directories_are_findable() {
        let vfs = vfs();
        vfs.add_directory("include").unwrap();
        assert!(vfs.find("include").unwrap().is_some());
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let vfs = vfs();
        let path = "a".repeat(PATH_BUFFER_CAPACITY);
        assert!(matches!(vfs.add_file(&path, b""), Err(SandccError::Vfs(_))));
    }

    #[test]
    fn split_characters_are_joined_across_writes() {
        let mut output = OutputDecoder::default();
        assert_eq!(output.decode(1, b"caf\xc3"), "caf");
        assert_eq!(output.decode(2, b"err"), "err");
        assert_eq!(output.decode(1, b"\xa9!"), "\u{e9}!");
        assert_eq!(output.finish(), "");
    }

    #[test]
    fn invalid_bytes_are_replaced_and_dangling_ones_flushed() {
        let mut output = OutputDecoder::default();
        assert_eq!(output.decode(1, b"a\xffb\xe2\x82"), "a\u{fffd}b");
        assert_eq!(output.finish(), "\u{fffd}");
    }

    #[test]
    fn exports_are_discoverable() {
        let vfs = vfs();
        assert!(vfs.exports_function("fd_write"));
        assert!(!vfs.exports_function("clock_time_get"));
    }
}
