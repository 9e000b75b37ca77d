#![allow(dead_code)]

use sandcc_core::{AssetSource, BufferedIo, GuestVfs, MemoryAssets, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasmtime::{Engine, Module};

pub const MEMFS: &str = include_str!("../fixtures/memfs.wat");
pub const TOOL_OK: &str = include_str!("../fixtures/tool_ok.wat");
pub const TOOL_FAIL: &str = include_str!("../fixtures/tool_fail.wat");
pub const TOOL_LOUD: &str = include_str!("../fixtures/tool_loud.wat");
pub const ARGV: &str = include_str!("../fixtures/argv.wat");
pub const HELLO: &str = include_str!("../fixtures/hello.wat");
pub const SILENT: &str = include_str!("../fixtures/silent.wat");
pub const ECHO: &str = include_str!("../fixtures/echo.wat");
pub const POLL: &str = include_str!("../fixtures/poll.wat");
pub const TRAP: &str = include_str!("../fixtures/trap.wat");
pub const ANIMATE: &str = include_str!("../fixtures/animate.wat");
pub const MEMFS_IO: &str = include_str!("../fixtures/memfs_io.wat");
pub const STDIO_READ: &str = include_str!("../fixtures/stdio_read.wat");
pub const SPLIT_UTF8: &str = include_str!("../fixtures/split_utf8.wat");

/// A ustar archive with a few sysroot files plus `extra` regular files.
pub fn sysroot(extra: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut add = |path: &str, kind: tar::EntryType, data: &[u8]| {
        let mut header = tar::Header::new_ustar();
        header.set_path(path).unwrap();
        header.set_entry_type(kind);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    };
    add("include", tar::EntryType::Directory, b"");
    add("include/stdio.h", tar::EntryType::Regular, b"int puts(const char *);\n");
    add("lib/wasm32-wasi", tar::EntryType::Directory, b"");
    add("lib/wasm32-wasi/crt1.o", tar::EntryType::Regular, &[0u8; 600]);
    for (path, data) in extra {
        add(path, tar::EntryType::Regular, data);
    }
    builder.into_inner().unwrap()
}

/// Assets where the "compiler" and "linker" are stubs and the linked program
/// is pre-placed in the sysroot as `<stem>.wasm`.
pub fn assets(clang: &str, lld: &str, programs: &[(&str, &str)]) -> MemoryAssets {
    let extra: Vec<(&str, &[u8])> = programs
        .iter()
        .map(|(path, wat)| (*path, wat.as_bytes()))
        .collect();
    MemoryAssets::new()
        .with("memfs.wasm", MEMFS)
        .with("clang.wasm", clang)
        .with("lld.wasm", lld)
        .with("sysroot.tar", sysroot(&extra))
}

/// Counts loads per asset name.
#[derive(Debug, Clone)]
pub struct CountingAssets {
    inner: MemoryAssets,
    loads: Arc<Mutex<HashMap<String, usize>>>,
}

impl CountingAssets {
    pub fn new(inner: MemoryAssets) -> Self {
        Self {
            inner,
            loads: Arc::default(),
        }
    }

    pub fn loads(&self, name: &str) -> usize {
        self.loads.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl AssetSource for CountingAssets {
    fn load(&self, name: &str) -> Result<Vec<u8>> {
        *self.loads.lock().unwrap().entry(name.to_owned()).or_default() += 1;
        self.inner.load(name)
    }
}

pub fn vfs(engine: &Engine, io: &BufferedIo) -> GuestVfs {
    let memfs = Module::new(engine, MEMFS).unwrap();
    GuestVfs::new(engine, &memfs, Box::new(io.clone())).unwrap()
}
