mod common;

use common::*;
use sandcc_core::{BufferedIo, SandccError, SourceFile, Toolchain, ToolchainConfig};
use std::cell::Cell;

fn toolchain(assets: impl sandcc_core::AssetSource + 'static, io: &BufferedIo) -> Toolchain {
    Toolchain::new(ToolchainConfig::default(), Box::new(assets), Box::new(io.clone())).unwrap()
}

fn files(name: &str) -> Vec<SourceFile> {
    vec![SourceFile::new(name, "int main(void) { return 0; }\n")]
}

#[test]
fn hello_world_echoes_the_command_then_runs() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_OK, TOOL_OK, &[("hello.wasm", HELLO)]), &io);
    let completed = Cell::new(0);

    let token = tc
        .run_user_code("hello.c", &files("hello.c"), || completed.set(completed.get() + 1))
        .unwrap();

    assert!(token.is_none());
    assert_eq!(completed.get(), 1);
    assert_eq!(
        io.output(),
        "$ clang -O2 -Werror -std=c11 hello.c -o hello\nhello, world\n"
    );
}

#[test]
fn silent_program_prints_only_the_echo() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_OK, TOOL_OK, &[("hello.wasm", SILENT)]), &io);
    tc.run_user_code("hello.c", &files("hello.c"), || {}).unwrap();
    assert_eq!(io.output(), "$ clang -O2 -Werror -std=c11 hello.c -o hello\n");
}

#[test]
fn user_files_land_in_the_guest_filesystem() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_OK, TOOL_OK, &[("main.wasm", SILENT)]), &io);
    let sources = vec![
        SourceFile::new("main.c", "#include \"util.h\"\n"),
        SourceFile::new("util.h", "int twice(int);\n"),
    ];
    tc.run_user_code("main.c", &sources, || {}).unwrap();

    assert_eq!(tc.vfs().get_file_contents("util.h").unwrap(), b"int twice(int);\n");
    assert_eq!(
        tc.vfs().get_file_contents("include/stdio.h").unwrap(),
        b"int puts(const char *);\n"
    );
}

#[test]
fn tools_receive_the_full_command_lines() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(ARGV, ARGV, &[("game.wasm", SILENT)]), &io);
    tc.run_user_code("game.cpp", &files("game.cpp"), || {}).unwrap();

    let output = io.output();
    let mut lines = output.splitn(2, '\n');
    assert_eq!(lines.next(), Some("$ clang++ -O2 -Werror -std=c++17 game.cpp -o game"));
    let argv: Vec<&str> = lines.next().unwrap().split('\0').collect();

    let compile_end = argv.iter().position(|a| *a == "game.cpp").unwrap();
    assert_eq!(argv[0], "clang");
    assert_eq!(&argv[1..3], ["-cc1", "-emit-obj"]);
    assert_eq!(&argv[compile_end - 3..=compile_end], ["game.o", "-x", "c++", "game.cpp"]);
    assert_eq!(argv[compile_end + 1], "USER=guest");

    let link = &argv[compile_end + 2..];
    assert_eq!(link[0], "wasm-ld");
    assert!(link.contains(&"-lc++abi"));
    assert!(link.contains(&"stack-size=1048576"));
    assert!(link.contains(&"game.wasm"));
}

#[test]
fn compile_failure_stops_the_pipeline_but_completes_the_run() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_FAIL, TOOL_LOUD, &[("hello.wasm", HELLO)]), &io);
    let completed = Cell::new(false);

    let err = tc
        .run_user_code("hello.c", &files("hello.c"), || completed.set(true))
        .unwrap_err();

    assert!(matches!(err, SandccError::Exited { code: 1, .. }));
    assert!(completed.get());
    let output = io.output();
    assert!(output.contains("error: expected ';'"));
    assert!(!output.contains("wasm-ld invoked"));
    assert!(!output.contains("hello, world"));
    assert!(!output.contains("\x1b[91m"));
}

#[test]
fn missing_active_file_is_reported_and_completes() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_OK, TOOL_OK, &[]), &io);
    let completed = Cell::new(false);

    let err = tc
        .run_user_code("nope.c", &files("hello.c"), || completed.set(true))
        .unwrap_err();

    assert!(matches!(err, SandccError::NotFound(ref name) if name == "nope.c"));
    assert!(completed.get());
    assert!(io.output().contains("\x1b[91mError: no such file in guest filesystem: nope.c"));
}

#[test]
fn unimplemented_syscall_in_user_program() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_OK, TOOL_OK, &[("sleepy.wasm", POLL)]), &io);
    let completed = Cell::new(false);

    let result = tc.run_user_code("sleepy.c", &files("sleepy.c"), || completed.set(true));

    assert!(result.is_err());
    assert!(completed.get());
    let output = io.output();
    assert_eq!(output.matches("\x1b[91mError:").count(), 1);
    assert!(output.contains("poll_oneoff"));
}

#[test]
fn tools_and_sysroot_are_loaded_once() {
    let io = BufferedIo::new();
    let assets = CountingAssets::new(assets(TOOL_OK, TOOL_OK, &[("hello.wasm", SILENT)]));
    let mut tc = toolchain(assets.clone(), &io);
    assert!(!tc.is_ready());

    for _ in 0..3 {
        tc.run_user_code("hello.c", &files("hello.c"), || {}).unwrap();
    }

    assert!(tc.is_ready());
    assert_eq!(assets.loads("memfs.wasm"), 1);
    assert_eq!(assets.loads("clang.wasm"), 1);
    assert_eq!(assets.loads("lld.wasm"), 1);
    assert_eq!(assets.loads("sysroot.tar"), 1);
    assert!(tc.cache().contains("clang.wasm"));
    assert_eq!(tc.cache().len(), 3);
}

#[test]
fn a_new_run_revokes_the_scheduled_program() {
    let io = BufferedIo::new();
    let mut tc = toolchain(
        assets(TOOL_OK, TOOL_OK, &[("anim.wasm", ANIMATE), ("hello.wasm", HELLO)]),
        &io,
    );

    let first = tc
        .run_user_code("anim.c", &files("anim.c"), || {})
        .unwrap()
        .expect("animation asks for frames");
    assert!(tc.frame(16.0).unwrap());
    assert_eq!(io.output().matches("tick").count(), 1);

    tc.run_user_code("hello.c", &files("hello.c"), || {}).unwrap();
    assert!(!first.is_active());

    // Frames after supersession reach nobody.
    assert!(!tc.frame(32.0).unwrap());
    assert_eq!(io.output().matches("tick").count(), 1);
}

#[test]
fn program_exiting_from_a_frame_is_dropped() {
    let io = BufferedIo::new();
    let mut tc = toolchain(assets(TOOL_OK, TOOL_OK, &[("anim.wasm", ANIMATE)]), &io);
    let token = tc.run_user_code("anim.c", &files("anim.c"), || {}).unwrap().unwrap();

    assert!(tc.frame(1.0).unwrap());
    assert!(tc.frame(2.0).unwrap());
    assert!(!tc.frame(3.0).unwrap());
    assert!(!token.is_active());
    assert!(!tc.frame(4.0).unwrap());
}

#[test]
fn missing_sysroot_surfaces_as_an_asset_error() {
    let io = BufferedIo::new();
    let assets = sandcc_core::MemoryAssets::new()
        .with("memfs.wasm", MEMFS)
        .with("clang.wasm", TOOL_OK)
        .with("lld.wasm", TOOL_OK);
    let mut tc = toolchain(assets, &io);
    let completed = Cell::new(false);

    let err = tc
        .run_user_code("hello.c", &files("hello.c"), || completed.set(true))
        .unwrap_err();
    assert!(matches!(err, SandccError::Asset { ref name, .. } if name == "sysroot.tar"));
    assert!(completed.get());
    assert!(!tc.is_ready());
}
