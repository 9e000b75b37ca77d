//! sandcc CLI - compile and run C/C++ inside the WebAssembly toolchain

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sandcc_core::pipe::{FrameReader, FrameWriter};
use sandcc_core::{DirectoryAssets, Request, Response, SourceFile, ToolchainConfig, worker};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "sandcc")]
#[command(author, version, about = "Sandboxed C/C++ toolchain running on WebAssembly")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, link and run a source file
    Run {
        /// Source file to build (.c, .cc, .cpp, .cxx)
        file: PathBuf,

        /// Extra files (headers, other sources) placed next to it
        #[arg(short = 'I', long = "include")]
        include: Vec<PathBuf>,

        /// Asset directory (defaults to SANDCC_ASSETS env var or ./assets)
        #[arg(short, long)]
        assets: Option<PathBuf>,

        /// JSON toolchain config
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Serve length-prefixed msgpack requests on stdin, responses on stdout
    Worker {
        /// Asset directory (defaults to SANDCC_ASSETS env var or ./assets)
        #[arg(short, long)]
        assets: Option<PathBuf>,

        /// JSON toolchain config
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the guest program (or the frame stream), so log to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sandcc=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            include,
            assets,
            config,
        } => {
            let config = load_config(config.as_deref(), assets)?;
            run(&file, &include, config).await
        }

        Commands::Worker { assets, config } => {
            let config = load_config(config.as_deref(), assets)?;
            serve(config).await
        }
    }
}

fn load_config(path: Option<&Path>, assets: Option<PathBuf>) -> Result<ToolchainConfig> {
    let mut config = match path {
        Some(path) => ToolchainConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ToolchainConfig::default(),
    };
    if let Some(dir) = assets {
        config.assets_dir = dir;
    }
    tracing::debug!(assets = %config.assets_dir.display(), "configuration loaded");
    Ok(config)
}

async fn read_source(path: &Path) -> Result<SourceFile> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(SourceFile::new(name, content))
}

/// Build and run one file, streaming its output and answering reads from stdin.
async fn run(file: &Path, include: &[PathBuf], config: ToolchainConfig) -> Result<()> {
    let active = read_source(file).await?;
    let filename = active.name.clone();
    let mut files = vec![active];
    for path in include {
        files.push(read_source(path).await?);
    }

    let assets = DirectoryAssets::new(&config.assets_dir);
    let mut handle = worker::spawn(config, Box::new(assets))?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut completed = false;

    while let Some(response) = handle.recv().await {
        match response {
            Response::Ready => {
                tracing::debug!(filename = %filename, "worker ready, starting run");
                handle.run(filename.clone(), std::mem::take(&mut files))?;
            }
            Response::Output { text } => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            Response::NeedInput => {
                let bytes = stdin
                    .next_line()
                    .await?
                    .map(|line| format!("{line}\n").into_bytes())
                    .unwrap_or_default();
                handle.provide_input(bytes);
            }
            Response::RunCompleted => {
                completed = true;
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || handle.shutdown()).await??;
    if !completed {
        bail!("worker stopped before the run completed");
    }
    Ok(())
}

/// Bridge framed stdin/stdout to a worker for an out-of-process host.
async fn serve(config: ToolchainConfig) -> Result<()> {
    let assets = DirectoryAssets::new(&config.assets_dir);
    let mut handle = worker::spawn(config, Box::new(assets))?;
    let requests = handle.sender();
    let input = handle.input();
    tracing::info!("serving framed requests on stdin");

    let reader = tokio::task::spawn_blocking(move || -> sandcc_core::Result<()> {
        let mut frames = FrameReader::new(std::io::stdin().lock());
        let outcome = loop {
            match frames.recv::<Request>() {
                // The worker may be parked on a read, so input bypasses the queue.
                Ok(Some(Request::Input { bytes })) => input.release(bytes),
                Ok(Some(Request::Shutdown) | None) => break Ok(()),
                Ok(Some(other)) => {
                    if requests.send(other).is_err() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let _ = requests.send(Request::Shutdown);
        input.close();
        outcome
    });

    let writer = tokio::task::spawn_blocking(move || -> sandcc_core::Result<()> {
        let mut frames = FrameWriter::new(std::io::stdout().lock());
        while let Some(response) = handle.blocking_recv() {
            frames.send(&response)?;
        }
        handle.shutdown()
    });

    writer.await??;
    reader.await??;
    tracing::info!("worker session ended");
    Ok(())
}
