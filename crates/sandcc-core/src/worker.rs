//! The toolchain worker: a dedicated thread that owns a [`Toolchain`] and
//! serves host requests one at a time.

use crate::assets::AssetSource;
use crate::config::ToolchainConfig;
use crate::input::SharedInput;
use crate::protocol::{Request, Response, SourceFile};
use crate::toolchain::Toolchain;
use crate::vfs::HostIo;
use crate::{Result, SandccError};
use std::ops::ControlFlow;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for `construct`
    Uninitialized,
    /// Ready to accept a run
    Ready,
    /// Currently running user code
    Busy,
}

/// Guest stdio routed over the response channel.
struct ChannelIo {
    responder: UnboundedSender<Response>,
    input: SharedInput,
}

impl HostIo for ChannelIo {
    fn write_output(&mut self, text: &str) {
        if self
            .responder
            .send(Response::Output { text: text.to_owned() })
            .is_err()
        {
            tracing::trace!("host gone, dropping output");
        }
    }

    fn request_input(&mut self) -> Vec<u8> {
        if self.responder.send(Response::NeedInput).is_err() {
            // Nobody can answer; treat it as end of input.
            return Vec::new();
        }
        self.input.wait()
    }
}

pub struct Worker {
    state: WorkerState,
    config: ToolchainConfig,
    assets: Option<Box<dyn AssetSource>>,
    toolchain: Option<Toolchain>,
    responder: Option<UnboundedSender<Response>>,
    input: SharedInput,
    run_count: u64,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("state", &self.state)
            .field("run_count", &self.run_count)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(config: ToolchainConfig, assets: Box<dyn AssetSource>) -> Self {
        Self {
            state: WorkerState::Uninitialized,
            config,
            assets: Some(assets),
            toolchain: None,
            responder: None,
            input: SharedInput::new(),
            run_count: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Serve requests until `shutdown` or until every sender is gone.
    pub fn serve(mut self, mut requests: UnboundedReceiver<Request>) {
        while let Some(request) = requests.blocking_recv() {
            if self.handle(request).is_break() {
                break;
            }
        }
        tracing::info!(runs = self.run_count, "worker stopped");
    }

    pub fn handle(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::Construct { responder, input } => return self.construct(responder, input),
            Request::Run { filename, files } => self.run(&filename, &files),
            Request::Frame { timestamp_ms } => self.frame(timestamp_ms),
            // Input that arrives while no guest is blocked waits for the next read.
            Request::Input { bytes } => self.input.release(bytes),
            Request::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Build the toolchain. A worker whose toolchain cannot start stops.
    fn construct(&mut self, responder: UnboundedSender<Response>, input: SharedInput) -> ControlFlow<()> {
        let Some(assets) = self.assets.take() else {
            tracing::warn!(state = ?self.state, "construct received twice, ignoring");
            return ControlFlow::Continue(());
        };
        self.input = input.clone();
        self.responder = Some(responder.clone());

        let io = Box::new(ChannelIo {
            responder: responder.clone(),
            input,
        });
        let toolchain = Toolchain::new(self.config.clone(), assets, io).and_then(|mut toolchain| {
            toolchain.ensure_ready()?;
            Ok(toolchain)
        });
        match toolchain {
            Ok(toolchain) => {
                self.toolchain = Some(toolchain);
                self.state = WorkerState::Ready;
                tracing::info!("worker ready");
                let _ = responder.send(Response::Ready);
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::error!(error = %e, "toolchain failed to start");
                let _ = responder.send(Response::Output {
                    text: format!("\x1b[91mError: {e}\x1b[0m\n"),
                });
                ControlFlow::Break(())
            }
        }
    }

    fn run(&mut self, filename: &str, files: &[SourceFile]) {
        let Some(toolchain) = self.toolchain.as_mut() else {
            tracing::warn!(state = ?self.state, filename, "run requested before the worker is ready");
            if let Some(responder) = &self.responder {
                let _ = responder.send(Response::RunCompleted);
            }
            return;
        };

        self.state = WorkerState::Busy;
        self.run_count += 1;
        tracing::debug!(filename, files = files.len(), run = self.run_count, "run started");

        let responder = self.responder.clone();
        let outcome = toolchain.run_user_code(filename, files, move || {
            if let Some(responder) = responder {
                let _ = responder.send(Response::RunCompleted);
            }
        });
        self.state = WorkerState::Ready;
        let scheduled = matches!(outcome, Ok(Some(_)));

        match outcome {
            Ok(Some(_)) => tracing::debug!(filename, "program is scheduled"),
            Ok(None) => tracing::debug!(filename, "run finished"),
            Err(e) => tracing::debug!(filename, error = %e, "run failed"),
        }
        // A finished program's unread input must not leak into the next run.
        if !scheduled {
            let dropped = self.input.discard();
            if dropped > 0 {
                tracing::debug!(filename, bytes = dropped, "discarded unread input");
            }
        }
    }

    fn frame(&mut self, timestamp_ms: f64) {
        let Some(toolchain) = self.toolchain.as_mut() else {
            tracing::warn!("frame received before the worker is ready");
            return;
        };
        if let Err(e) = toolchain.frame(timestamp_ms) {
            tracing::debug!(error = %e, "frame failed, program unscheduled");
        }
    }
}

/// Host side of a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    requests: UnboundedSender<Request>,
    responses: UnboundedReceiver<Response>,
    input: SharedInput,
    thread: Option<JoinHandle<()>>,
}

/// Start a worker thread and send it `construct`.
pub fn spawn(config: ToolchainConfig, assets: Box<dyn AssetSource>) -> Result<WorkerHandle> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let input = SharedInput::new();

    let thread = std::thread::Builder::new()
        .name("sandcc-worker".into())
        .spawn(move || Worker::new(config, assets).serve(request_rx))?;

    request_tx
        .send(Request::Construct {
            responder: response_tx,
            input: input.clone(),
        })
        .map_err(|_| SandccError::Worker("worker exited before construct".into()))?;

    Ok(WorkerHandle {
        requests: request_tx,
        responses: response_rx,
        input,
        thread: Some(thread),
    })
}

impl WorkerHandle {
    pub fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| SandccError::Worker("worker is no longer running".into()))
    }

    pub fn run(&self, filename: impl Into<String>, files: Vec<SourceFile>) -> Result<()> {
        self.send(Request::Run {
            filename: filename.into(),
            files,
        })
    }

    pub fn frame(&self, timestamp_ms: f64) -> Result<()> {
        self.send(Request::Frame { timestamp_ms })
    }

    pub async fn recv(&mut self) -> Option<Response> {
        self.responses.recv().await
    }

    /// Blocking receive. Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Response> {
        self.responses.blocking_recv()
    }

    /// Release a guest blocked on stdin. Empty bytes mean end of input.
    pub fn provide_input(&self, bytes: Vec<u8>) {
        self.input.release(bytes);
    }

    #[must_use]
    pub fn input(&self) -> SharedInput {
        self.input.clone()
    }

    #[must_use]
    pub fn sender(&self) -> UnboundedSender<Request> {
        self.requests.clone()
    }

    /// Stop the worker and wait for its thread.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.requests.send(Request::Shutdown);
        self.input.close();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| SandccError::Worker("worker thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.requests.send(Request::Shutdown);
            self.input.close();
        }
    }
}
