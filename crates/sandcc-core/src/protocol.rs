//! Messages between the host and the toolchain worker
//!
//! Both directions are closed enums tagged as `{ "id": ..., "data": ... }` with
//! camelCase names, so an out-of-process host sees the same shapes whether it
//! speaks msgpack over the framed pipe or builds the messages in-process.

use crate::input::SharedInput;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// A user-authored source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Host to worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Attach the response channel and the shared input cell, then get ready.
    /// Only exists in-process.
    #[serde(skip)]
    Construct {
        responder: UnboundedSender<Response>,
        input: SharedInput,
    },
    /// Compile, link and run `filename`, one of `files`.
    Run {
        filename: String,
        files: Vec<SourceFile>,
    },
    /// Tick the scheduled program, if any.
    Frame { timestamp_ms: f64 },
    /// Stdin bytes. An empty payload is end of input.
    Input { bytes: Vec<u8> },
    Shutdown,
}

/// Worker to host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum Response {
    Ready,
    Output { text: String },
    NeedInput,
    RunCompleted,
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}
