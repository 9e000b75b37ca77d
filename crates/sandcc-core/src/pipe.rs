//! Length-prefixed msgpack frames for an out-of-process host

use crate::protocol;
use crate::{Result, SandccError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{ErrorKind, Read, Write};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one message per frame
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and send `msg`
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = protocol::encode(msg).map_err(|e| SandccError::Protocol(e.to_string()))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(SandccError::Protocol(format!(
                "frame too large: {} bytes",
                payload.len()
            )));
        }

        // Send length prefix (4 bytes, big-endian)
        let len_bytes = (payload.len() as u32).to_be_bytes();
        self.inner.write_all(&len_bytes)?;
        self.inner.write_all(&payload)?;
        self.inner.flush()?;

        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads one message per frame
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next message. `Ok(None)` on a clean end of stream.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        // Read length prefix
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            match self.inner.read(&mut len_bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(SandccError::Protocol("stream ended inside a frame header".into()));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SandccError::Protocol(format!("frame too large: {len} bytes")));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;

        protocol::decode(&payload)
            .map(Some)
            .map_err(|e| SandccError::Protocol(format!("failed to decode frame: {e}")))
    }
}
