//! Blocking stdin hand-off between the host and the worker thread.
//!
//! The worker parks on a condition variable while a guest waits for input; the
//! host releases it from its own thread. Nothing polls.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Vec<u8>>,
    waiting: bool,
    closed: bool,
}

/// Shared cell the host writes input into and the worker blocks on.
#[derive(Debug, Clone, Default)]
pub struct SharedInput {
    inner: Arc<(Mutex<Slot>, Condvar)>,
}

impl SharedInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the host provides bytes. An empty delivery means end of input.
    ///
    /// Bytes released before anyone waited are returned immediately. Once the
    /// cell is closed, every wait returns end of input without blocking.
    pub fn wait(&self) -> Vec<u8> {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock();
        slot.waiting = true;
        loop {
            if let Some(bytes) = slot.pending.take() {
                slot.waiting = false;
                return bytes;
            }
            if slot.closed {
                slot.waiting = false;
                return Vec::new();
            }
            cvar.wait(&mut slot);
        }
    }

    /// Hand `bytes` to the worker and wake it.
    pub fn release(&self, bytes: Vec<u8>) {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock();
        match slot.pending.as_mut() {
            Some(pending) => pending.extend_from_slice(&bytes),
            None => slot.pending = Some(bytes),
        }
        cvar.notify_one();
    }

    /// Stop blocking: the current and every later wait sees end of input once
    /// anything already released has been consumed.
    pub fn close(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().closed = true;
        cvar.notify_all();
    }

    /// Drop released bytes nobody waited for.
    pub fn discard(&self) -> usize {
        self.inner.0.lock().pending.take().map_or(0, |bytes| bytes.len())
    }

    /// Whether the worker is currently parked waiting for input.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.inner.0.lock().waiting
    }
}

/// Bytes delivered by the host but not yet consumed by the guest.
#[derive(Debug, Default)]
pub struct StdinBuffer {
    data: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl StdinBuffer {
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Append a host delivery. An empty delivery marks end of input until more
    /// bytes arrive.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
        self.eof = bytes.is_empty();
        self.data.extend_from_slice(bytes);
    }

    #[must_use]
    pub const fn at_eof(&self) -> bool {
        self.eof
    }

    /// Consume up to `max` bytes.
    pub fn take(&mut self, max: usize) -> &[u8] {
        let start = self.pos;
        let end = start + max.min(self.remaining());
        self.pos = end;
        &self.data[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_release() {
        let input = SharedInput::new();
        let worker = {
            let input = input.clone();
            thread::spawn(move || input.wait())
        };

        while !input.is_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        input.release(b"42\n".to_vec());

        assert_eq!(worker.join().unwrap(), b"42\n");
        assert!(!input.is_waiting());
    }

    #[test]
    fn early_release_is_kept_for_the_next_wait() {
        let input = SharedInput::new();
        input.release(b"ab".to_vec());
        input.release(b"cd".to_vec());
        assert_eq!(input.wait(), b"abcd");
    }

    #[test]
    fn close_releases_a_parked_waiter() {
        let input = SharedInput::new();
        let worker = {
            let input = input.clone();
            thread::spawn(move || input.wait())
        };

        while !input.is_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        input.close();
        assert_eq!(worker.join().unwrap(), b"");
        assert_eq!(input.wait(), b"");
    }

    #[test]
    fn close_before_wait_still_delivers_pending_bytes() {
        let input = SharedInput::new();
        input.release(b"last".to_vec());
        input.close();
        assert_eq!(input.wait(), b"last");
        assert_eq!(input.wait(), b"");
    }

    #[test]
    fn discarded_input_is_not_seen_by_the_next_wait() {
        let input = SharedInput::new();
        input.release(b"stale".to_vec());
        assert_eq!(input.discard(), 5);
        assert_eq!(input.discard(), 0);
        input.release(b"fresh".to_vec());
        assert_eq!(input.wait(), b"fresh");
    }

    #[test]
    fn buffer_serves_partial_reads() {
        let mut buf = StdinBuffer::default();
        buf.push(b"hello\n");
        assert_eq!(buf.take(4), b"hell");
        assert_eq!(buf.remaining(), 2);
        assert_eq!(buf.take(10), b"o\n");
        assert_eq!(buf.take(10), b"");
        assert!(!buf.at_eof());

        buf.push(b"");
        assert!(buf.at_eof());
        buf.push(b"x");
        assert!(!buf.at_eof());
        assert_eq!(buf.take(1), b"x");
    }
}
