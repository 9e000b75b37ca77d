//! Bounds-checked view over a guest's linear memory.
//!
//! A guest may grow its memory whenever it runs, which can move the backing
//! buffer. A [`MemoryView`] is therefore a *borrow* of the guest's store: it
//! cannot be held across a call back into guest code, because that call needs
//! the store mutably. Code that has called into the guest re-acquires a view
//! with [`MemoryView::refresh`] and the stale one is statically gone.

use crate::error::MemoryError;
use wasmtime::{Memory, StoreContextMut};

/// Typed little-endian accessor over guest memory.
#[derive(Debug)]
pub struct MemoryView<'a> {
    bytes: &'a mut [u8],
}

impl<'a> MemoryView<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Acquire a view of `memory` as it is right now.
    pub fn refresh<T: 'a>(memory: Memory, store: impl Into<StoreContextMut<'a, T>>) -> Self {
        Self::new(memory.data_mut(store))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds {
                offset: u64::from(offset),
                len,
                size: self.bytes.len(),
            }),
        }
    }

    fn array<const N: usize>(&self, offset: u32) -> Result<[u8; N], MemoryError> {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.range(offset, N)?]);
        Ok(out)
    }

    pub fn read8(&self, offset: u32) -> Result<u8, MemoryError> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn read32(&self, offset: u32) -> Result<u32, MemoryError> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    pub fn read64(&self, offset: u32) -> Result<u64, MemoryError> {
        Ok(u64::from_le_bytes(self.array(offset)?))
    }

    pub fn write8(&mut self, offset: u32, value: u8) -> Result<(), MemoryError> {
        self.write_bytes(offset, &[value])
    }

    pub fn write32(&mut self, offset: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write64(&mut self, offset: u32, value: u64) -> Result<(), MemoryError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<&[u8], MemoryError> {
        Ok(&self.bytes[self.range(offset, len)?])
    }

    /// Mutable access to `len` bytes at `offset`, for filling in place.
    pub fn bytes_mut(&mut self, offset: u32, len: usize) -> Result<&mut [u8], MemoryError> {
        let range = self.range(offset, len)?;
        Ok(&mut self.bytes[range])
    }

    pub fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Read at most `len` bytes, stopping early at a NUL.
    ///
    /// Only the bytes actually inspected must be in bounds, so a generous `len`
    /// over a short string near the end of memory is fine.
    pub fn read_string(&self, offset: u32, len: usize) -> Result<String, MemoryError> {
        let start = offset as usize;
        let available = self.bytes.len().saturating_sub(start);
        let window = &self.bytes[start.min(self.bytes.len())..][..available.min(len)];
        match window.iter().position(|&b| b == 0) {
            Some(nul) => Ok(String::from_utf8_lossy(&window[..nul]).into_owned()),
            None if window.len() == len => Ok(String::from_utf8_lossy(window).into_owned()),
            None => Err(MemoryError::OutOfBounds {
                offset: u64::from(offset),
                len,
                size: self.bytes.len(),
            }),
        }
    }

    /// Write `s` followed by a NUL. Returns the bytes written, terminator included.
    pub fn write_string(&mut self, offset: u32, s: &str) -> Result<u32, MemoryError> {
        let range = self.range(offset, s.len() + 1)?;
        let (text, nul) = self.bytes[range].split_at_mut(s.len());
        text.copy_from_slice(s.as_bytes());
        nul[0] = 0;
        Ok(u32::try_from(s.len() + 1).unwrap_or(u32::MAX))
    }
}
