//! Forward-only reader over an image byte source.

use crate::ImageError;
use std::io::{ErrorKind, Read};

const CHUNK: usize = 4096;

/// Reads a byte source strictly front to back.
///
/// Bytes from the lowest offset still wanted up to the current position stay
/// buffered, so a read at an offset the stream has already passed is served
/// from the buffer instead of seeking back. Skipping forward is
/// read-and-discard. Memory held is bounded by that window, not by the
/// length of the file.
pub(crate) struct StreamReader<R> {
    inner: R,
    window: Vec<u8>,
    /// Absolute offset of `window[0]`.
    window_start: usize,
    /// Bytes below this offset are no longer kept.
    keep_from: usize,
}

impl<R: Read> StreamReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            window: Vec::new(),
            window_start: 0,
            keep_from: 0,
        }
    }

    /// Current stream position.
    pub(crate) fn position(&self) -> usize {
        self.window_start + self.window.len()
    }

    /// Bytes currently buffered.
    pub(crate) fn buffered(&self) -> usize {
        self.window.len()
    }

    /// Fill `buf` with the bytes at absolute `offset`.
    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
        let start = usize::try_from(offset).map_err(|_| {
            ImageError::MalformedImage(format!("offset 0x{:x} does not fit the host", offset))
        })?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            ImageError::MalformedImage(format!("read at 0x{:x} overflows", offset))
        })?;
        if buf.is_empty() {
            return Ok(());
        }
        if start < self.window_start {
            return Err(ImageError::MalformedImage(format!(
                "offset 0x{:x} lies before the retained window at 0x{:x}",
                offset, self.window_start
            )));
        }

        self.fill_to(end)?;
        buf.copy_from_slice(&self.window[start - self.window_start..end - self.window_start]);
        Ok(())
    }

    /// Stop keeping bytes below `offset`. Never moves backwards.
    pub(crate) fn release_before(&mut self, offset: usize) {
        self.keep_from = self.keep_from.max(offset);
        let cut = self
            .keep_from
            .saturating_sub(self.window_start)
            .min(self.window.len());
        self.window.drain(..cut);
        self.window_start += cut;
    }

    pub(crate) fn read_u8(&mut self, offset: u64) -> Result<u8, ImageError> {
        let mut b = [0u8; 1];
        self.read_at(offset, &mut b)?;
        Ok(b[0])
    }

    pub(crate) fn read_u16(&mut self, offset: u64) -> Result<u16, ImageError> {
        let mut b = [0u8; 2];
        self.read_at(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub(crate) fn read_u32(&mut self, offset: u64) -> Result<u32, ImageError> {
        let mut b = [0u8; 4];
        self.read_at(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub(crate) fn read_u64(&mut self, offset: u64) -> Result<u64, ImageError> {
        let mut b = [0u8; 8];
        self.read_at(offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Pull bytes from the source until the stream position reaches `end`.
    /// Short reads are looped over; end of stream is a truncated image.
    fn fill_to(&mut self, end: usize) -> Result<(), ImageError> {
        let mut chunk = [0u8; CHUNK];
        while self.position() < end {
            let pos = self.position();
            let want = (end - pos).min(CHUNK);
            match self.inner.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(ImageError::MalformedImage(format!(
                        "truncated: needed {} bytes, source ended at {}",
                        end, pos
                    )))
                }
                Ok(n) => {
                    // Anything below keep_from is only skipped over.
                    let skip = self.keep_from.saturating_sub(pos).min(n);
                    if self.window.is_empty() {
                        self.window_start = pos + skip;
                    }
                    self.window.extend_from_slice(&chunk[skip..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImageError::Io(e)),
            }
        }
        Ok(())
    }

    pub(crate) fn into_inner(self) -> R {
        self.inner
    }
}
