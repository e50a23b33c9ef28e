// Bounds-checked cursor over an archive buffer.
//
// Decodes the four primitive shapes (u32, tag frame, string, block) straight
// out of the borrowed buffer. Strings and blocks come back as sub-slices of
// the input, so a memory-mapped archive is never copied.

use super::header::{Tag, U32_SIZE, aligned};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// A read needed `needed` bytes at `offset` but the buffer ends at `len`.
    #[error("read of {needed} bytes at offset {offset} exceeds buffer length {len}")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        len: usize,
    },
    /// A seek targeted a position outside `[0, len)`.
    #[error("seek to {target} is outside buffer of length {len}")]
    SeekOutOfBounds { target: i64, len: usize },
}

// ---------------------------------------------------------------------------
// ByteReader
// ---------------------------------------------------------------------------

/// Cursor over a borrowed byte buffer.
///
/// Every accessor checks its full span before touching the buffer and leaves
/// the position unchanged on failure.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Create a reader positioned at `offset`.
    pub fn at(buf: &'a [u8], offset: usize) -> Result<Self, ReadError> {
        let mut reader = Self::new(buf);
        reader.seek_to(offset)?;
        Ok(reader)
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Move to an absolute offset from the start of the buffer.
    pub fn seek_to(&mut self, offset: usize) -> Result<(), ReadError> {
        if offset >= self.buf.len() {
            return Err(ReadError::SeekOutOfBounds {
                target: i64::try_from(offset).unwrap_or(i64::MAX),
                len: self.buf.len(),
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// Move by `delta` bytes relative to the current position.
    pub fn seek_by(&mut self, delta: i64) -> Result<(), ReadError> {
        let target = i64::try_from(self.pos)
            .ok()
            .and_then(|pos| pos.checked_add(delta))
            .unwrap_or(i64::MAX);
        match usize::try_from(target) {
            Ok(offset) if offset < self.buf.len() => {
                self.pos = offset;
                Ok(())
            }
            _ => Err(ReadError::SeekOutOfBounds {
                target,
                len: self.buf.len(),
            }),
        }
    }

    /// Borrow `n` bytes at the cursor and advance by `advance` (>= n).
    fn take(&mut self, n: usize, advance: usize) -> Result<&'a [u8], ReadError> {
        debug_assert!(advance >= n);
        let end = self
            .pos
            .checked_add(advance)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ReadError::OutOfBounds {
                offset: self.pos,
                needed: advance,
                len: self.buf.len(),
            })?;
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        let bytes = self.take(U32_SIZE, U32_SIZE)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a `tag + length` frame header.
    ///
    /// Both words must be present; on failure the cursor does not move.
    pub fn read_tag(&mut self) -> Result<(Tag, u32), ReadError> {
        let start = self.pos;
        let tag = self.read_u32()?;
        match self.read_u32() {
            Ok(len) => Ok((Tag::from_u32(tag), len)),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Read a length-prefixed, NUL-terminated, padded string.
    ///
    /// Returns the `len` string bytes; the terminator and padding are skipped
    /// without being inspected.
    pub fn read_string(&mut self) -> Result<&'a [u8], ReadError> {
        self.read_prefixed(|len| len.checked_add(1).map(aligned))
    }

    /// Read a length-prefixed, padded opaque block.
    pub fn read_block(&mut self) -> Result<&'a [u8], ReadError> {
        self.read_prefixed(|len| Some(aligned(len)))
    }

    fn read_prefixed(
        &mut self,
        padded: impl Fn(usize) -> Option<usize>,
    ) -> Result<&'a [u8], ReadError> {
        let start = self.pos;
        let len = self.read_u32()? as usize;
        // Keep the padding arithmetic away from usize::MAX on 32-bit targets.
        let span = if len <= usize::MAX - 4 { padded(len) } else { None };
        let result = match span {
            Some(span) => self.take(len, span),
            None => Err(ReadError::OutOfBounds {
                offset: self.pos,
                needed: usize::MAX,
                len: self.buf.len(),
            }),
        };
        if result.is_err() {
            self.pos = start;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
