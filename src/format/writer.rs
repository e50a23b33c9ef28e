// Append-only encoder for the CAR primitives.
//
// Mirrors `reader.rs` shape for shape. The writer counts every byte it emits
// so the builder can compare its precomputed forward offsets against where
// the stream actually is, without asking the sink to seek.

use std::io::{self, Read, Write};

use super::header::{Tag, aligned};

const ZERO_PAD: [u8; 3] = [0; 3];

/// Byte sink that tracks its own write position.
pub struct TagWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> TagWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Write raw bytes with no framing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a `tag + length` frame header.
    pub fn write_tag(&mut self, tag: Tag, len: u32) -> io::Result<()> {
        self.write_u32(tag.to_u32())?;
        self.write_u32(len)
    }

    /// Write a length-prefixed string: length (without terminator), bytes,
    /// NUL, zero padding.
    pub fn write_string(&mut self, value: &str) -> io::Result<()> {
        let len = checked_len(value.len())?;
        self.write_u32(len)?;
        self.write_raw(value.as_bytes())?;
        self.write_raw(&[0])?;
        self.pad(value.len() + 1)
    }

    /// Write a length-prefixed block followed by zero padding.
    pub fn write_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        let len = checked_len(bytes.len())?;
        self.write_u32(len)?;
        self.write_raw(bytes)?;
        self.pad(bytes.len())
    }

    /// Write a length-prefixed block whose bytes come from `src`.
    ///
    /// Exactly `len` bytes are copied. Returns the number of bytes the reader
    /// actually produced so the caller can detect sources that shrank or grew
    /// since they were measured; a short source is never padded out to `len`.
    pub fn write_block_from<R: Read>(&mut self, len: u32, src: R) -> io::Result<u64> {
        self.write_u32(len)?;
        let mut limited = src.take(u64::from(len));
        let copied = io::copy(&mut limited, &mut self.inner)?;
        self.position += copied;
        let mut src = limited.into_inner();
        let mut probe = [0u8; 1];
        let extra = src.read(&mut probe)? as u64;
        self.pad(copied as usize)?;
        Ok(copied + extra)
    }

    fn pad(&mut self, written: usize) -> io::Result<()> {
        let pad = aligned(written) - written;
        self.write_raw(&ZERO_PAD[..pad])
    }
}

fn checked_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("length {len} does not fit a u32 field"),
        )
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::reader::ByteReader;

    #[test]
    fn u32_bytes_are_little_endian() {
        let mut w = TagWriter::new(Vec::new());
        w.write_u32(0x1234_5678).unwrap();
        assert_eq!(w.into_inner(), vec![0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn string_layout() {
        let mut w = TagWriter::new(Vec::new());
        w.write_string("x.lu").unwrap();
        assert_eq!(w.position(), 12);
        assert_eq!(
            w.into_inner(),
            vec![4, 0, 0, 0, b'x', b'.', b'l', b'u', 0, 0, 0, 0]
        );
    }

    #[test]
    fn string_of_three_needs_no_padding() {
        let mut w = TagWriter::new(Vec::new());
        w.write_string("abc").unwrap();
        assert_eq!(w.into_inner(), vec![3, 0, 0, 0, b'a', b'b', b'c', 0]);
    }

    #[test]
    fn block_layout() {
        let mut w = TagWriter::new(Vec::new());
        w.write_block(b"AAAAA").unwrap();
        assert_eq!(w.position(), 12);
        assert_eq!(
            w.into_inner(),
            vec![5, 0, 0, 0, b'A', b'A', b'A', b'A', b'A', 0, 0, 0]
        );
    }

    #[test]
    fn block_from_reader_matches_block() {
        let mut a = TagWriter::new(Vec::new());
        a.write_block(b"hello").unwrap();
        let mut b = TagWriter::new(Vec::new());
        let produced = b.write_block_from(5, &b"hello"[..]).unwrap();
        assert_eq!(produced, 5);
        assert_eq!(a.position(), b.position());
        assert_eq!(a.into_inner(), b.into_inner());
    }

    #[test]
    fn block_from_reader_reports_size_drift() {
        let mut w = TagWriter::new(Vec::new());
        assert_eq!(w.write_block_from(3, &b"hello"[..]).unwrap(), 4);

        let mut w = TagWriter::new(Vec::new());
        assert_eq!(w.write_block_from(8, &b"hi"[..]).unwrap(), 2);
        // Only the bytes that arrived are counted.
        assert_eq!(w.position(), 8);
    }

    #[test]
    fn writer_output_reads_back() {
        let mut w = TagWriter::new(Vec::new());
        w.write_tag(Tag::Contents, 20).unwrap();
        w.write_string("main.lu").unwrap();
        w.write_block(&[9, 8, 7]).unwrap();
        w.write_tag(Tag::Eof, 0).unwrap();
        let buf = w.into_inner();

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_tag().unwrap(), (Tag::Contents, 20));
        assert_eq!(r.read_string().unwrap(), b"main.lu");
        assert_eq!(r.read_block().unwrap(), &[9, 8, 7]);
        assert_eq!(r.read_tag().unwrap(), (Tag::Eof, 0));
        assert_eq!(r.remaining(), 0);
    }
}
