use std::io::{self, Seek, SeekFrom, Write};

use crate::error::{Result, ZipError};

use super::counting::CountingWriter;

/// Destination for archive bytes.
///
/// Abstracts over a single file, a bare stream and a set of split
/// volumes. Positions are reported as (disk, offset) pairs because that
/// is what directory records store; single-volume sinks always report
/// disk 0.
pub trait VolumeSink: Write {
    /// Volume index (0-based) currently receiving bytes.
    fn disk(&self) -> u32;

    /// Byte offset within the current volume.
    fn position(&mut self) -> Result<u64>;

    /// Whether committed bytes can be rewritten in place.
    fn can_patch(&self) -> bool;

    /// Rewrite committed bytes at (disk, offset), leaving the write
    /// cursor where it was.
    fn patch(&mut self, disk: u32, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Guarantee the next `len` bytes land in one volume, rolling early
    /// if needed. No-op for single-volume sinks.
    fn reserve_contiguous(&mut self, len: u64) -> Result<()>;
}

/// Seekable single-file sink; supports header patch-back.
pub struct SeekSink<W> {
    inner: W,
}

impl<W: Write + Seek> SeekSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> Write for SeekSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Seek> VolumeSink for SeekSink<W> {
    fn disk(&self) -> u32 {
        0
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    fn can_patch(&self) -> bool {
        true
    }

    fn patch(&mut self, _disk: u32, offset: u64, bytes: &[u8]) -> Result<()> {
        let here = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(bytes)?;
        self.inner.seek(SeekFrom::Start(here))?;
        Ok(())
    }

    fn reserve_contiguous(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// Forward-only sink; positions come from a byte counter and headers
/// cannot be patched, so entries carry trailing data descriptors.
pub struct StreamSink<W> {
    inner: CountingWriter<W>,
}

impl<W: Write> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: CountingWriter::new(inner),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: Write> Write for StreamSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> VolumeSink for StreamSink<W> {
    fn disk(&self) -> u32 {
        0
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.inner.bytes_written())
    }

    fn can_patch(&self) -> bool {
        false
    }

    fn patch(&mut self, _disk: u32, _offset: u64, _bytes: &[u8]) -> Result<()> {
        Err(ZipError::BadState("cannot patch a forward-only stream"))
    }

    fn reserve_contiguous(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_seek_sink_patches_in_place() {
        let mut sink = SeekSink::new(Cursor::new(Vec::new()));
        sink.write_all(b"AAAABBBBCCCC").unwrap();
        sink.patch(0, 4, b"XXXX").unwrap();
        assert_eq!(sink.position().unwrap(), 12);
        assert_eq!(sink.into_inner().into_inner(), b"AAAAXXXXCCCC");
    }

    #[test]
    fn test_stream_sink_counts_but_rejects_patch() {
        let mut sink = StreamSink::new(Vec::new());
        sink.write_all(b"12345").unwrap();
        assert_eq!(sink.position().unwrap(), 5);
        assert!(matches!(
            sink.patch(0, 0, b"x"),
            Err(ZipError::BadState(_))
        ));
    }
}
