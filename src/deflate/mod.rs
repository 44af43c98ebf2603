//! Raw DEFLATE codec with explicit buffer cursors and flush control.
//!
//! Wraps `flate2`'s low-level [`Compress`]/[`Decompress`] state machines
//! (raw streams, no zlib framing). Every operation consumes from a caller
//! input slice and produces into a caller output slice, reporting exact
//! byte counts, so callers control all buffering.
//!
//! ## Chunked compression
//!
//! [`deflate_chunk`] compresses one chunk with a fresh dictionary and a
//! trailing sync flush. Sync-flushed chunks are byte-aligned and end with
//! an empty stored block, so independently compressed chunks concatenate
//! into a single valid stream, terminated by [`finish_trailer`]. The
//! sequential writer and the parallel scheduler both emit through these
//! two functions, which is what makes their outputs byte-identical.

mod parallel;

pub use parallel::ParallelDeflater;

use std::io::{self, Read, Write};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Result, ZipError};

/// Entry compression level, mapped onto deflate levels 0/1/6/9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Deflate framing with stored blocks only.
    None,
    Fastest,
    #[default]
    Normal,
    Best,
}

impl CompressionLevel {
    pub(crate) fn to_flate2(self) -> Compression {
        match self {
            CompressionLevel::None => Compression::none(),
            CompressionLevel::Fastest => Compression::new(1),
            CompressionLevel::Normal => Compression::new(6),
            CompressionLevel::Best => Compression::new(9),
        }
    }
}

/// Flush behavior for one compression step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Accumulate; the codec may hold data back for better matches.
    None,
    /// Drive output to a byte boundary (empty stored block trailer).
    Sync,
    /// Terminate the stream.
    Finish,
}

impl Flush {
    fn to_flate2(self) -> FlushCompress {
        match self {
            Flush::None => FlushCompress::None,
            Flush::Sync => FlushCompress::Sync,
            Flush::Finish => FlushCompress::Finish,
        }
    }
}

/// Byte movement of one codec step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub consumed: usize,
    pub produced: usize,
    /// Stream end reached (Finish completed, or inflate hit the trailer).
    pub done: bool,
}

/// Worst-case compressed size for `n` input bytes through one
/// [`deflate_chunk`] call. Stored-block framing plus sync-flush slack.
pub fn deflate_bound(n: usize) -> usize {
    n + ((n / 32768) + 1) * 5 * 2
}

/// Streaming compressor. One instance drives one deflate stream across
/// any number of steps.
pub struct Deflater {
    raw: Compress,
}

impl Deflater {
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            raw: Compress::new(level.to_flate2(), false),
        }
    }

    /// Feed `input`, fill `output`, honoring `flush`. Either slice may be
    /// partially used; the returned [`Progress`] says how far each moved.
    pub fn step(&mut self, input: &[u8], output: &mut [u8], flush: Flush) -> Result<Progress> {
        let before_in = self.raw.total_in();
        let before_out = self.raw.total_out();
        let status = self
            .raw
            .compress(input, output, flush.to_flate2())
            .map_err(|e| ZipError::Format(format!("deflate: {e}")))?;
        Ok(Progress {
            consumed: (self.raw.total_in() - before_in) as usize,
            produced: (self.raw.total_out() - before_out) as usize,
            done: status == Status::StreamEnd,
        })
    }

    pub fn reset(&mut self) {
        self.raw.reset();
    }
}

/// Compress one chunk into `output` with a fresh dictionary and a
/// trailing sync flush. Returns the number of compressed bytes.
///
/// `output` must hold at least [`deflate_bound`] of the input length;
/// anything smaller is reported as a format error rather than silently
/// truncated output.
pub fn deflate_chunk(level: CompressionLevel, input: &[u8], output: &mut [u8]) -> Result<usize> {
    let mut deflater = Deflater::new(level);
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;

    while in_pos < input.len() {
        let p = deflater.step(&input[in_pos..], &mut output[out_pos..], Flush::None)?;
        in_pos += p.consumed;
        out_pos += p.produced;
        if p.consumed == 0 && p.produced == 0 {
            return Err(ZipError::Format("deflate: output buffer too small".into()));
        }
    }

    // byte-align the chunk so the next one can follow it
    loop {
        let p = deflater.step(&[], &mut output[out_pos..], Flush::Sync)?;
        out_pos += p.produced;
        if p.produced == 0 {
            break;
        }
    }

    Ok(out_pos)
}

/// Terminate a stream built from sync-flushed chunks. Emits the final
/// (empty) block that carries the stream-end marker.
pub fn finish_trailer(level: CompressionLevel) -> Result<Vec<u8>> {
    let mut deflater = Deflater::new(level);
    let mut buf = [0u8; 128];
    let mut len = 0usize;
    loop {
        let p = deflater.step(&[], &mut buf[len..], Flush::Finish)?;
        len += p.produced;
        if p.done {
            break;
        }
    }
    Ok(buf[..len].to_vec())
}

/// Totals reported when a deflate writer finishes its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateSummary {
    pub bytes_in: u64,
    /// Compressed bytes including the stream trailer.
    pub bytes_out: u64,
    pub crc: u32,
}

/// Sequential chunk-at-a-time deflate writer.
///
/// Buffers plaintext to `chunk_size`, compresses each full chunk through
/// [`deflate_chunk`] and ends the stream with [`finish_trailer`]. Chunk
/// boundaries depend only on the plaintext offsets, never on write call
/// sizes, so output is byte-identical to [`ParallelDeflater`] with the
/// same level and chunk size.
pub struct ChunkedDeflateWriter<W> {
    sink: W,
    level: CompressionLevel,
    chunk_size: usize,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    crc: u32,
    bytes_in: u64,
    bytes_out: u64,
}

/// Default plaintext chunk size for both deflate writers.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

impl<W: Write> ChunkedDeflateWriter<W> {
    pub fn new(sink: W, level: CompressionLevel) -> Self {
        Self::with_chunk_size(sink, level, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(sink: W, level: CompressionLevel, chunk_size: usize) -> Self {
        Self {
            sink,
            level,
            chunk_size,
            buf: Vec::with_capacity(chunk_size),
            scratch: Vec::new(),
            crc: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    fn emit_chunk(&mut self) -> Result<()> {
        self.scratch.clear();
        self.scratch.resize(deflate_bound(self.buf.len()), 0);
        let n = deflate_chunk(self.level, &self.buf, &mut self.scratch)?;
        self.sink.write_all(&self.scratch[..n])?;
        self.crc = crate::crc::combine(self.crc, crate::crc::hash(&self.buf), self.buf.len() as u64);
        self.bytes_in += self.buf.len() as u64;
        self.bytes_out += n as u64;
        self.buf.clear();
        Ok(())
    }

    /// Compress any buffered tail, terminate the stream, return the sink
    /// and the stream totals.
    pub fn finish(mut self) -> Result<(W, DeflateSummary)> {
        if !self.buf.is_empty() {
            self.emit_chunk()?;
        }
        let trailer = finish_trailer(self.level)?;
        self.sink.write_all(&trailer)?;
        self.bytes_out += trailer.len() as u64;
        let summary = DeflateSummary {
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            crc: self.crc,
        };
        Ok((self.sink, summary))
    }
}

impl<W: Write> Write for ChunkedDeflateWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.chunk_size {
                self.emit_chunk().map_err(io::Error::other)?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // partial chunks stay buffered so split points never drift
        self.sink.flush()
    }
}

/// Read decorator that inflates a raw deflate stream from `inner`.
///
/// Sits above the cipher layer in the extraction stack. Stops at the
/// stream-end marker; compressed bytes past it are left unread in the
/// internal buffer and reported via [`compressed_consumed`].
///
/// [`compressed_consumed`]: InflateReader::compressed_consumed
pub struct InflateReader<R> {
    inner: R,
    raw: Decompress,
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
    eof: bool,
    done: bool,
}

const INFLATE_BUF: usize = 32 * 1024;

impl<R: Read> InflateReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            raw: Decompress::new(false),
            buf: vec![0u8; INFLATE_BUF],
            pos: 0,
            cap: 0,
            eof: false,
            done: false,
        }
    }

    /// Compressed bytes consumed by the inflater so far.
    pub fn compressed_consumed(&self) -> u64 {
        self.raw.total_in()
    }

    /// Plaintext bytes produced so far.
    pub fn plain_produced(&self) -> u64 {
        self.raw.total_out()
    }

    pub fn stream_ended(&self) -> bool {
        self.done
    }
}

impl<R: Read> Read for InflateReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }

        loop {
            if self.pos == self.cap && !self.eof {
                self.cap = self.inner.read(&mut self.buf)?;
                self.pos = 0;
                if self.cap == 0 {
                    self.eof = true;
                }
            }

            let before_in = self.raw.total_in();
            let before_out = self.raw.total_out();
            let flush = if self.eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let status = self
                .raw
                .decompress(&self.buf[self.pos..self.cap], out, flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("inflate: {e}")))?;
            self.pos += (self.raw.total_in() - before_in) as usize;
            let produced = (self.raw.total_out() - before_out) as usize;

            if status == Status::StreamEnd {
                self.done = true;
                return Ok(produced);
            }
            if produced > 0 {
                return Ok(produced);
            }
            if self.eof && self.pos == self.cap {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "inflate: truncated deflate stream",
                ));
            }
        }
    }
}
