//! Parallel deflate scheduler.
//!
//! Splits the plaintext stream into fixed-size chunks, compresses them on
//! worker threads and re-serializes the results in ordinal order, so the
//! output bytes match the sequential [`ChunkedDeflateWriter`] exactly.
//!
//! [`ChunkedDeflateWriter`]: super::ChunkedDeflateWriter
//!
//! A bounded pool of work items circulates through three channels:
//!
//! ```text
//! free pool ─→ caller fills ─→ work queue ─→ workers compress
//!     ↑                                          │
//!     └────────── emitter writes in order ←──────┘ (ready queue)
//! ```
//!
//! The caller's thread is the only filler and the only emitter; workers
//! only compress. Ordering is enforced at the emitter alone: an item
//! arriving ahead of its turn parks in a map until the missing ordinal
//! shows up. Worker failures ride the ready queue as `Err` values and
//! surface on the caller's next interaction.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use log::debug;

use crate::crc;
use crate::error::{Result, ZipError};

use super::{
    CompressionLevel, DEFAULT_CHUNK_SIZE, DeflateSummary, deflate_bound, deflate_chunk,
    finish_trailer,
};

/// Work item pool sizing: pairs per compute unit, overall cap and floor.
const PAIRS_PER_CPU: usize = 4;
const DEFAULT_MAX_PAIRS: usize = 16;
const MIN_PAIRS: usize = 4;

#[derive(Debug)]
struct WorkItem {
    ordinal: u64,
    buffer: Vec<u8>,
    compressed: Vec<u8>,
    crc: u32,
}

impl WorkItem {
    fn new(chunk_size: usize) -> Self {
        Self {
            ordinal: 0,
            buffer: Vec::with_capacity(chunk_size),
            compressed: Vec::with_capacity(deflate_bound(chunk_size)),
            crc: 0,
        }
    }
}

type ReadyResult = std::result::Result<WorkItem, ZipError>;

#[derive(Debug)]
struct Pipeline {
    free_tx: Sender<WorkItem>,
    free_rx: Receiver<WorkItem>,
    /// Taken (closed) when input ends so workers drain and exit.
    work_tx: Option<Sender<WorkItem>>,
    ready_rx: Receiver<ReadyResult>,
    workers: Vec<JoinHandle<()>>,
}

/// Write decorator compressing through a worker pool.
///
/// Plaintext written here comes out of `finish` as one raw deflate
/// stream on the sink, with totals and the combined CRC. Configuration
/// must happen before the first write; the pool spins up lazily.
#[derive(Debug)]
pub struct ParallelDeflater<W> {
    sink: Option<W>,
    level: CompressionLevel,
    chunk_size: usize,
    max_pairs: usize,
    pipeline: Option<Pipeline>,
    current: Option<WorkItem>,
    next_ordinal: u64,
    next_to_write: u64,
    parked: BTreeMap<u64, WorkItem>,
    crc: u32,
    bytes_in: u64,
    bytes_out: u64,
    failed: Option<ZipError>,
}

impl<W: Write> ParallelDeflater<W> {
    pub fn new(sink: W, level: CompressionLevel) -> Self {
        Self {
            sink: Some(sink),
            level,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_pairs: DEFAULT_MAX_PAIRS,
            pipeline: None,
            current: None,
            next_ordinal: 0,
            next_to_write: 0,
            parked: BTreeMap::new(),
            crc: 0,
            bytes_in: 0,
            bytes_out: 0,
            failed: None,
        }
    }

    /// Set the plaintext chunk size. Must match the sequential writer's
    /// chunk size for byte-identical output. Minimum 1 KiB.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if self.pipeline.is_some() {
            return Err(ZipError::BadState("chunk size set after writing began"));
        }
        if chunk_size < 1024 {
            return Err(ZipError::BadState("chunk size below 1 KiB"));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    /// Cap the work item pool. Values below 4 are rejected.
    pub fn with_max_buffer_pairs(mut self, pairs: usize) -> Result<Self> {
        if self.pipeline.is_some() {
            return Err(ZipError::BadState("pool size set after writing began"));
        }
        if pairs < MIN_PAIRS {
            return Err(ZipError::BadState("buffer pair count below 4"));
        }
        self.max_pairs = pairs;
        Ok(self)
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }

        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let pool = (cpus * PAIRS_PER_CPU).clamp(MIN_PAIRS, self.max_pairs);
        let worker_count = cpus.min(pool);

        let (free_tx, free_rx) = bounded::<WorkItem>(pool);
        let (work_tx, work_rx) = bounded::<WorkItem>(pool);
        // pool items plus one terminal error per worker always fit
        let (ready_tx, ready_rx) = bounded::<ReadyResult>(pool + worker_count);

        for _ in 0..pool {
            free_tx
                .send(WorkItem::new(self.chunk_size))
                .map_err(|_| ZipError::BadState("work item pool rejected seed items"))?;
        }

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let work_rx = work_rx.clone();
            let ready_tx = ready_tx.clone();
            let level = self.level;
            workers.push(thread::spawn(move || {
                while let Ok(mut item) = work_rx.recv() {
                    item.crc = crc::hash(&item.buffer);
                    item.compressed.clear();
                    item.compressed.resize(deflate_bound(item.buffer.len()), 0);
                    match deflate_chunk(level, &item.buffer, &mut item.compressed) {
                        Ok(n) => {
                            item.compressed.truncate(n);
                            if ready_tx.send(Ok(item)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            break;
                        }
                    }
                }
            }));
        }

        debug!(
            "parallel deflate: {} workers, {} buffer pairs, {} byte chunks",
            worker_count, pool, self.chunk_size
        );

        self.pipeline = Some(Pipeline {
            free_tx,
            free_rx,
            work_tx: Some(work_tx),
            ready_rx,
            workers,
        });
        Ok(())
    }

    /// Borrow a free item, waiting on the emitter side when the pool has
    /// all items in flight.
    fn acquire_item(&mut self) -> Result<WorkItem> {
        loop {
            let pl = self
                .pipeline
                .as_ref()
                .ok_or(ZipError::BadState("scheduler not started"))?;
            match pl.free_rx.try_recv() {
                Ok(mut item) => {
                    item.ordinal = self.next_ordinal;
                    self.next_ordinal += 1;
                    item.buffer.clear();
                    return Ok(item);
                }
                Err(TryRecvError::Empty) => self.drain_ready(true)?,
                Err(TryRecvError::Disconnected) => {
                    return Err(ZipError::BadState("work item pool disconnected"));
                }
            }
        }
    }

    fn submit(&mut self, item: WorkItem) -> Result<()> {
        let pl = self
            .pipeline
            .as_ref()
            .ok_or(ZipError::BadState("scheduler not started"))?;
        let tx = pl
            .work_tx
            .as_ref()
            .ok_or(ZipError::BadState("write after finish began"))?;
        tx.send(item)
            .map_err(|_| ZipError::BadState("compression workers exited early"))
    }

    /// Pull completed items from the workers. With `block` set, waits
    /// until at least one item has been written and recycled.
    fn drain_ready(&mut self, block: bool) -> Result<()> {
        let mut freed = false;
        loop {
            loop {
                let pl = self
                    .pipeline
                    .as_ref()
                    .ok_or(ZipError::BadState("scheduler not started"))?;
                match pl.ready_rx.try_recv() {
                    Ok(res) => {
                        let item = res?;
                        self.parked.insert(item.ordinal, item);
                    }
                    Err(_) => break,
                }
            }
            freed |= self.write_in_order()?;
            if !block || freed {
                return Ok(());
            }

            let pl = self
                .pipeline
                .as_ref()
                .ok_or(ZipError::BadState("scheduler not started"))?;
            match pl.ready_rx.recv() {
                Ok(res) => {
                    let item = res?;
                    self.parked.insert(item.ordinal, item);
                }
                Err(_) => return Err(ZipError::BadState("compression workers exited early")),
            }
        }
    }

    /// Emit every parked item that is next in line; recycle its buffers.
    fn write_in_order(&mut self) -> Result<bool> {
        let mut wrote = false;
        while let Some(mut item) = self.parked.remove(&self.next_to_write) {
            let sink = self
                .sink
                .as_mut()
                .ok_or(ZipError::BadState("sink already taken"))?;
            sink.write_all(&item.compressed)?;
            self.crc = crc::combine(self.crc, item.crc, item.buffer.len() as u64);
            self.bytes_in += item.buffer.len() as u64;
            self.bytes_out += item.compressed.len() as u64;
            self.next_to_write += 1;
            wrote = true;

            item.buffer.clear();
            item.compressed.clear();
            if let Some(pl) = self.pipeline.as_ref() {
                let _ = pl.free_tx.send(item);
            }
        }
        Ok(wrote)
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<usize> {
        if let Some(e) = self.failed.take() {
            self.failed = Some(ZipError::BadState("scheduler failed earlier"));
            return Err(e);
        }
        self.ensure_started()?;

        let mut rest = data;
        while !rest.is_empty() {
            if self.current.is_none() {
                self.current = Some(self.acquire_item()?);
            }
            let item = self
                .current
                .as_mut()
                .ok_or(ZipError::BadState("no active work item"))?;
            let room = self.chunk_size - item.buffer.len();
            let take = room.min(rest.len());
            item.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if item.buffer.len() == self.chunk_size {
                let full = self
                    .current
                    .take()
                    .ok_or(ZipError::BadState("no active work item"))?;
                self.submit(full)?;
            }
        }
        self.drain_ready(false)?;
        Ok(data.len())
    }

    /// Drain the pipeline, terminate the deflate stream, return the sink
    /// and stream totals.
    pub fn finish(mut self) -> Result<(W, DeflateSummary)> {
        if let Some(e) = self.failed.take() {
            return Err(e);
        }

        if self.pipeline.is_some() {
            if let Some(item) = self.current.take() {
                self.submit(item)?;
            }
            if let Some(pl) = self.pipeline.as_mut() {
                pl.work_tx.take();
            }
            while self.next_to_write < self.next_ordinal {
                self.drain_ready(true)?;
            }
            if let Some(pl) = self.pipeline.as_mut() {
                for h in pl.workers.drain(..) {
                    let _ = h.join();
                }
            }
        }

        let trailer = finish_trailer(self.level)?;
        let sink = self
            .sink
            .as_mut()
            .ok_or(ZipError::BadState("sink already taken"))?;
        sink.write_all(&trailer)?;
        self.bytes_out += trailer.len() as u64;

        debug!(
            "parallel deflate: {} bytes in, {} bytes out",
            self.bytes_in, self.bytes_out
        );

        let summary = DeflateSummary {
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            crc: self.crc,
        };
        let sink = self
            .sink
            .take()
            .ok_or(ZipError::BadState("sink already taken"))?;
        Ok((sink, summary))
    }
}

impl<W: Write> Write for ParallelDeflater<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let res = self.write_inner(data);
        if res.is_err() {
            self.failed = Some(ZipError::BadState("scheduler failed earlier"));
        }
        res.map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        // partial chunks stay buffered so split points never drift
        self.drain_ready(false).map_err(io::Error::other)?;
        match self.sink.as_mut() {
            Some(s) => s.flush(),
            None => Ok(()),
        }
    }
}

impl<W> Drop for ParallelDeflater<W> {
    fn drop(&mut self) {
        if let Some(pl) = self.pipeline.as_mut() {
            pl.work_tx.take();
            // the ready queue can hold every live item, so workers
            // finish their sends and exit once the work queue closes
            for h in pl.workers.drain(..) {
                let _ = h.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::{ChunkedDeflateWriter, InflateReader};
    use std::io::{Cursor, Read};

    fn inflate_all(compressed: &[u8]) -> Vec<u8> {
        let mut r = InflateReader::new(Cursor::new(compressed));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    fn mixed_payload(len: usize) -> Vec<u8> {
        // compressible runs broken up by a counter so chunks differ
        (0..len)
            .map(|i| if i % 7 == 0 { (i / 7 % 256) as u8 } else { 0x42 })
            .collect()
    }

    #[test]
    fn test_roundtrip_and_crc() {
        let input = mixed_payload(500_000);
        let mut w = ParallelDeflater::new(Vec::new(), CompressionLevel::Normal);
        w.write_all(&input).unwrap();
        let (compressed, summary) = w.finish().unwrap();

        assert_eq!(summary.bytes_in, input.len() as u64);
        assert_eq!(summary.bytes_out, compressed.len() as u64);
        assert_eq!(summary.crc, crc::hash(&input));
        assert_eq!(inflate_all(&compressed), input);
    }

    #[test]
    fn test_matches_sequential_writer_byte_for_byte() {
        let input = mixed_payload(777_777);

        let mut par = ParallelDeflater::new(Vec::new(), CompressionLevel::Fastest)
            .with_chunk_size(32 * 1024)
            .unwrap();
        for piece in input.chunks(10_001) {
            par.write_all(piece).unwrap();
        }
        let (par_bytes, par_summary) = par.finish().unwrap();

        let mut seq =
            ChunkedDeflateWriter::with_chunk_size(Vec::new(), CompressionLevel::Fastest, 32 * 1024);
        seq.write_all(&input).unwrap();
        let (seq_bytes, seq_summary) = seq.finish().unwrap();

        assert_eq!(par_bytes, seq_bytes);
        assert_eq!(par_summary, seq_summary);
    }

    #[test]
    fn test_empty_input_emits_valid_stream() {
        let w = ParallelDeflater::new(Vec::new(), CompressionLevel::Normal);
        let (compressed, summary) = w.finish().unwrap();
        assert_eq!(summary.bytes_in, 0);
        assert_eq!(summary.crc, 0);
        assert!(inflate_all(&compressed).is_empty());
    }

    #[test]
    fn test_single_partial_chunk() {
        let input = b"smaller than any chunk".to_vec();
        let mut w = ParallelDeflater::new(Vec::new(), CompressionLevel::Best);
        w.write_all(&input).unwrap();
        let (compressed, summary) = w.finish().unwrap();
        assert_eq!(summary.crc, crc::hash(&input));
        assert_eq!(inflate_all(&compressed), input);
    }

    #[test]
    fn test_config_rejects_tiny_pool() {
        let err = ParallelDeflater::new(Vec::new(), CompressionLevel::Normal)
            .with_max_buffer_pairs(2)
            .unwrap_err();
        assert!(matches!(err, ZipError::BadState(_)));
    }

    #[test]
    fn test_config_locked_after_first_write() {
        let mut w = ParallelDeflater::new(Vec::new(), CompressionLevel::Normal);
        w.write_all(b"x").unwrap();
        let err = w.with_chunk_size(2048).unwrap_err();
        assert!(matches!(err, ZipError::BadState(_)));
    }

    #[test]
    fn test_many_chunks_stay_ordered() {
        // enough chunks that out-of-order completion is overwhelmingly likely
        let input = mixed_payload(2_000_000);
        let mut w = ParallelDeflater::new(Vec::new(), CompressionLevel::Fastest)
            .with_chunk_size(4096)
            .unwrap();
        w.write_all(&input).unwrap();
        let (compressed, _) = w.finish().unwrap();
        assert_eq!(inflate_all(&compressed), input);
    }
}
