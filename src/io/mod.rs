//! Byte-stream plumbing underneath the archive engine.
//!
//! This module keeps the format logic in `zip` free of storage concerns:
//! - [`CountingWriter`] tracks how many bytes passed through a sink
//! - [`VolumeSink`] is the seam the archive writer emits into, with
//!   [`SeekSink`] (patchable files), [`StreamSink`] (forward-only pipes)
//!   and [`SegmentedWriter`] (split volumes) behind it
//! - [`SegmentedReader`] chains split volumes back into one stream
//! - [`RetryReader`] rides out transient sharing violations on reads

use std::io::{self, Read};
use std::time::Duration;

use log::warn;

mod counting;
mod segment;
mod sink;

pub use counting::CountingWriter;
pub use segment::{segment_name, SegmentedReader, SegmentedWriter, MIN_SEGMENT_SIZE};
pub use sink::{SeekSink, StreamSink, VolumeSink};

/// Total read attempts before a retryable error is surfaced.
const MAX_READ_ATTEMPTS: u32 = 10;

/// Reader that retries reads interrupted by file-sharing contention.
///
/// Backup agents and virus scanners briefly lock files mid-read; those
/// failures show up as lock violations (OS error 33) or `WouldBlock`.
/// Each retry backs off a little longer than the last.
pub struct RetryReader<R> {
    inner: R,
    sleep: fn(Duration),
}

impl<R: Read> RetryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            sleep: std::thread::sleep,
        }
    }

    #[cfg(test)]
    fn with_sleep(inner: R, sleep: fn(Duration)) -> Self {
        Self { inner, sleep }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn retryable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(33)
}

impl<R: Read> Read for RetryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut attempt = 0u32;
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if retryable(&e) && attempt + 1 < MAX_READ_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        "read blocked ({}), attempt {}/{}",
                        e, attempt, MAX_READ_ATTEMPTS
                    );
                    (self.sleep)(Duration::from_millis(250 + u64::from(attempt) * 550));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
