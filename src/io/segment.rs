//! Split-archive volume streams.
//!
//! A segmented archive stores its bytes across numbered volume files:
//! `archive.z01`, `archive.z02`, ... with the final segment carrying the
//! archive's own name. The writer fills one temporary file per segment
//! and seals it by renaming once the size cap is reached; the reader
//! chains the volumes back into one flat stream.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Result, ZipError};

use super::sink::VolumeSink;

/// Marker prefixing the first segment of a split archive.
const SPLIT_MARKER: [u8; 4] = [b'P', b'K', 0x07, 0x08];

/// Smallest accepted segment size cap.
pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;

/// Final path of volume `disk` (0-based) for an archive at `base`.
/// Every volume but the last swaps the extension for `.zNN`, 1-based.
pub fn segment_name(base: &Path, disk: u32) -> PathBuf {
    base.with_extension(format!("z{:02}", disk + 1))
}

/// Writer that splits output into capped volume files.
pub struct SegmentedWriter {
    base: PathBuf,
    dir: PathBuf,
    max_segment: u64,
    current: u32,
    temp_path: PathBuf,
    file: Option<File>,
    contiguous: bool,
}

impl SegmentedWriter {
    /// Start writing a split archive that will end up at `base`.
    /// The size cap applies to every volume; the split marker written to
    /// the first volume counts against its budget.
    pub fn create(base: &Path, max_segment: u64) -> Result<Self> {
        if max_segment < MIN_SEGMENT_SIZE {
            return Err(ZipError::BadState("segment size below 64 KiB"));
        }
        let dir = base.parent().unwrap_or(Path::new(".")).to_path_buf();
        let (temp_path, file) = create_temp(&dir, base)?;
        let mut w = Self {
            base: base.to_path_buf(),
            dir,
            max_segment,
            current: 0,
            temp_path,
            file: Some(file),
            contiguous: false,
        };
        w.file()?.write_all(&SPLIT_MARKER)?;
        Ok(w)
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or(ZipError::BadState("segmented writer already closed"))
    }

    /// While set, each write call lands whole in a single volume; the
    /// writer rolls to the next volume instead of splitting the block.
    pub fn set_contiguous(&mut self, on: bool) {
        self.contiguous = on;
    }

    fn remaining(&mut self) -> Result<u64> {
        let pos = self.file()?.stream_position()?;
        Ok(self.max_segment.saturating_sub(pos))
    }

    /// Seal the current temp file under its volume name and open a fresh
    /// temp for the next one.
    fn roll_over(&mut self) -> Result<()> {
        let (new_temp, new_file) = create_temp(&self.dir, &self.base)?;
        let sealed = segment_name(&self.base, self.current);
        let old = self.file.replace(new_file);
        drop(old);
        fs::rename(&self.temp_path, &sealed)?;
        debug!("segment {} sealed as {}", self.current, sealed.display());
        self.temp_path = new_temp;
        self.current += 1;
        Ok(())
    }

    /// Abandon bytes after (disk, offset): delete newer volumes, reopen
    /// the target volume as the active temp file and resume there.
    pub fn truncate_back(&mut self, disk: u32, offset: u64) -> Result<()> {
        if disk == self.current {
            let f = self.file()?;
            f.seek(SeekFrom::Start(offset))?;
            f.set_len(offset)?;
            return Ok(());
        }
        if disk > self.current {
            return Err(ZipError::BadState("cannot truncate forward"));
        }

        let old = self.file.take();
        drop(old);
        fs::remove_file(&self.temp_path)?;
        for d in (disk + 1)..self.current {
            fs::remove_file(segment_name(&self.base, d))?;
        }

        let target = segment_name(&self.base, disk);
        let (temp_path, _) = create_temp(&self.dir, &self.base)?;
        // the placeholder temp is replaced by the reopened volume
        fs::remove_file(&temp_path)?;
        fs::rename(&target, &temp_path)?;
        let mut f = OpenOptions::new().read(true).write(true).open(&temp_path)?;
        f.seek(SeekFrom::Start(offset))?;
        f.set_len(offset)?;
        debug!("truncated back to segment {} offset {}", disk, offset);
        self.temp_path = temp_path;
        self.file = Some(f);
        self.current = disk;
        Ok(())
    }

    /// Rename the final temp file to the archive's own name. Returns the
    /// total volume count.
    pub fn finish(mut self) -> Result<u32> {
        let f = self.file.take().ok_or(ZipError::BadState("already closed"))?;
        f.sync_all()?;
        drop(f);
        fs::rename(&self.temp_path, &self.base)?;
        debug!(
            "split archive complete: {} volumes at {}",
            self.current + 1,
            self.base.display()
        );
        Ok(self.current + 1)
    }
}

impl Drop for SegmentedWriter {
    fn drop(&mut self) {
        if let Some(f) = self.file.take() {
            drop(f);
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

fn create_temp(dir: &Path, base: &Path) -> Result<(PathBuf, File)> {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    for _ in 0..16 {
        let name = format!(".{}-{:08x}.tmp", stem, rand::random::<u32>());
        let path = dir.join(name);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => return Ok((path, f)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ZipError::BadState("could not create a unique temp file"))
}

impl Write for SegmentedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let write_err = |e: ZipError| io::Error::other(e);

        if self.contiguous {
            // roll rather than split; an oversized block may exceed the
            // cap but never straddles two volumes
            let remaining = self.remaining().map_err(write_err)?;
            if (buf.len() as u64) > remaining {
                self.roll_over().map_err(write_err)?;
            }
            self.file().map_err(write_err)?.write_all(buf)?;
            return Ok(buf.len());
        }

        let mut rest = buf;
        while !rest.is_empty() {
            let remaining = self.remaining().map_err(write_err)?;
            if remaining == 0 {
                self.roll_over().map_err(write_err)?;
                continue;
            }
            let take = (remaining as usize).min(rest.len());
            self.file().map_err(write_err)?.write_all(&rest[..take])?;
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl VolumeSink for SegmentedWriter {
    fn disk(&self) -> u32 {
        self.current
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.file()?.stream_position()?)
    }

    fn can_patch(&self) -> bool {
        true
    }

    fn patch(&mut self, disk: u32, offset: u64, bytes: &[u8]) -> Result<()> {
        if disk == self.current {
            let f = self.file()?;
            let here = f.stream_position()?;
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(bytes)?;
            f.seek(SeekFrom::Start(here))?;
            return Ok(());
        }
        // sealed volumes are plain files again
        let mut f = OpenOptions::new()
            .write(true)
            .open(segment_name(&self.base, disk))?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(bytes)?;
        Ok(())
    }

    fn reserve_contiguous(&mut self, len: u64) -> Result<()> {
        if len > self.remaining()? {
            self.roll_over()?;
        }
        Ok(())
    }
}

/// Reader presenting split volumes as one flat, seekable stream.
pub struct SegmentedReader {
    base: PathBuf,
    /// Logical start offset of each volume; last element is total size.
    starts: Vec<u64>,
    total_disks: u32,
    current: u32,
    file: File,
    logical_pos: u64,
}

impl SegmentedReader {
    /// Open all volumes of a split archive whose last segment is `base`.
    pub fn open(base: &Path, total_disks: u32) -> Result<Self> {
        if total_disks == 0 {
            return Err(ZipError::Format("archive claims zero volumes".into()));
        }
        let mut starts = Vec::with_capacity(total_disks as usize + 1);
        let mut total = 0u64;
        for d in 0..total_disks {
            starts.push(total);
            total += fs::metadata(volume_path(base, d, total_disks))?.len();
        }
        starts.push(total);

        let file = File::open(volume_path(base, 0, total_disks))?;
        Ok(Self {
            base: base.to_path_buf(),
            starts,
            total_disks,
            current: 0,
            file,
            logical_pos: 0,
        })
    }

    /// Logical offset of a (disk, offset) pair from a directory record.
    pub fn logical_offset(&self, disk: u32, offset: u64) -> u64 {
        match self.starts.get(disk as usize) {
            Some(s) => s + offset,
            None => offset,
        }
    }

    /// Logical start offset of each volume.
    pub fn disk_starts(&self) -> &[u64] {
        &self.starts[..self.total_disks as usize]
    }

    fn total_len(&self) -> u64 {
        *self.starts.last().unwrap_or(&0)
    }

    fn open_disk(&mut self, disk: u32, offset_in_disk: u64) -> io::Result<()> {
        if disk != self.current {
            self.file = File::open(volume_path(&self.base, disk, self.total_disks))?;
            self.current = disk;
        }
        self.file.seek(SeekFrom::Start(offset_in_disk))?;
        Ok(())
    }
}

fn volume_path(base: &Path, disk: u32, total_disks: u32) -> PathBuf {
    if disk + 1 == total_disks {
        base.to_path_buf()
    } else {
        segment_name(base, disk)
    }
}

impl Read for SegmentedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.file.read(buf)?;
            if n > 0 {
                self.logical_pos += n as u64;
                return Ok(n);
            }
            if self.current + 1 >= self.total_disks {
                return Ok(0);
            }
            let next = self.current + 1;
            self.open_disk(next, 0)?;
        }
    }
}

impl Seek for SegmentedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(d) => self.total_len() as i128 + d as i128,
            SeekFrom::Current(d) => self.logical_pos as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of archive",
            ));
        }
        let target = target as u64;

        // find the volume containing the target offset
        let disk = match self.starts[..self.total_disks as usize]
            .iter()
            .rposition(|&s| s <= target)
        {
            Some(d) => d as u32,
            None => 0,
        };
        self.open_disk(disk, target - self.starts[disk as usize])?;
        self.logical_pos = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "zipforge-seg-{tag}-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_write_splits_into_volumes() {
        let dir = temp_dir("split");
        let base = dir.join("archive.zip");

        let mut w = SegmentedWriter::create(&base, MIN_SEGMENT_SIZE).unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        w.write_all(&payload).unwrap();
        let disks = w.finish().unwrap();

        // 4 bytes of marker + 200000 bytes over 64 KiB volumes
        assert_eq!(disks, 4);
        assert!(segment_name(&base, 0).exists());
        assert!(segment_name(&base, 1).exists());
        assert!(segment_name(&base, 2).exists());
        assert!(base.exists());
        assert_eq!(fs::metadata(segment_name(&base, 0)).unwrap().len(), MIN_SEGMENT_SIZE);

        // reading chains the volumes back together, marker first
        let mut r = SegmentedReader::open(&base, disks).unwrap();
        let mut back = Vec::new();
        r.read_to_end(&mut back).unwrap();
        assert_eq!(&back[..4], &SPLIT_MARKER);
        assert_eq!(&back[4..], &payload[..]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_segment_names_are_two_digit() {
        let base = Path::new("/tmp/foo.zip");
        assert_eq!(segment_name(base, 0), Path::new("/tmp/foo.z01"));
        assert_eq!(segment_name(base, 9), Path::new("/tmp/foo.z10"));
        assert_eq!(segment_name(base, 98), Path::new("/tmp/foo.z99"));
    }

    #[test]
    fn test_contiguous_reserve_rolls_early() {
        let dir = temp_dir("contig");
        let base = dir.join("a.zip");

        let mut w = SegmentedWriter::create(&base, MIN_SEGMENT_SIZE).unwrap();
        let fill = vec![0u8; MIN_SEGMENT_SIZE as usize - 100];
        w.write_all(&fill).unwrap();

        // 200 bytes no longer fit; the reservation must roll first
        w.reserve_contiguous(200).unwrap();
        assert_eq!(w.disk(), 1);
        assert_eq!(w.position().unwrap(), 0);
        w.write_all(&[7u8; 200]).unwrap();

        // contiguous mode rolls on its own instead of splitting
        w.set_contiguous(true);
        let fill = vec![3u8; MIN_SEGMENT_SIZE as usize - 250];
        w.write_all(&fill).unwrap();
        assert_eq!(w.disk(), 1);
        w.write_all(&[4u8; 300]).unwrap();
        assert_eq!(w.disk(), 2);
        assert_eq!(w.position().unwrap(), 300);
        w.set_contiguous(false);

        let disks = w.finish().unwrap();
        assert_eq!(disks, 3);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_truncate_back_discards_newer_volumes() {
        let dir = temp_dir("trunc");
        let base = dir.join("t.zip");

        let mut w = SegmentedWriter::create(&base, MIN_SEGMENT_SIZE).unwrap();
        w.write_all(&vec![1u8; 3 * MIN_SEGMENT_SIZE as usize / 2]).unwrap();
        assert_eq!(w.disk(), 1);

        w.truncate_back(0, 1000).unwrap();
        assert_eq!(w.disk(), 0);
        assert_eq!(w.position().unwrap(), 1000);
        assert!(!segment_name(&base, 0).exists());

        w.write_all(&[9u8; 16]).unwrap();
        let disks = w.finish().unwrap();
        assert_eq!(disks, 1);
        assert_eq!(fs::metadata(&base).unwrap().len(), 1016);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_patch_reaches_sealed_volume() {
        let dir = temp_dir("patch");
        let base = dir.join("p.zip");

        let mut w = SegmentedWriter::create(&base, MIN_SEGMENT_SIZE).unwrap();
        w.write_all(&vec![0xAAu8; 2 * MIN_SEGMENT_SIZE as usize]).unwrap();
        assert!(w.disk() >= 1);

        w.patch(0, 10, b"PATCH").unwrap();
        let disks = w.finish().unwrap();

        let mut r = SegmentedReader::open(&base, disks).unwrap();
        r.seek(SeekFrom::Start(10)).unwrap();
        let mut got = [0u8; 5];
        r.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"PATCH");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_reader_seeks_across_boundaries() {
        let dir = temp_dir("seek");
        let base = dir.join("s.zip");

        let payload: Vec<u8> = (0..180_000u32).map(|i| (i % 251) as u8).collect();
        let mut w = SegmentedWriter::create(&base, MIN_SEGMENT_SIZE).unwrap();
        w.write_all(&payload).unwrap();
        let disks = w.finish().unwrap();

        let mut r = SegmentedReader::open(&base, disks).unwrap();
        // logical offset 4 skips the split marker
        let probe = 100_000usize;
        r.seek(SeekFrom::Start(4 + probe as u64)).unwrap();
        let mut got = [0u8; 8];
        r.read_exact(&mut got).unwrap();
        assert_eq!(&got, &payload[probe..probe + 8]);

        let end = r.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(end, 4 + payload.len() as u64);

        fs::remove_dir_all(&dir).unwrap();
    }
}
