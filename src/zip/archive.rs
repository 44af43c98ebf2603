//! High-level archive model: open, edit, save.
//!
//! An [`Archive`] is an edit buffer over an optional backing store. Opening
//! reads only the central directory; entry payloads stay on disk until a
//! save or an extraction touches them. Saving walks the entry list once:
//!
//! 1. Entries kept from the backing archive are copied raw, compressed
//!    bytes verbatim, so a resave never recompresses and never needs the
//!    password of entries it leaves alone.
//! 2. Fresh entries (bytes, files, readers, directories) run through the
//!    compression and cipher stack.
//! 3. File saves go to a sibling temp file (or temp volumes) renamed into
//!    place on success, so a failed save cannot eat the original.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;

use crate::crc::CrcWriter;
use crate::crypto::{CipherReader, ZipCrypto, ENCRYPTION_HEADER_LEN};
use crate::deflate::{CompressionLevel, InflateReader};
use crate::error::{Result, ZipError};
use crate::io::{
    segment_name, RetryReader, SeekSink, SegmentedReader, SegmentedWriter, StreamSink, VolumeSink,
    MIN_SEGMENT_SIZE,
};

use super::reader::{
    append_copy_to_name, find_eocd, payload_offset, read_archive, ArchiveIndex,
    DuplicateNameMode, MAX_COPY_RENAMES,
};
use super::structures::{
    CompressionMethod, DosDateTime, EncryptionMethod, Zip64EOCDLocator, ATTR_ARCHIVE,
    ATTR_DIRECTORY, FLAG_ENCRYPTED, FLAG_STRONG_ENCRYPTION,
};
use super::writer::{
    ArchiveWriter, EntryPayload, PendingEntry, SaveOptions, WriteSummary, Zip64Mode,
};

trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Knobs that shape how an archive is read and written.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub level: CompressionLevel,
    pub zip64: Zip64Mode,
    pub duplicates: DuplicateNameMode,
    pub encryption: EncryptionMethod,
    pub password: Option<Vec<u8>>,
    /// Split the archive into volumes of this size; `None` writes one file.
    pub segment_size: Option<u64>,
    pub parallel: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Normal,
            zip64: Zip64Mode::AsNeeded,
            duplicates: DuplicateNameMode::Rename,
            encryption: EncryptionMethod::None,
            password: None,
            segment_size: None,
            parallel: true,
        }
    }
}

/// Where an entry's bytes live between open and save.
enum EntrySource {
    Bytes(Vec<u8>),
    File(PathBuf),
    /// Consumed on first save; a stream cannot be replayed.
    Reader(Option<Box<dyn Read>>),
    Directory,
    Stored(StoredEntry),
}

/// Coordinates and numbers of an entry inside the backing archive.
#[derive(Debug, Clone)]
struct StoredEntry {
    /// Logical offset of the local header in the flattened volume stream.
    lfh_offset: u64,
    method: CompressionMethod,
    flags: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    encryption: EncryptionMethod,
}

/// One archive member.
pub struct Entry {
    name: String,
    source: EntrySource,
    dos: DosDateTime,
    mtime: Option<SystemTime>,
    comment: String,
    external_attrs: u32,
}

impl Entry {
    fn fresh(name: String, source: EntrySource) -> Self {
        let external_attrs = match source {
            EntrySource::Directory => ATTR_DIRECTORY,
            _ => ATTR_ARCHIVE,
        };
        Self {
            name,
            source,
            dos: DosDateTime::now(),
            mtime: Some(SystemTime::now()),
            comment: String::new(),
            external_attrs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.source, EntrySource::Directory) || self.name.ends_with('/')
    }

    /// True for entries whose stored bytes are enciphered.
    pub fn is_encrypted(&self) -> bool {
        match &self.source {
            EntrySource::Stored(meta) => meta.encryption.is_some(),
            _ => false,
        }
    }

    /// Compression method, known once the entry has been serialized.
    pub fn method(&self) -> Option<CompressionMethod> {
        match &self.source {
            EntrySource::Stored(meta) => Some(meta.method),
            EntrySource::Directory => Some(CompressionMethod::Stored),
            _ => None,
        }
    }

    pub fn compressed_size(&self) -> Option<u64> {
        match &self.source {
            EntrySource::Stored(meta) => Some(meta.compressed_size),
            EntrySource::Directory => Some(0),
            _ => None,
        }
    }

    pub fn uncompressed_size(&self) -> Option<u64> {
        match &self.source {
            EntrySource::Stored(meta) => Some(meta.uncompressed_size),
            EntrySource::Bytes(b) => Some(b.len() as u64),
            EntrySource::Directory => Some(0),
            _ => None,
        }
    }

    pub fn crc32(&self) -> Option<u32> {
        match &self.source {
            EntrySource::Stored(meta) => Some(meta.crc32),
            _ => None,
        }
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.mtime
    }

    pub fn dos_datetime(&self) -> DosDateTime {
        self.dos
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }
}

enum ArchiveSource {
    Detached,
    File { base: PathBuf, disks: u32 },
    Stream(Box<dyn ReadSeek>),
}

/// An editable ZIP archive.
pub struct Archive {
    options: ArchiveOptions,
    entries: Vec<Entry>,
    comment: Vec<u8>,
    source: ArchiveSource,
    zip64: bool,
    total_disks: u32,
    recovered: bool,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

impl Archive {
    /// Empty archive with default options.
    pub fn new() -> Self {
        Self::with_options(ArchiveOptions::default())
    }

    pub fn with_options(options: ArchiveOptions) -> Self {
        Self {
            options,
            entries: Vec::new(),
            comment: Vec::new(),
            source: ArchiveSource::Detached,
            zip64: false,
            total_disks: 1,
            recovered: false,
        }
    }

    /// Open an archive file, following split volumes when the trailer
    /// says there are several.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ArchiveOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: ArchiveOptions) -> Result<Self> {
        let base = path.as_ref().to_path_buf();
        let mut file = File::open(&base)?;
        let disks = probe_total_disks(&mut file)?;
        let (index, source) = if disks > 1 {
            drop(file);
            let mut seg = SegmentedReader::open(&base, disks)?;
            let starts = seg.disk_starts().to_vec();
            let index = read_archive(&mut seg, &starts, options.duplicates)?;
            (index, ArchiveSource::File { base, disks })
        } else {
            let index = read_archive(&mut file, &[], options.duplicates)?;
            (index, ArchiveSource::File { base, disks: 1 })
        };
        Ok(Self::from_index(index, options, source))
    }

    /// Read an archive from any seekable stream. The stream is treated as
    /// a single volume; split archives must be opened by path.
    pub fn read_from<R: Read + Seek + 'static>(reader: R) -> Result<Self> {
        Self::read_from_with(reader, ArchiveOptions::default())
    }

    pub fn read_from_with<R: Read + Seek + 'static>(
        reader: R,
        options: ArchiveOptions,
    ) -> Result<Self> {
        let mut boxed: Box<dyn ReadSeek> = Box::new(reader);
        let index = read_archive(&mut boxed, &[], options.duplicates)?;
        Ok(Self::from_index(index, options, ArchiveSource::Stream(boxed)))
    }

    fn from_index(index: ArchiveIndex, options: ArchiveOptions, source: ArchiveSource) -> Self {
        let entries = index
            .entries
            .into_iter()
            .map(|raw| {
                let entry_source = if raw.is_directory {
                    EntrySource::Directory
                } else {
                    EntrySource::Stored(StoredEntry {
                        lfh_offset: raw.lfh_offset,
                        method: raw.method,
                        flags: raw.flags,
                        crc32: raw.crc32,
                        compressed_size: raw.compressed_size,
                        uncompressed_size: raw.uncompressed_size,
                        encryption: raw.encryption,
                    })
                };
                Entry {
                    name: raw.name,
                    source: entry_source,
                    dos: DosDateTime {
                        time: raw.dos_time,
                        date: raw.dos_date,
                    },
                    mtime: Some(raw.mtime),
                    comment: raw.comment,
                    external_attrs: raw.external_attrs,
                }
            })
            .collect::<Vec<_>>();
        debug!(
            "opened archive: {} entries across {} volume(s){}",
            entries.len(),
            index.total_disks,
            if index.recovered_by_scan {
                ", index rebuilt by scan"
            } else {
                ""
            }
        );
        Self {
            options,
            entries,
            comment: index.comment,
            source,
            zip64: index.zip64,
            total_disks: index.total_disks,
            recovered: index.recovered_by_scan,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<Vec<u8>>) {
        self.comment = comment.into();
    }

    /// True when the source archive carried any ZIP64 record.
    pub fn is_zip64(&self) -> bool {
        self.zip64
    }

    pub fn total_disks(&self) -> u32 {
        self.total_disks
    }

    /// True when the index was rebuilt by scanning local headers because
    /// the central directory was missing or damaged.
    pub fn recovered_from_scan(&self) -> bool {
        self.recovered
    }

    /// Convenience: setting a password turns on ZipCrypto when no cipher
    /// was chosen yet; `None` clears the password but keeps the cipher
    /// selection.
    pub fn set_password(&mut self, password: Option<Vec<u8>>) {
        if password.is_some() && self.options.encryption == EncryptionMethod::None {
            self.options.encryption = EncryptionMethod::ZipCrypto;
        }
        self.options.password = password;
    }

    /// Choose the cipher for entries added fresh. Only the legacy stream
    /// cipher can be written.
    pub fn set_encryption(&mut self, method: EncryptionMethod) -> Result<()> {
        if let EncryptionMethod::Strong(alg) = method {
            return Err(ZipError::Unsupported(format!(
                "cannot write strong encryption (algorithm 0x{alg:04x})"
            )));
        }
        self.options.encryption = method;
        Ok(())
    }

    pub fn set_zip64(&mut self, mode: Zip64Mode) {
        self.options.zip64 = mode;
    }

    pub fn set_compression_level(&mut self, level: CompressionLevel) {
        self.options.level = level;
    }

    /// Split future saves into volumes of `size` bytes (64 KiB minimum);
    /// `None` goes back to single-file saves.
    pub fn set_segment_size(&mut self, size: Option<u64>) -> Result<()> {
        if let Some(sz) = size {
            if sz < MIN_SEGMENT_SIZE {
                return Err(ZipError::BadState("segment size below the 64 KiB minimum"));
            }
        }
        self.options.segment_size = size;
        Ok(())
    }

    pub fn add_entry_from_bytes(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let Some(name) = self.admit_name(name.into())? else {
            return Ok(());
        };
        self.entries.push(Entry::fresh(name, EntrySource::Bytes(bytes)));
        Ok(())
    }

    /// Queue a forward-only stream; it is drained once, at save time.
    pub fn add_entry_from_reader<R: Read + 'static>(
        &mut self,
        name: impl Into<String>,
        reader: R,
    ) -> Result<()> {
        let Some(name) = self.admit_name(name.into())? else {
            return Ok(());
        };
        self.entries
            .push(Entry::fresh(name, EntrySource::Reader(Some(Box::new(reader)))));
        Ok(())
    }

    /// Queue a file; its bytes and timestamps are read at save time.
    pub fn add_entry_from_file(
        &mut self,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> Result<()> {
        let Some(name) = self.admit_name(name.into())? else {
            return Ok(());
        };
        self.entries
            .push(Entry::fresh(name, EntrySource::File(path.into())));
        Ok(())
    }

    pub fn add_directory(&mut self, name: impl Into<String>) -> Result<()> {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        let Some(name) = self.admit_name(name)? else {
            return Ok(());
        };
        self.entries.push(Entry::fresh(name, EntrySource::Directory));
        Ok(())
    }

    /// Replace an entry's payload, or add it when absent.
    pub fn update_entry(&mut self, name: &str, bytes: Vec<u8>) {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.source = EntrySource::Bytes(bytes);
                entry.dos = DosDateTime::now();
                entry.mtime = Some(SystemTime::now());
            }
            None => {
                self.entries
                    .push(Entry::fresh(name.to_string(), EntrySource::Bytes(bytes)));
            }
        }
    }

    pub fn remove_entry(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    /// Apply the duplicate-name policy to an incoming name. `None` means
    /// the add is dropped.
    fn admit_name(&self, name: String) -> Result<Option<String>> {
        if !self.entries.iter().any(|e| e.name == name) {
            return Ok(Some(name));
        }
        match self.options.duplicates {
            DuplicateNameMode::Ignore => Ok(None),
            DuplicateNameMode::Rename => {
                let mut candidate = name;
                let mut renames = 0u32;
                while self.entries.iter().any(|e| e.name == candidate) {
                    renames += 1;
                    if renames > MAX_COPY_RENAMES {
                        return Err(ZipError::Format(format!(
                            "could not derive a unique name for duplicate entry '{candidate}'"
                        )));
                    }
                    candidate = append_copy_to_name(&candidate);
                }
                Ok(Some(candidate))
            }
        }
    }

    /// Serialize every entry into `dest` as one unsplit archive. The
    /// destination is written front to back, so entries settle their
    /// numbers with trailing data descriptors.
    pub fn save_to<W: Write>(&mut self, dest: W) -> Result<WriteSummary> {
        if self.options.segment_size.is_some() {
            return Err(ZipError::BadState("segmented saves need a file destination"));
        }
        let mut sink = StreamSink::new(dest);
        self.save_entries(&mut sink)
    }

    /// Serialize to a file, split into volumes when a segment size is
    /// configured. On success the archive rebinds to the new file, so
    /// later extractions and saves read from it.
    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<WriteSummary> {
        let dest = path.as_ref().to_path_buf();
        if let ArchiveSource::File { base, disks } = &self.source {
            if *disks > 1 && self.options.segment_size.is_some() && *base == dest {
                return Err(ZipError::BadState(
                    "cannot rewrite a split archive over its own volumes",
                ));
            }
        }
        match self.options.segment_size {
            Some(size) => {
                let mut sink = SegmentedWriter::create(&dest, size)?;
                match self.save_entries(&mut sink) {
                    Ok(summary) => {
                        let disks = sink.finish()?;
                        debug!("saved {} across {disks} volume(s)", dest.display());
                        self.rebind_to_file(dest, &summary)?;
                        Ok(summary)
                    }
                    Err(e) => {
                        let sealed = sink.disk();
                        drop(sink);
                        for d in 0..sealed {
                            let _ = fs::remove_file(segment_name(&dest, d));
                        }
                        Err(e)
                    }
                }
            }
            None => {
                let temp = sibling_temp_path(&dest);
                let mut sink = SeekSink::new(File::create(&temp)?);
                match self.save_entries(&mut sink) {
                    Ok(summary) => {
                        let file = sink.into_inner();
                        file.sync_all()?;
                        drop(file);
                        fs::rename(&temp, &dest)?;
                        self.rebind_to_file(dest, &summary)?;
                        Ok(summary)
                    }
                    Err(e) => {
                        drop(sink);
                        let _ = fs::remove_file(&temp);
                        Err(e)
                    }
                }
            }
        }
    }

    fn save_entries<S: VolumeSink>(&mut self, sink: &mut S) -> Result<WriteSummary> {
        let Archive {
            options,
            entries,
            comment,
            source,
            ..
        } = self;

        let save_options = SaveOptions {
            level: options.level,
            zip64: options.zip64,
            password: options.password.clone(),
            comment: comment.clone(),
            parallel: options.parallel,
        };
        let encrypt_fresh = options.encryption == EncryptionMethod::ZipCrypto;
        let mut backing = open_backing(source)?;

        let mut writer = ArchiveWriter::new(sink, save_options);
        for entry in entries.iter_mut() {
            let mut dos = entry.dos;
            let mut mtime = entry.mtime;
            let mut encrypt = encrypt_fresh;
            let payload = match &mut entry.source {
                EntrySource::Bytes(b) => EntryPayload::Bytes(b.clone()),
                EntrySource::File(path) => {
                    if let Ok(modified) = fs::metadata(&*path).and_then(|m| m.modified()) {
                        dos = DosDateTime::from_system(modified);
                        mtime = Some(modified);
                    }
                    EntryPayload::File(path.clone())
                }
                EntrySource::Reader(slot) => {
                    let reader = slot
                        .take()
                        .ok_or(ZipError::BadState("stream entry was already written"))?;
                    EntryPayload::Reader(reader)
                }
                EntrySource::Directory => {
                    encrypt = false;
                    EntryPayload::Directory
                }
                EntrySource::Stored(meta) => {
                    encrypt = false;
                    let handle = backing
                        .as_mut()
                        .ok_or(ZipError::BadState("backing archive is no longer available"))?;
                    let (_, payload_at) = payload_offset(handle, meta.lfh_offset)?;
                    handle.seek(SeekFrom::Start(payload_at))?;
                    let blob = RetryReader::new(handle.by_ref().take(meta.compressed_size));
                    EntryPayload::Raw {
                        reader: Box::new(blob),
                        method: meta.method,
                        flags: meta.flags,
                        crc32: meta.crc32,
                        compressed_size: meta.compressed_size,
                        uncompressed_size: meta.uncompressed_size,
                    }
                }
            };
            entry.dos = dos;
            entry.mtime = mtime;
            writer.add(PendingEntry {
                name: entry.name.clone(),
                payload,
                dos,
                mtime,
                comment: entry.comment.clone().into_bytes(),
                external_attrs: entry.external_attrs,
                encrypt,
            })?;
        }
        writer.finish()
    }

    /// Point every serialized entry at its new home so extractions and
    /// further saves read from the file just written.
    fn rebind_to_file(&mut self, base: PathBuf, summary: &WriteSummary) -> Result<()> {
        let disks = summary.total_disks;
        let starts: Vec<u64> = if disks > 1 {
            SegmentedReader::open(&base, disks)?.disk_starts().to_vec()
        } else {
            Vec::new()
        };
        for (entry, written) in self.entries.iter_mut().zip(&summary.entries) {
            if matches!(entry.source, EntrySource::Directory) {
                continue;
            }
            let encryption = if written.flags & FLAG_ENCRYPTED != 0 {
                if written.flags & FLAG_STRONG_ENCRYPTION != 0 {
                    EncryptionMethod::Strong(0)
                } else {
                    EncryptionMethod::ZipCrypto
                }
            } else {
                EncryptionMethod::None
            };
            let volume_base = starts.get(written.disk_start as usize).copied().unwrap_or(0);
            entry.source = EntrySource::Stored(StoredEntry {
                lfh_offset: volume_base + written.lfh_offset,
                method: written.method,
                flags: written.flags,
                crc32: written.crc32,
                compressed_size: written.compressed_size,
                uncompressed_size: written.uncompressed_size,
                encryption,
            });
        }
        self.source = ArchiveSource::File { base, disks };
        self.zip64 = summary.zip64;
        self.total_disks = disks;
        self.recovered = false;
        Ok(())
    }

    /// Extract one entry into `dest`, returning the plaintext length.
    ///
    /// The password (explicit, or the archive-level one) is verified
    /// against the cipher header before any decompression starts; the
    /// plaintext CRC is verified after.
    ///
    /// # Errors
    ///
    /// [`ZipError::NotFound`] for unknown names, [`ZipError::BadPassword`]
    /// for a wrong or missing password, [`ZipError::Unsupported`] for
    /// strong encryption or unknown compression methods, and
    /// [`ZipError::CrcMismatch`] when the payload does not hash to the
    /// directory's digest.
    pub fn extract_to<W: Write>(
        &mut self,
        name: &str,
        dest: &mut W,
        password: Option<&[u8]>,
    ) -> Result<u64> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| ZipError::NotFound(name.to_string()))?;

        // entries not yet serialized come straight from their sources
        let (meta, dos, entry_name) = {
            let entry = &self.entries[idx];
            match &entry.source {
                EntrySource::Bytes(b) => {
                    dest.write_all(b)?;
                    return Ok(b.len() as u64);
                }
                EntrySource::File(path) => {
                    let mut src = RetryReader::new(File::open(path)?);
                    return Ok(io::copy(&mut src, dest)?);
                }
                EntrySource::Directory => return Ok(0),
                EntrySource::Reader(_) => {
                    return Err(ZipError::BadState(
                        "stream-backed entry is only written at save time",
                    ));
                }
                EntrySource::Stored(meta) => (meta.clone(), entry.dos, entry.name.clone()),
            }
        };

        let password = password
            .map(<[u8]>::to_vec)
            .or_else(|| self.options.password.clone());
        let mut handle = open_backing(&mut self.source)?
            .ok_or(ZipError::BadState("backing archive is no longer available"))?;
        extract_stored(
            &mut handle,
            &meta,
            dos,
            &entry_name,
            password.as_deref(),
            dest,
        )
    }

    /// Extract one entry into memory.
    pub fn extract_entry(&mut self, name: &str, password: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.extract_to(name, &mut out, password)?;
        Ok(out)
    }
}

/// Open a read handle over the backing store, flattening split volumes.
fn open_backing(source: &mut ArchiveSource) -> Result<Option<Box<dyn ReadSeek + '_>>> {
    Ok(match source {
        ArchiveSource::Detached => None,
        ArchiveSource::File { base, disks } => {
            if *disks > 1 {
                Some(Box::new(SegmentedReader::open(base, *disks)?))
            } else {
                Some(Box::new(File::open(&*base)?))
            }
        }
        ArchiveSource::Stream(r) => Some(Box::new(&mut **r)),
    })
}

/// Volume count recorded in the trailer of the final volume; 1 when the
/// file has no trailer at all (scan-recovered archives are single-volume).
fn probe_total_disks<R: Read + Seek>(r: &mut R) -> Result<u32> {
    let len = r.seek(SeekFrom::End(0))?;
    let Some((eocd, eocd_offset)) = find_eocd(r, len)? else {
        return Ok(1);
    };
    if eocd.is_zip64() {
        if let Some(at) = eocd_offset.checked_sub(Zip64EOCDLocator::SIZE as u64) {
            r.seek(SeekFrom::Start(at))?;
            let mut buf = [0u8; Zip64EOCDLocator::SIZE];
            r.read_exact(&mut buf)?;
            if buf.starts_with(Zip64EOCDLocator::SIGNATURE) {
                let locator = Zip64EOCDLocator::from_bytes(&buf)?;
                return Ok(locator.total_disks.max(1));
            }
        }
        Ok(1)
    } else {
        Ok(u32::from(eocd.disk_number) + 1)
    }
}

/// Decrypt (when needed), decompress and digest one stored entry.
fn extract_stored<R: Read + Seek, W: Write>(
    r: &mut R,
    meta: &StoredEntry,
    dos: DosDateTime,
    name: &str,
    password: Option<&[u8]>,
    dest: &mut W,
) -> Result<u64> {
    let (header, payload_at) = payload_offset(r, meta.lfh_offset)?;
    r.seek(SeekFrom::Start(payload_at))?;
    let mut remaining = meta.compressed_size;

    let cipher = match meta.encryption {
        EncryptionMethod::None => None,
        EncryptionMethod::ZipCrypto => {
            let pw = password.ok_or(ZipError::BadPassword)?;
            if remaining < ENCRYPTION_HEADER_LEN as u64 {
                return Err(ZipError::Format(format!(
                    "encrypted entry '{name}' is shorter than its cipher header"
                )));
            }
            let mut check = [0u8; ENCRYPTION_HEADER_LEN];
            r.read_exact(&mut check)?;
            let mut cipher = ZipCrypto::new(pw);
            let ok = cipher.check_header(
                &check,
                meta.crc32,
                u32::from(dos.time),
                header.has_descriptor(),
            );
            if !ok {
                return Err(ZipError::BadPassword);
            }
            remaining -= ENCRYPTION_HEADER_LEN as u64;
            Some(cipher)
        }
        EncryptionMethod::Strong(alg) => {
            return Err(ZipError::Unsupported(format!(
                "strong encryption (algorithm 0x{alg:04x})"
            )));
        }
    };

    let raw = RetryReader::new(r.by_ref().take(remaining));
    let mut src: Box<dyn Read + '_> = match cipher {
        Some(c) => Box::new(CipherReader::new(raw, c)),
        None => Box::new(raw),
    };

    let mut counted = CrcWriter::new(&mut *dest);
    let produced = match meta.method {
        CompressionMethod::Stored => io::copy(&mut src, &mut counted)?,
        CompressionMethod::Deflate => {
            let mut inflater = InflateReader::new(src);
            io::copy(&mut inflater, &mut counted)?
        }
        CompressionMethod::Unknown(m) => {
            return Err(ZipError::Unsupported(format!("compression method {m}")));
        }
    };

    if produced != meta.uncompressed_size {
        return Err(ZipError::Format(format!(
            "entry '{name}' produced {produced} bytes, directory records {}",
            meta.uncompressed_size
        )));
    }
    let actual = counted.crc();
    if actual != meta.crc32 {
        return Err(ZipError::CrcMismatch {
            name: name.to_string(),
            expected: meta.crc32,
            actual,
        });
    }
    Ok(produced)
}

fn sibling_temp_path(dest: &Path) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let dir = dest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join(format!(".{stem}-{:08x}.tmp", rand::random::<u32>()))
}
