//! Archive serialization.
//!
//! Entries stream out through three layers: plaintext is compressed, the
//! result optionally encrypted, and everything counted on its way into
//! the sink. Because a local header precedes its payload, the crc and
//! size fields it promises are settled one of two ways:
//!
//! 1. Patch-back: sinks that can rewrite committed bytes get the real
//!    numbers written over the header (or over its ZIP64 extra) once the
//!    payload is done.
//! 2. Descriptor: forward-only sinks set bit 3 and trail the payload
//!    with a data descriptor record carrying the numbers.
//!
//! Encrypted entries fed from a plain reader take the descriptor path on
//! every sink, because the cipher's check byte must be derived from the
//! DOS timestamp when the CRC is unknown at header time.
//!
//! Already-compressed blobs lifted out of another archive are copied
//! verbatim, keeping their method, crc and cipher-relevant flags, so a
//! resave never needs the password of entries it leaves untouched.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;

use crate::crc::{self, CrcReader};
use crate::crypto::{CipherWriter, ZipCrypto};
use crate::deflate::{ChunkedDeflateWriter, CompressionLevel, DeflateSummary, ParallelDeflater};
use crate::error::{Result, ZipError};
use crate::io::{CountingWriter, VolumeSink};

use super::structures::{
    build_ntfs_times_extra, build_unix_times_extra, build_zip64_extra, encode_name,
    CentralDirectoryHeader, CompressionMethod, DataDescriptor, DosDateTime,
    EndOfCentralDirectory, HeaderState, LocalFileHeader, Zip64EOCD, Zip64EOCDLocator,
    ATTR_ARCHIVE, ATTR_DIRECTORY, FLAG_DESCRIPTOR, FLAG_ENCRYPTED, FLAG_UTF8, VERSION_MADE_BY,
    VERSION_NEEDED_DEFAULT, VERSION_NEEDED_ZIP64, ZIP64_SENTINEL_U16, ZIP64_SENTINEL_U32,
};

/// Known-size payloads at or above this size compress on the worker pool.
pub const PARALLEL_THRESHOLD: u64 = 512 * 1024;

/// Compression can expand incompressible input by a few bytes per chunk;
/// sizes within this margin of the classic limit reserve ZIP64 headers
/// up front so the final numbers are guaranteed to fit somewhere.
const ZIP64_PROMOTION_MARGIN: u64 = 2 * 1024 * 1024;

/// When to emit ZIP64 records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Mode {
    /// Classic records only; oversized values fail with
    /// [`ZipError::Zip64Required`].
    Never,
    /// Promote entries and the trailer when their numbers demand it.
    #[default]
    AsNeeded,
    /// Every entry and the trailer carry ZIP64 records.
    Always,
}

/// Knobs for one save pass.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub level: CompressionLevel,
    pub zip64: Zip64Mode,
    /// Key for entries flagged for encryption.
    pub password: Option<Vec<u8>>,
    /// Archive comment stored in the trailer, at most 65535 bytes.
    pub comment: Vec<u8>,
    /// Compress large known-size payloads on the worker pool.
    pub parallel: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Normal,
            zip64: Zip64Mode::AsNeeded,
            password: None,
            comment: Vec::new(),
            parallel: true,
        }
    }
}

/// Where one entry's bytes come from.
pub enum EntryPayload<'a> {
    Bytes(Vec<u8>),
    /// Opened (and for encryption, pre-hashed) when the entry is written.
    File(PathBuf),
    /// Forward-only source of unknown length.
    Reader(Box<dyn Read + 'a>),
    Directory,
    /// Compressed bytes copied verbatim from another archive, with the
    /// numbers and flag bits their directory recorded.
    Raw {
        reader: Box<dyn Read + 'a>,
        method: CompressionMethod,
        flags: u16,
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
    },
}

impl EntryPayload<'_> {
    /// Plaintext size when knowable without consuming the source.
    fn known_size(&self) -> Result<Option<u64>> {
        Ok(match self {
            EntryPayload::Bytes(b) => Some(b.len() as u64),
            EntryPayload::File(p) => Some(std::fs::metadata(p)?.len()),
            EntryPayload::Reader(_) => None,
            EntryPayload::Directory => Some(0),
            EntryPayload::Raw {
                uncompressed_size, ..
            } => Some(*uncompressed_size),
        })
    }
}

/// One entry queued for serialization.
pub struct PendingEntry<'a> {
    pub name: String,
    pub payload: EntryPayload<'a>,
    /// DOS timestamp stored in the header fields.
    pub dos: DosDateTime,
    /// High-resolution stamp for the timestamp extras; `None` skips them.
    pub mtime: Option<SystemTime>,
    pub comment: Vec<u8>,
    pub external_attrs: u32,
    pub encrypt: bool,
}

impl<'a> PendingEntry<'a> {
    pub fn new(name: impl Into<String>, payload: EntryPayload<'a>) -> Self {
        let external_attrs = match payload {
            EntryPayload::Directory => ATTR_DIRECTORY,
            _ => ATTR_ARCHIVE,
        };
        Self {
            name: name.into(),
            payload,
            dos: DosDateTime::now(),
            mtime: Some(SystemTime::now()),
            comment: Vec::new(),
            external_attrs,
            encrypt: false,
        }
    }
}

/// Final numbers for one serialized entry.
#[derive(Debug, Clone)]
pub struct WrittenEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub disk_start: u32,
    /// Offset of the local header within its volume.
    pub lfh_offset: u64,
}

/// What a completed save produced.
#[derive(Debug)]
pub struct WriteSummary {
    pub entries: Vec<WrittenEntry>,
    /// True when any ZIP64 record was emitted.
    pub zip64: bool,
    pub total_disks: u32,
}

/// Everything the central directory needs about an already-written entry.
struct FinishedEntry {
    name: String,
    name_bytes: Vec<u8>,
    flags: u16,
    method: CompressionMethod,
    dos: DosDateTime,
    state: HeaderState,
    disk_start: u32,
    lfh_offset: u64,
    comment: Vec<u8>,
    external_attrs: u32,
    time_extra: Vec<u8>,
    /// Local header reserved a ZIP64 extra.
    zip64_reserved: bool,
}

/// Streaming archive builder over a [`VolumeSink`].
///
/// Entries go out as they are added; [`finish`](Self::finish) writes the
/// central directory and trailer. Dropping the builder without finishing
/// leaves the sink holding a headerless fragment.
pub struct ArchiveWriter<'s, S: VolumeSink> {
    sink: &'s mut S,
    options: SaveOptions,
    finished: Vec<FinishedEntry>,
}

impl<'s, S: VolumeSink> ArchiveWriter<'s, S> {
    pub fn new(sink: &'s mut S, options: SaveOptions) -> Self {
        Self {
            sink,
            options,
            finished: Vec::new(),
        }
    }

    /// Serialize one entry: local header, payload, then the descriptor or
    /// header patch that settles its numbers.
    pub fn add(&mut self, entry: PendingEntry<'_>) -> Result<()> {
        let fin = write_entry(&mut *self.sink, entry, &self.options)?;
        self.finished.push(fin);
        Ok(())
    }

    /// Write the central directory and trailer records, then flush.
    pub fn finish(self) -> Result<WriteSummary> {
        let Self {
            sink,
            options,
            finished,
        } = self;

        if options.comment.len() > usize::from(u16::MAX) {
            return Err(ZipError::BadState("archive comment longer than 65535 bytes"));
        }

        let cd_disk = sink.disk();
        let cd_offset = sink.position()?;
        let mut cd_size = 0u64;
        let mut record_disks = Vec::with_capacity(finished.len());
        let mut any_zip64 = finished.iter().any(|f| f.zip64_reserved);

        for fin in &finished {
            let record = central_record(fin, options.zip64)?;
            any_zip64 |= record.version_needed >= VERSION_NEEDED_ZIP64;
            record_disks.push(sink.disk());
            record.write_to(sink)?;
            cd_size += record.len();
        }
        debug!(
            "central directory: {} entries, {} bytes at disk {} offset 0x{:x}",
            finished.len(),
            cd_size,
            cd_disk,
            cd_offset
        );

        let entries_total = finished.len() as u64;
        let saturated = entries_total >= u64::from(ZIP64_SENTINEL_U16)
            || cd_size >= u64::from(ZIP64_SENTINEL_U32)
            || cd_offset >= u64::from(ZIP64_SENTINEL_U32)
            || cd_disk >= u32::from(ZIP64_SENTINEL_U16)
            || sink.disk().saturating_add(1) >= u32::from(ZIP64_SENTINEL_U16);
        let trailer_zip64 = match options.zip64 {
            Zip64Mode::Always => true,
            Zip64Mode::AsNeeded => saturated,
            Zip64Mode::Never if saturated => {
                return Err(ZipError::Zip64Required(
                    "central directory totals do not fit the classic trailer",
                ));
            }
            Zip64Mode::Never => false,
        };

        let trailer_len = if trailer_zip64 {
            Zip64EOCD::MIN_SIZE + Zip64EOCDLocator::SIZE
        } else {
            0
        } + EndOfCentralDirectory::SIZE
            + options.comment.len();

        // The whole trailer lands on one volume so the record hunt that
        // starts from a single file can find it.
        sink.reserve_contiguous(trailer_len as u64)?;
        let eocd_disk = sink.disk();
        let eocd64_offset = sink.position()?;
        let disk_entries = record_disks.iter().filter(|&&d| d == eocd_disk).count() as u64;

        let mut trailer = Vec::with_capacity(trailer_len);
        if trailer_zip64 {
            Zip64EOCD {
                version_made_by: VERSION_MADE_BY,
                version_needed: VERSION_NEEDED_ZIP64,
                disk_number: eocd_disk,
                disk_with_cd: cd_disk,
                disk_entries,
                total_entries: entries_total,
                cd_size,
                cd_offset,
            }
            .write_to(&mut trailer)?;
            Zip64EOCDLocator {
                disk_with_eocd64: eocd_disk,
                eocd64_offset,
                total_disks: eocd_disk + 1,
            }
            .write_to(&mut trailer)?;
        }
        EndOfCentralDirectory {
            disk_number: sat16(u64::from(eocd_disk)),
            disk_with_cd: sat16(u64::from(cd_disk)),
            disk_entries: sat16(disk_entries),
            total_entries: sat16(entries_total),
            cd_size: sat32(cd_size),
            cd_offset: sat32(cd_offset),
            comment_len: options.comment.len() as u16,
        }
        .write_to(&mut trailer, &options.comment)?;
        sink.write_all(&trailer)?;
        sink.flush()?;

        let entries = finished
            .into_iter()
            .map(|fin| {
                let (crc32, compressed_size, uncompressed_size) = fin.state.numbers()?;
                Ok(WrittenEntry {
                    name: fin.name,
                    method: fin.method,
                    flags: fin.flags,
                    crc32,
                    compressed_size,
                    uncompressed_size,
                    disk_start: fin.disk_start,
                    lfh_offset: fin.lfh_offset,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WriteSummary {
            entries,
            zip64: any_zip64 || trailer_zip64,
            total_disks: eocd_disk + 1,
        })
    }
}

fn sat16(v: u64) -> u16 {
    if v >= u64::from(ZIP64_SENTINEL_U16) {
        ZIP64_SENTINEL_U16
    } else {
        v as u16
    }
}

fn sat32(v: u64) -> u32 {
    if v >= u64::from(ZIP64_SENTINEL_U32) {
        ZIP64_SENTINEL_U32
    } else {
        v as u32
    }
}

fn write_entry<S: VolumeSink>(
    sink: &mut S,
    entry: PendingEntry<'_>,
    options: &SaveOptions,
) -> Result<FinishedEntry> {
    let PendingEntry {
        name,
        payload,
        dos,
        mtime,
        comment,
        external_attrs,
        encrypt,
    } = entry;

    let (name_bytes, needs_utf8) = encode_name(&name);
    if name_bytes.len() > usize::from(u16::MAX) {
        return Err(ZipError::BadState("entry name longer than 65535 bytes"));
    }
    if comment.len() > usize::from(u16::MAX) {
        return Err(ZipError::BadState("entry comment longer than 65535 bytes"));
    }

    let is_dir = matches!(payload, EntryPayload::Directory);
    let raw_meta = match &payload {
        EntryPayload::Raw {
            flags,
            crc32,
            compressed_size,
            uncompressed_size,
            ..
        } => Some((*flags, *crc32, *compressed_size, *uncompressed_size)),
        _ => None,
    };
    let known_size = payload.known_size()?;

    let encrypt = encrypt && !is_dir && raw_meta.is_none();
    if encrypt && options.password.is_none() {
        return Err(ZipError::BadState("encryption requested without a password"));
    }

    let method = match &payload {
        EntryPayload::Raw { method, .. } => *method,
        EntryPayload::Directory => CompressionMethod::Stored,
        _ if options.level == CompressionLevel::None => CompressionMethod::Stored,
        _ if known_size == Some(0) => CompressionMethod::Stored,
        _ => CompressionMethod::Deflate,
    };

    let descriptor = if is_dir {
        false
    } else if let Some((raw_flags, ..)) = raw_meta {
        // An encrypted blob written with bit 3 derived its check byte
        // from the timestamp; the flag must travel with the bytes.
        raw_flags & FLAG_ENCRYPTED != 0 && raw_flags & FLAG_DESCRIPTOR != 0
    } else if !sink.can_patch() {
        true
    } else {
        encrypt && known_size.is_none()
    };

    let presume_zip64 = match options.zip64 {
        Zip64Mode::Always => true,
        Zip64Mode::Never => false,
        Zip64Mode::AsNeeded => match raw_meta {
            Some((_, _, c, u)) => c.max(u) >= u64::from(ZIP64_SENTINEL_U32),
            None => match known_size {
                Some(n) => {
                    n.saturating_add(ZIP64_PROMOTION_MARGIN) >= u64::from(ZIP64_SENTINEL_U32)
                }
                None => !sink.can_patch(),
            },
        },
    };
    if let Some((_, _, c, u)) = raw_meta {
        if !presume_zip64 && (c >= u64::from(ZIP64_SENTINEL_U32) || u >= u64::from(ZIP64_SENTINEL_U32)) {
            return Err(ZipError::Zip64Required(
                "entry does not fit classic size fields",
            ));
        }
    }

    let mut flags = match raw_meta {
        Some((raw_flags, ..)) => raw_flags & !(FLAG_DESCRIPTOR | FLAG_UTF8),
        None => 0,
    };
    if needs_utf8 {
        flags |= FLAG_UTF8;
    }
    if descriptor {
        flags |= FLAG_DESCRIPTOR;
    }
    if encrypt {
        flags |= FLAG_ENCRYPTED;
    }

    // Entries whose crc the cipher needs up front get it hashed before
    // any payload byte moves; file sources pay an extra read pass.
    let precomputed_crc = if encrypt && !descriptor {
        match &payload {
            EntryPayload::Bytes(b) => Some(crc::hash(b)),
            EntryPayload::File(p) => Some(file_crc(p)?),
            _ => None,
        }
    } else {
        None
    };

    let mut time_extra = Vec::new();
    if let Some(t) = mtime {
        time_extra.extend_from_slice(&build_ntfs_times_extra(t, t, t));
        time_extra.extend_from_slice(&build_unix_times_extra(t));
    }

    let mut extra = Vec::new();
    if presume_zip64 {
        // Values settle later: descriptor entries leave them zero, raw
        // entries know them now, patch-back entries overwrite in place.
        let (unc0, cmp0) = match raw_meta {
            Some((_, _, c, u)) if !descriptor => (u, c),
            _ => (0, 0),
        };
        extra.extend_from_slice(&build_zip64_extra(Some(unc0), Some(cmp0), None, None));
    }
    extra.extend_from_slice(&time_extra);

    let (crc_field, comp_field, unc_field) = if descriptor {
        (0, 0, 0)
    } else if let Some((_, raw_crc, c, u)) = raw_meta {
        if presume_zip64 {
            (raw_crc, ZIP64_SENTINEL_U32, ZIP64_SENTINEL_U32)
        } else {
            (raw_crc, c as u32, u as u32)
        }
    } else {
        let sentinel = if presume_zip64 { ZIP64_SENTINEL_U32 } else { 0 };
        (precomputed_crc.unwrap_or(0), sentinel, sentinel)
    };

    let header = LocalFileHeader {
        version_needed: if presume_zip64 {
            VERSION_NEEDED_ZIP64
        } else {
            VERSION_NEEDED_DEFAULT
        },
        flags,
        method: method.as_u16(),
        dos_time: dos.time,
        dos_date: dos.date,
        crc32: crc_field,
        compressed_size: comp_field,
        uncompressed_size: unc_field,
        name: name_bytes.clone(),
        extra,
    };

    // Headers never straddle a volume boundary.
    sink.reserve_contiguous(header.len())?;
    let disk_start = sink.disk();
    let lfh_offset = sink.position()?;
    header.write_to(sink)?;

    let cipher = match (encrypt, options.password.as_deref()) {
        (true, Some(pw)) => {
            let mut cipher = ZipCrypto::new(pw);
            let check = cipher.make_header(
                precomputed_crc.unwrap_or(0),
                u32::from(dos.time),
                descriptor,
            );
            Some((cipher, check))
        }
        _ => None,
    };

    let parallel = options.parallel
        && method == CompressionMethod::Deflate
        && known_size.map_or(true, |n| n >= PARALLEL_THRESHOLD);

    let (crc32, compressed, uncompressed) = match payload {
        EntryPayload::Directory => (0, 0, 0),
        EntryPayload::Raw {
            mut reader,
            crc32,
            compressed_size,
            uncompressed_size,
            ..
        } => {
            let copied = io::copy(&mut reader, sink)?;
            if copied != compressed_size {
                return Err(ZipError::Format(format!(
                    "raw payload for '{name}' ended after {copied} of {compressed_size} bytes"
                )));
            }
            (crc32, compressed_size, uncompressed_size)
        }
        EntryPayload::Bytes(b) => {
            stream_payload(sink, &mut Cursor::new(b), method, options.level, parallel, cipher)?
        }
        EntryPayload::File(p) => stream_payload(
            sink,
            &mut File::open(&p)?,
            method,
            options.level,
            parallel,
            cipher,
        )?,
        EntryPayload::Reader(mut r) => {
            stream_payload(sink, &mut *r, method, options.level, parallel, cipher)?
        }
    };

    if !presume_zip64
        && (compressed >= u64::from(ZIP64_SENTINEL_U32)
            || uncompressed >= u64::from(ZIP64_SENTINEL_U32))
    {
        return Err(match options.zip64 {
            Zip64Mode::Never => {
                ZipError::Zip64Required("entry exceeds 4 GiB and zip64 is disabled")
            }
            _ => ZipError::Zip64Required(
                "entry grew past 4 GiB after its header was written; save with Zip64Mode::Always",
            ),
        });
    }

    if descriptor {
        DataDescriptor {
            crc32,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
        }
        .write_to(sink, presume_zip64)?;
    } else if !is_dir && raw_meta.is_none() {
        patch_header(
            sink,
            disk_start,
            lfh_offset,
            name_bytes.len(),
            presume_zip64,
            (crc32, compressed, uncompressed),
        )?;
    }

    debug!(
        "entry '{}': {} -> {} bytes, method {:?}, disk {} offset 0x{:x}",
        name, uncompressed, compressed, method, disk_start, lfh_offset
    );

    Ok(FinishedEntry {
        name,
        name_bytes,
        flags,
        method,
        dos,
        state: HeaderState::Finalized {
            crc32,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
        },
        disk_start,
        lfh_offset,
        comment,
        external_attrs,
        time_extra,
        zip64_reserved: presume_zip64,
    })
}

/// Run one payload through the compression (and cipher) stack.
/// Returns (crc of the plaintext, compressed bytes written including the
/// encryption header, plaintext bytes consumed).
fn stream_payload<S: VolumeSink>(
    sink: &mut S,
    src: &mut dyn Read,
    method: CompressionMethod,
    level: CompressionLevel,
    parallel: bool,
    cipher: Option<(ZipCrypto, [u8; crate::crypto::ENCRYPTION_HEADER_LEN])>,
) -> Result<(u32, u64, u64)> {
    let mut counting = CountingWriter::new(&mut *sink);
    let summary = match cipher {
        Some((cipher, check_header)) => {
            counting.write_all(&check_header)?;
            let encrypting = CipherWriter::new(counting, cipher);
            let (encrypting, summary) = compress_into(encrypting, src, method, level, parallel)?;
            counting = encrypting.into_inner();
            summary
        }
        None => {
            let (back, summary) = compress_into(counting, src, method, level, parallel)?;
            counting = back;
            summary
        }
    };
    Ok((summary.crc, counting.bytes_written(), summary.bytes_in))
}

fn compress_into<W: Write>(
    mut dest: W,
    src: &mut dyn Read,
    method: CompressionMethod,
    level: CompressionLevel,
    parallel: bool,
) -> Result<(W, DeflateSummary)> {
    match method {
        CompressionMethod::Stored => {
            let mut tap = CrcReader::new(src);
            let n = io::copy(&mut tap, &mut dest)?;
            Ok((
                dest,
                DeflateSummary {
                    bytes_in: n,
                    bytes_out: n,
                    crc: tap.crc(),
                },
            ))
        }
        CompressionMethod::Deflate if parallel => {
            let mut w = ParallelDeflater::new(dest, level);
            io::copy(src, &mut w)?;
            w.finish()
        }
        CompressionMethod::Deflate => {
            let mut w = ChunkedDeflateWriter::new(dest, level);
            io::copy(src, &mut w)?;
            w.finish()
        }
        CompressionMethod::Unknown(m) => Err(ZipError::Unsupported(format!(
            "cannot compress with method {m}"
        ))),
    }
}

/// CRC of a file's contents, read in full.
fn file_crc(path: &Path) -> Result<u32> {
    let mut tap = CrcReader::new(File::open(path)?);
    io::copy(&mut tap, &mut io::sink())?;
    Ok(tap.crc())
}

/// Rewrite the crc and size fields (or the ZIP64 extra's values) of an
/// already-committed local header.
fn patch_header<S: VolumeSink>(
    sink: &mut S,
    disk: u32,
    lfh_offset: u64,
    name_len: usize,
    zip64: bool,
    numbers: (u32, u64, u64),
) -> Result<()> {
    let (crc32, compressed, uncompressed) = numbers;
    // crc sits 14 bytes in: signature, version, flags, method, time, date
    let mut fields = Vec::with_capacity(12);
    fields.write_u32::<LittleEndian>(crc32)?;
    if zip64 {
        sink.patch(disk, lfh_offset + 14, &fields)?;
        let mut sizes = Vec::with_capacity(16);
        sizes.write_u64::<LittleEndian>(uncompressed)?;
        sizes.write_u64::<LittleEndian>(compressed)?;
        // the ZIP64 extra is first in the extra area; skip its id and
        // length words to land on the value pair
        let values_at =
            lfh_offset + LocalFileHeader::FIXED_SIZE as u64 + name_len as u64 + 4;
        sink.patch(disk, values_at, &sizes)?;
    } else {
        fields.write_u32::<LittleEndian>(compressed as u32)?;
        fields.write_u32::<LittleEndian>(uncompressed as u32)?;
        sink.patch(disk, lfh_offset + 14, &fields)?;
    }
    Ok(())
}

/// Build the directory record for a finished entry. Saturated fields move
/// into a ZIP64 extra; the extra holds exactly the saturated ones so
/// readers walk it without guessing.
fn central_record(fin: &FinishedEntry, mode: Zip64Mode) -> Result<CentralDirectoryHeader> {
    let (crc32, compressed, uncompressed) = fin.state.numbers()?;

    let force = matches!(mode, Zip64Mode::Always);
    let need_unc = force || uncompressed >= u64::from(ZIP64_SENTINEL_U32);
    let need_cmp = force || compressed >= u64::from(ZIP64_SENTINEL_U32);
    let need_off = force || fin.lfh_offset >= u64::from(ZIP64_SENTINEL_U32);
    let need_disk = fin.disk_start >= u32::from(ZIP64_SENTINEL_U16);

    if matches!(mode, Zip64Mode::Never) && (need_unc || need_cmp || need_off || need_disk) {
        return Err(ZipError::Zip64Required(
            "entry layout does not fit classic directory fields",
        ));
    }

    let zip64_extra = build_zip64_extra(
        need_unc.then_some(uncompressed),
        need_cmp.then_some(compressed),
        need_off.then_some(fin.lfh_offset),
        need_disk.then_some(fin.disk_start),
    );
    let zip64 = !zip64_extra.is_empty() || fin.zip64_reserved;

    let mut extra = zip64_extra;
    extra.extend_from_slice(&fin.time_extra);

    Ok(CentralDirectoryHeader {
        version_made_by: VERSION_MADE_BY,
        version_needed: if zip64 {
            VERSION_NEEDED_ZIP64
        } else {
            VERSION_NEEDED_DEFAULT
        },
        flags: fin.flags,
        method: fin.method.as_u16(),
        dos_time: fin.dos.time,
        dos_date: fin.dos.date,
        crc32,
        compressed_size: if need_cmp {
            ZIP64_SENTINEL_U32
        } else {
            compressed as u32
        },
        uncompressed_size: if need_unc { ZIP64_SENTINEL_U32 } else { uncompressed as u32 },
        disk_start: if need_disk {
            ZIP64_SENTINEL_U16
        } else {
            fin.disk_start as u16
        },
        internal_attrs: 0,
        external_attrs: fin.external_attrs,
        lfh_offset: if need_off {
            ZIP64_SENTINEL_U32
        } else {
            fin.lfh_offset as u32
        },
        name: fin.name_bytes.clone(),
        extra,
        comment: fin.comment.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Seek, SeekFrom};

    use super::*;
    use crate::crypto::{CipherReader, ENCRYPTION_HEADER_LEN};
    use crate::deflate::InflateReader;
    use crate::io::{SeekSink, SegmentedReader, SegmentedWriter, StreamSink, MIN_SEGMENT_SIZE};
    use crate::zip::reader::{payload_offset, read_archive, DuplicateNameMode};
    use crate::zip::structures::EncryptionMethod;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "zipforge-writer-{tag}-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // 2024-06-15 10:30:00
    fn fixed_dos() -> DosDateTime {
        DosDateTime {
            time: 0x53C0,
            date: 0x58CF,
        }
    }

    fn entry_bytes(name: &str, data: &[u8]) -> PendingEntry<'static> {
        let mut e = PendingEntry::new(name, EntryPayload::Bytes(data.to_vec()));
        e.dos = fixed_dos();
        e.mtime = None;
        e
    }

    fn save_seekable(
        entries: Vec<PendingEntry<'_>>,
        options: SaveOptions,
    ) -> (Vec<u8>, WriteSummary) {
        let mut sink = SeekSink::new(Cursor::new(Vec::new()));
        let mut w = ArchiveWriter::new(&mut sink, options);
        for e in entries {
            w.add(e).unwrap();
        }
        let summary = w.finish().unwrap();
        (sink.into_inner().into_inner(), summary)
    }

    fn lcg_bytes(mut seed: u32, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            out.push((seed >> 24) as u8);
        }
        out
    }

    #[test]
    fn test_seekable_roundtrip() {
        let compressible = b"hello hello hello hello hello ".repeat(40);
        let entries = vec![
            entry_bytes("a.txt", &compressible),
            entry_bytes("dir/b.bin", &[0xAB; 100]),
        ];
        let (bytes, summary) = save_seekable(entries, SaveOptions::default());

        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.total_disks, 1);
        assert!(!summary.zip64);

        let mut c = Cursor::new(&bytes[..]);
        let index = read_archive(&mut c, &[], DuplicateNameMode::Rename).unwrap();
        assert_eq!(index.entries.len(), 2);
        assert!(!index.recovered_by_scan);

        let e = &index.entries[0];
        assert_eq!(e.name, "a.txt");
        assert_eq!(e.method, CompressionMethod::Deflate);
        assert_eq!(e.uncompressed_size, compressible.len() as u64);
        assert!(e.compressed_size < e.uncompressed_size);
        assert_eq!(e.crc32, crc::hash(&compressible));

        let (hdr, payload_at) = payload_offset(&mut c, e.lfh_offset).unwrap();
        assert!(!hdr.has_descriptor());
        assert_eq!(hdr.crc32, e.crc32);
        c.seek(SeekFrom::Start(payload_at)).unwrap();
        let mut inf = InflateReader::new(&mut c);
        let mut back = Vec::new();
        inf.read_to_end(&mut back).unwrap();
        assert_eq!(back, compressible);
    }

    #[test]
    fn test_stream_sink_writes_descriptors() {
        let data = b"streaming destination ".repeat(30);
        let mut sink = StreamSink::new(Vec::new());
        let mut w = ArchiveWriter::new(&mut sink, SaveOptions::default());
        w.add(entry_bytes("s.txt", &data)).unwrap();
        let summary = w.finish().unwrap();
        let bytes = sink.into_inner();

        let written = &summary.entries[0];
        let mut c = Cursor::new(&bytes[..]);
        let (hdr, payload_at) = payload_offset(&mut c, written.lfh_offset).unwrap();
        assert!(hdr.has_descriptor());
        assert_eq!(hdr.crc32, 0);
        assert_eq!(hdr.compressed_size, 0);

        // the directory still carries the settled numbers
        let index = read_archive(&mut c, &[], DuplicateNameMode::Rename).unwrap();
        assert_eq!(index.entries[0].crc32, crc::hash(&data));
        assert_eq!(index.entries[0].compressed_size, written.compressed_size);

        // with the trailer cut off, descriptor recovery finds the same numbers
        let cut = payload_at as usize + written.compressed_size as usize + 16;
        let mut torn = Cursor::new(&bytes[..cut]);
        let rebuilt = read_archive(&mut torn, &[], DuplicateNameMode::Rename).unwrap();
        assert!(rebuilt.recovered_by_scan);
        let r = &rebuilt.entries[0];
        assert_eq!(r.name, "s.txt");
        assert_eq!(r.crc32, crc::hash(&data));
        assert_eq!(r.compressed_size, written.compressed_size);
        assert_eq!(r.uncompressed_size, data.len() as u64);
    }

    #[test]
    fn test_encrypted_bytes_roundtrip() {
        let plain = b"secret payload secret payload ".repeat(20);
        let mut e = entry_bytes("hidden.txt", &plain);
        e.encrypt = true;
        let mut options = SaveOptions::default();
        options.password = Some(b"hunter2".to_vec());
        let (bytes, _) = save_seekable(vec![e], options);

        let mut c = Cursor::new(&bytes[..]);
        let index = read_archive(&mut c, &[], DuplicateNameMode::Rename).unwrap();
        let entry = &index.entries[0];
        assert_eq!(entry.encryption, EncryptionMethod::ZipCrypto);
        assert_eq!(entry.crc32, crc::hash(&plain));

        let (hdr, payload_at) = payload_offset(&mut c, entry.lfh_offset).unwrap();
        assert!(hdr.is_encrypted());
        assert!(!hdr.has_descriptor());

        // the crc-keyed check byte accepts the right password
        c.seek(SeekFrom::Start(payload_at)).unwrap();
        let mut enc_header = [0u8; ENCRYPTION_HEADER_LEN];
        c.read_exact(&mut enc_header).unwrap();
        let mut cipher = ZipCrypto::new(b"hunter2");
        assert!(cipher.check_header(&enc_header, entry.crc32, u32::from(entry.dos_time), false));

        let decrypting = CipherReader::new(&mut c, cipher);
        let mut inf = InflateReader::new(decrypting);
        let mut back = Vec::new();
        inf.read_to_end(&mut back).unwrap();
        assert_eq!(back, plain);

        // and rejects a wrong one
        c.seek(SeekFrom::Start(payload_at)).unwrap();
        c.read_exact(&mut enc_header).unwrap();
        let mut wrong = ZipCrypto::new(b"password");
        assert!(!wrong.check_header(&enc_header, entry.crc32, u32::from(entry.dos_time), false));
    }

    #[test]
    fn test_encrypted_stream_source_uses_descriptor() {
        let plain: Vec<u8> = b"no length known up front ".repeat(25);
        let mut e = PendingEntry::new(
            "fed.bin",
            EntryPayload::Reader(Box::new(Cursor::new(plain.clone()))),
        );
        e.dos = fixed_dos();
        e.mtime = None;
        e.encrypt = true;
        let mut options = SaveOptions::default();
        options.password = Some(b"tick".to_vec());
        let (bytes, _) = save_seekable(vec![e], options);

        let mut c = Cursor::new(&bytes[..]);
        let index = read_archive(&mut c, &[], DuplicateNameMode::Rename).unwrap();
        let entry = &index.entries[0];
        let (hdr, payload_at) = payload_offset(&mut c, entry.lfh_offset).unwrap();
        assert!(hdr.has_descriptor());

        // check byte comes from the timestamp when bit 3 is set
        c.seek(SeekFrom::Start(payload_at)).unwrap();
        let mut enc_header = [0u8; ENCRYPTION_HEADER_LEN];
        c.read_exact(&mut enc_header).unwrap();
        let mut cipher = ZipCrypto::new(b"tick");
        assert!(cipher.check_header(&enc_header, entry.crc32, u32::from(entry.dos_time), true));

        let decrypting = CipherReader::new(&mut c, cipher);
        let mut inf = InflateReader::new(decrypting);
        let mut back = Vec::new();
        inf.read_to_end(&mut back).unwrap();
        assert_eq!(back, plain);
    }

    #[test]
    fn test_file_payload_encrypted_without_descriptor() {
        let dir = temp_dir("file");
        let path = dir.join("src.txt");
        let body = b"file-backed entry body ".repeat(18);
        fs::write(&path, &body).unwrap();

        let mut e = PendingEntry::new("src.txt", EntryPayload::File(path.clone()));
        e.dos = fixed_dos();
        e.mtime = None;
        e.encrypt = true;
        let mut options = SaveOptions::default();
        options.password = Some(b"disk".to_vec());
        let (bytes, summary) = save_seekable(vec![e], options);

        // pre-hashing the file keeps the descriptor off and keys the
        // check byte from the crc
        let w = &summary.entries[0];
        let mut c = Cursor::new(&bytes[..]);
        let (hdr, payload_at) = payload_offset(&mut c, w.lfh_offset).unwrap();
        assert!(!hdr.has_descriptor());
        assert_eq!(hdr.crc32, crc::hash(&body));

        c.seek(SeekFrom::Start(payload_at)).unwrap();
        let mut enc_header = [0u8; ENCRYPTION_HEADER_LEN];
        c.read_exact(&mut enc_header).unwrap();
        let mut cipher = ZipCrypto::new(b"disk");
        assert!(cipher.check_header(&enc_header, w.crc32, u32::from(fixed_dos().time), false));
        let mut inf = InflateReader::new(CipherReader::new(&mut c, cipher));
        let mut back = Vec::new();
        inf.read_to_end(&mut back).unwrap();
        assert_eq!(back, body);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_encrypt_without_password_rejected() {
        let mut sink = SeekSink::new(Cursor::new(Vec::new()));
        let mut w = ArchiveWriter::new(&mut sink, SaveOptions::default());
        let mut e = entry_bytes("x", b"y");
        e.encrypt = true;
        assert!(matches!(w.add(e).unwrap_err(), ZipError::BadState(_)));
    }

    #[test]
    fn test_zip64_always_emits_records() {
        let mut options = SaveOptions::default();
        options.zip64 = Zip64Mode::Always;
        let (bytes, summary) = save_seekable(vec![entry_bytes("t.txt", b"tiny")], options);
        assert!(summary.zip64);
        assert!(bytes.windows(4).any(|w| w == Zip64EOCD::SIGNATURE));

        let mut c = Cursor::new(&bytes[..]);
        let index = read_archive(&mut c, &[], DuplicateNameMode::Rename).unwrap();
        assert!(index.zip64);
        let e = &index.entries[0];
        assert_eq!(e.uncompressed_size, 4);
        assert_eq!(e.crc32, crc::hash(b"tiny"));

        let (_, payload_at) = payload_offset(&mut c, e.lfh_offset).unwrap();
        c.seek(SeekFrom::Start(payload_at)).unwrap();
        let mut inf = InflateReader::new(&mut c);
        let mut back = Vec::new();
        inf.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"tiny");
    }

    #[test]
    fn test_zip64_never_rejects_oversized_entry() {
        let mut options = SaveOptions::default();
        options.zip64 = Zip64Mode::Never;
        let mut sink = SeekSink::new(Cursor::new(Vec::new()));
        let mut w = ArchiveWriter::new(&mut sink, options);
        let mut e = PendingEntry::new(
            "big.bin",
            EntryPayload::Raw {
                reader: Box::new(io::empty()),
                method: CompressionMethod::Deflate,
                flags: 0,
                crc32: 0,
                compressed_size: 0x1_0000_0010,
                uncompressed_size: 0x1_0000_0010,
            },
        );
        e.dos = fixed_dos();
        let err = w.add(e).unwrap_err();
        assert!(matches!(err, ZipError::Zip64Required(_)));
    }

    #[test]
    fn test_raw_oversized_metadata_roundtrip() {
        let blob = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut e = PendingEntry::new(
            "wide.bin",
            EntryPayload::Raw {
                reader: Box::new(Cursor::new(blob)),
                method: CompressionMethod::Deflate,
                flags: 0,
                crc32: 0xDEAD_BEEF,
                compressed_size: 8,
                uncompressed_size: 0x1_4000_0000,
            },
        );
        e.dos = fixed_dos();
        e.mtime = None;
        let (bytes, summary) = save_seekable(vec![e], SaveOptions::default());
        assert!(summary.zip64);

        let mut c = Cursor::new(&bytes[..]);
        let index = read_archive(&mut c, &[], DuplicateNameMode::Rename).unwrap();
        let r = &index.entries[0];
        assert_eq!(r.uncompressed_size, 0x1_4000_0000);
        assert_eq!(r.compressed_size, 8);
        assert_eq!(r.crc32, 0xDEAD_BEEF);
        assert_eq!(r.method, CompressionMethod::Deflate);
    }

    #[test]
    fn test_raw_resave_preserves_compressed_bytes() {
        let data = b"round and round the raw bytes go ".repeat(12);
        let (first, s1) =
            save_seekable(vec![entry_bytes("keep.txt", &data)], SaveOptions::default());
        let w1 = &s1.entries[0];

        let mut c = Cursor::new(&first[..]);
        let (_, payload_at) = payload_offset(&mut c, w1.lfh_offset).unwrap();
        let blob =
            first[payload_at as usize..(payload_at + w1.compressed_size) as usize].to_vec();

        let mut e = PendingEntry::new(
            "keep.txt",
            EntryPayload::Raw {
                reader: Box::new(Cursor::new(blob.clone())),
                method: w1.method,
                flags: 0,
                crc32: w1.crc32,
                compressed_size: w1.compressed_size,
                uncompressed_size: w1.uncompressed_size,
            },
        );
        e.dos = fixed_dos();
        e.mtime = None;
        let (second, s2) = save_seekable(vec![e], SaveOptions::default());
        let w2 = &s2.entries[0];
        assert_eq!(w2.crc32, w1.crc32);
        assert_eq!(w2.compressed_size, w1.compressed_size);

        let mut c2 = Cursor::new(&second[..]);
        let index = read_archive(&mut c2, &[], DuplicateNameMode::Rename).unwrap();
        let (_, at2) = payload_offset(&mut c2, index.entries[0].lfh_offset).unwrap();
        assert_eq!(&second[at2 as usize..at2 as usize + blob.len()], &blob[..]);

        // the copied payload still inflates to the original plaintext
        c2.seek(SeekFrom::Start(at2)).unwrap();
        let mut inf = InflateReader::new(&mut c2);
        let mut back = Vec::new();
        inf.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_segmented_save_roundtrip() {
        let dir = temp_dir("save");
        let base = dir.join("spanned.zip");

        // incompressible payloads stored uncompressed force several
        // 64 KiB volumes
        let payloads: Vec<Vec<u8>> = (0..3u32)
            .map(|i| lcg_bytes(0x2545_F491 ^ i, 60_000))
            .collect();

        let mut sink = SegmentedWriter::create(&base, MIN_SEGMENT_SIZE).unwrap();
        let options = SaveOptions {
            level: CompressionLevel::None,
            ..SaveOptions::default()
        };
        let mut w = ArchiveWriter::new(&mut sink, options);
        for (i, p) in payloads.iter().enumerate() {
            w.add(entry_bytes(&format!("blob{i}.bin"), p)).unwrap();
        }
        let summary = w.finish().unwrap();
        let disks = sink.finish().unwrap();
        assert!(disks >= 3);
        assert_eq!(summary.total_disks, disks);

        let mut r = SegmentedReader::open(&base, disks).unwrap();
        let starts = r.disk_starts().to_vec();
        let index = read_archive(&mut r, &starts, DuplicateNameMode::Rename).unwrap();
        assert_eq!(index.entries.len(), 3);
        assert_eq!(index.total_disks, disks);

        for (i, p) in payloads.iter().enumerate() {
            let e = &index.entries[i];
            assert_eq!(e.name, format!("blob{i}.bin"));
            assert_eq!(e.method, CompressionMethod::Stored);
            assert_eq!(e.uncompressed_size, p.len() as u64);
            let (hdr, at) = payload_offset(&mut r, e.lfh_offset).unwrap();
            assert_eq!(hdr.file_name(), e.name);
            r.seek(SeekFrom::Start(at)).unwrap();
            let mut back = vec![0u8; p.len()];
            r.read_exact(&mut back).unwrap();
            assert_eq!(&back, p);
        }

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_entries() {
        let mut e = PendingEntry::new("docs/", EntryPayload::Directory);
        e.dos = fixed_dos();
        e.mtime = None;
        let (bytes, _) = save_seekable(vec![e], SaveOptions::default());
        let index =
            read_archive(&mut Cursor::new(&bytes[..]), &[], DuplicateNameMode::Rename).unwrap();
        let d = &index.entries[0];
        assert!(d.is_directory);
        assert_eq!(d.method, CompressionMethod::Stored);
        assert_eq!(d.uncompressed_size, 0);
        assert_eq!(d.external_attrs & ATTR_DIRECTORY, ATTR_DIRECTORY);
    }

    #[test]
    fn test_archive_comment_in_trailer() {
        let mut options = SaveOptions::default();
        options.comment = b"spanned test archive".to_vec();
        let (bytes, _) = save_seekable(vec![entry_bytes("x", b"y")], options);
        let index =
            read_archive(&mut Cursor::new(&bytes[..]), &[], DuplicateNameMode::Rename).unwrap();
        assert_eq!(index.comment, b"spanned test archive".to_vec());
    }

    #[test]
    fn test_oversized_comment_rejected() {
        let mut sink = SeekSink::new(Cursor::new(Vec::new()));
        let mut options = SaveOptions::default();
        options.comment = vec![b'x'; 70_000];
        let w = ArchiveWriter::new(&mut sink, options);
        assert!(matches!(w.finish().unwrap_err(), ZipError::BadState(_)));
    }

    #[test]
    fn test_parallel_output_matches_sequential() {
        let target = PARALLEL_THRESHOLD as usize + 65_536;
        let data = lcg_bytes(0x9E37_79B9, target);

        let sequential = SaveOptions {
            parallel: false,
            ..SaveOptions::default()
        };
        let parallel = SaveOptions {
            parallel: true,
            ..SaveOptions::default()
        };
        let (a, _) = save_seekable(vec![entry_bytes("p.bin", &data)], sequential);
        let (b, _) = save_seekable(vec![entry_bytes("p.bin", &data)], parallel);
        assert_eq!(a, b);
    }

    #[test]
    fn test_timestamp_extras_roundtrip() {
        let stamp = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let mut e = entry_bytes("stamped.txt", b"when");
        e.mtime = Some(stamp);
        let (bytes, _) = save_seekable(vec![e], SaveOptions::default());
        let index =
            read_archive(&mut Cursor::new(&bytes[..]), &[], DuplicateNameMode::Rename).unwrap();
        assert_eq!(index.entries[0].mtime, stamp);
    }

    #[test]
    fn test_empty_archive() {
        let (bytes, summary) = save_seekable(vec![], SaveOptions::default());
        assert!(summary.entries.is_empty());
        assert_eq!(bytes.len(), EndOfCentralDirectory::SIZE);
        let index =
            read_archive(&mut Cursor::new(&bytes[..]), &[], DuplicateNameMode::Rename).unwrap();
        assert!(index.entries.is_empty());
    }
}
