//! Archive discovery and central directory parsing.
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) near the file's end
//! 2. If ZIP64, follow the locator to the ZIP64 EOCD for 64-bit fields
//! 3. Walk the Central Directory to get metadata for all entries
//! 4. For extraction, read each entry's Local File Header and data
//!
//! When no EOCD can be found (truncated or damaged trailer), a forward
//! linear scan of local file headers reconstructs the entry list. Entries
//! written with bit 3 (sizes in a trailing descriptor) are recovered by
//! scanning for the descriptor signature and validating the sizes it
//! claims against the bytes actually skipped, retrying past payload
//! bytes that merely look like a signature. That recovery is best-effort.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};

use crate::error::{Result, ZipError};

use super::structures::{
    apply_zip64_extra, decode_name, find_extra, mtime_from_extras, CentralDirectoryHeader,
    CompressionMethod, DataDescriptor, DosDateTime, EncryptionMethod, EndOfCentralDirectory,
    LocalFileHeader, Zip64EOCD, Zip64EOCDLocator, EXTRA_ZIP64, PK00_SIGNATURE, ZIP64_SENTINEL_U16,
};

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for the EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65_535;

/// Backward search windows tried in order, smallest first. All are
/// anchored at the end of the file; the last covers the whole comment
/// range the format permits.
const EOCD_SEARCH_WINDOWS: [u64; 3] = [
    1024,
    16 * 1024,
    MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64,
];

/// Attempt ceiling when hunting a data descriptor past false signature
/// matches embedded in payload bytes.
const MAX_DESCRIPTOR_TRIES: u32 = 1024;

/// Rename ceiling for one duplicated entry name.
pub(crate) const MAX_COPY_RENAMES: u32 = 25;

/// Policy for entry names that appear more than once in a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateNameMode {
    /// Later duplicates get " (copy N)" spliced in before the extension.
    #[default]
    Rename,
    /// Later duplicates are dropped while reading and rejected when adding.
    Ignore,
}

/// One entry as recorded by the archive's directory (or recovered from
/// its local header).
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Logical offset of the local header (volume-flattened).
    pub lfh_offset: u64,
    pub disk_start: u32,
    pub dos_time: u16,
    pub dos_date: u16,
    pub mtime: SystemTime,
    pub is_directory: bool,
    pub encryption: EncryptionMethod,
    pub comment: String,
    pub external_attrs: u32,
}

/// Everything learned about an archive's layout from its trailer records.
pub struct ArchiveIndex {
    pub entries: Vec<RawEntry>,
    /// Archive comment bytes from the EOCD trailer.
    pub comment: Vec<u8>,
    /// True when ZIP64 records were present anywhere.
    pub zip64: bool,
    /// Volume count (1 for a single-file archive).
    pub total_disks: u32,
    /// True when the directory was rebuilt by the local-header scan.
    pub recovered_by_scan: bool,
}

/// Parse an archive laid out as one logical stream.
///
/// # Arguments
///
/// * `r` - The archive bytes; segmented archives must already be
///   flattened (see [`SegmentedReader`](crate::io::SegmentedReader))
/// * `disk_starts` - Logical start offset per volume, empty for a
///   single-file archive; used to resolve (disk, offset) pairs
/// * `duplicates` - What to do with repeated entry names
///
/// # Errors
///
/// Returns a format error when neither an EOCD nor a leading local file
/// header can be found, or when the directory is structurally invalid.
pub fn read_archive<R: Read + Seek>(
    r: &mut R,
    disk_starts: &[u64],
    duplicates: DuplicateNameMode,
) -> Result<ArchiveIndex> {
    let len = r.seek(SeekFrom::End(0))?;

    let Some((eocd, eocd_offset)) = find_eocd(r, len)? else {
        warn!("no end-of-central-directory record; scanning local headers");
        return scan_local_headers(r, len, duplicates);
    };
    debug!("eocd at 0x{:x}", eocd_offset);

    // Resolve the 64-bit directory numbers when any field saturated.
    let mut zip64 = false;
    let (cd_disk, cd_offset, total_entries, total_disks) = if eocd.is_zip64() {
        let eocd64 = read_zip64_records(r, &eocd, eocd_offset, disk_starts)?;
        zip64 = true;
        (
            eocd64.0.disk_with_cd,
            eocd64.0.cd_offset,
            eocd64.0.total_entries,
            eocd64.1,
        )
    } else {
        (
            u32::from(eocd.disk_with_cd),
            u64::from(eocd.cd_offset),
            u64::from(eocd.total_entries),
            u32::from(eocd.disk_number) + 1,
        )
    };

    // Comment bytes trail the fixed EOCD record.
    let mut comment = vec![0u8; usize::from(eocd.comment_len)];
    r.seek(SeekFrom::Start(eocd_offset + EndOfCentralDirectory::SIZE as u64))?;
    r.read_exact(&mut comment)?;

    let cd_logical = logical_offset(disk_starts, cd_disk, cd_offset);
    r.seek(SeekFrom::Start(cd_logical))?;
    let (entries, saw_zip64_extras) = walk_central_directory(r, disk_starts, duplicates)?;
    debug!(
        "central directory: {} entries ({} expected)",
        entries.len(),
        total_entries
    );

    Ok(ArchiveIndex {
        entries,
        comment,
        zip64: zip64 || saw_zip64_extras,
        total_disks,
        recovered_by_scan: false,
    })
}

/// Map a (disk, offset-in-disk) pair onto the flattened stream.
fn logical_offset(disk_starts: &[u64], disk: u32, offset: u64) -> u64 {
    match disk_starts.get(disk as usize) {
        Some(start) => start + offset,
        None => offset,
    }
}

/// Find and parse the End of Central Directory record.
///
/// Tries the no-comment tail position first, then searches backward in
/// widening end-anchored windows. A candidate is accepted only when its
/// comment-length field matches the bytes remaining after the record,
/// which rejects signature look-alikes inside comments.
///
/// Returns `Ok(None)` when the record cannot be found; the caller falls
/// back to the local-header scan.
pub(crate) fn find_eocd<R: Read + Seek>(
    r: &mut R,
    len: u64,
) -> Result<Option<(EndOfCentralDirectory, u64)>> {
    if len < EndOfCentralDirectory::SIZE as u64 {
        return Ok(None);
    }

    // Fast path: record flush with the end of the file, no comment.
    let tail_offset = len - EndOfCentralDirectory::SIZE as u64;
    let mut tail = [0u8; EndOfCentralDirectory::SIZE];
    r.seek(SeekFrom::Start(tail_offset))?;
    r.read_exact(&mut tail)?;
    if &tail[0..4] == EndOfCentralDirectory::SIGNATURE && tail[20..22] == [0, 0] {
        return Ok(Some((EndOfCentralDirectory::from_bytes(&tail)?, tail_offset)));
    }

    for window in EOCD_SEARCH_WINDOWS {
        let search = window.min(len);
        let start = len - search;
        let mut buf = vec![0u8; search as usize];
        r.seek(SeekFrom::Start(start))?;
        r.read_exact(&mut buf)?;

        for i in (0..buf.len().saturating_sub(EndOfCentralDirectory::SIZE)).rev() {
            if &buf[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
                continue;
            }
            let comment_len = usize::from(u16::from_le_bytes([buf[i + 20], buf[i + 21]]));
            if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                let eocd =
                    EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                return Ok(Some((eocd, start + i as u64)));
            }
        }

        if search == len {
            break;
        }
    }

    Ok(None)
}

/// Follow the ZIP64 locator sitting just before the EOCD and read the
/// ZIP64 EOCD it points at. Returns the record and the volume count.
fn read_zip64_records<R: Read + Seek>(
    r: &mut R,
    eocd: &EndOfCentralDirectory,
    eocd_offset: u64,
    disk_starts: &[u64],
) -> Result<(Zip64EOCD, u32)> {
    let spanned_sentinel =
        eocd.disk_number == ZIP64_SENTINEL_U16 || eocd.disk_with_cd == ZIP64_SENTINEL_U16;

    if eocd_offset < Zip64EOCDLocator::SIZE as u64 {
        return Err(ZipError::Format("zip64 locator does not fit".into()));
    }
    let mut buf = [0u8; Zip64EOCDLocator::SIZE];
    r.seek(SeekFrom::Start(eocd_offset - Zip64EOCDLocator::SIZE as u64))?;
    r.read_exact(&mut buf)?;
    let locator = match Zip64EOCDLocator::from_bytes(&buf) {
        Ok(l) => l,
        Err(_) if spanned_sentinel => {
            return Err(ZipError::Unsupported(
                "saturated disk numbers without zip64 records".into(),
            ));
        }
        Err(e) => return Err(e),
    };

    let mut buf = vec![0u8; Zip64EOCD::MIN_SIZE];
    r.seek(SeekFrom::Start(logical_offset(
        disk_starts,
        locator.disk_with_eocd64,
        locator.eocd64_offset,
    )))?;
    r.read_exact(&mut buf)?;
    let eocd64 = Zip64EOCD::from_bytes(&buf)?;
    debug!("zip64 eocd: {} entries", eocd64.total_entries);
    Ok((eocd64, locator.total_disks.max(1)))
}

/// Walk central directory records until a trailer signature appears.
/// Returns the entries plus whether any record carried a ZIP64 extra.
fn walk_central_directory<R: Read + Seek>(
    r: &mut R,
    disk_starts: &[u64],
    duplicates: DuplicateNameMode,
) -> Result<(Vec<RawEntry>, bool)> {
    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut saw_zip64 = false;

    loop {
        let Some(sig) = read_signature(r)? else {
            break;
        };
        if sig == EndOfCentralDirectory::SIGNATURE
            || sig == Zip64EOCD::SIGNATURE
            || sig == Zip64EOCDLocator::SIGNATURE
        {
            break;
        }
        if sig != CentralDirectoryHeader::SIGNATURE {
            let here = r.stream_position()?.saturating_sub(4);
            return Err(ZipError::format_at("unexpected central directory signature", here));
        }

        let header = CentralDirectoryHeader::read_after_signature(r)?;
        if find_extra(&header.extra, EXTRA_ZIP64).is_some() {
            saw_zip64 = true;
        }
        let Some(entry) = resolve_entry(&header, disk_starts, duplicates, &mut seen)? else {
            continue;
        };
        entries.push(entry);
    }

    Ok((entries, saw_zip64))
}

/// Turn a directory record into a [`RawEntry`], applying ZIP64 values,
/// timestamp extras and the duplicate-name policy. Returns `None` when
/// the policy drops the record.
fn resolve_entry(
    header: &CentralDirectoryHeader,
    disk_starts: &[u64],
    duplicates: DuplicateNameMode,
    seen: &mut HashSet<String>,
) -> Result<Option<RawEntry>> {
    let mut uncompressed = u64::from(header.uncompressed_size);
    let mut compressed = u64::from(header.compressed_size);
    let mut lfh_offset = u64::from(header.lfh_offset);
    let mut disk_start = u32::from(header.disk_start);
    apply_zip64_extra(
        &header.extra,
        &mut uncompressed,
        &mut compressed,
        &mut lfh_offset,
        &mut disk_start,
    )?;

    let mut name = header.file_name();
    match duplicates {
        DuplicateNameMode::Rename => {
            let mut renames = 0;
            while seen.contains(&name) {
                renames += 1;
                if renames > MAX_COPY_RENAMES {
                    return Err(ZipError::Format(format!(
                        "could not derive a unique name for duplicate entry '{name}'"
                    )));
                }
                name = append_copy_to_name(&name);
            }
        }
        DuplicateNameMode::Ignore => {
            if seen.contains(&name) {
                debug!("dropping duplicate entry '{}'", name);
                return Ok(None);
            }
        }
    }
    seen.insert(name.clone());

    let packed = DosDateTime {
        time: header.dos_time,
        date: header.dos_date,
    };
    let mtime = mtime_from_extras(&header.extra).unwrap_or_else(|| packed.to_system());

    Ok(Some(RawEntry {
        name,
        method: CompressionMethod::from_u16(header.method),
        flags: header.flags,
        crc32: header.crc32,
        compressed_size: compressed,
        uncompressed_size: uncompressed,
        lfh_offset: logical_offset(disk_starts, disk_start, lfh_offset),
        disk_start,
        dos_time: header.dos_time,
        dos_date: header.dos_date,
        mtime,
        is_directory: header.is_directory(),
        encryption: header.encryption(),
        comment: decode_name(&header.comment, header.is_utf8()),
        external_attrs: header.external_attrs,
    }))
}

/// Rebuild the entry list by walking local file headers from the front.
///
/// Engaged when the trailer is damaged. A trailing central directory is
/// still consulted for comments and attributes when it happens to parse;
/// errors there are tolerated because the local headers are already in
/// hand.
fn scan_local_headers<R: Read + Seek>(
    r: &mut R,
    len: u64,
    duplicates: DuplicateNameMode,
) -> Result<ArchiveIndex> {
    r.seek(SeekFrom::Start(0))?;
    let mut sig = match read_signature(r)? {
        Some(s) => s,
        None => return Err(ZipError::Format("file too short to be an archive".into())),
    };

    // Tolerated front matter: the PK00 marker some tools emit, or the
    // split marker left by volume one of a reassembled spanned archive.
    if sig == PK00_SIGNATURE || sig == DataDescriptor::SIGNATURE {
        sig = match read_signature(r)? {
            Some(s) => s,
            None => return Err(ZipError::Format("file too short to be an archive".into())),
        };
    }

    if sig == EndOfCentralDirectory::SIGNATURE {
        // An archive with no entries at all.
        return Ok(ArchiveIndex {
            entries: Vec::new(),
            comment: read_eocd_comment_here(r, len)?,
            zip64: false,
            total_disks: 1,
            recovered_by_scan: true,
        });
    }
    if sig != LocalFileHeader::SIGNATURE {
        return Err(ZipError::Format("not a zip archive".into()));
    }

    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut saw_zip64 = false;

    while sig == LocalFileHeader::SIGNATURE {
        let lfh_offset = r.stream_position()? - 4;
        let header = LocalFileHeader::read_after_signature(r)?;
        let mut entry = read_past_payload(r, &header, lfh_offset)?;
        saw_zip64 = saw_zip64 || find_extra(&header.extra, EXTRA_ZIP64).is_some();

        match duplicates {
            DuplicateNameMode::Rename => {
                let mut renames = 0;
                while seen.contains(&entry.name) {
                    renames += 1;
                    if renames > MAX_COPY_RENAMES {
                        return Err(ZipError::Format(format!(
                            "could not derive a unique name for duplicate entry '{}'",
                            entry.name
                        )));
                    }
                    entry.name = append_copy_to_name(&entry.name);
                }
            }
            DuplicateNameMode::Ignore => {
                if seen.contains(&entry.name) {
                    debug!("dropping duplicate entry '{}'", entry.name);
                    sig = match read_signature(r)? {
                        Some(s) => s,
                        None => break,
                    };
                    continue;
                }
            }
        }
        seen.insert(entry.name.clone());
        entries.push(entry);

        sig = match read_signature(r)? {
            Some(s) => s,
            None => break,
        };
    }

    debug!("local-header scan recovered {} entries", entries.len());

    // Best-effort enrichment from whatever directory follows.
    let mut comment = Vec::new();
    if sig == CentralDirectoryHeader::SIGNATURE {
        let cd_start = r.stream_position()? - 4;
        r.seek(SeekFrom::Start(cd_start))?;
        if let Ok((cd_entries, _)) = walk_central_directory(r, &[], duplicates) {
            for cd_entry in &cd_entries {
                if let Some(local) = entries.iter_mut().find(|e| e.name == cd_entry.name) {
                    local.comment = cd_entry.comment.clone();
                    local.external_attrs = cd_entry.external_attrs;
                    local.is_directory = local.is_directory || cd_entry.is_directory;
                }
            }
            if let Ok(Some((eocd, eocd_offset))) = find_eocd(r, len) {
                let mut bytes = vec![0u8; usize::from(eocd.comment_len)];
                r.seek(SeekFrom::Start(
                    eocd_offset + EndOfCentralDirectory::SIZE as u64,
                ))?;
                if r.read_exact(&mut bytes).is_ok() {
                    comment = bytes;
                }
            }
        }
    }

    Ok(ArchiveIndex {
        entries,
        comment,
        zip64: saw_zip64,
        total_disks: 1,
        recovered_by_scan: true,
    })
}

/// Read one entry's sizes/crc during the forward scan and leave the
/// cursor at the next record. Bit-3 entries trigger descriptor recovery.
fn read_past_payload<R: Read + Seek>(
    r: &mut R,
    header: &LocalFileHeader,
    lfh_offset: u64,
) -> Result<RawEntry> {
    let mut uncompressed = u64::from(header.uncompressed_size);
    let mut compressed = u64::from(header.compressed_size);
    let mut ignored_offset = 0u64;
    let mut ignored_disk = 0u32;
    apply_zip64_extra(
        &header.extra,
        &mut uncompressed,
        &mut compressed,
        &mut ignored_offset,
        &mut ignored_disk,
    )?;
    let zip64_entry = find_extra(&header.extra, EXTRA_ZIP64).is_some();

    let name = header.file_name();
    let is_directory = name.ends_with('/');
    let mut crc32 = header.crc32;

    if header.has_descriptor() && !is_directory {
        let descriptor = recover_descriptor(r, zip64_entry)?;
        crc32 = descriptor.crc32;
        compressed = descriptor.compressed_size;
        uncompressed = descriptor.uncompressed_size;
    } else {
        let data_start = r.stream_position()?;
        r.seek(SeekFrom::Start(data_start + compressed))?;
    }

    let packed = DosDateTime {
        time: header.dos_time,
        date: header.dos_date,
    };
    let mtime = mtime_from_extras(&header.extra).unwrap_or_else(|| packed.to_system());

    let encryption = if header.is_encrypted() {
        EncryptionMethod::ZipCrypto
    } else {
        EncryptionMethod::None
    };

    Ok(RawEntry {
        name,
        method: CompressionMethod::from_u16(header.method),
        flags: header.flags,
        crc32,
        compressed_size: compressed,
        uncompressed_size: uncompressed,
        lfh_offset,
        disk_start: 0,
        dos_time: header.dos_time,
        dos_date: header.dos_date,
        mtime,
        is_directory,
        encryption,
        comment: String::new(),
        external_attrs: 0,
    })
}

/// Hunt the data descriptor for a bit-3 entry of unknown length.
///
/// Scans forward for the descriptor signature and accepts a match only
/// when the compressed size it records equals the payload bytes skipped
/// to reach it. A mismatch means the signature bytes were payload; they
/// count as four data bytes and the scan resumes. Best-effort: bounded
/// by [`MAX_DESCRIPTOR_TRIES`].
fn recover_descriptor<R: Read + Seek>(r: &mut R, zip64: bool) -> Result<DataDescriptor> {
    let body_len: i64 = if zip64 { 20 } else { 12 };
    let mut data_read = 0u64;

    for _ in 0..MAX_DESCRIPTOR_TRIES {
        let skipped = match find_signature(r, DataDescriptor::SIGNATURE)? {
            Some(d) => d,
            None => {
                return Err(ZipError::Format(
                    "no data descriptor found for streamed entry".into(),
                ));
            }
        };
        data_read += skipped;

        let crc32 = r.read_u32::<LittleEndian>()?;
        let (compressed, uncompressed) = if zip64 {
            (
                r.read_u64::<LittleEndian>()?,
                r.read_u64::<LittleEndian>()?,
            )
        } else {
            (
                u64::from(r.read_u32::<LittleEndian>()?),
                u64::from(r.read_u32::<LittleEndian>()?),
            )
        };

        if compressed == data_read {
            return Ok(DataDescriptor {
                crc32,
                compressed_size: compressed,
                uncompressed_size: uncompressed,
            });
        }

        // False positive: un-read the body (it may hold the real
        // signature) and count the matched bytes as payload.
        r.seek(SeekFrom::Current(-body_len))?;
        data_read += 4;
    }

    Err(ZipError::Format(
        "gave up hunting a consistent data descriptor".into(),
    ))
}

/// Scan forward for a four-byte signature.
///
/// Returns the number of bytes skipped before the signature and leaves
/// the cursor just past it, or `None` at end of stream.
pub(crate) fn find_signature<R: Read + Seek>(r: &mut R, sig: &[u8]) -> Result<Option<u64>> {
    let start = r.stream_position()?;
    let mut buf = vec![0u8; 16 * 1024];
    let mut carry = [0u8; 3];
    let mut carry_len = 0usize;
    let mut consumed = 0u64;

    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }

        let mut hay = Vec::with_capacity(carry_len + n);
        hay.extend_from_slice(&carry[..carry_len]);
        hay.extend_from_slice(&buf[..n]);

        if let Some(i) = hay.windows(4).position(|w| w == sig) {
            let before = consumed - carry_len as u64 + i as u64;
            r.seek(SeekFrom::Start(start + before + 4))?;
            return Ok(Some(before));
        }

        consumed += n as u64;
        let keep = hay.len().min(3);
        carry[..keep].copy_from_slice(&hay[hay.len() - keep..]);
        carry_len = keep;
    }
}

/// Seek to an entry's local header and compute where its payload starts.
/// The local header's own name/extra lengths govern, not the directory's.
pub fn payload_offset<R: Read + Seek>(r: &mut R, lfh_offset: u64) -> Result<(LocalFileHeader, u64)> {
    r.seek(SeekFrom::Start(lfh_offset))?;
    let header = LocalFileHeader::read_from(r)?;
    let data = lfh_offset + header.len();
    Ok((header, data))
}

fn read_signature<R: Read>(r: &mut R) -> Result<Option<[u8; 4]>> {
    let mut sig = [0u8; 4];
    let mut filled = 0usize;
    while filled < 4 {
        let n = r.read(&mut sig[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(sig))
}

fn read_eocd_comment_here<R: Read + Seek>(r: &mut R, len: u64) -> Result<Vec<u8>> {
    // cursor sits right after the EOCD signature
    let record_start = r.stream_position()? - 4;
    r.seek(SeekFrom::Start(record_start))?;
    if len - record_start < EndOfCentralDirectory::SIZE as u64 {
        return Ok(Vec::new());
    }
    let mut fixed = [0u8; EndOfCentralDirectory::SIZE];
    r.read_exact(&mut fixed)?;
    let eocd = EndOfCentralDirectory::from_bytes(&fixed)?;
    let mut comment = vec![0u8; usize::from(eocd.comment_len)];
    if r.read_exact(&mut comment).is_err() {
        return Ok(Vec::new());
    }
    Ok(comment)
}

/// Splice " (copy N)" into a name, in front of the extension when one
/// exists; an existing counter increments instead of nesting.
pub(crate) fn append_copy_to_name(name: &str) -> String {
    fn splice(stem: &str) -> String {
        match parse_copy_suffix(stem) {
            Some((at, n)) => format!("{} (copy {})", &stem[..at], n + 1),
            None => format!("{stem} (copy 1)"),
        }
    }

    match name.rfind('.') {
        Some(dot) => {
            let (stem, ext) = name.split_at(dot);
            format!("{}{}", splice(stem), ext)
        }
        None => splice(name),
    }
}

/// Offset and value of a trailing " (copy N)" suffix.
fn parse_copy_suffix(stem: &str) -> Option<(usize, u32)> {
    let at = stem.rfind(" (copy ")?;
    let digits = stem[at + 7..].strip_suffix(')')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((at, digits.parse().ok()?))
}
