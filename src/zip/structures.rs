//! On-disk ZIP record types.
//!
//! Every record follows the same shape: a `SIGNATURE` constant, a
//! `read_*` constructor driven by `byteorder`, and a `write_to` emitter.
//! Multi-byte fields are little-endian throughout. Sizes and offsets
//! that overflow the classic 32/16-bit fields saturate to the sentinel
//! values and move into the ZIP64 extra field (0x0001).

use std::io::{Cursor, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

use crate::error::{Result, ZipError};

/// Saturated 32-bit field: the real value lives in the ZIP64 extra.
pub const ZIP64_SENTINEL_U32: u32 = 0xFFFF_FFFF;
/// Saturated 16-bit field.
pub const ZIP64_SENTINEL_U16: u16 = 0xFFFF;

pub const FLAG_ENCRYPTED: u16 = 0x0001;
pub const FLAG_DESCRIPTOR: u16 = 0x0008;
pub const FLAG_STRONG_ENCRYPTION: u16 = 0x0040;
pub const FLAG_UTF8: u16 = 0x0800;

pub const EXTRA_ZIP64: u16 = 0x0001;
pub const EXTRA_NTFS_TIMES: u16 = 0x000a;
pub const EXTRA_STRONG_ENCRYPTION: u16 = 0x0017;
pub const EXTRA_UNIX_EXTENDED_TIME: u16 = 0x5455;
pub const EXTRA_UNIX_TYPE1: u16 = 0x5855;

/// Lowest version able to read a baseline deflate entry.
pub const VERSION_NEEDED_DEFAULT: u16 = 20;
/// Version required once ZIP64 records are in play.
pub const VERSION_NEEDED_ZIP64: u16 = 45;
pub const VERSION_MADE_BY: u16 = 45;

/// FAT external attribute bits.
pub const ATTR_DIRECTORY: u32 = 0x10;
pub const ATTR_ARCHIVE: u32 = 0x20;

/// Optional four-byte marker some tools place before the first local header.
pub const PK00_SIGNATURE: &[u8] = b"PK\x00\x00";

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// Entry encryption as recorded in the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMethod {
    #[default]
    None,
    /// Legacy PKZIP stream cipher with the 12-byte verification header.
    ZipCrypto,
    /// Strong-encryption extension; carried algorithm id, never decoded.
    Strong(u16),
}

impl EncryptionMethod {
    pub fn is_some(&self) -> bool {
        !matches!(self, EncryptionMethod::None)
    }
}

/// Write-side lifecycle of an entry's header numbers.
///
/// Local headers go out before the payload is compressed, so the crc and
/// size fields start unknown. They become known either through a trailing
/// data descriptor or by patching the header once the payload is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Numbers unknown; a descriptor was promised or a patch is planned.
    Pending,
    /// Digest and sizes are final.
    Finalized {
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
    },
}

impl HeaderState {
    /// The finalized numbers, or `BadState` when still pending.
    pub fn numbers(&self) -> Result<(u32, u64, u64)> {
        match *self {
            HeaderState::Finalized {
                crc32,
                compressed_size,
                uncompressed_size,
            } => Ok((crc32, compressed_size, uncompressed_size)),
            HeaderState::Pending => Err(ZipError::BadState(
                "entry emitted before its sizes were finalized",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamps

const DOS_EPOCH_UNIX_SECS: u64 = 315_532_800;
const FILETIME_UNIX_DELTA_SECS: u64 = 11_644_473_600;

/// 1980-01-01 00:00:00, the earliest instant DOS fields can hold.
pub fn dos_epoch() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(DOS_EPOCH_UNIX_SECS)
}

/// MS-DOS date/time pair as stored in ZIP headers, 2-second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

impl DosDateTime {
    pub const EPOCH: Self = Self { time: 0, date: 0x21 };

    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    /// Pack a wall-clock instant; years outside 1980..=2107 clamp.
    pub fn from_system(t: SystemTime) -> Self {
        let dt: DateTime<Local> = t.into();
        if dt.year() < 1980 {
            return Self::EPOCH;
        }
        let year = dt.year().min(2107) as u16;
        let date = ((year - 1980) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time =
            ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
        Self { time, date }
    }

    /// Unpack to an instant; placeholder or unbuildable values floor to
    /// [`dos_epoch`].
    pub fn to_system(self) -> SystemTime {
        let blob = (u32::from(self.date) << 16) | u32::from(self.time);
        if blob == 0 || blob == 0xFFFF {
            return dos_epoch();
        }
        let (year, month, day) = self.ymd();
        let (hour, minute, second) = self.hms();
        match Local
            .with_ymd_and_hms(
                i32::from(year),
                u32::from(month),
                u32::from(day),
                u32::from(hour),
                u32::from(minute),
                u32::from(second),
            )
            .earliest()
        {
            Some(dt) => dt.into(),
            None => dos_epoch(),
        }
    }

    /// (year, month, day)
    pub fn ymd(self) -> (u16, u8, u8) {
        let day = (self.date & 0x1F) as u8;
        let month = ((self.date >> 5) & 0x0F) as u8;
        let year = ((self.date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// (hour, minute, second)
    pub fn hms(self) -> (u8, u8, u8) {
        let second = ((self.time & 0x1F) * 2) as u8;
        let minute = ((self.time >> 5) & 0x3F) as u8;
        let hour = ((self.time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

fn filetime_from_system(t: SystemTime) -> u64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() + FILETIME_UNIX_DELTA_SECS) * 10_000_000
            + u64::from(d.subsec_nanos() / 100),
        Err(_) => 0,
    }
}

fn system_from_filetime(ft: u64) -> Option<SystemTime> {
    let unix_100ns = ft.checked_sub(FILETIME_UNIX_DELTA_SECS * 10_000_000)?;
    let secs = unix_100ns / 10_000_000;
    let nanos = (unix_100ns % 10_000_000) as u32 * 100;
    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}

fn unix_from_system(t: SystemTime) -> u32 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs().min(u64::from(u32::MAX)) as u32,
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// Entry names

/// Encode an entry name; returns the bytes and whether the UTF-8 flag is
/// required (pure-ASCII names stay flag-free for old readers).
pub fn encode_name(name: &str) -> (Vec<u8>, bool) {
    (name.as_bytes().to_vec(), !name.is_ascii())
}

/// Decode an entry name: UTF-8 when flagged, IBM code page 437 otherwise.
pub fn decode_name(bytes: &[u8], utf8: bool) -> String {
    if utf8 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        bytes
            .iter()
            .map(|&b| {
                if b < 0x80 {
                    b as char
                } else {
                    CP437_HIGH[(b - 0x80) as usize]
                }
            })
            .collect()
    }
}

/// Code page 437, upper half (0x80..=0xFF).
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

// ---------------------------------------------------------------------------
// Extra fields

/// Body of the first extra-field block with the given id, if present.
/// A truncated trailing block ends the walk without erroring.
pub fn find_extra(extra: &[u8], id: u16) -> Option<&[u8]> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let block_id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
        let body = rest.get(4..4 + len)?;
        if block_id == id {
            return Some(body);
        }
        rest = &rest[4 + len..];
    }
    None
}

fn push_extra(out: &mut Vec<u8>, id: u16, body: &[u8]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
}

/// Replace header fields saturated to the sentinel with their real values
/// from the ZIP64 extra. Fields appear in the block only when saturated,
/// always in the order uncompressed, compressed, offset, disk.
pub fn apply_zip64_extra(
    extra: &[u8],
    uncompressed: &mut u64,
    compressed: &mut u64,
    lfh_offset: &mut u64,
    disk_start: &mut u32,
) -> Result<()> {
    let Some(block) = find_extra(extra, EXTRA_ZIP64) else {
        return Ok(());
    };
    let mut need = 0usize;
    for saturated in [
        *uncompressed == u64::from(ZIP64_SENTINEL_U32),
        *compressed == u64::from(ZIP64_SENTINEL_U32),
        *lfh_offset == u64::from(ZIP64_SENTINEL_U32),
    ] {
        if saturated {
            need += 8;
        }
    }
    if *disk_start == u32::from(ZIP64_SENTINEL_U16) {
        need += 4;
    }
    if block.len() < need {
        return Err(ZipError::Format(format!(
            "zip64 extra holds {} bytes, {} needed",
            block.len(),
            need
        )));
    }

    let mut c = Cursor::new(block);
    if *uncompressed == u64::from(ZIP64_SENTINEL_U32) {
        *uncompressed = c.read_u64::<LittleEndian>()?;
    }
    if *compressed == u64::from(ZIP64_SENTINEL_U32) {
        *compressed = c.read_u64::<LittleEndian>()?;
    }
    if *lfh_offset == u64::from(ZIP64_SENTINEL_U32) {
        *lfh_offset = c.read_u64::<LittleEndian>()?;
    }
    if *disk_start == u32::from(ZIP64_SENTINEL_U16) {
        *disk_start = c.read_u32::<LittleEndian>()?;
    }
    Ok(())
}

/// Build a ZIP64 extra block carrying exactly the saturated fields.
/// Empty when nothing saturates.
pub fn build_zip64_extra(
    uncompressed: Option<u64>,
    compressed: Option<u64>,
    lfh_offset: Option<u64>,
    disk_start: Option<u32>,
) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(v) = uncompressed {
        body.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = compressed {
        body.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = lfh_offset {
        body.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = disk_start {
        body.extend_from_slice(&v.to_le_bytes());
    }
    if body.is_empty() {
        return body;
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    push_extra(&mut out, EXTRA_ZIP64, &body);
    out
}

/// NTFS times block (0x000a): reserved word, then tag 1 with three
/// 100ns-FILETIME stamps (modify, access, create).
pub fn build_ntfs_times_extra(mtime: SystemTime, atime: SystemTime, ctime: SystemTime) -> Vec<u8> {
    let mut body = Vec::with_capacity(32);
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&24u16.to_le_bytes());
    for t in [mtime, atime, ctime] {
        body.extend_from_slice(&filetime_from_system(t).to_le_bytes());
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    push_extra(&mut out, EXTRA_NTFS_TIMES, &body);
    out
}

/// Extended-timestamp block (0x5455), modification time only.
pub fn build_unix_times_extra(mtime: SystemTime) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    body.push(0x01);
    body.extend_from_slice(&unix_from_system(mtime).to_le_bytes());
    let mut out = Vec::with_capacity(body.len() + 4);
    push_extra(&mut out, EXTRA_UNIX_EXTENDED_TIME, &body);
    out
}

/// Best modification time recoverable from the extra fields.
/// NTFS stamps win over 0x5455, which wins over legacy 0x5855.
pub fn mtime_from_extras(extra: &[u8]) -> Option<SystemTime> {
    if let Some(block) = find_extra(extra, EXTRA_NTFS_TIMES) {
        if let Some(t) = ntfs_mtime(block) {
            return Some(t);
        }
    }
    if let Some(block) = find_extra(extra, EXTRA_UNIX_EXTENDED_TIME) {
        if block.len() >= 5 && block[0] & 0x01 != 0 {
            let secs = u32::from_le_bytes([block[1], block[2], block[3], block[4]]);
            return Some(UNIX_EPOCH + Duration::from_secs(u64::from(secs)));
        }
    }
    if let Some(block) = find_extra(extra, EXTRA_UNIX_TYPE1) {
        // layout: access time, then modification time
        if block.len() >= 8 {
            let secs = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
            return Some(UNIX_EPOCH + Duration::from_secs(u64::from(secs)));
        }
    }
    None
}

fn ntfs_mtime(block: &[u8]) -> Option<SystemTime> {
    let mut rest = block.get(4..)?;
    while rest.len() >= 4 {
        let tag = u16::from_le_bytes([rest[0], rest[1]]);
        let len = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
        let body = rest.get(4..4 + len)?;
        if tag == 1 && body.len() >= 8 {
            let ft = u64::from_le_bytes(body[..8].try_into().ok()?);
            return system_from_filetime(ft);
        }
        rest = &rest[4 + len..];
    }
    None
}

/// Algorithm id from a strong-encryption extra block (0x0017).
pub fn strong_encryption_algorithm(extra: &[u8]) -> Option<u16> {
    let block = find_extra(extra, EXTRA_STRONG_ENCRYPTION)?;
    if block.len() >= 4 {
        Some(u16::from_le_bytes([block[2], block[3]]))
    } else {
        Some(0)
    }
}

// ---------------------------------------------------------------------------
// Records

/// Local File Header (LFH) - 30 bytes fixed, then name and extra
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

impl LocalFileHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x03\x04";
    pub const FIXED_SIZE: usize = 30;

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut sig = [0u8; 4];
        r.read_exact(&mut sig)?;
        if sig != Self::SIGNATURE {
            return Err(ZipError::Format("bad local file header signature".into()));
        }
        Self::read_after_signature(r)
    }

    /// Parse the record body when the 4-byte signature was already consumed.
    pub fn read_after_signature<R: Read>(r: &mut R) -> Result<Self> {
        let version_needed = r.read_u16::<LittleEndian>()?;
        let flags = r.read_u16::<LittleEndian>()?;
        let method = r.read_u16::<LittleEndian>()?;
        let dos_time = r.read_u16::<LittleEndian>()?;
        let dos_date = r.read_u16::<LittleEndian>()?;
        let crc32 = r.read_u32::<LittleEndian>()?;
        let compressed_size = r.read_u32::<LittleEndian>()?;
        let uncompressed_size = r.read_u32::<LittleEndian>()?;
        let name_len = usize::from(r.read_u16::<LittleEndian>()?);
        let extra_len = usize::from(r.read_u16::<LittleEndian>()?);

        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let mut extra = vec![0u8; extra_len];
        r.read_exact(&mut extra)?;

        Ok(Self {
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(self.dos_time)?;
        w.write_u16::<LittleEndian>(self.dos_date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.name.len() as u16)?;
        w.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        w.write_all(&self.name)?;
        w.write_all(&self.extra)?;
        Ok(())
    }

    /// Total serialized length.
    pub fn len(&self) -> u64 {
        (Self::FIXED_SIZE + self.name.len() + self.extra.len()) as u64
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn has_descriptor(&self) -> bool {
        self.flags & FLAG_DESCRIPTOR != 0
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & FLAG_UTF8 != 0
    }

    pub fn file_name(&self) -> String {
        decode_name(&self.name, self.is_utf8())
    }
}

/// Data descriptor (PK\x07\x08) trailing a bit-3 entry
#[derive(Debug, Clone, Copy)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    pub const SIGNATURE: &'static [u8] = b"PK\x07\x08";

    /// Serialized length with the signature included.
    pub fn len(zip64: bool) -> u64 {
        if zip64 { 24 } else { 16 }
    }

    /// Emit with the signature; 8-byte sizes when the entry is ZIP64.
    pub fn write_to<W: Write>(&self, w: &mut W, zip64: bool) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        if zip64 {
            w.write_u64::<LittleEndian>(self.compressed_size)?;
            w.write_u64::<LittleEndian>(self.uncompressed_size)?;
        } else {
            w.write_u32::<LittleEndian>(self.compressed_size as u32)?;
            w.write_u32::<LittleEndian>(self.uncompressed_size as u32)?;
        }
        Ok(())
    }
}

/// Central Directory File Header (CDFH) - 46 bytes fixed, then
/// name, extra and comment
#[derive(Debug, Clone)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub lfh_offset: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x01\x02";
    pub const FIXED_SIZE: usize = 46;

    pub fn read_after_signature<R: Read>(r: &mut R) -> Result<Self> {
        let version_made_by = r.read_u16::<LittleEndian>()?;
        let version_needed = r.read_u16::<LittleEndian>()?;
        let flags = r.read_u16::<LittleEndian>()?;
        let method = r.read_u16::<LittleEndian>()?;
        let dos_time = r.read_u16::<LittleEndian>()?;
        let dos_date = r.read_u16::<LittleEndian>()?;
        let crc32 = r.read_u32::<LittleEndian>()?;
        let compressed_size = r.read_u32::<LittleEndian>()?;
        let uncompressed_size = r.read_u32::<LittleEndian>()?;
        let name_len = usize::from(r.read_u16::<LittleEndian>()?);
        let extra_len = usize::from(r.read_u16::<LittleEndian>()?);
        let comment_len = usize::from(r.read_u16::<LittleEndian>()?);
        let disk_start = r.read_u16::<LittleEndian>()?;
        let internal_attrs = r.read_u16::<LittleEndian>()?;
        let external_attrs = r.read_u32::<LittleEndian>()?;
        let lfh_offset = r.read_u32::<LittleEndian>()?;

        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let mut extra = vec![0u8; extra_len];
        r.read_exact(&mut extra)?;
        let mut comment = vec![0u8; comment_len];
        r.read_exact(&mut comment)?;

        Ok(Self {
            version_made_by,
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_start,
            internal_attrs,
            external_attrs,
            lfh_offset,
            name,
            extra,
            comment,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(self.dos_time)?;
        w.write_u16::<LittleEndian>(self.dos_date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.name.len() as u16)?;
        w.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        w.write_u16::<LittleEndian>(self.comment.len() as u16)?;
        w.write_u16::<LittleEndian>(self.disk_start)?;
        w.write_u16::<LittleEndian>(self.internal_attrs)?;
        w.write_u32::<LittleEndian>(self.external_attrs)?;
        w.write_u32::<LittleEndian>(self.lfh_offset)?;
        w.write_all(&self.name)?;
        w.write_all(&self.extra)?;
        w.write_all(&self.comment)?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        (Self::FIXED_SIZE + self.name.len() + self.extra.len() + self.comment.len()) as u64
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn has_descriptor(&self) -> bool {
        self.flags & FLAG_DESCRIPTOR != 0
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & FLAG_UTF8 != 0
    }

    pub fn file_name(&self) -> String {
        decode_name(&self.name, self.is_utf8())
    }

    pub fn is_directory(&self) -> bool {
        self.name.last() == Some(&b'/') || self.external_attrs & ATTR_DIRECTORY != 0
    }

    /// Encryption scheme implied by flags, method and extras.
    pub fn encryption(&self) -> EncryptionMethod {
        if self.flags & FLAG_ENCRYPTED == 0 {
            return EncryptionMethod::None;
        }
        if self.flags & FLAG_STRONG_ENCRYPTION != 0 || self.method == 99 {
            return EncryptionMethod::Strong(
                strong_encryption_algorithm(&self.extra).unwrap_or(0),
            );
        }
        if let Some(alg) = strong_encryption_algorithm(&self.extra) {
            return EncryptionMethod::Strong(alg);
        }
        EncryptionMethod::ZipCrypto
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::Format(
                "bad end-of-central-directory record".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W, comment: &[u8]) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.disk_number)?;
        w.write_u16::<LittleEndian>(self.disk_with_cd)?;
        w.write_u16::<LittleEndian>(self.disk_entries)?;
        w.write_u16::<LittleEndian>(self.total_entries)?;
        w.write_u32::<LittleEndian>(self.cd_size)?;
        w.write_u32::<LittleEndian>(self.cd_offset)?;
        w.write_u16::<LittleEndian>(comment.len() as u16)?;
        w.write_all(comment)?;
        Ok(())
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_number == ZIP64_SENTINEL_U16
            || self.disk_with_cd == ZIP64_SENTINEL_U16
            || self.disk_entries == ZIP64_SENTINEL_U16
            || self.total_entries == ZIP64_SENTINEL_U16
            || self.cd_size == ZIP64_SENTINEL_U32
            || self.cd_offset == ZIP64_SENTINEL_U32
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::Format("bad zip64 locator record".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        w.write_u64::<LittleEndian>(self.eocd64_offset)?;
        w.write_u32::<LittleEndian>(self.total_disks)?;
        Ok(())
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::Format("bad zip64 end-of-directory record".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);
        // record-size field; fixed part only for the revisions we emit
        let _eocd64_size = cursor.read_u64::<LittleEndian>()?;

        Ok(Self {
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u64::<LittleEndian>((Self::MIN_SIZE - 12) as u64)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u32::<LittleEndian>(self.disk_number)?;
        w.write_u32::<LittleEndian>(self.disk_with_cd)?;
        w.write_u64::<LittleEndian>(self.disk_entries)?;
        w.write_u64::<LittleEndian>(self.total_entries)?;
        w.write_u64::<LittleEndian>(self.cd_size)?;
        w.write_u64::<LittleEndian>(self.cd_offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_header_round_trip() {
        let hdr = LocalFileHeader {
            version_needed: VERSION_NEEDED_DEFAULT,
            flags: FLAG_UTF8,
            method: CompressionMethod::Deflate.as_u16(),
            dos_time: 0x63CA,
            dos_date: 0x50CF,
            crc32: 0xCBF43926,
            compressed_size: 9,
            uncompressed_size: 9,
            name: b"caf\xc3\xa9.txt".to_vec(),
            extra: Vec::new(),
        };

        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, hdr.len());

        let back = LocalFileHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.file_name(), "café.txt");
        assert_eq!(back.crc32, 0xCBF43926);
        assert_eq!(back.method, 8);
        assert!(back.is_utf8());
        assert!(!back.is_encrypted());
    }

    #[test]
    fn test_local_header_rejects_bad_signature() {
        let err = LocalFileHeader::read_from(&mut Cursor::new(b"PK\x01\x02garbage")).unwrap_err();
        assert!(matches!(err, ZipError::Format(_)));
    }

    #[test]
    fn test_central_header_round_trip() {
        let hdr = CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_NEEDED_DEFAULT,
            flags: 0,
            method: 0,
            dos_time: 0,
            dos_date: 0x21,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            disk_start: 0,
            internal_attrs: 0,
            external_attrs: ATTR_DIRECTORY,
            lfh_offset: 1234,
            name: b"docs/".to_vec(),
            extra: Vec::new(),
            comment: b"per-entry note".to_vec(),
        };

        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();

        let mut c = Cursor::new(&buf);
        let mut sig = [0u8; 4];
        c.read_exact(&mut sig).unwrap();
        assert_eq!(&sig, CentralDirectoryHeader::SIGNATURE);
        let back = CentralDirectoryHeader::read_after_signature(&mut c).unwrap();
        assert!(back.is_directory());
        assert_eq!(back.comment, b"per-entry note");
        assert_eq!(back.lfh_offset, 1234);
        assert_eq!(back.encryption(), EncryptionMethod::None);
    }

    #[test]
    fn test_encryption_detection() {
        let mut hdr = CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_NEEDED_DEFAULT,
            flags: FLAG_ENCRYPTED,
            method: 8,
            dos_time: 0,
            dos_date: 0x21,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            disk_start: 0,
            internal_attrs: 0,
            external_attrs: 0,
            lfh_offset: 0,
            name: b"secret".to_vec(),
            extra: Vec::new(),
            comment: Vec::new(),
        };
        assert_eq!(hdr.encryption(), EncryptionMethod::ZipCrypto);

        // strong-encryption extra flips the classification
        let mut extra = Vec::new();
        push_extra(&mut extra, EXTRA_STRONG_ENCRYPTION, &[2, 0, 0x0E, 0x66, 0, 1]);
        hdr.extra = extra;
        assert_eq!(hdr.encryption(), EncryptionMethod::Strong(0x660E));
    }

    #[test]
    fn test_eocd_round_trip() {
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 3,
            total_entries: 3,
            cd_size: 150,
            cd_offset: 4242,
            comment_len: 0,
        };
        let mut buf = Vec::new();
        eocd.write_to(&mut buf, b"hello").unwrap();
        assert_eq!(buf.len(), EndOfCentralDirectory::SIZE + 5);

        let back = EndOfCentralDirectory::from_bytes(&buf).unwrap();
        assert_eq!(back.total_entries, 3);
        assert_eq!(back.cd_offset, 4242);
        assert_eq!(back.comment_len, 5);
        assert!(!back.is_zip64());
    }

    #[test]
    fn test_zip64_records_round_trip() {
        let eocd64 = Zip64EOCD {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_NEEDED_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 70000,
            total_entries: 70000,
            cd_size: 99,
            cd_offset: 0x1_0000_0000,
        };
        let mut buf = Vec::new();
        eocd64.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), Zip64EOCD::MIN_SIZE);
        let back = Zip64EOCD::from_bytes(&buf).unwrap();
        assert_eq!(back.total_entries, 70000);
        assert_eq!(back.cd_offset, 0x1_0000_0000);

        let loc = Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset: 0x1234_5678_9A,
            total_disks: 1,
        };
        let mut buf = Vec::new();
        loc.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), Zip64EOCDLocator::SIZE);
        let back = Zip64EOCDLocator::from_bytes(&buf).unwrap();
        assert_eq!(back.eocd64_offset, 0x1234_5678_9A);
    }

    #[test]
    fn test_zip64_extra_partial_fields() {
        // only the offset saturates; block carries just that one u64
        let extra = build_zip64_extra(None, None, Some(0x1_0000_0010), None);
        assert_eq!(extra.len(), 4 + 8);

        let mut uncompressed = 100u64;
        let mut compressed = 50u64;
        let mut offset = u64::from(ZIP64_SENTINEL_U32);
        let mut disk = 0u32;
        apply_zip64_extra(&extra, &mut uncompressed, &mut compressed, &mut offset, &mut disk)
            .unwrap();
        assert_eq!(uncompressed, 100);
        assert_eq!(compressed, 50);
        assert_eq!(offset, 0x1_0000_0010);
        assert_eq!(disk, 0);
    }

    #[test]
    fn test_zip64_extra_too_short_is_format_error() {
        let mut extra = Vec::new();
        push_extra(&mut extra, EXTRA_ZIP64, &[1, 2, 3, 4]);
        let mut uncompressed = u64::from(ZIP64_SENTINEL_U32);
        let mut compressed = 0u64;
        let mut offset = 0u64;
        let mut disk = 0u32;
        let err =
            apply_zip64_extra(&extra, &mut uncompressed, &mut compressed, &mut offset, &mut disk)
                .unwrap_err();
        assert!(matches!(err, ZipError::Format(_)));
    }

    #[test]
    fn test_dos_datetime_fields() {
        let t = DosDateTime {
            time: 0x63CA,
            date: 0x50CF,
        };
        assert_eq!(t.ymd(), (2020, 6, 15));
        assert_eq!(t.hms(), (12, 30, 20));
    }

    #[test]
    fn test_dos_datetime_placeholders_floor_to_epoch() {
        let zero = DosDateTime { time: 0, date: 0 };
        assert_eq!(zero.to_system(), dos_epoch());

        let ffff = DosDateTime {
            time: 0xFFFF,
            date: 0,
        };
        assert_eq!(ffff.to_system(), dos_epoch());

        // month 0 cannot build a date
        let invalid = DosDateTime { time: 0, date: 1 };
        assert_eq!(invalid.to_system(), dos_epoch());
    }

    #[test]
    fn test_dos_datetime_round_trip_within_resolution() {
        let now = SystemTime::now();
        let packed = DosDateTime::from_system(now);
        let back = packed.to_system();
        let delta = match now.duration_since(back) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        assert!(delta < Duration::from_secs(2));
    }

    #[test]
    fn test_pre_1980_clamps_to_epoch() {
        let old = UNIX_EPOCH + Duration::from_secs(86_400);
        assert_eq!(DosDateTime::from_system(old), DosDateTime::EPOCH);
    }

    #[test]
    fn test_filetime_round_trip() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_700);
        let back = system_from_filetime(filetime_from_system(t)).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_extra_time_precedence() {
        let ntfs_time = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let unix_time = UNIX_EPOCH + Duration::from_secs(1_500_000_000);

        let mut extra = build_unix_times_extra(unix_time);
        extra.extend_from_slice(&build_ntfs_times_extra(ntfs_time, ntfs_time, ntfs_time));
        assert_eq!(mtime_from_extras(&extra), Some(ntfs_time));

        let only_unix = build_unix_times_extra(unix_time);
        assert_eq!(mtime_from_extras(&only_unix), Some(unix_time));
    }

    #[test]
    fn test_legacy_unix_extra_mtime() {
        let mut extra = Vec::new();
        let atime = 1_400_000_000u32.to_le_bytes();
        let mtime = 1_450_000_000u32.to_le_bytes();
        let mut body = Vec::new();
        body.extend_from_slice(&atime);
        body.extend_from_slice(&mtime);
        push_extra(&mut extra, EXTRA_UNIX_TYPE1, &body);

        assert_eq!(
            mtime_from_extras(&extra),
            Some(UNIX_EPOCH + Duration::from_secs(1_450_000_000))
        );
    }

    #[test]
    fn test_cp437_name_decoding() {
        assert_eq!(decode_name(b"caf\x82.txt", false), "café.txt");
        assert_eq!(decode_name(b"stra\xe1e", false), "straße");
        assert_eq!(decode_name("café.txt".as_bytes(), true), "café.txt");
    }

    #[test]
    fn test_name_encoding_sets_utf8_only_when_needed() {
        let (bytes, utf8) = encode_name("plain.txt");
        assert_eq!(bytes, b"plain.txt");
        assert!(!utf8);

        let (bytes, utf8) = encode_name("café.txt");
        assert_eq!(bytes, "café.txt".as_bytes());
        assert!(utf8);
    }

    #[test]
    fn test_find_extra_skips_foreign_blocks() {
        let mut extra = Vec::new();
        push_extra(&mut extra, 0xCAFE, b"xx");
        push_extra(&mut extra, EXTRA_ZIP64, b"zzzzzzzz");
        assert_eq!(find_extra(&extra, EXTRA_ZIP64), Some(&b"zzzzzzzz"[..]));
        assert_eq!(find_extra(&extra, 0x9999), None);

        // truncated trailer ends the walk quietly
        extra.extend_from_slice(&[0x55, 0x54, 0xFF]);
        assert_eq!(find_extra(&extra, EXTRA_UNIX_EXTENDED_TIME), None);
    }

    #[test]
    fn test_header_state_guard() {
        assert!(HeaderState::Pending.numbers().is_err());
        let s = HeaderState::Finalized {
            crc32: 7,
            compressed_size: 10,
            uncompressed_size: 20,
        };
        assert_eq!(s.numbers().unwrap(), (7, 10, 20));
    }

    #[test]
    fn test_descriptor_lengths() {
        let d = DataDescriptor {
            crc32: 1,
            compressed_size: 2,
            uncompressed_size: 3,
        };
        let mut small = Vec::new();
        d.write_to(&mut small, false).unwrap();
        assert_eq!(small.len() as u64, DataDescriptor::len(false));

        let mut big = Vec::new();
        d.write_to(&mut big, true).unwrap();
        assert_eq!(big.len() as u64, DataDescriptor::len(true));
    }
}
