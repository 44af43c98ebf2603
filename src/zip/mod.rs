//! ZIP archive reading, editing, and writing.
//!
//! ## Architecture
//!
//! The module is organized into four components:
//!
//! - `structures`: wire-format records (headers, trailers, extra fields)
//!   with their codecs
//! - `reader`: central-directory indexing, with a local-header scan
//!   fallback for archives whose trailer is damaged
//! - `writer`: streaming serializer that emits entries front to back over
//!   any volume sink
//! - `archive`: the editable model tying both together
//!
//! ## ZIP format overview
//!
//! An archive is a sequence of local file headers, each followed by its
//! compressed payload (and, for forward-only writes, a data descriptor
//! carrying the numbers that were unknown when the header went out),
//! then a central directory summarizing every entry, then an end-of-
//! central-directory trailer. ZIP64 adds a wider trailer pair ahead of
//! the classic one and per-entry extra fields for values that overflow
//! the 16/32-bit header slots. Reading starts from the trailer; writing
//! streams entries and settles the directory last.
//!
//! ## Supported features
//!
//! - PKZIP APPNOTE 6.3.x layouts, ZIP64 included
//! - STORED and DEFLATE entry payloads
//! - ZipCrypto stream encryption (read and write)
//! - Split archives (`.z01`, `.z02`, ... volumes)
//! - Trailer-damage recovery by scanning local headers
//!
//! ## Limitations
//!
//! - Strong (AES or PKWARE certificate) encryption is detected but
//!   payloads cannot be deciphered
//! - No BZIP2, LZMA, or other compression methods

mod archive;
mod reader;
mod structures;
mod writer;

pub use archive::{Archive, ArchiveOptions, Entry};
pub use reader::{payload_offset, read_archive, ArchiveIndex, DuplicateNameMode, RawEntry};
pub use structures::*;
pub use writer::{
    ArchiveWriter, EntryPayload, PendingEntry, SaveOptions, WriteSummary, WrittenEntry, Zip64Mode,
    PARALLEL_THRESHOLD,
};
