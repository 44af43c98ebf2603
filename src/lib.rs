//! # zipforge
//!
//! A ZIP archive engine: read, create, edit, and save archives, including
//! ZIP64 layouts, split volumes, ZipCrypto encryption, and recovery of
//! archives with damaged trailers.
//!
//! Opening an archive reads only its central directory; payloads stay on
//! disk until extracted. Editing is cheap: entries kept from the source
//! archive are copied raw on save, compressed bytes verbatim, so a resave
//! never recompresses what it does not touch.
//!
//! ## Features
//!
//! - Read and write standard and ZIP64 archives
//! - STORED and DEFLATE compression, with multi-threaded deflate for
//!   large payloads
//! - ZipCrypto encryption and decryption, password checked before any
//!   decompression
//! - Split archives (`.z01` volumes) on both the read and write side
//! - Streaming saves to non-seekable destinations via data descriptors
//! - Central-directory recovery by local-header scan
//!
//! ## Example
//!
//! ```no_run
//! use zipforge::Archive;
//!
//! fn main() -> zipforge::Result<()> {
//!     let mut archive = Archive::new();
//!     archive.add_entry_from_bytes("hello.txt", b"hello world".to_vec())?;
//!     archive.add_directory("docs")?;
//!     archive.save_to_file("hello.zip")?;
//!
//!     let mut reopened = Archive::open("hello.zip")?;
//!     for entry in reopened.entries() {
//!         println!("{}", entry.name());
//!     }
//!     let body = reopened.extract_entry("hello.txt", None)?;
//!     assert_eq!(body, b"hello world");
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod crc;
pub mod crypto;
pub mod deflate;
pub mod error;
pub mod io;
pub mod zip;

pub use cli::Cli;
pub use error::{Result, ZipError};
pub use zip::{Archive, ArchiveOptions, Entry};
