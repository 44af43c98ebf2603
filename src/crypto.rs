//! PKWARE traditional ZIP encryption (ZipCrypto).
//!
//! A three-key stream cipher driven by the CRC-32 table. Archives carry a
//! 12-byte header before the ciphertext: 11 salt bytes plus one check
//! byte derived from the entry CRC (or the DOS time field when the entry
//! uses a trailing data descriptor, because the CRC is not known when the
//! header is written). The check byte lets a wrong password fail fast,
//! before any decompression work.

use std::io::{self, Read, Write};

use rand::RngCore;

use crate::crc::crc32_byte;

/// Length of the encryption header preceding the ciphertext.
pub const ENCRYPTION_HEADER_LEN: usize = 12;

/// Keystream state. Keys initialized to [305419896, 591751049, 878082192].
pub struct ZipCrypto {
    key: [u32; 3],
}

impl ZipCrypto {
    pub fn new(password: &[u8]) -> Self {
        let mut c = ZipCrypto {
            key: [0x12345678, 0x23456789, 0x34567890],
        };
        for &b in password {
            c.update_keys(b);
        }
        c
    }

    fn update_keys(&mut self, c: u8) {
        self.key[0] = crc32_byte(self.key[0], c);
        self.key[1] = self.key[1].wrapping_add(self.key[0] & 0xff);
        self.key[1] = self.key[1].wrapping_mul(134775813).wrapping_add(1);
        self.key[2] = crc32_byte(self.key[2], (self.key[1] >> 24) as u8);
    }

    fn keystream_byte(&self) -> u8 {
        let temp = (self.key[2] | 2) as u16;
        (temp.wrapping_mul(temp ^ 1) >> 8) as u8
    }

    /// Decrypt data in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            let plain = *b ^ self.keystream_byte();
            self.update_keys(plain);
            *b = plain;
        }
    }

    /// Encrypt data in place. The key schedule advances on plaintext.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            let plain = *b;
            *b = plain ^ self.keystream_byte();
            self.update_keys(plain);
        }
    }

    /// Decrypt and validate the 12-byte encryption header.
    /// Returns true if the password checks out.
    ///
    /// The 12th plaintext byte must equal the high byte of the entry CRC,
    /// or of the packed DOS time when the entry was written with a
    /// trailing descriptor (bit 3) and the CRC was unknown at that point.
    pub fn check_header(
        &mut self,
        enc_header: &[u8; ENCRYPTION_HEADER_LEN],
        entry_crc: u32,
        dos_time: u32,
        uses_descriptor: bool,
    ) -> bool {
        let mut last_byte = 0u8;
        for &b in enc_header.iter() {
            let plain = b ^ self.keystream_byte();
            self.update_keys(plain);
            last_byte = plain;
        }

        if uses_descriptor {
            (dos_time >> 8) as u8 == last_byte
        } else {
            (entry_crc >> 24) as u8 == last_byte
        }
    }

    /// Build and encrypt a fresh 12-byte header for writing.
    pub fn make_header(
        &mut self,
        entry_crc: u32,
        dos_time: u32,
        uses_descriptor: bool,
    ) -> [u8; ENCRYPTION_HEADER_LEN] {
        let mut header = [0u8; ENCRYPTION_HEADER_LEN];
        rand::thread_rng().fill_bytes(&mut header);
        header[ENCRYPTION_HEADER_LEN - 1] = if uses_descriptor {
            (dos_time >> 8) as u8
        } else {
            (entry_crc >> 24) as u8
        };
        self.encrypt(&mut header);
        header
    }
}

/// Read decorator that decrypts ciphertext flowing out of `inner`.
///
/// Sits under the inflater in the extraction stack, so compressed bytes
/// are decrypted exactly once on their way up.
pub struct CipherReader<R> {
    inner: R,
    cipher: ZipCrypto,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, cipher: ZipCrypto) -> Self {
        Self { inner, cipher }
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.decrypt(&mut buf[..n]);
        Ok(n)
    }
}

/// Write decorator that encrypts bytes on their way into `inner`.
pub struct CipherWriter<W> {
    inner: W,
    cipher: ZipCrypto,
    scratch: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, cipher: ZipCrypto) -> Self {
        Self {
            inner,
            cipher,
            scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.encrypt(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_keys() {
        let c = ZipCrypto::new(b"");
        assert_eq!(c.key, [305419896, 591751049, 878082192]);
    }

    #[test]
    fn test_key_update_deterministic() {
        let c1 = ZipCrypto::new(b"password");
        let c2 = ZipCrypto::new(b"password");
        assert_eq!(c1.key, c2.key);
    }

    #[test]
    fn test_different_passwords_different_keys() {
        let c1 = ZipCrypto::new(b"abc");
        let c2 = ZipCrypto::new(b"xyz");
        assert_ne!(c1.key, c2.key);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let data = b"hello world";
        let mut buf = *data;

        let mut c = ZipCrypto::new(b"secret");
        c.encrypt(&mut buf);
        assert_ne!(&buf, data);

        let mut c = ZipCrypto::new(b"secret");
        c.decrypt(&mut buf);
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_header_roundtrip_crc_check() {
        let crc = 0xA1B2C3D4u32;
        let mut enc = ZipCrypto::new(b"hunter2");
        let header = enc.make_header(crc, 0, false);

        let mut dec = ZipCrypto::new(b"hunter2");
        assert!(dec.check_header(&header, crc, 0, false));
    }

    #[test]
    fn test_header_roundtrip_descriptor_check() {
        // bit 3 entries validate against the DOS time field instead
        let dos_time = 0x5cb4_8a21u32;
        let mut enc = ZipCrypto::new(b"pw");
        let header = enc.make_header(0, dos_time, true);

        let mut dec = ZipCrypto::new(b"pw");
        assert!(dec.check_header(&header, 0, dos_time, true));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let crc = 0xFEEDBEEFu32;
        let mut enc = ZipCrypto::new(b"right");
        let header = enc.make_header(crc, 0, false);

        let mut dec = ZipCrypto::new(b"wrong");
        assert!(!dec.check_header(&header, crc, 0, false));
    }

    #[test]
    fn test_stream_decorators_roundtrip() {
        use std::io::Cursor;

        let plain = b"stream cipher through io traits";
        let mut w = CipherWriter::new(Vec::new(), ZipCrypto::new(b"k"));
        w.write_all(plain).unwrap();
        let encrypted = w.into_inner();
        assert_ne!(&encrypted[..], &plain[..]);

        let mut r = CipherReader::new(Cursor::new(encrypted), ZipCrypto::new(b"k"));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(&out[..], &plain[..]);
    }
}
