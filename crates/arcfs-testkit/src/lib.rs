#![forbid(unsafe_code)]
//! Test fixtures for arcfs: a byte-level ZIP writer.
//!
//! Tests need real containers on disk (stored and deflated members,
//! directory markers, DOS timestamps) without going through the reader
//! under test. `ZipBuilder` emits the local headers, central directory,
//! and end record by hand.

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::io::Write;
use std::path::Path;

const SIG_LFH: u32 = 0x0403_4b50;
const SIG_CDFH: u32 = 0x0201_4b50;
const SIG_EOCD: u32 = 0x0605_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

struct Entry {
    name: String,
    data: Vec<u8>,
    method: u16,
    crc: u32,
    uncompressed_len: u32,
    dos_date: u16,
    dos_time: u16,
}

/// Builds a Zip32 archive in memory.
///
/// Entries appear in insertion order in both the local section and the
/// central directory, so entry ids are predictable in tests.
pub struct ZipBuilder {
    entries: Vec<Entry>,
    dos_date: u16,
    dos_time: u16,
}

impl ZipBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            // 2020-01-02 03:04:06
            dos_date: (40 << 9) | (1 << 5) | 2,
            dos_time: (3 << 11) | (4 << 5) | 3,
        }
    }

    /// Set the DOS timestamp applied to subsequently added entries.
    #[must_use]
    pub fn times(mut self, dos_date: u16, dos_time: u16) -> Self {
        self.dos_date = dos_date;
        self.dos_time = dos_time;
        self
    }

    /// Add a directory marker (name gains a trailing `/` if missing).
    #[must_use]
    pub fn dir(mut self, name: &str) -> Self {
        let name = if name.ends_with('/') {
            name.to_owned()
        } else {
            format!("{name}/")
        };
        self.entries.push(Entry {
            name,
            data: Vec::new(),
            method: METHOD_STORED,
            crc: 0,
            uncompressed_len: 0,
            dos_date: self.dos_date,
            dos_time: self.dos_time,
        });
        self
    }

    /// Add a stored (method 0) file.
    #[must_use]
    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push(Entry {
            name: name.to_owned(),
            data: data.to_vec(),
            method: METHOD_STORED,
            crc: crc32(data),
            uncompressed_len: data.len() as u32,
            dos_date: self.dos_date,
            dos_time: self.dos_time,
        });
        self
    }

    /// Add a deflated (method 8) file.
    #[must_use]
    pub fn deflated_file(mut self, name: &str, data: &[u8]) -> Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("deflate into memory");
        let compressed = encoder.finish().expect("finish deflate stream");
        self.entries.push(Entry {
            name: name.to_owned(),
            data: compressed,
            method: METHOD_DEFLATED,
            crc: crc32(data),
            uncompressed_len: data.len() as u32,
            dos_date: self.dos_date,
            dos_time: self.dos_time,
        });
        self
    }

    /// Serialize the archive.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offsets = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            offsets.push(out.len() as u32);
            push_u32(&mut out, SIG_LFH);
            push_u16(&mut out, 20); // version needed
            push_u16(&mut out, 0); // flags
            push_u16(&mut out, entry.method);
            push_u16(&mut out, entry.dos_time);
            push_u16(&mut out, entry.dos_date);
            push_u32(&mut out, entry.crc);
            push_u32(&mut out, entry.data.len() as u32);
            push_u32(&mut out, entry.uncompressed_len);
            push_u16(&mut out, entry.name.len() as u16);
            push_u16(&mut out, 0); // extra length
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&entry.data);
        }

        let dir_offset = out.len() as u32;
        for (entry, offset) in self.entries.iter().zip(&offsets) {
            push_u32(&mut out, SIG_CDFH);
            push_u16(&mut out, 20); // version made by
            push_u16(&mut out, 20); // version needed
            push_u16(&mut out, 0); // flags
            push_u16(&mut out, entry.method);
            push_u16(&mut out, entry.dos_time);
            push_u16(&mut out, entry.dos_date);
            push_u32(&mut out, entry.crc);
            push_u32(&mut out, entry.data.len() as u32);
            push_u32(&mut out, entry.uncompressed_len);
            push_u16(&mut out, entry.name.len() as u16);
            push_u16(&mut out, 0); // extra length
            push_u16(&mut out, 0); // comment length
            push_u16(&mut out, 0); // disk number start
            push_u16(&mut out, 0); // internal attributes
            push_u32(&mut out, 0); // external attributes
            push_u32(&mut out, *offset);
            out.extend_from_slice(entry.name.as_bytes());
        }
        let dir_size = out.len() as u32 - dir_offset;

        push_u32(&mut out, SIG_EOCD);
        push_u16(&mut out, 0); // disk number
        push_u16(&mut out, 0); // central directory disk
        push_u16(&mut out, self.entries.len() as u16);
        push_u16(&mut out, self.entries.len() as u16);
        push_u32(&mut out, dir_size);
        push_u32(&mut out, dir_offset);
        push_u16(&mut out, 0); // comment length

        out
    }

    /// Serialize and write the archive to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ends_with_eocd() {
        let bytes = ZipBuilder::new().file("a.txt", b"hello").build();
        // EOCD with empty comment is the trailing 22 bytes.
        let eocd = &bytes[bytes.len() - 22..];
        assert_eq!(&eocd[..4], &SIG_EOCD.to_le_bytes());
        assert_eq!(u16::from_le_bytes([eocd[10], eocd[11]]), 1);
    }

    #[test]
    fn local_header_leads() {
        let bytes = ZipBuilder::new().dir("d").file("a", b"x").build();
        assert_eq!(&bytes[..4], &SIG_LFH.to_le_bytes());
    }
}
