#![forbid(unsafe_code)]
//! Zip32 container reader.
//!
//! Locates the end-of-central-directory record, walks the central
//! directory, and reads entry payloads (stored and deflated) by local
//! header offset. All reads are positioned (`read_exact_at`), so the
//! reader never carries a cursor and payload reads can interleave freely.
//!
//! Not supported: Zip64, multi-disk archives, encrypted entries.

use arcfs_error::{ArcError, Result};
use arcfs_types::{read_le_u16, read_le_u32};
use flate2::read::DeflateDecoder;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::warn;

/// End of central directory signature (`PK 05 06`).
pub const SIG_EOCD: u32 = 0x0605_4b50;
/// Central directory file header signature (`PK 01 02`).
pub const SIG_CDFH: u32 = 0x0201_4b50;
/// Local file header signature (`PK 03 04`).
pub const SIG_LFH: u32 = 0x0403_4b50;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

const EOCD_MIN_LEN: usize = 22;
// 64 KiB max comment plus the fixed record.
const EOCD_SEARCH_MAX: u64 = 64 * 1024 + EOCD_MIN_LEN as u64;

const CDFH_LEN: usize = 46;
const LFH_LEN: usize = 30;

/// Parsed end-of-central-directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRecord {
    pub entry_count: u64,
    pub dir_size: u64,
    pub dir_offset: u64,
}

/// One central directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralRecord {
    /// Position in the central directory (archive-local entry number).
    pub index: u32,
    pub name: String,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
    /// Directory marker (name carries a trailing separator).
    pub is_dir: bool,
}

/// A positioned reader over a ZIP container file.
#[derive(Debug)]
pub struct ZipReader {
    file: File,
    len: u64,
}

impl ZipReader {
    /// Open the archive at `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already-open archive file.
    pub fn from_file(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// The underlying archive file (used for digesting).
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    /// Locate and parse the end-of-central-directory record.
    ///
    /// Scans backwards over the tail window so archives with a trailing
    /// comment still resolve.
    pub fn read_end_record(&self) -> Result<EndRecord> {
        if self.len < EOCD_MIN_LEN as u64 {
            return Err(ArcError::ArchiveInvalid(
                "file shorter than an end record".to_owned(),
            ));
        }

        let window_len = self.len.min(EOCD_SEARCH_MAX);
        let window_start = self.len - window_len;
        let mut window = vec![0_u8; window_len as usize];
        self.file.read_exact_at(&mut window, window_start)?;

        let mut pos = window.len() - EOCD_MIN_LEN;
        loop {
            if read_le_u32(&window, pos).ok() == Some(SIG_EOCD) {
                let entry_count = u64::from(le_u16(&window, pos + 10)?);
                let dir_size = u64::from(le_u32(&window, pos + 12)?);
                let dir_offset = u64::from(le_u32(&window, pos + 16)?);

                let Some(dir_end) = dir_offset.checked_add(dir_size) else {
                    return Err(ArcError::ArchiveInvalid(
                        "central directory extent overflows".to_owned(),
                    ));
                };
                if dir_end > self.len {
                    return Err(ArcError::ArchiveInvalid(
                        "central directory extends past end of file".to_owned(),
                    ));
                }

                return Ok(EndRecord {
                    entry_count,
                    dir_size,
                    dir_offset,
                });
            }
            if pos == 0 {
                break;
            }
            pos -= 1;
        }

        Err(ArcError::ArchiveInvalid(
            "end of central directory record not found".to_owned(),
        ))
    }

    /// Walk the central directory and return its records in file order.
    ///
    /// The record index is the entry's position in the walk, which is
    /// what names the entry's cache file.
    pub fn read_central_directory(&self, end: &EndRecord) -> Result<Vec<CentralRecord>> {
        let dir_len = usize::try_from(end.dir_size)
            .map_err(|_| ArcError::ArchiveInvalid("central directory too large".to_owned()))?;
        let mut dir = vec![0_u8; dir_len];
        self.file.read_exact_at(&mut dir, end.dir_offset)?;

        let mut records = Vec::with_capacity(end.entry_count as usize);
        let mut pos = 0_usize;

        for index in 0..end.entry_count {
            if le_u32(&dir, pos)? != SIG_CDFH {
                return Err(ArcError::ArchiveInvalid(format!(
                    "bad central directory signature at record {index}"
                )));
            }

            let flags = le_u16(&dir, pos + 8)?;
            let method = le_u16(&dir, pos + 10)?;
            let dos_time = le_u16(&dir, pos + 12)?;
            let dos_date = le_u16(&dir, pos + 14)?;
            let compressed_size = u64::from(le_u32(&dir, pos + 20)?);
            let uncompressed_size = u64::from(le_u32(&dir, pos + 24)?);
            let name_len = usize::from(le_u16(&dir, pos + 28)?);
            let extra_len = usize::from(le_u16(&dir, pos + 30)?);
            let comment_len = usize::from(le_u16(&dir, pos + 32)?);
            let local_header_offset = u64::from(le_u32(&dir, pos + 42)?);

            let name_start = pos + CDFH_LEN;
            let name_end = name_start + name_len;
            if name_end > dir.len() {
                return Err(ArcError::ArchiveInvalid(format!(
                    "entry name at record {index} extends past directory"
                )));
            }
            let name = String::from_utf8_lossy(&dir[name_start..name_end]).into_owned();
            let is_dir = name.ends_with('/') || name.ends_with('\\');

            records.push(CentralRecord {
                index: u32::try_from(index).unwrap_or(u32::MAX),
                name,
                flags,
                method,
                dos_time,
                dos_date,
                compressed_size,
                uncompressed_size,
                local_header_offset,
                is_dir,
            });

            pos = name_end + extra_len + comment_len;
        }

        Ok(records)
    }

    /// Read and decompress one entry's payload.
    pub fn read_entry_data(&self, record: &CentralRecord) -> Result<Vec<u8>> {
        self.read_entry_data_at(
            record.local_header_offset,
            record.method,
            record.compressed_size,
            record.uncompressed_size,
        )
    }

    /// Read an entry's payload given its central-directory geometry.
    ///
    /// The local header is parsed only for its name/extra lengths; sizes
    /// come from the central directory (local sizes may be zero when a
    /// data descriptor follows the payload).
    pub fn read_entry_data_at(
        &self,
        local_header_offset: u64,
        method: u16,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Result<Vec<u8>> {
        let mut header = [0_u8; LFH_LEN];
        self.file.read_exact_at(&mut header, local_header_offset)?;

        if le_u32(&header, 0)? != SIG_LFH {
            return Err(ArcError::ArchiveInvalid(format!(
                "bad local header signature at offset {local_header_offset}"
            )));
        }
        let name_len = u64::from(le_u16(&header, 26)?);
        let extra_len = u64::from(le_u16(&header, 28)?);
        let data_offset = local_header_offset + LFH_LEN as u64 + name_len + extra_len;

        let compressed_len = usize::try_from(compressed_size)
            .map_err(|_| ArcError::ArchiveInvalid("entry too large".to_owned()))?;
        let mut compressed = vec![0_u8; compressed_len];
        self.file.read_exact_at(&mut compressed, data_offset)?;

        match method {
            METHOD_STORED => Ok(compressed),
            METHOD_DEFLATED => {
                let mut inflated = Vec::with_capacity(uncompressed_size as usize);
                DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut inflated)?;
                if inflated.len() as u64 != uncompressed_size {
                    warn!(
                        target: "arcfs::zip",
                        expected = uncompressed_size,
                        actual = inflated.len(),
                        "inflated size mismatch"
                    );
                    return Err(ArcError::ArchiveInvalid(
                        "inflated payload size mismatch".to_owned(),
                    ));
                }
                Ok(inflated)
            }
            other => Err(ArcError::ArchiveInvalid(format!(
                "unsupported compression method {other}"
            ))),
        }
    }
}

fn le_u16(data: &[u8], offset: usize) -> Result<u16> {
    read_le_u16(data, offset).map_err(|e| ArcError::ArchiveInvalid(e.to_string()))
}

fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    read_le_u32(data, offset).map_err(|e| ArcError::ArchiveInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcfs_testkit::ZipBuilder;
    use std::io::Write;

    fn write_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp archive");
        file.write_all(bytes).expect("write archive");
        file
    }

    #[test]
    fn end_record_round_trip() {
        let bytes = ZipBuilder::new()
            .dir("assets")
            .file("a.txt", b"alpha")
            .file("assets/b.txt", b"beta")
            .build();
        let archive = write_archive(&bytes);

        let reader = ZipReader::open(archive.path()).expect("open");
        let end = reader.read_end_record().expect("end record");
        assert_eq!(end.entry_count, 3);

        let records = reader.read_central_directory(&end).expect("central dir");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].name, "assets/");
        assert!(records[0].is_dir);
        assert_eq!(records[1].name, "a.txt");
        assert_eq!(records[1].index, 1);
        assert_eq!(records[1].uncompressed_size, 5);
        assert!(!records[1].is_dir);
    }

    #[test]
    fn stored_payload() {
        let bytes = ZipBuilder::new().file("data.bin", b"raw payload").build();
        let archive = write_archive(&bytes);
        let reader = ZipReader::open(archive.path()).expect("open");
        let end = reader.read_end_record().expect("end record");
        let records = reader.read_central_directory(&end).expect("central dir");

        let data = reader.read_entry_data(&records[0]).expect("payload");
        assert_eq!(data, b"raw payload");
    }

    #[test]
    fn deflated_payload() {
        let body: Vec<u8> = (0..4096_u32).flat_map(|i| i.to_le_bytes()).collect();
        let bytes = ZipBuilder::new().deflated_file("blob", &body).build();
        let archive = write_archive(&bytes);
        let reader = ZipReader::open(archive.path()).expect("open");
        let end = reader.read_end_record().expect("end record");
        let records = reader.read_central_directory(&end).expect("central dir");

        assert_eq!(records[0].method, METHOD_DEFLATED);
        assert!(records[0].compressed_size < records[0].uncompressed_size);
        let data = reader.read_entry_data(&records[0]).expect("payload");
        assert_eq!(data, body);
    }

    #[test]
    fn not_a_zip() {
        let archive = write_archive(b"this is definitely not an archive");
        let reader = ZipReader::open(archive.path()).expect("open");
        assert!(matches!(
            reader.read_end_record(),
            Err(ArcError::ArchiveInvalid(_))
        ));
    }

    #[test]
    fn truncated_file() {
        let archive = write_archive(b"PK");
        let reader = ZipReader::open(archive.path()).expect("open");
        assert!(reader.read_end_record().is_err());
    }

    #[test]
    fn central_extent_validated() {
        let mut bytes = ZipBuilder::new().file("a", b"x").build();
        // Corrupt the EOCD central directory offset to point past EOF.
        let eocd = bytes.len() - 22;
        bytes[eocd + 16..eocd + 20].copy_from_slice(&u32::MAX.to_le_bytes());
        let archive = write_archive(&bytes);
        let reader = ZipReader::open(archive.path()).expect("open");
        assert!(reader.read_end_record().is_err());
    }
}
