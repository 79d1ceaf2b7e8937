//! Checksummed page layer over the raw file
//!
//! E57 files interleave a CRC-32C word after every 1020 payload bytes, so the
//! file has two address spaces: physical (what is on disk) and logical (the
//! payload stream with the checksum words removed). Everything above this
//! module works in logical offsets; packet locations arriving from section
//! headers are physical and get converted here.

use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Size of a physical page, payload plus checksum
pub const PAGE_SIZE: u64 = 1024;

/// Payload bytes per physical page
pub const PAGE_PAYLOAD: u64 = 1020;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Read-side file cursor over the checksummed page stream.
///
/// Pages are verified on first touch and the most recently verified page is
/// kept so sequential reads do not recompute the checksum per call.
pub struct PagedFile {
    file: File,
    path: PathBuf,
    physical_length: u64,
    logical_position: u64,
    page: Vec<u8>,
    page_index: Option<u64>,
}

impl PagedFile {
    /// Open an existing paged file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let physical_length = file.metadata()?.len();

        debug!(
            "opened paged file {:?} ({} physical bytes, {} logical)",
            path,
            physical_length,
            Self::physical_to_logical(physical_length)
        );

        Ok(Self {
            file,
            path,
            physical_length,
            logical_position: 0,
            page: vec![0u8; PAGE_PAYLOAD as usize],
            page_index: None,
        })
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the physical stream in bytes.
    pub fn physical_length(&self) -> u64 {
        self.physical_length
    }

    /// Length of the logical stream in bytes.
    pub fn logical_length(&self) -> u64 {
        Self::physical_to_logical(self.physical_length)
    }

    /// Map a physical offset to its logical equivalent.
    pub fn physical_to_logical(physical: u64) -> u64 {
        let page = physical / PAGE_SIZE;
        let rem = physical % PAGE_SIZE;
        page * PAGE_PAYLOAD + rem.min(PAGE_PAYLOAD)
    }

    /// Map a logical offset to its physical equivalent.
    pub fn logical_to_physical(logical: u64) -> u64 {
        (logical / PAGE_PAYLOAD) * PAGE_SIZE + logical % PAGE_PAYLOAD
    }

    /// Move the cursor to a logical offset.
    pub fn seek_logical(&mut self, offset: u64) {
        self.logical_position = offset;
    }

    /// Current cursor position in the logical stream.
    pub fn position_logical(&self) -> u64 {
        self.logical_position
    }

    /// Fill `buf` from the cursor position, advancing it.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.logical_position + buf.len() as u64 > self.logical_length() {
            return Err(Error::ShortRead {
                offset: self.logical_position,
                wanted: buf.len(),
            });
        }

        let mut filled = 0;
        while filled < buf.len() {
            let page = self.logical_position / PAGE_PAYLOAD;
            let in_page = (self.logical_position % PAGE_PAYLOAD) as usize;
            self.load_page(page)?;

            let n = (buf.len() - filled).min(PAGE_PAYLOAD as usize - in_page);
            buf[filled..filled + n].copy_from_slice(&self.page[in_page..in_page + n]);
            filled += n;
            self.logical_position += n as u64;
        }
        Ok(())
    }

    /// Fill `buf` from an explicit logical offset, leaving the cursor after it.
    pub fn read_at_logical(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_logical(offset);
        self.read_exact(buf)
    }

    fn load_page(&mut self, index: u64) -> Result<()> {
        if self.page_index == Some(index) {
            return Ok(());
        }

        let mut raw = [0u8; PAGE_SIZE as usize];
        self.file.seek(SeekFrom::Start(index * PAGE_SIZE))?;
        self.file.read_exact(&mut raw)?;

        let expected = u32::from_le_bytes([raw[1020], raw[1021], raw[1022], raw[1023]]);
        let actual = CRC32C.checksum(&raw[..PAGE_PAYLOAD as usize]);
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                page: index,
                expected,
                actual,
            });
        }

        self.page.copy_from_slice(&raw[..PAGE_PAYLOAD as usize]);
        self.page_index = Some(index);
        Ok(())
    }
}

/// Write-side counterpart: appends a logical stream, stamping the checksum
/// word as each page fills. The final partial page is zero padded by
/// [`finish`](PagedWriter::finish).
pub struct PagedWriter {
    file: File,
    pending: Vec<u8>,
    pages_written: u64,
}

impl PagedWriter {
    /// Create (truncate) a paged file for writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            file,
            pending: Vec::with_capacity(PAGE_PAYLOAD as usize),
            pages_written: 0,
        })
    }

    /// Number of logical bytes written so far.
    pub fn logical_length(&self) -> u64 {
        self.pages_written * PAGE_PAYLOAD + self.pending.len() as u64
    }

    /// Append bytes to the logical stream.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = PAGE_PAYLOAD as usize - self.pending.len();
            let n = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.pending.len() == PAGE_PAYLOAD as usize {
                self.flush_page()?;
            }
        }
        Ok(())
    }

    /// Zero-pad the trailing page, stamp its checksum and sync.
    pub fn finish(mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.pending.resize(PAGE_PAYLOAD as usize, 0);
            self.flush_page()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn flush_page(&mut self) -> Result<()> {
        let crc = CRC32C.checksum(&self.pending);
        self.file.write_all(&self.pending)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.pending.clear();
        self.pages_written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_paged(path: &Path, logical: &[u8]) {
        let mut writer = PagedWriter::create(path).unwrap();
        writer.write(logical).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_offset_mapping() {
        assert_eq!(PagedFile::logical_to_physical(0), 0);
        assert_eq!(PagedFile::logical_to_physical(1019), 1019);
        assert_eq!(PagedFile::logical_to_physical(1020), 1024);
        assert_eq!(PagedFile::logical_to_physical(2040), 2048);

        assert_eq!(PagedFile::physical_to_logical(0), 0);
        assert_eq!(PagedFile::physical_to_logical(1024), 1020);
        // The checksum word itself maps to the end of its page's payload
        assert_eq!(PagedFile::physical_to_logical(1022), 1020);
        assert_eq!(PagedFile::physical_to_logical(2048), 2040);
    }

    #[test]
    fn test_round_trip_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.bin");

        let logical: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        write_paged(&path, &logical);

        let mut file = PagedFile::open(&path).unwrap();
        assert_eq!(file.logical_length(), 3060); // padded to 3 pages

        let mut buf = vec![0u8; logical.len()];
        file.read_at_logical(0, &mut buf).unwrap();
        assert_eq!(buf, logical);

        // Read straddling the first page boundary
        let mut small = [0u8; 8];
        file.read_at_logical(1016, &mut small).unwrap();
        assert_eq!(&small, &logical[1016..1024]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.bin");
        write_paged(&path, &[0xAB; 100]);

        // Flip a payload byte in the second half of page 0
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(50)).unwrap();
            f.write_all(&[0xCD]).unwrap();
        }

        let mut file = PagedFile::open(&path).unwrap();
        let mut buf = [0u8; 4];
        let err = file.read_at_logical(0, &mut buf).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { page: 0, .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        write_paged(&path, &[1, 2, 3, 4]);

        let mut file = PagedFile::open(&path).unwrap();
        let mut buf = [0u8; 16];
        let err = file.read_at_logical(1016, &mut buf).unwrap_err();
        assert!(
            matches!(err, Error::ShortRead { offset: 1016, wanted: 16 }),
            "actual error: {err:?}",
        );
    }
}
