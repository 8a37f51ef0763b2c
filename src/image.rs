// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image-reader boundary (C1).
//!
//! Disk-image acquisition, container unwrapping (L01/EWF), and carving are
//! external collaborators. This module only defines the small contract the
//! rest of the crate reads through, plus two concrete implementations: a
//! plain file on disk, and an in-memory slice for tests.

use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Byte-addressable random read over a disk image.
pub trait ImageReader: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`. Returns the number of
    /// bytes actually read; a short read past EOF is not an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the image in bytes.
    fn size(&self) -> u64;

    /// Device sector size, used to bound superblock scans.
    fn sector_size(&self) -> u32 {
        512
    }

    /// Hint for YAFFS2 page size, when the acquisition tool recorded one.
    fn page_size_hint(&self) -> Option<u32> {
        None
    }

    /// Hint for YAFFS2 spare size, when the acquisition tool recorded one.
    fn spare_size_hint(&self) -> Option<u32> {
        None
    }

    /// Read exactly `buf.len()` bytes, failing with `Error::Read` on a
    /// short read. Most callers want this rather than the raw primitive.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(Error::Read);
        }
        Ok(())
    }
}

/// An `ImageReader` backed by a plain file on disk.
pub struct FileImage {
    file: Mutex<File>,
    size: u64,
    sector_size: u32,
}

impl FileImage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<FileImage> {
        let file = File::open(path).map_err(|_| Error::Read)?;
        let size = file.metadata().map_err(|_| Error::Read)?.len();
        Ok(FileImage { file: Mutex::new(file), size, sector_size: 512 })
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> FileImage {
        self.sector_size = sector_size;
        self
    }
}

impl ImageReader for FileImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let mut file = self.file.lock().map_err(|_| Error::Read)?;
        file.seek(SeekFrom::Start(offset)).map_err(|_| Error::Read)?;
        let avail = (self.size - offset).min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..avail]).map_err(|_| Error::Read)?;
        Ok(avail)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

/// An `ImageReader` backed by an owned in-memory buffer, for tests and for
/// doc examples that should not touch the file system.
pub struct SliceImage {
    data: Vec<u8>,
    page_size: Option<u32>,
    spare_size: Option<u32>,
}

impl SliceImage {
    pub fn new(data: Vec<u8>) -> SliceImage {
        SliceImage { data, page_size: None, spare_size: None }
    }

    pub fn with_yaffs2_hints(mut self, page_size: u32, spare_size: u32) -> SliceImage {
        self.page_size = Some(page_size);
        self.spare_size = Some(spare_size);
        self
    }
}

impl ImageReader for SliceImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let avail = &self.data[offset..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn page_size_hint(&self) -> Option<u32> {
        self.page_size
    }

    fn spare_size_hint(&self) -> Option<u32> {
        self.spare_size
    }
}

/// Shifts every read by a fixed base offset, so a driver written against
/// offset-0 addressing can mount an image that starts partway through a
/// container (e.g. `--offset` past a partition table).
pub struct OffsetImage {
    inner: std::rc::Rc<dyn ImageReader>,
    base: u64,
}

impl OffsetImage {
    pub fn new(inner: std::rc::Rc<dyn ImageReader>, base: u64) -> OffsetImage {
        OffsetImage { inner, base }
    }
}

impl ImageReader for OffsetImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_at(self.base + offset, buf)
    }

    fn size(&self) -> u64 {
        self.inner.size().saturating_sub(self.base)
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn page_size_hint(&self) -> Option<u32> {
        self.inner.page_size_hint()
    }

    fn spare_size_hint(&self) -> Option<u32> {
        self.inner.spare_size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_image_short_read_at_eof() {
        let img = SliceImage::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 8];
        let n = img.read_at(2, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[3, 4]);
    }

    #[test]
    fn slice_image_read_past_end_is_empty() {
        let img = SliceImage::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 8];
        let n = img.read_at(10, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn read_exact_at_fails_on_short_read() {
        let img = SliceImage::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 8];
        assert_eq!(img.read_exact_at(2, &mut buf), Err(Error::Read));
    }

    #[test]
    fn offset_image_shifts_reads_and_size() {
        let inner: std::rc::Rc<dyn ImageReader> = std::rc::Rc::new(SliceImage::new(vec![10, 20, 30, 40, 50]));
        let img = OffsetImage::new(inner, 2);
        let mut buf = [0u8; 2];
        assert_eq!(img.read_at(0, &mut buf).unwrap(), 2);
        assert_eq!(buf, [30, 40]);
        assert_eq!(img.size(), 3);
    }
}
