// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-disk inode ("dinode") record and its loader (C6).

use crate::endian::BigEndian as BE;
use crate::error::{Error, Result};
use crate::fs::Timestamp;
use crate::image::ImageReader;

use super::superblock::Superblock;

pub const XFS_DINODE_MAGIC: u16 = 0x494e; // "IN"

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InodeFormat {
    Dev,
    Local,
    Extents,
    BTree,
    Uuid,
    Rmap,
}

impl InodeFormat {
    fn from_raw(v: u8) -> Result<InodeFormat> {
        Ok(match v {
            0 => InodeFormat::Dev,
            1 => InodeFormat::Local,
            2 => InodeFormat::Extents,
            3 => InodeFormat::BTree,
            4 => InodeFormat::Uuid,
            5 => InodeFormat::Rmap,
            _ => return Err(Error::InodeCor),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Dinode {
    pub mode: u16,
    pub version: u8,
    pub format: InodeFormat,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
    pub size: u64,
    pub nblocks: u64,
    pub nextents: u32,
    pub anextents: u16,
    pub forkoff: u8,
    pub aformat: InodeFormat,
    pub flags: u16,
    /// Byte offset, within the inode record, where the data fork begins.
    pub data_fork_offset: usize,
    pub inode_size: u16,
}

impl Dinode {
    pub fn inode_offset(sb: &Superblock, ag: u32, agino: u32) -> u64 {
        let inopblock = 1u32 << sb.inopblog;
        let block_in_ag = agino / inopblock;
        let index_in_block = agino % inopblock;
        (ag as u64 * sb.agblocks as u64 + block_in_ag as u64) * sb.blocksize as u64
            + index_in_block as u64 * sb.inodesize as u64
    }

    pub fn read(image: &dyn ImageReader, sb: &Superblock, ag: u32, agino: u32) -> Result<Dinode> {
        let offset = Self::inode_offset(sb, ag, agino);
        let mut buf = vec![0u8; sb.inodesize as usize];
        image.read_exact_at(offset, &mut buf)?;

        let magic = BE::read_u16(&buf[0..]);
        if magic != XFS_DINODE_MAGIC {
            return Err(Error::InodeCor);
        }

        let version = buf[4];
        let format = InodeFormat::from_raw(buf[5])?;
        let aformat = if buf[83] <= 5 { InodeFormat::from_raw(buf[83])? } else { InodeFormat::Dev };

        let read_time = |off: usize| Timestamp { secs: BE::read_u32(&buf[off..]) as i64, nanos: BE::read_u32(&buf[off + 4..]) };

        let crtime = if version == 3 {
            read_time(144)
        } else {
            Timestamp::default()
        };

        // Data fork begins right after the literal area of the dinode
        // core. v3 cores are 176 bytes; v1/v2 cores are 100 bytes.
        let data_fork_offset = if version == 3 { 176 } else { 100 };

        Ok(Dinode {
            mode: BE::read_u16(&buf[2..]),
            version,
            format,
            nlink: BE::read_u32(&buf[16..]),
            uid: BE::read_u32(&buf[8..]),
            gid: BE::read_u32(&buf[12..]),
            atime: read_time(32),
            mtime: read_time(40),
            ctime: read_time(48),
            crtime,
            size: BE::read_u64(&buf[56..]),
            nblocks: BE::read_u64(&buf[64..]),
            nextents: BE::read_u32(&buf[76..]),
            anextents: BE::read_u16(&buf[80..]),
            forkoff: buf[82],
            aformat,
            flags: BE::read_u16(&buf[90..]),
            data_fork_offset,
            inode_size: sb.inodesize,
        })
    }

    /// The raw bytes of the data fork's literal area (after the core),
    /// up to the attribute fork offset (or end of record if there is
    /// none).
    pub fn data_fork_bytes<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        let end = if self.forkoff != 0 {
            self.data_fork_offset + self.forkoff as usize * 8
        } else {
            record.len()
        };
        &record[self.data_fork_offset..end.min(record.len())]
    }

    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFDIR: u16 = 0o040000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_IFLNK: u16 = 0o120000;
    pub const S_IFBLK: u16 = 0o060000;
    pub const S_IFCHR: u16 = 0o020000;
    pub const S_IFIFO: u16 = 0o010000;
    pub const S_IFSOCK: u16 = 0o140000;
}
