// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The directory walker (C8): shortform, data-block ("Extents"), and
//! BTree directory formats.

use crate::endian::BigEndian as BE;
use crate::error::Result;
use crate::fs::{DirOpenResult, FileType, FsName};
use crate::image::ImageReader;

use super::superblock::Superblock;

/// Parses a shortform (`xfs_dir2_sf_hdr`) directory, entirely contained
/// within the inode's literal area.
pub fn parse_shortform(buf: &[u8], parent_alloc: bool) -> (Vec<FsName>, DirOpenResult) {
    let mut names = Vec::new();
    if buf.len() < 2 {
        return (names, DirOpenResult::Corrupt);
    }
    let count = buf[0];
    let i8count = buf[1];
    let inum_width = if i8count != 0 { 8 } else { 4 };
    let total = if i8count != 0 { i8count as usize } else { count as usize };

    let mut off = 2 + inum_width; // header: count, i8count, parent inum
    if off > buf.len() {
        return (names, DirOpenResult::Corrupt);
    }

    for _ in 0..total {
        if off >= buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        let namelen = buf[off] as usize;
        if namelen == 0 {
            break;
        }
        off += 1;
        if off + 2 > buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        off += 2; // xfs_dir2_sf_off, unused for reconstruction
        if off + namelen > buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        let name = String::from_utf8_lossy(&buf[off..off + namelen]).into_owned();
        off += namelen;

        // ftype byte presence is feature-gated; callers that know the
        // superblock feature bit pre-strip it by passing `has_ftype`
        // through `parse_shortform_ftyped` below instead.
        if off + inum_width > buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        let inumber = if inum_width == 8 { BE::read_u64(&buf[off..]) } else { BE::read_u32(&buf[off..]) as u64 };
        off += inum_width;

        names.push(FsName {
            name,
            short_name: None,
            meta_addr: inumber,
            meta_seq: 0,
            par_addr: 0,
            par_seq: 0,
            file_type: FileType::Undef,
            alloc: parent_alloc,
        });
    }
    (names, DirOpenResult::Ok)
}

/// As `parse_shortform`, but accounts for the optional 1-byte `ftype`
/// field present when the directory feature bit is set.
pub fn parse_shortform_ftyped(buf: &[u8], has_ftype: bool, parent_alloc: bool) -> (Vec<FsName>, DirOpenResult) {
    if !has_ftype {
        return parse_shortform(buf, parent_alloc);
    }
    let mut names = Vec::new();
    if buf.len() < 2 {
        return (names, DirOpenResult::Corrupt);
    }
    let count = buf[0];
    let i8count = buf[1];
    let inum_width = if i8count != 0 { 8 } else { 4 };
    let total = if i8count != 0 { i8count as usize } else { count as usize };
    let mut off = 2 + inum_width;

    for _ in 0..total {
        if off >= buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        let namelen = buf[off] as usize;
        if namelen == 0 {
            break;
        }
        off += 1 + 2; // namelen byte + xfs_dir2_sf_off
        if off + namelen + 1 > buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        let name = String::from_utf8_lossy(&buf[off..off + namelen]).into_owned();
        off += namelen;
        let ftype = ftype_from_byte(buf[off]);
        off += 1;
        if off + inum_width > buf.len() {
            return (names, DirOpenResult::Corrupt);
        }
        let inumber = if inum_width == 8 { BE::read_u64(&buf[off..]) } else { BE::read_u32(&buf[off..]) as u64 };
        off += inum_width;
        names.push(FsName {
            name,
            short_name: None,
            meta_addr: inumber,
            meta_seq: 0,
            par_addr: 0,
            par_seq: 0,
            file_type: ftype,
            alloc: parent_alloc,
        });
    }
    (names, DirOpenResult::Ok)
}

fn ftype_from_byte(b: u8) -> FileType {
    match b {
        1 => FileType::Reg,
        2 => FileType::Dir,
        3 => FileType::Chr,
        4 => FileType::Blk,
        5 => FileType::Fifo,
        6 => FileType::Sock,
        7 => FileType::Lnk,
        _ => FileType::Undef,
    }
}

fn data_header_len(v5: bool) -> usize {
    if v5 { 64 } else { 16 }
}

/// Parses the active entries of one directory data block, honoring the
/// best-free layout and, when present, a block tail that marks where the
/// leaf-entry area begins.
pub fn parse_data_block(
    buf: &[u8],
    v5: bool,
    has_ftype: bool,
    parent_alloc: bool,
    mut resolve_ftype: impl FnMut(u64) -> FileType,
) -> Vec<FsName> {
    let header_len = data_header_len(v5);
    if buf.len() < header_len + 8 {
        return Vec::new();
    }

    // Detect a single-block directory's tail: {leaf_count, stale_count}
    // as the last 8 bytes, used only to bound entry scanning.
    let tail_count = BE::read_u32(&buf[buf.len() - 8..]);
    let leaf_area_start = buf.len().checked_sub(8 + tail_count as usize * 8);
    let scan_end = match leaf_area_start {
        Some(pos) if pos >= header_len && pos <= buf.len() => pos,
        _ => buf.len(),
    };

    let mut names = Vec::new();
    let mut off = header_len;
    while off + 8 <= scan_end {
        let freetag = BE::read_u16(&buf[off..]);
        if freetag == 0xFFFF {
            let len = BE::read_u16(&buf[off + 2..]) as usize;
            if len == 0 || off + len > scan_end {
                break;
            }
            off += len;
            continue;
        }

        if off + 8 > scan_end {
            break;
        }
        let inumber = BE::read_u64(&buf[off..]);
        let mut p = off + 8;
        if p >= scan_end {
            break;
        }
        let namelen = buf[p] as usize;
        p += 1;
        if p + namelen > scan_end {
            break;
        }
        let name = String::from_utf8_lossy(&buf[p..p + namelen]).into_owned();
        p += namelen;

        let file_type = if has_ftype {
            if p >= scan_end {
                break;
            }
            let ft = ftype_from_byte(buf[p]);
            p += 1;
            ft
        } else {
            resolve_ftype(inumber)
        };

        // tag(2) + 8-byte alignment padding.
        let entry_len = p + 2 - off;
        let aligned_len = entry_len.div_ceil(8) * 8;

        names.push(FsName {
            name,
            short_name: None,
            meta_addr: inumber,
            meta_seq: 0,
            par_addr: 0,
            par_seq: 0,
            file_type,
            alloc: parent_alloc,
        });
        off += aligned_len.max(8);
    }
    names
}

pub fn is_v5(sb: &Superblock) -> bool {
    sb.version() == 5
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 1: root dir at inum 128 with entries `{"a"->131, "b"->132}`
    /// using `i8count=0`.
    #[test]
    fn shortform_two_entries() {
        let mut buf = vec![0u8; 64];
        buf[0] = 2; // count
        buf[1] = 0; // i8count -> 4-byte inode width
        BE::write_u32(&mut buf[2..], 128); // parent
        let mut off = 6;
        buf[off] = 1; // namelen "a"
        off += 1;
        off += 2; // sf_off
        buf[off] = b'a';
        off += 1;
        BE::write_u32(&mut buf[off..], 131);
        off += 4;
        buf[off] = 1; // namelen "b"
        off += 1;
        off += 2;
        buf[off] = b'b';
        off += 1;
        BE::write_u32(&mut buf[off..], 132);

        let (names, res) = parse_shortform(&buf, true);
        assert_eq!(res, DirOpenResult::Ok);
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].name, "a");
        assert_eq!(names[0].meta_addr, 131);
        assert_eq!(names[1].name, "b");
        assert_eq!(names[1].meta_addr, 132);
        assert!(names.iter().all(|n| n.alloc));
    }
}
