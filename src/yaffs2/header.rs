// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object header record stored in chunk 0 of every object version.

use crate::endian::LittleEndian as LE;
use crate::error::{Error, Result};
use crate::image::ImageReader;

pub const NAME_LENGTH: usize = 256;
pub const ALIAS_LENGTH: usize = 160;

// Field offsets within the first page of a header chunk. There's a two-byte
// gap between `parent_id` and `name` and a small one before `file_mode`;
// this is the on-disk layout, not struct padding, so the offsets are kept
// exactly as read rather than computed from field sizes.
const OFF_OBJ_TYPE: usize = 0x00;
const OFF_PARENT_ID: usize = 0x04;
const OFF_NAME: usize = 0x0A;
const OFF_FILE_MODE: usize = 0x10C;
const OFF_USER_ID: usize = 0x110;
const OFF_GROUP_ID: usize = 0x114;
const OFF_ATIME: usize = 0x118;
const OFF_MTIME: usize = 0x11C;
const OFF_CTIME: usize = 0x120;
const OFF_FILE_SIZE: usize = 0x124;
const OFF_EQUIVALENT_ID: usize = 0x128;
const OFF_ALIAS: usize = 0x12C;
const HEADER_MIN_LEN: usize = OFF_ALIAS + ALIAS_LENGTH;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjType {
    Unknown,
    File,
    SoftLink,
    Directory,
    HardLink,
    Special,
}

impl ObjType {
    fn from_raw(v: u32) -> ObjType {
        match v {
            1 => ObjType::File,
            2 => ObjType::SoftLink,
            3 => ObjType::Directory,
            4 => ObjType::HardLink,
            5 => ObjType::Special,
            _ => ObjType::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct YaffsHeader {
    pub obj_type: ObjType,
    pub parent_id: u32,
    pub name: String,
    pub file_mode: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub file_size: u32,
    pub equivalent_id: u32,
    pub alias: String,
}

fn cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl YaffsHeader {
    pub fn decode(buf: &[u8]) -> Result<YaffsHeader> {
        if buf.len() < HEADER_MIN_LEN {
            return Err(Error::InodeCor);
        }
        Ok(YaffsHeader {
            obj_type: ObjType::from_raw(LE::read_u32(&buf[OFF_OBJ_TYPE..])),
            parent_id: LE::read_u32(&buf[OFF_PARENT_ID..]),
            name: cstr(&buf[OFF_NAME..OFF_NAME + NAME_LENGTH]),
            file_mode: LE::read_u32(&buf[OFF_FILE_MODE..]),
            user_id: LE::read_u32(&buf[OFF_USER_ID..]),
            group_id: LE::read_u32(&buf[OFF_GROUP_ID..]),
            atime: LE::read_u32(&buf[OFF_ATIME..]),
            mtime: LE::read_u32(&buf[OFF_MTIME..]),
            ctime: LE::read_u32(&buf[OFF_CTIME..]),
            file_size: LE::read_u32(&buf[OFF_FILE_SIZE..]),
            equivalent_id: LE::read_u32(&buf[OFF_EQUIVALENT_ID..]),
            alias: cstr(&buf[OFF_ALIAS..OFF_ALIAS + ALIAS_LENGTH]),
        })
    }

    pub fn read(image: &dyn ImageReader, offset: u64, page_size: u32) -> Result<YaffsHeader> {
        let mut buf = vec![0u8; page_size as usize];
        image.read_exact_at(offset, &mut buf)?;
        YaffsHeader::decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header_page(obj_type: u32, parent_id: u32, name: &str, file_size: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        buf[OFF_OBJ_TYPE..OFF_OBJ_TYPE + 4].copy_from_slice(&obj_type.to_le_bytes());
        buf[OFF_PARENT_ID..OFF_PARENT_ID + 4].copy_from_slice(&parent_id.to_le_bytes());
        let name_bytes = name.as_bytes();
        buf[OFF_NAME..OFF_NAME + name_bytes.len()].copy_from_slice(name_bytes);
        buf[OFF_FILE_SIZE..OFF_FILE_SIZE + 4].copy_from_slice(&file_size.to_le_bytes());
        buf
    }

    #[test]
    fn decodes_name_and_type() {
        let buf = make_header_page(3, 1, "subdir", 0);
        let hdr = YaffsHeader::decode(&buf).unwrap();
        assert_eq!(hdr.obj_type, ObjType::Directory);
        assert_eq!(hdr.parent_id, 1);
        assert_eq!(hdr.name, "subdir");
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert!(YaffsHeader::decode(&[0u8; 16]).is_err());
    }
}
