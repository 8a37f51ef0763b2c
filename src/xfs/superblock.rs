// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! XFS superblock (C4).

use crate::endian::BigEndian as BE;
use crate::error::{Error, Result};
use crate::image::ImageReader;

pub const XFS_SB_MAGIC: u32 = 0x5846_5342; // "XFSB"
pub const SB_SIZE: usize = 512;

#[derive(Clone, Debug)]
pub struct Superblock {
    pub magicnum: u32,
    pub blocksize: u32,
    pub dblocks: u64,
    pub rblocks: u64,
    pub rextents: u64,
    pub logstart: u64,
    pub rootino: u64,
    pub rbmino: u64,
    pub rsumino: u64,
    pub rextsize: u32,
    pub agblocks: u32,
    pub agcount: u32,
    pub rbmblocks: u32,
    pub logblocks: u32,
    pub versionnum: u16,
    pub sectsize: u16,
    pub inodesize: u16,
    pub inopblock: u16,
    pub blocklog: u8,
    pub sectlog: u8,
    pub inodelog: u8,
    pub inopblog: u8,
    pub agblklog: u8,
    pub rextslog: u8,
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub frextents: u64,
    pub uquotino: u64,
    pub gquotino: u64,
    pub pquotino: u64,
    /// Present only on v5 (`version() == 5`); zero on v4.
    pub features_compat: u32,
    pub features_ro_compat: u32,
    pub features_incompat: u32,
    pub features_log_incompat: u32,
}

impl Superblock {
    pub fn version(&self) -> u16 {
        self.versionnum & 0xF
    }

    pub fn read(image: &dyn ImageReader, offset: u64) -> Result<Superblock> {
        let mut buf = [0u8; SB_SIZE];
        image.read_exact_at(offset, &mut buf)?;

        let magicnum = BE::read_u32(&buf[0..]);
        if magicnum != XFS_SB_MAGIC {
            return Err(Error::Magic);
        }

        let versionnum = BE::read_u16(&buf[100..]);
        let version = versionnum & 0xF;
        if version != 4 && version != 5 {
            return Err(Error::Magic);
        }
        if version == 4 {
            log::warn!("XFS v4 superblock; analyzing via the v5 code path");
        }

        let mut sb = Superblock {
            magicnum,
            blocksize: BE::read_u32(&buf[4..]),
            dblocks: BE::read_u64(&buf[8..]),
            rblocks: BE::read_u64(&buf[16..]),
            rextents: BE::read_u64(&buf[24..]),
            logstart: BE::read_u64(&buf[48..]),
            rootino: BE::read_u64(&buf[56..]),
            rbmino: BE::read_u64(&buf[64..]),
            rsumino: BE::read_u64(&buf[72..]),
            rextsize: BE::read_u32(&buf[80..]),
            agblocks: BE::read_u32(&buf[84..]),
            agcount: BE::read_u32(&buf[88..]),
            rbmblocks: BE::read_u32(&buf[92..]),
            logblocks: BE::read_u32(&buf[96..]),
            versionnum,
            sectsize: BE::read_u16(&buf[102..]),
            inodesize: BE::read_u16(&buf[104..]),
            inopblock: BE::read_u16(&buf[106..]),
            blocklog: buf[120],
            sectlog: buf[121],
            inodelog: buf[122],
            inopblog: buf[123],
            agblklog: buf[124],
            rextslog: buf[125],
            icount: BE::read_u64(&buf[128..]),
            ifree: BE::read_u64(&buf[136..]),
            fdblocks: BE::read_u64(&buf[144..]),
            frextents: BE::read_u64(&buf[152..]),
            uquotino: BE::read_u64(&buf[160..]),
            gquotino: BE::read_u64(&buf[168..]),
            pquotino: 0,
            features_compat: 0,
            features_ro_compat: 0,
            features_incompat: 0,
            features_log_incompat: 0,
        };

        if version == 5 {
            sb.features_compat = BE::read_u32(&buf[208..]);
            sb.features_ro_compat = BE::read_u32(&buf[212..]);
            sb.features_incompat = BE::read_u32(&buf[216..]);
            sb.features_log_incompat = BE::read_u32(&buf[220..]);
            sb.pquotino = BE::read_u64(&buf[232..]);
        }

        if sb.blocksize == 0 || sb.agblocks == 0 || sb.agcount == 0 {
            return Err(Error::Magic);
        }

        Ok(sb)
    }

    /// Whether directory/inode records on this mount carry an explicit
    /// `ftype` byte (v5, or v4 with the ftype ro-compat bit set).
    pub fn has_ftype(&self) -> bool {
        self.version() == 5 && (self.features_incompat & 0x1) != 0
    }
}
