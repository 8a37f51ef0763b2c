// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-allocation-group headers: AGI (inode B+tree root) and AGF
//! (free-space B+tree roots + free list).

use crate::endian::BigEndian as BE;
use crate::error::{Error, Result};
use crate::image::ImageReader;

use super::superblock::Superblock;

pub const XFS_AGI_MAGIC: u32 = 0x5841_4749; // "XAGI"
pub const XFS_AGF_MAGIC: u32 = 0x5841_4746; // "XAGF"

#[derive(Clone, Copy, Debug)]
pub struct Agi {
    pub magicnum: u32,
    pub seqno: u32,
    pub length: u32,
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Agf {
    pub magicnum: u32,
    pub seqno: u32,
    pub length: u32,
    /// `[by-block root, by-count root]`
    pub roots: [u32; 2],
    /// `[by-block levels, by-count levels]`
    pub levels: [u32; 2],
    pub flfirst: u32,
    pub fllast: u32,
    pub flcount: u32,
    pub freeblks: u32,
}

fn ag_header_offset(sb: &Superblock, ag: u32, sector_multiple: u64) -> u64 {
    ag as u64 * sb.agblocks as u64 * sb.blocksize as u64 + sector_multiple * sb.sectsize as u64
}

impl Agi {
    pub fn read(image: &dyn ImageReader, sb: &Superblock, ag: u32) -> Result<Agi> {
        let mut buf = [0u8; 64];
        image.read_exact_at(ag_header_offset(sb, ag, 2), &mut buf)?;
        let agi = Agi {
            magicnum: BE::read_u32(&buf[0..]),
            seqno: BE::read_u32(&buf[8..]),
            length: BE::read_u32(&buf[12..]),
            count: BE::read_u32(&buf[16..]),
            root: BE::read_u32(&buf[20..]),
            level: BE::read_u32(&buf[24..]),
            freecount: BE::read_u32(&buf[28..]),
        };
        if agi.magicnum != XFS_AGI_MAGIC {
            return Err(Error::Magic);
        }
        Ok(agi)
    }
}

impl Agf {
    pub fn read(image: &dyn ImageReader, sb: &Superblock, ag: u32) -> Result<Agf> {
        let mut buf = [0u8; 64];
        image.read_exact_at(ag_header_offset(sb, ag, 1), &mut buf)?;
        let agf = Agf {
            magicnum: BE::read_u32(&buf[0..]),
            seqno: BE::read_u32(&buf[8..]),
            length: BE::read_u32(&buf[12..]),
            roots: [BE::read_u32(&buf[16..]), BE::read_u32(&buf[20..])],
            levels: [BE::read_u32(&buf[28..]), BE::read_u32(&buf[32..])],
            flfirst: BE::read_u32(&buf[40..]),
            fllast: BE::read_u32(&buf[44..]),
            flcount: BE::read_u32(&buf[48..]),
            freeblks: BE::read_u32(&buf[52..]),
        };
        if agf.magicnum != XFS_AGF_MAGIC {
            return Err(Error::Magic);
        }
        Ok(agf)
    }
}

/// The circular free-list of reserved AG blocks: 4 header blocks (sb, agf,
/// agi, agfl) plus one sector, read as a flat array of block numbers.
pub fn read_agfl(image: &dyn ImageReader, sb: &Superblock, ag: u32, agf: &Agf) -> Result<Vec<u32>> {
    let offset = ag_header_offset(sb, ag, 3);
    let agfl_size = sb.blocksize as usize;
    let mut buf = vec![0u8; agfl_size];
    image.read_exact_at(offset, &mut buf)?;

    let header_len = if sb.version() == 5 { 36 } else { 4 };
    let mut entries = Vec::new();
    let mut off = header_len;
    while off + 4 <= buf.len() {
        entries.push(BE::read_u32(&buf[off..]));
        off += 4;
    }

    let first = agf.flfirst as usize;
    let count = agf.flcount as usize;
    let capacity = entries.len();
    if capacity == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(entries[(first + i) % capacity]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SliceImage;

    fn synth_sb() -> Superblock {
        Superblock {
            magicnum: super::super::superblock::XFS_SB_MAGIC,
            blocksize: 512,
            dblocks: 100,
            rblocks: 0,
            rextents: 0,
            logstart: 0,
            rootino: 128,
            rbmino: 0,
            rsumino: 0,
            rextsize: 0,
            agblocks: 100,
            agcount: 1,
            rbmblocks: 0,
            logblocks: 0,
            versionnum: 5,
            sectsize: 512,
            inodesize: 256,
            inopblock: 2,
            blocklog: 9,
            sectlog: 9,
            inodelog: 8,
            inopblog: 1,
            agblklog: 7,
            rextslog: 0,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            frextents: 0,
            uquotino: 0,
            gquotino: 0,
            pquotino: 0,
            features_compat: 0,
            features_ro_compat: 0,
            features_incompat: 0,
            features_log_incompat: 0,
        }
    }

    #[test]
    fn agi_reads_root_and_rejects_bad_magic() {
        let sb = synth_sb();
        let mut image = vec![0u8; sb.blocksize as usize * 4];
        let agi_off = 2 * sb.sectsize as usize;
        BE::write_u32(&mut image[agi_off..], XFS_AGI_MAGIC);
        BE::write_u32(&mut image[agi_off + 20..], 4); // root block
        BE::write_u32(&mut image[agi_off + 28..], 3); // freecount
        let img = SliceImage::new(image);

        let agi = Agi::read(&img, &sb, 0).unwrap();
        assert_eq!(agi.root, 4);
        assert_eq!(agi.freecount, 3);

        let mut bad = vec![0u8; sb.blocksize as usize * 4];
        BE::write_u32(&mut bad[agi_off..], 0xdead_beef);
        let bad_img = SliceImage::new(bad);
        assert!(Agi::read(&bad_img, &sb, 0).is_err());
    }

    #[test]
    fn agf_reads_roots_and_free_list_bounds() {
        let sb = synth_sb();
        let mut image = vec![0u8; sb.blocksize as usize * 4];
        let agf_off = sb.sectsize as usize;
        BE::write_u32(&mut image[agf_off..], XFS_AGF_MAGIC);
        BE::write_u32(&mut image[agf_off + 16..], 11); // roots[0]: by-block
        BE::write_u32(&mut image[agf_off + 20..], 12); // roots[1]: by-count
        BE::write_u32(&mut image[agf_off + 40..], 0); // flfirst
        BE::write_u32(&mut image[agf_off + 44..], 1); // fllast
        BE::write_u32(&mut image[agf_off + 48..], 2); // flcount
        let img = SliceImage::new(image);

        let agf = Agf::read(&img, &sb, 0).unwrap();
        assert_eq!(agf.roots, [11, 12]);
        assert_eq!(agf.flfirst, 0);
        assert_eq!(agf.flcount, 2);
    }

    #[test]
    fn read_agfl_wraps_the_circular_buffer() {
        let sb = synth_sb();
        let mut image = vec![0u8; sb.blocksize as usize];
        let header_len = 36usize; // v5
        let capacity = (image.len() - header_len) / 4;
        // Fill only the slots the test reads from; the rest stay zero.
        let last = capacity - 1;
        BE::write_u32(&mut image[header_len + last * 4..], 900); // entries[last]
        BE::write_u32(&mut image[header_len..], 901); // entries[0]
        BE::write_u32(&mut image[header_len + 4..], 902); // entries[1]
        let img = SliceImage::new(image);
        let agf = Agf {
            magicnum: XFS_AGF_MAGIC,
            seqno: 0,
            length: 100,
            roots: [0, 0],
            levels: [0, 0],
            flfirst: last as u32,
            fllast: 1,
            flcount: 3,
            freeblks: 0,
        };

        let out = read_agfl(&img, &sb, 0, &agf).unwrap();
        // Starting at the last slot and wrapping around: last, 0, 1.
        assert_eq!(out, vec![900, 901, 902]);
    }
}
