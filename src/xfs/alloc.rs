// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block allocation oracle (C9).

use crate::endian::BigEndian as BE;
use crate::error::Result;
use crate::fs::BlockFlags;
use crate::image::ImageReader;

use super::ag::Agf;
use super::inode_btree::{self, AllocState};
use super::superblock::Superblock;

/// AG-relative block indices at or below this are the fixed header set
/// (superblock, AGF, AGI, AGFL, plus the first free-space B+tree roots).
const METADATA_BLOCK_THRESHOLD: u32 = 7;

pub fn block_getflags(
    image: &dyn ImageReader,
    sb: &Superblock,
    ag: u32,
    agf: &Agf,
    agfl: &[u32],
    agi_root: u32,
    rel_blk: u32,
) -> Result<BlockFlags> {
    if rel_blk <= METADATA_BLOCK_THRESHOLD {
        return Ok(BlockFlags::META | BlockFlags::ALLOC);
    }

    if agfl.contains(&rel_blk) {
        return Ok(BlockFlags::META | BlockFlags::UNALLOC);
    }

    let inopblock = 1u32 << sb.inopblog;
    let agino = rel_blk.saturating_mul(inopblock);
    if let Ok(AllocState::Alloc) = inode_btree::getallocflag(image, sb, ag, agi_root, agino) {
        return Ok(BlockFlags::META | BlockFlags::ALLOC);
    }

    if free_space_contains(image, sb, ag, agf.roots[0], rel_blk)? {
        Ok(BlockFlags::CONT | BlockFlags::UNALLOC)
    } else {
        Ok(BlockFlags::CONT | BlockFlags::ALLOC)
    }
}

fn ag_block_offset(sb: &Superblock, ag: u32, agbno: u32) -> u64 {
    (ag as u64 * sb.agblocks as u64 + agbno as u64) * sb.blocksize as u64
}

/// Descends the free-space-by-offset B+tree looking for a record whose
/// `[startblock, startblock+blockcount)` covers `rel_blk`.
fn free_space_contains(image: &dyn ImageReader, sb: &Superblock, ag: u32, root: u32, rel_blk: u32) -> Result<bool> {
    let v5 = sb.version() == 5;
    let header_len = if v5 { 56 } else { 16 };
    let mut block = root;

    loop {
        let mut buf = vec![0u8; sb.blocksize as usize];
        image.read_exact_at(ag_block_offset(sb, ag, block), &mut buf)?;
        let level = BE::read_u16(&buf[4..]);
        let numrecs = BE::read_u16(&buf[6..]) as usize;

        if level > 0 {
            let maxrecs = (sb.blocksize as usize - header_len) / (4 + 4);
            let keys_off = header_len;
            let ptrs_off = header_len + maxrecs * 4;
            let mut next = None;
            for i in 0..numrecs {
                let startblock = BE::read_u32(&buf[keys_off + i * 4..]);
                let next_start = if i + 1 < numrecs { BE::read_u32(&buf[keys_off + (i + 1) * 4..]) } else { u32::MAX };
                if startblock <= rel_blk && rel_blk < next_start {
                    next = Some(BE::read_u32(&buf[ptrs_off + i * 4..]));
                    break;
                }
            }
            match next {
                Some(ptr) => {
                    block = ptr;
                    continue;
                }
                None => return Ok(false),
            }
        }

        let recs_off = header_len;
        for i in 0..numrecs {
            let rec = &buf[recs_off + i * 8..];
            let startblock = BE::read_u32(&rec[0..]);
            let blockcount = BE::read_u32(&rec[4..]);
            if rel_blk >= startblock && rel_blk < startblock + blockcount {
                return Ok(true);
            }
        }
        return Ok(false);
    }
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

    fn blank_agf() -> Agf {
        Agf { magicnum: 0, seqno: 0, length: 100, roots: [11, 0], levels: [0, 0], flfirst: 0, fllast: 0, flcount: 0, freeblks: 0 }
    }

    #[test]
    fn header_blocks_are_always_metadata_alloc() {
        let sb = synth_sb();
        let img = SliceImage::new(vec![0u8; sb.blocksize as usize]);
        let agf = blank_agf();
        for rel_blk in 0..=METADATA_BLOCK_THRESHOLD {
            let flags = block_getflags(&img, &sb, 0, &agf, &[], 0, rel_blk).unwrap();
            assert_eq!(flags, BlockFlags::META | BlockFlags::ALLOC);
        }
    }

    #[test]
    fn agfl_member_is_metadata_unalloc() {
        let sb = synth_sb();
        let img = SliceImage::new(vec![0u8; sb.blocksize as usize]);
        let agf = blank_agf();
        let flags = block_getflags(&img, &sb, 0, &agf, &[8, 9], 0, 8).unwrap();
        assert_eq!(flags, BlockFlags::META | BlockFlags::UNALLOC);
    }

    #[test]
    fn inode_bearing_block_with_allocated_inode_is_metadata_alloc() {
        let sb = synth_sb();
        let mut image = vec![0u8; sb.blocksize as usize * 12];
        let agi_root = 10u32;
        let leaf_off = agi_root as usize * sb.blocksize as usize;
        BE::write_u16(&mut image[leaf_off + 4..], 0); // level = 0
        BE::write_u16(&mut image[leaf_off + 6..], 1); // numrecs = 1
        let rec_off = leaf_off + 56;
        BE::write_u32(&mut image[rec_off..], 0); // ir_startino
        BE::write_u64(&mut image[rec_off + 8..], 0); // ir_free: all allocated
        let img = SliceImage::new(image);
        let agf = blank_agf();

        // rel_blk 20 -> agino 40 (inopblock=2), covered by the one leaf record.
        let flags = block_getflags(&img, &sb, 0, &agf, &[], agi_root, 20).unwrap();
        assert_eq!(flags, BlockFlags::META | BlockFlags::ALLOC);
    }

    #[test]
    fn data_block_in_free_space_btree_is_content_unalloc() {
        let sb = synth_sb();
        let mut image = vec![0u8; sb.blocksize as usize * 12];
        // Inode btree (root at block 10): empty leaf, nothing allocated.
        let ibt_off = 10 * sb.blocksize as usize;
        BE::write_u16(&mut image[ibt_off + 4..], 0);
        BE::write_u16(&mut image[ibt_off + 6..], 0);
        // Free-space-by-block btree (root at block 11): one leaf record
        // covering AG-relative blocks [25, 35).
        let fsbt_off = 11 * sb.blocksize as usize;
        BE::write_u16(&mut image[fsbt_off + 4..], 0); // level = 0
        BE::write_u16(&mut image[fsbt_off + 6..], 1); // numrecs = 1
        let rec_off = fsbt_off + 56;
        BE::write_u32(&mut image[rec_off..], 25); // startblock
        BE::write_u32(&mut image[rec_off + 4..], 10); // blockcount
        let img = SliceImage::new(image);
        let agf = blank_agf();

        let flags = block_getflags(&img, &sb, 0, &agf, &[], 10, 30).unwrap();
        assert_eq!(flags, BlockFlags::CONT | BlockFlags::UNALLOC);
    }

    #[test]
    fn data_block_outside_free_space_btree_is_content_alloc() {
        let sb = synth_sb();
        let mut image = vec![0u8; sb.blocksize as usize * 12];
        let ibt_off = 10 * sb.blocksize as usize;
        BE::write_u16(&mut image[ibt_off + 4..], 0);
        BE::write_u16(&mut image[ibt_off + 6..], 0);
        let fsbt_off = 11 * sb.blocksize as usize;
        BE::write_u16(&mut image[fsbt_off + 4..], 0);
        BE::write_u16(&mut image[fsbt_off + 6..], 1);
        let rec_off = fsbt_off + 56;
        BE::write_u32(&mut image[rec_off..], 25);
        BE::write_u32(&mut image[rec_off + 4..], 10);
        let img = SliceImage::new(image);
        let agf = blank_agf();

        let flags = block_getflags(&img, &sb, 0, &agf, &[], 10, 50).unwrap();
        assert_eq!(flags, BlockFlags::CONT | BlockFlags::ALLOC);
    }
}
