// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The inode allocation-state oracle (C5): descend the per-AG inode
//! B+tree to classify an inode as `Alloc`, `Unalloc`, or `NotTracked`.

use crate::endian::BigEndian as BE;
use crate::error::Result;
use crate::image::ImageReader;

use super::superblock::Superblock;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocState {
    Alloc,
    Unalloc,
    NotTracked,
}

struct BtreeHeader {
    level: u16,
    numrecs: u16,
    header_len: usize,
}

fn read_header(buf: &[u8], v5: bool) -> BtreeHeader {
    let header_len = if v5 { 56 } else { 16 };
    BtreeHeader { level: BE::read_u16(&buf[4..]), numrecs: BE::read_u16(&buf[6..]), header_len }
}

fn ag_block_offset(sb: &Superblock, ag: u32, agbno: u32) -> u64 {
    (ag as u64 * sb.agblocks as u64 + agbno as u64) * sb.blocksize as u64
}

/// Classifies `agino` within allocation group `ag`, whose inode B+tree
/// root block is `agi_root`.
pub fn getallocflag(
    image: &dyn ImageReader,
    sb: &Superblock,
    ag: u32,
    agi_root: u32,
    agino: u32,
) -> Result<AllocState> {
    let v5 = sb.version() == 5;
    let mut block = agi_root;
    let mut saw_key_match = false;

    loop {
        let buf = read_block(image, sb, ag, block)?;
        let hdr = read_header(&buf, v5);

        if hdr.level > 0 {
            let keysize = 4;
            let ptrsize = 4;
            let maxrecs = (sb.blocksize as usize - hdr.header_len) / (keysize + ptrsize);
            let keys_off = hdr.header_len;
            let ptrs_off = hdr.header_len + maxrecs * keysize;

            let mut found = None;
            for i in 0..hdr.numrecs as usize {
                let startino = BE::read_u32(&buf[keys_off + i * keysize..]);
                let next_start =
                    if i + 1 < hdr.numrecs as usize { BE::read_u32(&buf[keys_off + (i + 1) * keysize..]) } else { u32::MAX };
                if startino <= agino && agino < next_start {
                    found = Some(BE::read_u32(&buf[ptrs_off + i * ptrsize..]));
                    break;
                }
            }
            match found {
                Some(ptr) => {
                    saw_key_match = true;
                    block = ptr;
                    continue;
                }
                None => return Ok(AllocState::NotTracked),
            }
        }

        let recsize = 16;
        let maxrecs = (sb.blocksize as usize - hdr.header_len) / recsize;
        let _ = maxrecs;
        let recs_off = hdr.header_len;
        for i in 0..hdr.numrecs as usize {
            let rec = &buf[recs_off + i * recsize..];
            let ir_startino = BE::read_u32(&rec[0..]);
            let ir_free = BE::read_u64(&rec[8..]);
            if agino >= ir_startino && agino < ir_startino + 64 {
                let bit = agino - ir_startino;
                return Ok(if (ir_free >> bit) & 1 != 0 { AllocState::Unalloc } else { AllocState::Alloc });
            }
        }
        if saw_key_match {
            log::warn!("inode btree: key matched an internal node but no leaf record covers inode {agino}");
        }
        return Ok(AllocState::NotTracked);
    }
}

fn read_block(image: &dyn ImageReader, sb: &Superblock, ag: u32, agbno: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; sb.blocksize as usize];
    image.read_exact_at(ag_block_offset(sb, ag, agbno), &mut buf)?;
    Ok(buf)
}
