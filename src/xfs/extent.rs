// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packed BMBT extent records and the BMAP B+tree (C7).

use bitstruct::bitstruct;

use crate::endian::BigEndian as BE;
use crate::error::{Error, Result};
use crate::fs::{AttrRunFlags, FsAttrRun};
use crate::image::ImageReader;

use super::superblock::Superblock;

bitstruct! {
    /// The packed 128-bit on-disk extent record: 1 bit `exntflag`, 54 bits
    /// `startoff`, 52 bits `startblock`, 21 bits `blockcount`, read as a
    /// single big-endian 128-bit integer (two successive 64-bit words).
    #[derive(Copy, Clone)]
    pub struct BmbtRaw(u128) {
        blockcount: u64 = 0..21;
        startblock: u64 = 21..73;
        startoff: u64 = 73..127;
        exntflag: bool = 127;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtentState {
    Norm,
    Unwritten,
}

#[derive(Clone, Copy, Debug)]
pub struct BmbtRec {
    pub startoff: u64,
    pub startblock: u64,
    pub blockcount: u64,
    pub state: ExtentState,
}

impl BmbtRec {
    pub fn decode(bytes: &[u8]) -> BmbtRec {
        let hi = BE::read_u64(&bytes[0..]);
        let lo = BE::read_u64(&bytes[8..]);
        let raw = BmbtRaw(((hi as u128) << 64) | lo as u128);
        BmbtRec {
            startoff: raw.startoff(),
            startblock: raw.startblock(),
            blockcount: raw.blockcount(),
            state: if raw.exntflag() { ExtentState::Unwritten } else { ExtentState::Norm },
        }
    }
}

/// Splits an absolute `startblock` into `(ag, phys_block)` — the
/// device-relative block address within the whole image.
pub fn resolve_block(sb: &Superblock, startblock: u64) -> u64 {
    let ag = startblock >> sb.agblklog;
    let mask = (1u64 << sb.agblklog) - 1;
    let rel = startblock & mask;
    ag * sb.agblocks as u64 + rel
}

fn bmbt_header_len(v5: bool) -> usize {
    if v5 { 72 } else { 24 }
}

fn extent_run(sb: &Superblock, rec: &BmbtRec) -> FsAttrRun {
    FsAttrRun {
        offset: rec.startoff,
        addr: resolve_block(sb, rec.startblock),
        len: rec.blockcount,
        flags: AttrRunFlags::empty(),
    }
}

/// Unpacks a flat buffer of 16-byte packed extent records (the `Extents`
/// format fork, stashed verbatim by the inode loader) into runs.
pub fn runs_from_extents_buf(sb: &Superblock, buf: &[u8]) -> Vec<FsAttrRun> {
    buf.chunks_exact(16).map(|c| extent_run(sb, &BmbtRec::decode(c))).collect()
}

/// Full traversal of a BTree-format data fork: descend every child of
/// every internal node (not a keyed lookup — see design notes on why a
/// full ascending-offset traversal is the contract here) and collect
/// every leaf extent, in ascending logical-offset order.
pub fn runs_from_btree(image: &dyn ImageReader, sb: &Superblock, root_fork_bytes: &[u8]) -> Result<Vec<FsAttrRun>> {
    // xfs_bmdr_block root, embedded in the inode literal area.
    if root_fork_bytes.len() < 4 {
        return Err(Error::InodeCor);
    }
    let numrecs = BE::read_u16(&root_fork_bytes[2..]) as usize;
    let dfork_size = root_fork_bytes.len();
    let bmdr_header = 4usize;
    let maxrecs = (dfork_size - bmdr_header) / (8 + 8);
    if maxrecs == 0 {
        return Ok(Vec::new());
    }
    let keys_off = bmdr_header;
    let ptrs_off = bmdr_header + maxrecs * 8;

    let mut runs = Vec::new();
    for i in 0..numrecs.min(maxrecs) {
        let ptr_off = ptrs_off + i * 8;
        if ptr_off + 8 > root_fork_bytes.len() {
            break;
        }
        let fsblock = BE::read_u64(&root_fork_bytes[ptr_off..]);
        walk_bmbt_block(image, sb, fsblock, &mut runs)?;
    }
    let _ = keys_off;
    runs.sort_by_key(|r| r.offset);
    Ok(runs)
}

fn walk_bmbt_block(image: &dyn ImageReader, sb: &Superblock, fsblock: u64, runs: &mut Vec<FsAttrRun>) -> Result<()> {
    let v5 = sb.version() == 5;
    let header_len = bmbt_header_len(v5);
    let phys = resolve_block(sb, fsblock);
    let mut buf = vec![0u8; sb.blocksize as usize];
    image.read_exact_at(phys * sb.blocksize as u64, &mut buf)?;

    let level = BE::read_u16(&buf[4..]);
    let numrecs = BE::read_u16(&buf[6..]) as usize;

    if level > 0 {
        let maxrecs = (sb.blocksize as usize - header_len) / 16;
        let ptrs_off = header_len + maxrecs * 8;
        for i in 0..numrecs.min(maxrecs) {
            let ptr_off = ptrs_off + i * 8;
            if ptr_off + 8 > buf.len() {
                break;
            }
            let child = BE::read_u64(&buf[ptr_off..]);
            walk_bmbt_block(image, sb, child, runs)?;
        }
    } else {
        let recs_off = header_len;
        for i in 0..numrecs {
            let rec_off = recs_off + i * 16;
            if rec_off + 16 > buf.len() {
                break;
            }
            let rec = BmbtRec::decode(&buf[rec_off..]);
            runs.push(extent_run(sb, &rec));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_packed_extent() {
        // startoff=2, startblock=4200, blockcount=1, norm.
        let raw = BmbtRaw(0).with_startoff(2).with_startblock(4200).with_blockcount(1).with_exntflag(false);
        let mut bytes = [0u8; 16];
        BE::write_u64(&mut bytes[0..], (raw.0 >> 64) as u64);
        BE::write_u64(&mut bytes[8..], raw.0 as u64);
        let rec = BmbtRec::decode(&bytes);
        assert_eq!(rec.startoff, 2);
        assert_eq!(rec.startblock, 4200);
        assert_eq!(rec.blockcount, 1);
        assert_eq!(rec.state, ExtentState::Norm);
    }
}
