// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full-mount, end-to-end coverage of the XFS driver: a shortform root
//! directory over two regular files, and a regular file whose data fork
//! holds a packed `Extents` array of three non-contiguous runs.

use std::rc::Rc;

use tskfs::endian::BigEndian as BE;
use tskfs::fs::{ContentStash, FileType, FsType};
use tskfs::image::{ImageReader, SliceImage};
use tskfs::xfs;

const BLOCKSIZE: u32 = 512;
const SECTSIZE: u16 = 512;
const INODESIZE: u16 = 256;
const INOPBLOCK: u16 = 2;

/// Writes a v5 superblock at byte 0 of `buf`.
fn write_superblock(buf: &mut [u8], agblocks: u32, agcount: u32, dblocks: u64, rootino: u64) {
    BE::write_u32(&mut buf[0..], 0x5846_5342); // XFSB magic
    BE::write_u32(&mut buf[4..], BLOCKSIZE);
    BE::write_u64(&mut buf[8..], dblocks);
    BE::write_u64(&mut buf[56..], rootino);
    BE::write_u32(&mut buf[84..], agblocks);
    BE::write_u32(&mut buf[88..], agcount);
    BE::write_u16(&mut buf[100..], 5); // versionnum = v5
    BE::write_u16(&mut buf[102..], SECTSIZE);
    BE::write_u16(&mut buf[104..], INODESIZE);
    BE::write_u16(&mut buf[106..], INOPBLOCK);
    buf[120] = 9; // blocklog (512)
    buf[121] = 9; // sectlog
    buf[122] = 8; // inodelog (256)
    buf[123] = 1; // inopblog (2 inodes/block)
    buf[124] = 7; // agblklog (128 blocks/AG)
    // features_{compat,ro_compat,incompat,log_incompat} left at 0: no
    // ftype bit, so directory entries carry no on-disk ftype byte.
}

/// Writes the AGI header (block 2 of AG 0) with inode-btree root at block 4.
fn write_agi(buf: &mut [u8], agi_offset: usize, btree_root_block: u32) {
    BE::write_u32(&mut buf[agi_offset..], 0x5841_4749); // XAGI magic
    BE::write_u32(&mut buf[agi_offset + 20..], btree_root_block); // root
}

/// Writes a single-leaf inode B+tree block covering `start..start+64`
/// with every inode marked allocated (`ir_free = 0`).
fn write_inobt_leaf(buf: &mut [u8], block_offset: usize, start: u32) {
    BE::write_u16(&mut buf[block_offset + 4..], 0); // level = 0 (leaf)
    BE::write_u16(&mut buf[block_offset + 6..], 1); // numrecs = 1
    let rec_off = block_offset + 56; // v5 header length
    BE::write_u32(&mut buf[rec_off..], start); // ir_startino
    BE::write_u64(&mut buf[rec_off + 8..], 0); // ir_free: all allocated
}

fn dinode_offset(agblocks: u32, agino: u32) -> usize {
    let block_in_ag = agino / INOPBLOCK as u32;
    let index_in_block = agino % INOPBLOCK as u32;
    let _ = agblocks;
    block_in_ag as usize * BLOCKSIZE as usize + index_in_block as usize * INODESIZE as usize
}

/// Writes the common dinode core fields (not the data fork) at `off`.
fn write_dinode_core(buf: &mut [u8], off: usize, mode: u16, format: u8, size: u64, nextents: u32) {
    BE::write_u16(&mut buf[off..], 0x494e); // "IN" magic
    BE::write_u16(&mut buf[off + 2..], mode);
    buf[off + 4] = 2; // version 2: 100-byte literal area, no crtime
    buf[off + 5] = format;
    BE::write_u32(&mut buf[off + 16..], 1); // nlink
    BE::write_u32(&mut buf[off + 32..], 1_700_000_000); // atime secs
    BE::write_u32(&mut buf[off + 40..], 1_700_000_000); // mtime secs
    BE::write_u32(&mut buf[off + 48..], 1_700_000_000); // ctime secs (USED)
    BE::write_u64(&mut buf[off + 56..], size);
    BE::write_u32(&mut buf[off + 76..], nextents);
    buf[off + 83] = 0; // aformat: Dev (no attribute fork)
}

const DATA_FORK_OFFSET: usize = 100; // version 2 dinode core length

/// Scenario 1: a shortform root directory (inum 128) listing two regular
/// files, `"a"` -> 131 and `"b"` -> 132, all three inodes allocated per
/// the inode B+tree.
#[test]
fn shortform_root_directory_mounts_and_lists_children() {
    let agblocks = 128u32;
    let mut image = vec![0u8; agblocks as usize * BLOCKSIZE as usize];

    write_superblock(&mut image, agblocks, 1, agblocks as u64, 128);
    write_agi(&mut image, 2 * SECTSIZE as usize, 4);
    write_inobt_leaf(&mut image, 4 * BLOCKSIZE as usize, 128);

    // Root dinode (agino 128): shortform directory, two entries.
    let root_off = dinode_offset(agblocks, 128);
    let sf_mode = 0o040755u16;
    let mut sf = Vec::new();
    sf.push(2u8); // count
    sf.push(0u8); // i8count -> 4-byte inode numbers
    let mut parent = [0u8; 4];
    BE::write_u32(&mut parent, 128);
    sf.extend_from_slice(&parent);
    for (name, inum) in [("a", 131u32), ("b", 132u32)] {
        sf.push(name.len() as u8);
        sf.extend_from_slice(&[0, 0]); // sf_off, unused
        sf.extend_from_slice(name.as_bytes());
        let mut n = [0u8; 4];
        BE::write_u32(&mut n, inum);
        sf.extend_from_slice(&n);
    }
    write_dinode_core(&mut image, root_off, sf_mode, 1 /* Local */, sf.len() as u64, 0);
    image[root_off + DATA_FORK_OFFSET..root_off + DATA_FORK_OFFSET + sf.len()].copy_from_slice(&sf);

    // Child dinodes: plain empty regular files.
    for agino in [131u32, 132u32] {
        let off = dinode_offset(agblocks, agino);
        write_dinode_core(&mut image, off, 0o100644, 1 /* Local */, 0, 0);
    }

    let reader: Rc<dyn ImageReader> = Rc::new(SliceImage::new(image));
    let fs = xfs::mount(reader, 0).expect("mount succeeds");
    assert_eq!(fs.fs_type(), FsType::Xfs);
    assert_eq!(fs.root_inum(), 128);

    let (dir, res) = fs.dir_open_meta(128).expect("root directory opens");
    assert_eq!(res, tskfs::fs::DirOpenResult::Ok);
    assert_eq!(dir.names.len(), 2);
    assert!(dir.names.iter().all(|n| n.alloc));
    let a = dir.names.iter().find(|n| n.name == "a").expect("entry a");
    assert_eq!(a.meta_addr, 131);
    let b = dir.names.iter().find(|n| n.name == "b").expect("entry b");
    assert_eq!(b.meta_addr, 132);

    let meta_a = fs.file_add_meta(131).expect("inode 131 readable");
    assert_eq!(meta_a.file_type, FileType::Reg);
    assert!(meta_a.flags.contains(tskfs::fs::MetaFlags::ALLOC));

    let meta_root = fs.file_add_meta(128).expect("inode 128 readable");
    assert_eq!(meta_root.file_type, FileType::Dir);
    assert!(matches!(meta_root.content, ContentStash::Local(_)));
}

/// Same layout as the shortform-directory scenario, but preceded by a
/// partition-table-sized prefix and mounted with `--offset` pointing past
/// it, proving every AG/inode/block read is offset-relative, not just the
/// superblock read.
#[test]
fn mounts_at_a_nonzero_image_offset() {
    let agblocks = 128u32;
    let prefix = 4096u64;
    let mut fs_image = vec![0u8; agblocks as usize * BLOCKSIZE as usize];

    write_superblock(&mut fs_image, agblocks, 1, agblocks as u64, 128);
    write_agi(&mut fs_image, 2 * SECTSIZE as usize, 4);
    write_inobt_leaf(&mut fs_image, 4 * BLOCKSIZE as usize, 128);

    let root_off = dinode_offset(agblocks, 128);
    let sf_mode = 0o040755u16;
    let mut sf = Vec::new();
    sf.push(1u8); // count
    sf.push(0u8); // i8count -> 4-byte inode numbers
    let mut parent = [0u8; 4];
    BE::write_u32(&mut parent, 128);
    sf.extend_from_slice(&parent);
    sf.push(1u8); // namelen
    sf.extend_from_slice(&[0, 0]); // sf_off, unused
    sf.extend_from_slice(b"a");
    let mut n = [0u8; 4];
    BE::write_u32(&mut n, 131);
    sf.extend_from_slice(&n);
    write_dinode_core(&mut fs_image, root_off, sf_mode, 1 /* Local */, sf.len() as u64, 0);
    fs_image[root_off + DATA_FORK_OFFSET..root_off + DATA_FORK_OFFSET + sf.len()].copy_from_slice(&sf);

    let off = dinode_offset(agblocks, 131);
    write_dinode_core(&mut fs_image, off, 0o100644, 1 /* Local */, 0, 0);

    let mut image = vec![0xAAu8; prefix as usize];
    image.extend_from_slice(&fs_image);

    let reader: Rc<dyn ImageReader> = Rc::new(SliceImage::new(image));
    let fs = xfs::mount(reader, prefix).expect("mount succeeds at a nonzero offset");
    assert_eq!(fs.root_inum(), 128);

    let (dir, res) = fs.dir_open_meta(128).expect("root directory opens");
    assert_eq!(res, tskfs::fs::DirOpenResult::Ok);
    assert_eq!(dir.names.len(), 1);
    let a = dir.names.iter().find(|n| n.name == "a").expect("entry a");
    assert_eq!(a.meta_addr, 131);

    let meta_a = fs.file_add_meta(131).expect("inode 131 readable through the offset");
    assert_eq!(meta_a.file_type, FileType::Reg);
    assert!(meta_a.flags.contains(tskfs::fs::MetaFlags::ALLOC));
}

/// Scenario 2: a regular file whose `Extents`-format data fork packs
/// three non-contiguous runs covering 7 logical blocks, and whose
/// content reads back in ascending logical order.
#[test]
fn extents_file_resolves_noncontiguous_runs_and_reads_back() {
    let agblocks = 128u32;
    let mut image = vec![0u8; agblocks as usize * BLOCKSIZE as usize];

    write_superblock(&mut image, agblocks, 1, agblocks as u64, 128);
    write_agi(&mut image, 2 * SECTSIZE as usize, 4);
    write_inobt_leaf(&mut image, 4 * BLOCKSIZE as usize, 128);

    // Root dinode is the file itself: Extents format, 3 runs, size 7 blocks.
    let root_off = dinode_offset(agblocks, 128);
    let runs = [
        (0u64, 40u64, 2u64), // (startoff, startblock, blockcount)
        (2, 55, 1),
        (3, 80, 4),
    ];
    let total_blocks: u64 = runs.iter().map(|(_, _, c)| c).sum();
    write_dinode_core(&mut image, root_off, 0o100644, 2 /* Extents */, total_blocks * BLOCKSIZE as u64, runs.len() as u32);

    let mut fork = Vec::new();
    for (startoff, startblock, blockcount) in runs {
        fork.extend_from_slice(&pack_extent(startoff, startblock, blockcount, false));
    }
    image[root_off + DATA_FORK_OFFSET..root_off + DATA_FORK_OFFSET + fork.len()].copy_from_slice(&fork);

    // Fill each referenced block so logical block i reads back as all-`i`
    // bytes, letting a single readback prove both resolution and ordering.
    let mut logical = 0u8;
    for (_, startblock, blockcount) in runs {
        for b in 0..blockcount {
            let phys = (startblock + b) as usize * BLOCKSIZE as usize;
            image[phys..phys + BLOCKSIZE as usize].fill(logical);
            logical += 1;
        }
    }

    let reader: Rc<dyn ImageReader> = Rc::new(SliceImage::new(image));
    let fs = xfs::mount(reader, 0).expect("mount succeeds");

    let mut meta = fs.file_add_meta(128).expect("file readable");
    assert_eq!(meta.file_type, FileType::Reg);
    assert_eq!(meta.size, 7 * BLOCKSIZE as u64);
    assert!(matches!(meta.content, ContentStash::Extents(_)));

    fs.load_attrs(&mut meta).expect("attrs load");
    let attr = meta.attr.first().expect("one resident data attribute");
    assert_eq!(attr.runs().len(), 3);
    assert_eq!(attr.runs()[0].offset, 0);
    assert_eq!(attr.runs()[1].offset, 2);
    assert_eq!(attr.runs()[2].offset, 3);

    let mut content = vec![0u8; 7 * BLOCKSIZE as usize];
    let n = tskfs::fs::attr_read(&fs, attr, 0, &mut content).expect("attr_read succeeds");
    assert_eq!(n, content.len());
    for (i, chunk) in content.chunks_exact(BLOCKSIZE as usize).enumerate() {
        assert!(chunk.iter().all(|&b| b == i as u8), "logical block {i} did not resolve to the expected physical block");
    }
}

/// Packs a BMBT extent record the same way the on-disk format does: 1-bit
/// `exntflag`, 54-bit `startoff`, 52-bit `startblock`, 21-bit `blockcount`,
/// as two big-endian 64-bit words.
fn pack_extent(startoff: u64, startblock: u64, blockcount: u64, unwritten: bool) -> [u8; 16] {
    let raw: u128 = (blockcount & 0x1F_FFFF) as u128
        | (((startblock & 0xF_FFFF_FFFF_FFFF) as u128) << 21)
        | (((startoff & 0x3F_FFFF_FFFF_FFFF) as u128) << 73)
        | ((unwritten as u128) << 127);
    let mut bytes = [0u8; 16];
    BE::write_u64(&mut bytes[0..], (raw >> 64) as u64);
    BE::write_u64(&mut bytes[8..], raw as u64);
    bytes
}
