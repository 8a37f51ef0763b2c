// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The XFS driver (C4–C9): mount, AG headers, inode allocation oracle,
//! inode loader, extent/BMBT decoding, directory walking, and the block
//! allocation oracle.

pub mod ag;
pub mod alloc;
pub mod dinode;
pub mod dir;
pub mod extent;
pub mod inode_btree;
pub mod superblock;

use std::rc::Rc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::fs::{
    AttrState, BlockCallback, BlockFlags, ContentStash, DirOpenResult, FileType, FsAttr, FsAttrData, FsDir, FsDriver,
    FsFile, FsInfo, FsInfoInner, FsMeta, FsName, FsTimes, FsType, InodeCallback, MetaFlags, Timestamp, WalkControl,
};
use crate::image::{ImageReader, OffsetImage};

use ag::{Agf, Agi};
use dinode::{Dinode, InodeFormat};
use inode_btree::AllocState;
use superblock::Superblock;

struct AgHeaders {
    agf: Agf,
    agfl: Vec<u32>,
}

pub struct Xfs {
    sb: Superblock,
    agi: Vec<Agi>,
    ag_cache: Mutex<Vec<Option<AgHeaders>>>,
}

impl Xfs {
    fn shift(&self) -> u32 {
        self.sb.agblklog as u32 + self.sb.inopblog as u32
    }

    fn inum_to_ag_agino(&self, inum: u64) -> (u32, u32) {
        let shift = self.shift();
        ((inum >> shift) as u32, (inum & ((1u64 << shift) - 1)) as u32)
    }

    fn addr_to_ag_relblk(&self, addr: u64) -> (u32, u32) {
        ((addr / self.sb.agblocks as u64) as u32, (addr % self.sb.agblocks as u64) as u32)
    }

    fn with_ag_headers<T>(&self, image: &dyn ImageReader, ag: u32, f: impl FnOnce(&Agf, &[u32]) -> Result<T>) -> Result<T> {
        let mut cache = self.ag_cache.lock();
        if cache[ag as usize].is_none() {
            let agf = Agf::read(image, &self.sb, ag)?;
            let agfl = ag::read_agfl(image, &self.sb, ag, &agf)?;
            cache[ag as usize] = Some(AgHeaders { agf, agfl });
        }
        let headers = cache[ag as usize].as_ref().unwrap();
        f(&headers.agf, &headers.agfl)
    }

    fn resolve_ftype(&self, image: &dyn ImageReader, inum: u64) -> FileType {
        let (ag, agino) = self.inum_to_ag_agino(inum);
        match Dinode::read(image, &self.sb, ag, agino) {
            Ok(dinode) => mode_to_file_type(dinode.mode),
            Err(_) => FileType::Undef,
        }
    }

    fn load_dir_names(&self, image: &dyn ImageReader, inum: u64, meta: &FsMeta) -> (Vec<FsName>, DirOpenResult) {
        let parent_alloc = meta.flags.contains(MetaFlags::ALLOC);
        let has_ftype = self.sb.has_ftype();
        let (mut names, res) = match &meta.content {
            ContentStash::Local(buf) => dir::parse_shortform_ftyped(buf, has_ftype, parent_alloc),
            ContentStash::Extents(buf) => {
                let runs = extent::runs_from_extents_buf(&self.sb, buf);
                let mut names = Vec::new();
                for run in &runs {
                    for i in 0..run.len {
                        let addr = run.addr + i;
                        let mut block = vec![0u8; self.sb.blocksize as usize];
                        if image.read_exact_at(addr * self.sb.blocksize as u64, &mut block).is_err() {
                            return (names, DirOpenResult::Corrupt);
                        }
                        let entries = dir::parse_data_block(&block, dir::is_v5(&self.sb), has_ftype, parent_alloc, |inum| {
                            self.resolve_ftype(image, inum)
                        });
                        names.extend(entries);
                    }
                }
                (names, DirOpenResult::Ok)
            }
            ContentStash::BTreeRoot { offset, len } => {
                let mut root_buf = vec![0u8; *len as usize];
                if image.read_exact_at(*offset, &mut root_buf).is_err() {
                    return (Vec::new(), DirOpenResult::Corrupt);
                }
                match extent::runs_from_btree(image, &self.sb, &root_buf) {
                    Ok(runs) => {
                        let mut names = Vec::new();
                        for run in &runs {
                            for i in 0..run.len {
                                let addr = run.addr + i;
                                let mut block = vec![0u8; self.sb.blocksize as usize];
                                if image.read_exact_at(addr * self.sb.blocksize as u64, &mut block).is_err() {
                                    return (names, DirOpenResult::Corrupt);
                                }
                                let entries =
                                    dir::parse_data_block(&block, dir::is_v5(&self.sb), has_ftype, parent_alloc, |inum| {
                                        self.resolve_ftype(image, inum)
                                    });
                                names.extend(entries);
                            }
                        }
                        (names, DirOpenResult::Ok)
                    }
                    Err(_) => (Vec::new(), DirOpenResult::Corrupt),
                }
            }
            _ => (Vec::new(), DirOpenResult::Corrupt),
        };
        for name in &mut names {
            name.par_addr = inum;
        }
        (names, res)
    }
}

fn mode_to_file_type(mode: u16) -> FileType {
    match mode & Dinode::S_IFMT {
        Dinode::S_IFDIR => FileType::Dir,
        Dinode::S_IFREG => FileType::Reg,
        Dinode::S_IFLNK => FileType::Lnk,
        Dinode::S_IFBLK => FileType::Blk,
        Dinode::S_IFCHR => FileType::Chr,
        Dinode::S_IFIFO => FileType::Fifo,
        Dinode::S_IFSOCK => FileType::Sock,
        _ => FileType::Undef,
    }
}

fn round_up(v: u64, to: u64) -> u64 {
    if to == 0 { v } else { v.div_ceil(to) * to }
}

pub fn mount(image: Rc<dyn ImageReader>, offset: u64) -> Result<FsInfo> {
    // All AG/inode/block addressing below is relative to the start of the
    // file system; shifting the image once here keeps every downstream
    // read (AG headers, dinodes, inode btree, free-space btree, directory
    // data blocks) offset-relative without threading `offset` through them.
    let image: Rc<dyn ImageReader> =
        if offset == 0 { image } else { Rc::new(OffsetImage::new(image, offset)) };

    let sb = Superblock::read(&*image, 0)?;

    let mut agi = Vec::with_capacity(sb.agcount as usize);
    for ag in 0..sb.agcount {
        agi.push(Agi::read(&*image, &sb, ag)?);
    }
    let last = agi.last().ok_or(Error::Magic)?;

    let block_count = sb.dblocks;
    let first_block = 0u64;
    let last_block = ((sb.agcount as u64 - 1) << sb.agblklog) + last.length as u64 - 1;
    let root_inum = sb.rootino;
    let first_inum = sb.rootino;
    let shift = sb.agblklog as u32 + sb.inopblog as u32;
    let inopblock = 1u64 << sb.inopblog;
    let last_inum = (((sb.agcount as u64 - 1) << shift)) + (last.length as u64 * inopblock) - 1;

    let ag_count = sb.agcount as usize;
    let driver = Xfs { sb, agi, ag_cache: Mutex::new((0..ag_count).map(|_| None).collect()) };

    let sector_size = driver.sb.sectsize as u32;
    let block_size = driver.sb.blocksize;

    Ok(FsInfo::new(FsInfoInner {
        image,
        fs_type: FsType::Xfs,
        block_size,
        dev_block_size: sector_size,
        block_count,
        first_block,
        last_block,
        root_inum,
        first_inum,
        last_inum,
        driver: Box::new(driver),
        list_inum_named: Mutex::new(None),
        orphan_dir: Mutex::new(None),
        orphan_discovery_active: std::sync::atomic::AtomicBool::new(false),
    }))
}

impl FsDriver for Xfs {
    fn fs_type(&self) -> FsType {
        FsType::Xfs
    }

    fn block_walk(&self, fs: &FsInfo, start: u64, end: u64, flags: BlockFlags, cb: &mut BlockCallback<'_>) -> Result<()> {
        for addr in start..=end {
            let bflags = self.block_getflags(fs, addr)?;
            let alloc_axis = flags & (BlockFlags::ALLOC | BlockFlags::UNALLOC);
            let meta_axis = flags & (BlockFlags::META | BlockFlags::CONT);
            if !alloc_axis.is_empty() && (bflags & alloc_axis).is_empty() {
                continue;
            }
            if !meta_axis.is_empty() && (bflags & meta_axis).is_empty() {
                continue;
            }
            let buf = if flags.contains(BlockFlags::AONLY) {
                Vec::new()
            } else {
                let mut buf = vec![0u8; self.sb.blocksize as usize];
                let (ag, rel) = self.addr_to_ag_relblk(addr);
                let phys = ag as u64 * self.sb.agblocks as u64 + rel as u64;
                fs.image().read_exact_at(phys * self.sb.blocksize as u64, &mut buf)?;
                buf
            };
            let block = crate::fs::FsBlock { addr, buf, flags: bflags };
            if cb(&block)? == WalkControl::Stop {
                return Ok(());
            }
        }
        Ok(())
    }

    fn block_getflags(&self, fs: &FsInfo, addr: u64) -> Result<BlockFlags> {
        let (ag, rel) = self.addr_to_ag_relblk(addr);
        let agi_root = self.agi.get(ag as usize).ok_or(Error::WalkRange)?.root;
        self.with_ag_headers(fs.image(), ag, |agf, agfl| {
            alloc::block_getflags(fs.image(), &self.sb, ag, agf, agfl, agi_root, rel)
        })
    }

    fn inode_walk(&self, fs: &FsInfo, start: u64, end: u64, flags: MetaFlags, cb: &mut InodeCallback<'_>) -> Result<()> {
        for inum in start..=end {
            let mut meta = FsMeta::empty(inum);
            if self.file_add_meta(fs, inum, &mut meta).is_err() {
                continue;
            }
            let alloc_axis = flags & (MetaFlags::ALLOC | MetaFlags::UNALLOC);
            let used_axis = flags & (MetaFlags::USED | MetaFlags::UNUSED);
            if !alloc_axis.is_empty() && (meta.flags & alloc_axis).is_empty() {
                continue;
            }
            if !used_axis.is_empty() && (meta.flags & used_axis).is_empty() {
                continue;
            }
            let file = FsFile { fs: fs.clone(), name: None, meta: Some(meta) };
            if cb(&file)? == WalkControl::Stop {
                return Ok(());
            }
        }
        Ok(())
    }

    fn file_add_meta(&self, fs: &FsInfo, inum: u64, meta_out: &mut FsMeta) -> Result<()> {
        let (ag, agino) = self.inum_to_ag_agino(inum);
        let agi = self.agi.get(ag as usize).ok_or(Error::InodeNum)?;
        let dinode = Dinode::read(fs.image(), &self.sb, ag, agino)?;

        let alloc_state = inode_btree::getallocflag(fs.image(), &self.sb, ag, agi.root, agino)?;
        let mut flags = MetaFlags::empty();
        match alloc_state {
            AllocState::Alloc => flags |= MetaFlags::ALLOC,
            AllocState::Unalloc => flags |= MetaFlags::UNALLOC,
            AllocState::NotTracked => {}
        }
        flags |= if dinode.ctime.secs != 0 { MetaFlags::USED } else { MetaFlags::UNUSED };

        meta_out.addr = inum;
        meta_out.file_type = mode_to_file_type(dinode.mode);
        meta_out.mode = (dinode.mode & 0xFFF) as u32;
        meta_out.nlink = dinode.nlink;
        meta_out.size = dinode.size;
        meta_out.uid = dinode.uid;
        meta_out.gid = dinode.gid;
        meta_out.times = FsTimes {
            mtime: dinode.mtime,
            atime: dinode.atime,
            ctime: dinode.ctime,
            crtime: if dinode.version == 3 { dinode.crtime } else { Timestamp::default() },
        };
        meta_out.flags = flags;

        let offset = Dinode::inode_offset(&self.sb, ag, agino);
        let mut record = vec![0u8; self.sb.inodesize as usize];
        fs.image().read_exact_at(offset, &mut record)?;
        let fork = dinode.data_fork_bytes(&record);

        meta_out.content = match dinode.format {
            InodeFormat::Local => ContentStash::Local(fork[..(dinode.size as usize).min(fork.len())].to_vec()),
            InodeFormat::Extents => {
                let n = (dinode.nextents as usize * 16).min(fork.len());
                ContentStash::Extents(fork[..n].to_vec())
            }
            InodeFormat::BTree => {
                ContentStash::BTreeRoot { offset: offset + dinode.data_fork_offset as u64, len: fork.len() as u32 }
            }
            InodeFormat::Uuid | InodeFormat::Rmap | InodeFormat::Dev => ContentStash::None,
        };

        Ok(())
    }

    fn dir_open_meta(&self, fs: &FsInfo, inum: u64, dir_out: &mut FsDir) -> Result<DirOpenResult> {
        let mut meta = FsMeta::empty(inum);
        self.file_add_meta(fs, inum, &mut meta)?;
        if meta.file_type != FileType::Dir {
            return Err(Error::Arg);
        }
        let (names, res) = self.load_dir_names(fs.image(), inum, &meta);
        dir_out.addr = inum;
        dir_out.names = names;
        Ok(res)
    }

    fn load_attrs(&self, fs: &FsInfo, meta: &mut FsMeta) -> Result<()> {
        let data = match &meta.content {
            ContentStash::Local(buf) => FsAttrData::Resident(buf.clone()),
            ContentStash::Extents(buf) => {
                let runs = extent::runs_from_extents_buf(&self.sb, buf);
                FsAttrData::NonResident {
                    runs,
                    skiplen: 0,
                    allocsize: round_up(meta.size, self.sb.blocksize as u64),
                    initsize: meta.size,
                    compsize: meta.size,
                }
            }
            ContentStash::BTreeRoot { offset, len } => {
                let mut root_buf = vec![0u8; *len as usize];
                fs.image().read_exact_at(*offset, &mut root_buf)?;
                let runs = extent::runs_from_btree(fs.image(), &self.sb, &root_buf)?;
                FsAttrData::NonResident {
                    runs,
                    skiplen: 0,
                    allocsize: round_up(meta.size, self.sb.blocksize as u64),
                    initsize: meta.size,
                    compsize: meta.size,
                }
            }
            ContentStash::None => FsAttrData::NonResident { runs: Vec::new(), skiplen: 0, allocsize: 0, initsize: 0, compsize: 0 },
            ContentStash::Yaffs2 { .. } => unreachable!("yaffs2 content stash never appears on an XFS mount"),
        };
        meta.attr = vec![FsAttr { attr_type: 0, id: 0, name: None, size: meta.size, data }];
        meta.attr_state = AttrState::Studied;
        Ok(())
    }

    fn close(&self) {}
}

impl Dinode {
    fn data_fork_offset(&self) -> usize {
        if self.version == 3 { 176 } else { 100 }
    }
}
