// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The generic file-system abstraction core (C3).
//!
//! `FsInfo` is the handle every caller holds; it dispatches through a
//! per-file-system `FsDriver` vtable to XFS or YAFFS2. The types here
//! (`FsMeta`, `FsName`, `FsDir`, `FsAttr`, `FsAttrRun`, `FsBlock`) are
//! driver-agnostic and never leak XFS or YAFFS2 specifics.

mod walk;

pub use walk::{ParsedInum, attr_read, file_walk, parse_inum, path2inum};

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::image::ImageReader;

/// Which driver mounted a given image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsType {
    Detect,
    Xfs,
    Yaffs2,
}

/// Generic file type, independent of any one file system's on-disk mode
/// bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    Undef,
    Reg,
    Dir,
    Fifo,
    Chr,
    Blk,
    Lnk,
    Sock,
    /// Whiteout marker (unused by XFS/YAFFS2, kept for vtable generality).
    Wht,
    /// Synthetic virtual file (e.g. a YAFFS2 alternate-version alias).
    Virt,
    /// Synthetic virtual directory (unlinked/deleted/orphan).
    VirtDir,
}

bitflags! {
    /// Flags on a single block (C3's `FsBlock`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct BlockFlags: u16 {
        const ALLOC   = 1 << 0;
        const UNALLOC = 1 << 1;
        const CONT    = 1 << 2;
        const META    = 1 << 3;
        const BAD     = 1 << 4;
        const RAW     = 1 << 5;
        const SPARSE  = 1 << 6;
        const COMP    = 1 << 7;
        const RES     = 1 << 8;
        /// Address-only: the buffer content is undefined/unread.
        const AONLY   = 1 << 9;
        const UNUSED  = 1 << 10;
    }
}

bitflags! {
    /// Selector flags for `inode_walk`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MetaFlags: u16 {
        const ALLOC   = 1 << 0;
        const UNALLOC = 1 << 1;
        const USED    = 1 << 2;
        const UNUSED  = 1 << 3;
        /// FS-specific: allocated but unreferenced by any directory entry.
        const ORPHAN  = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AttrRunFlags: u8 {
        const FILLER = 1 << 0;
        const SPARSE = 1 << 1;
    }
}

/// What a `block_walk`/`inode_walk` callback wants to happen next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkControl {
    Continue,
    Stop,
}

pub type BlockCallback<'a> = dyn FnMut(&FsBlock) -> Result<WalkControl> + 'a;
pub type InodeCallback<'a> = dyn FnMut(&FsFile) -> Result<WalkControl> + 'a;

/// Result of `dir_open_meta`: directory parsing can partially succeed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirOpenResult {
    Ok,
    /// Parsing hit malformed data; whatever was parsed up to that point
    /// has already been appended to the `FsDir`.
    Corrupt,
}

/// A single extent of file content: `(offset_in_file_blocks,
/// physical_block_addr, length_blocks, flags)`.
#[derive(Clone, Copy, Debug)]
pub struct FsAttrRun {
    pub offset: u64,
    pub addr: u64,
    pub len: u64,
    pub flags: AttrRunFlags,
}

/// One fork of file content: either a small inline buffer, or a chain of
/// `FsAttrRun`s describing where the content lives on the image.
#[derive(Clone, Debug)]
pub enum FsAttrData {
    Resident(Vec<u8>),
    NonResident {
        runs: Vec<FsAttrRun>,
        skiplen: u64,
        allocsize: u64,
        initsize: u64,
        compsize: u64,
    },
}

#[derive(Clone, Debug)]
pub struct FsAttr {
    pub attr_type: u32,
    pub id: u32,
    pub name: Option<String>,
    pub size: u64,
    pub data: FsAttrData,
}

impl FsAttr {
    pub fn runs(&self) -> &[FsAttrRun] {
        match &self.data {
            FsAttrData::Resident(_) => &[],
            FsAttrData::NonResident { runs, .. } => runs,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrState {
    Empty,
    Studied,
    Error,
}

/// Raw fork payload stashed by the inode loader until `load_attrs`
/// materializes it into a real `FsAttr`.
#[derive(Clone, Debug)]
pub enum ContentStash {
    None,
    /// Resident/local content, copied verbatim from the inode.
    Local(Vec<u8>),
    /// Packed extent records (XFS: 16 bytes each).
    Extents(Vec<u8>),
    /// Byte offset and length, within the image, of a BTree-format fork's
    /// embedded root (`xfs_bmdr_block`) — re-read on demand rather than
    /// copied, since it lives inside the inode record the loader already
    /// read once.
    BTreeRoot { offset: u64, len: u32 },
    /// Unparsed YAFFS2 object/version identity, consumed by its own driver.
    Yaffs2 { obj_id: u32, version: u32 },
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

/// Four POSIX times plus an FS-specific extra-time union.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsTimes {
    pub mtime: Timestamp,
    pub atime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
}

/// Inode-level metadata, generic across drivers.
#[derive(Clone, Debug)]
pub struct FsMeta {
    pub addr: u64,
    pub file_type: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub times: FsTimes,
    pub flags: MetaFlags,
    pub content: ContentStash,
    pub attr: Vec<FsAttr>,
    pub attr_state: AttrState,
    pub names: Vec<String>,
    pub symlink_target: Option<String>,
}

impl FsMeta {
    pub fn empty(addr: u64) -> FsMeta {
        FsMeta {
            addr,
            file_type: FileType::Undef,
            mode: 0,
            nlink: 0,
            size: 0,
            uid: 0,
            gid: 0,
            times: FsTimes::default(),
            flags: MetaFlags::empty(),
            content: ContentStash::None,
            attr: Vec::new(),
            attr_state: AttrState::Empty,
            names: Vec::new(),
            symlink_target: None,
        }
    }
}

/// A directory-entry record.
#[derive(Clone, Debug)]
pub struct FsName {
    pub name: String,
    pub short_name: Option<String>,
    pub meta_addr: u64,
    pub meta_seq: u64,
    pub par_addr: u64,
    pub par_seq: u64,
    pub file_type: FileType,
    pub alloc: bool,
}

/// The enumeration of one directory.
#[derive(Clone, Debug, Default)]
pub struct FsDir {
    pub addr: u64,
    pub names: Vec<FsName>,
}

/// Snapshot of one block.
#[derive(Clone, Debug)]
pub struct FsBlock {
    pub addr: u64,
    pub buf: Vec<u8>,
    pub flags: BlockFlags,
}

/// Pairs an optional name and an optional meta record with a backing
/// `FsInfo`. Either may be absent when the other is known.
pub struct FsFile {
    pub fs: FsInfo,
    pub name: Option<FsName>,
    pub meta: Option<FsMeta>,
}

impl FsFile {
    pub fn new(fs: FsInfo) -> FsFile {
        FsFile { fs, name: None, meta: None }
    }
}

/// The operations a driver must implement. All state that differs between
/// mounts belongs behind the concrete type implementing this trait; the
/// generic core never matches on which driver it is talking to.
pub trait FsDriver: Send + Sync {
    fn fs_type(&self) -> FsType;

    fn block_walk(
        &self,
        fs: &FsInfo,
        start: u64,
        end: u64,
        flags: BlockFlags,
        cb: &mut BlockCallback<'_>,
    ) -> Result<()>;

    fn block_getflags(&self, fs: &FsInfo, addr: u64) -> Result<BlockFlags>;

    fn inode_walk(
        &self,
        fs: &FsInfo,
        start: u64,
        end: u64,
        flags: MetaFlags,
        cb: &mut InodeCallback<'_>,
    ) -> Result<()>;

    fn file_add_meta(&self, fs: &FsInfo, inum: u64, meta_out: &mut FsMeta) -> Result<()>;

    fn dir_open_meta(&self, fs: &FsInfo, inum: u64, dir_out: &mut FsDir) -> Result<DirOpenResult>;

    fn load_attrs(&self, fs: &FsInfo, meta: &mut FsMeta) -> Result<()>;

    /// Tears down any driver-private cache. Called once from `FsInfo::close`.
    fn close(&self) {}
}

/// Immutable parameters established at mount time, shared by every clone
/// of an `FsInfo` handle.
pub struct FsInfoInner {
    pub image: Rc<dyn ImageReader>,
    pub fs_type: FsType,
    pub block_size: u32,
    pub dev_block_size: u32,
    pub block_count: u64,
    pub first_block: u64,
    pub last_block: u64,
    pub root_inum: u64,
    pub first_inum: u64,
    pub last_inum: u64,
    pub driver: Box<dyn FsDriver>,

    /// Lazily built directory of inodes whose only references come from
    /// deleted/unallocated directory entries (built on first request).
    pub list_inum_named: Mutex<Option<Vec<u64>>>,
    /// Lazily built synthetic "orphan" directory (§4.1).
    pub orphan_dir: Mutex<Option<FsDir>>,
    /// Guards against a recursive `dir_open_meta(last_inum)` call while
    /// orphan discovery is itself walking directories.
    pub orphan_discovery_active: AtomicBool,
}

/// A cheap-to-clone handle to a mounted file system. Internally an
/// `Rc<FsInfoInner>` — mirroring the teacher's shared immutable-handle
/// pattern — since every field here is set up once at mount and shared
/// read-only afterwards.
#[derive(Clone)]
pub struct FsInfo(pub Rc<FsInfoInner>);

impl FsInfo {
    pub fn new(inner: FsInfoInner) -> FsInfo {
        FsInfo(Rc::new(inner))
    }

    pub fn image(&self) -> &dyn ImageReader {
        &*self.0.image
    }

    pub fn block_size(&self) -> u32 {
        self.0.block_size
    }

    pub fn fs_type(&self) -> FsType {
        self.0.fs_type
    }

    pub fn root_inum(&self) -> u64 {
        self.0.root_inum
    }

    pub fn first_inum(&self) -> u64 {
        self.0.first_inum
    }

    pub fn last_inum(&self) -> u64 {
        self.0.last_inum
    }

    pub fn first_block(&self) -> u64 {
        self.0.first_block
    }

    pub fn last_block(&self) -> u64 {
        self.0.last_block
    }

    fn driver(&self) -> &dyn FsDriver {
        &*self.0.driver
    }

    pub fn block_walk(
        &self,
        start: u64,
        end: u64,
        flags: BlockFlags,
        cb: &mut BlockCallback<'_>,
    ) -> Result<()> {
        if end < start || start < self.first_block() || end > self.last_block() {
            return Err(Error::WalkRange);
        }
        self.driver().block_walk(self, start, end, flags, cb)
    }

    pub fn block_getflags(&self, addr: u64) -> Result<BlockFlags> {
        self.driver().block_getflags(self, addr)
    }

    pub fn inode_walk(
        &self,
        start: u64,
        end: u64,
        flags: MetaFlags,
        cb: &mut InodeCallback<'_>,
    ) -> Result<()> {
        if end < start || start < self.first_inum() || end > self.last_inum() {
            return Err(Error::WalkRange);
        }
        self.driver().inode_walk(self, start, end, flags, cb)
    }

    pub fn file_add_meta(&self, inum: u64) -> Result<FsMeta> {
        if inum < self.first_inum() || inum > self.last_inum() {
            return Err(Error::InodeNum);
        }
        let mut meta = FsMeta::empty(inum);
        self.driver().file_add_meta(self, inum, &mut meta)?;
        Ok(meta)
    }

    pub fn dir_open_meta(&self, inum: u64) -> Result<(FsDir, DirOpenResult)> {
        if inum == self.last_inum() {
            return self.open_orphan_dir();
        }
        let mut dir = FsDir { addr: inum, names: Vec::new() };
        let res = self.driver().dir_open_meta(self, inum, &mut dir)?;
        Ok((dir, res))
    }

    pub fn load_attrs(&self, meta: &mut FsMeta) -> Result<()> {
        if meta.attr_state == AttrState::Studied {
            return Ok(());
        }
        match self.driver().load_attrs(self, meta) {
            Ok(()) => {
                meta.attr_state = AttrState::Studied;
                Ok(())
            }
            Err(e) => {
                meta.attr_state = AttrState::Error;
                Err(e)
            }
        }
    }

    /// Lazily build and return the synthetic orphan directory (§4.1): every
    /// `Alloc` inode not referenced by any allocated directory entry.
    fn open_orphan_dir(&self) -> Result<(FsDir, DirOpenResult)> {
        if let Some(dir) = self.0.orphan_dir.lock().clone() {
            return Ok((dir, DirOpenResult::Ok));
        }
        if self.0.orphan_discovery_active.swap(true, Ordering::AcqRel) {
            // Re-entrant call during the walk below; report an empty
            // directory rather than recursing into discovery again.
            return Ok((FsDir { addr: self.last_inum(), names: Vec::new() }, DirOpenResult::Ok));
        }
        let referenced = self.collect_referenced_inodes();
        self.0.orphan_discovery_active.store(false, Ordering::Release);

        let mut names = Vec::new();
        let first = self.first_inum();
        let last_real = self.last_inum().saturating_sub(1).max(first);
        self.inode_walk(first, last_real, MetaFlags::ALLOC, &mut |file| {
            if let Some(meta) = &file.meta {
                if !referenced.contains(&meta.addr) {
                    names.push(FsName {
                        name: format!("orphan-{}", meta.addr),
                        short_name: None,
                        meta_addr: meta.addr,
                        meta_seq: 0,
                        par_addr: self.last_inum(),
                        par_seq: 0,
                        file_type: meta.file_type,
                        alloc: true,
                    });
                }
            }
            Ok(WalkControl::Continue)
        })?;

        let dir = FsDir { addr: self.last_inum(), names };
        *self.0.orphan_dir.lock() = Some(dir.clone());
        Ok((dir, DirOpenResult::Ok))
    }

    fn collect_referenced_inodes(&self) -> std::collections::HashSet<u64> {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![self.root_inum()];
        let mut visited_dirs = std::collections::HashSet::new();
        while let Some(inum) = stack.pop() {
            if !visited_dirs.insert(inum) {
                continue;
            }
            seen.insert(inum);
            if inum == self.last_inum() {
                continue;
            }
            if let Ok((dir, _)) = self.driver_dir_open_meta(inum) {
                for name in dir.names {
                    if seen.insert(name.meta_addr) {
                        stack.push(name.meta_addr);
                    }
                }
            }
        }
        seen
    }

    /// Bypasses the orphan-slot special case in `dir_open_meta`, used only
    /// by orphan discovery itself to avoid infinite recursion.
    fn driver_dir_open_meta(&self, inum: u64) -> Result<(FsDir, DirOpenResult)> {
        let mut dir = FsDir { addr: inum, names: Vec::new() };
        let res = self.driver().dir_open_meta(self, inum, &mut dir)?;
        Ok((dir, res))
    }

    pub fn close(&self) {
        self.driver().close();
    }
}
