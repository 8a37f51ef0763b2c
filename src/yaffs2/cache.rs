// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scan-derived object/version cache (C11–C13).
//!
//! YAFFS2 keeps no on-disk tree: a mount is a single forward scan of every
//! chunk, grouping by object id and folding each object's chronological
//! chunk history into a sequence of versions at every header write. This
//! module owns that cache as a flat arena (`Vec<CacheChunk>` plus
//! `Vec<CacheObject>`, each object holding index positions rather than
//! pointers) so there is nothing here that needs `Rc`/`RefCell` cycles.

use std::collections::HashMap;

pub use crate::yaffs2::header::ObjType;
use crate::yaffs2::header::YaffsHeader;
use crate::yaffs2::spare::{self, SpareLayout};

use crate::error::Result;
use crate::image::ImageReader;

pub const OBJECT_ID_MASK: u32 = 0x0003_FFFF;
pub const VERSION_NUM_SHIFT: u32 = 18;
pub const VERSION_NUM_MASK: u32 = 0x3FFF;

pub const OBJECT_ROOT: u32 = 1;
pub const OBJECT_LOSTNFOUND: u32 = 2;
pub const OBJECT_UNLINKED: u32 = 3;
pub const OBJECT_DELETED: u32 = 4;

fn is_tombstone_parent(parent_id: u32) -> bool {
    parent_id == OBJECT_UNLINKED || parent_id == OBJECT_DELETED
}

/// One chunk found in the image, after spare-tag validation. `chunk_id ==
/// 0` marks a header chunk; `parent_id` is only meaningful for those.
#[derive(Clone, Copy, Debug)]
pub struct CacheChunk {
    pub offset: u64,
    pub seq: u32,
    pub obj_id: u32,
    pub chunk_id: u32,
    pub parent_id: u32,
}

/// One reconstructed checkpoint in an object's chunk timeline.
#[derive(Clone, Debug)]
pub struct CacheVersion {
    /// 0 is always the latest version of this object; numbers increase
    /// going further back in time.
    pub version_number: u32,
    pub parent_id: u32,
    pub obj_type: ObjType,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub file_size: u32,
    pub equivalent_id: u32,
    pub alias: String,
    /// Position in the owning object's `chunk_order` that this version's
    /// name/attributes were read from. `None` only for a synthesized
    /// object with no backing chunk in the image at all.
    pub header_pos: Option<usize>,
    /// Position in `chunk_order` of this version's most recent chunk.
    pub last_pos: Option<usize>,
    /// Only ever `true` for `version_number == 0`.
    pub allocated: bool,
}

pub struct CacheObject {
    pub obj_id: u32,
    /// Global indices into `Yaffs2Cache::chunks`, ascending by `(seq,
    /// offset)`. Empty for a purely synthetic object.
    pub chunk_order: Vec<usize>,
    /// Ascending by `version_number`, so `versions[n].version_number == n`.
    pub versions: Vec<CacheVersion>,
}

impl CacheObject {
    pub fn latest(&self) -> Option<&CacheVersion> {
        self.versions.first()
    }

    pub fn version(&self, version_number: u32) -> Option<&CacheVersion> {
        self.versions.get(version_number as usize)
    }
}

pub struct Yaffs2Cache {
    pub chunks: Vec<CacheChunk>,
    /// Ascending by `obj_id`.
    pub objects: Vec<CacheObject>,
    pub page_size: u32,
    pub spare_size: u32,
    pub chunks_per_block: u32,
}

impl Yaffs2Cache {
    pub fn object(&self, obj_id: u32) -> Option<&CacheObject> {
        self.objects.binary_search_by_key(&obj_id, |o| o.obj_id).ok().map(|i| &self.objects[i])
    }

    pub fn max_inode(&self) -> u64 {
        self.objects
            .iter()
            .flat_map(|o| o.versions.iter().map(|v| encode_inode(o.obj_id, v.version_number)))
            .max()
            .unwrap_or_else(|| encode_inode(OBJECT_ROOT, 0))
    }

    /// Every version, across every object, whose recorded parent is
    /// `parent_obj_id` — the raw ingredient `dir.rs` filters down to a
    /// listing.
    pub fn find_children(&self, parent_obj_id: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for obj in &self.objects {
            for version in &obj.versions {
                if version.parent_id == parent_obj_id {
                    out.push((obj.obj_id, version.version_number));
                }
            }
        }
        out
    }
}

pub fn encode_inode(obj_id: u32, version_number: u32) -> u64 {
    (obj_id as u64 & OBJECT_ID_MASK as u64) | ((version_number as u64 & VERSION_NUM_MASK as u64) << VERSION_NUM_SHIFT)
}

/// Decodes an inode into `(obj_id, version_number)`. Version 0 is a
/// reserved alias for "current version" — since version numbers are
/// assigned descending from the latest, that's exactly what decoding a
/// raw `0` in the version field already yields, with no extra case needed.
pub fn decode_inode(inode: u64) -> (u32, u32) {
    let obj_id = (inode as u32) & OBJECT_ID_MASK;
    let version_number = ((inode >> VERSION_NUM_SHIFT) as u32) & VERSION_NUM_MASK;
    (obj_id, version_number)
}

struct Draft {
    header_pos: Option<usize>,
    last_pos: usize,
    parent_id: u32,
}

fn blank_header() -> YaffsHeader {
    YaffsHeader {
        obj_type: ObjType::Unknown,
        parent_id: 0,
        name: String::new(),
        file_mode: 0,
        user_id: 0,
        group_id: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        file_size: 0,
        equivalent_id: 0,
        alias: String::new(),
    }
}

fn read_header_at(image: &dyn ImageReader, page_size: u32, chunks: &[CacheChunk], order: &[usize], pos: usize) -> YaffsHeader {
    let chunk = &chunks[order[pos]];
    YaffsHeader::read(image, chunk.offset, page_size).unwrap_or_else(|_| blank_header())
}

fn denoise_match(image: &dyn ImageReader, page_size: u32, chunks: &[CacheChunk], order: &[usize], cur_pos: usize, new_pos: usize) -> bool {
    let cur = read_header_at(image, page_size, chunks, order, cur_pos);
    let new = read_header_at(image, page_size, chunks, order, new_pos);
    cur.obj_type == ObjType::Directory && new.obj_type == ObjType::Directory && cur.name == new.name
}

/// Folds one object's chronologically-ordered chunks into draft versions,
/// oldest first. See the module doc for the header-chunk/tombstone rules.
fn build_versions(image: &dyn ImageReader, page_size: u32, chunks: &[CacheChunk], order: &[usize]) -> Vec<Draft> {
    let mut versions = Vec::new();
    let mut last_known_header_pos: Option<usize> = None;
    let mut in_progress: Option<Draft> = None;

    let resolve_header = |pos: usize, parent_id: u32, last_known: &mut Option<usize>| -> Option<usize> {
        if is_tombstone_parent(parent_id) {
            last_known.or(Some(pos))
        } else {
            *last_known = Some(pos);
            Some(pos)
        }
    };

    for (pos, &global_idx) in order.iter().enumerate() {
        let chunk = &chunks[global_idx];
        if chunk.chunk_id == 0 {
            match in_progress.take() {
                None => {
                    let header_pos = resolve_header(pos, chunk.parent_id, &mut last_known_header_pos);
                    in_progress = Some(Draft { header_pos, last_pos: pos, parent_id: chunk.parent_id });
                }
                Some(mut cur) if cur.header_pos.is_none() => {
                    cur.header_pos = resolve_header(pos, chunk.parent_id, &mut last_known_header_pos);
                    cur.last_pos = pos;
                    cur.parent_id = chunk.parent_id;
                    in_progress = Some(cur);
                }
                Some(mut cur) => {
                    let is_real = !is_tombstone_parent(chunk.parent_id);
                    let merge = is_real
                        && cur
                            .header_pos
                            .map(|hp| denoise_match(image, page_size, chunks, order, hp, pos))
                            .unwrap_or(false);
                    if merge {
                        cur.header_pos = Some(pos);
                        cur.last_pos = pos;
                        last_known_header_pos = Some(pos);
                        in_progress = Some(cur);
                    } else {
                        versions.push(cur);
                        let header_pos = resolve_header(pos, chunk.parent_id, &mut last_known_header_pos);
                        in_progress = Some(Draft { header_pos, last_pos: pos, parent_id: chunk.parent_id });
                    }
                }
            }
        } else {
            match in_progress.take() {
                None => in_progress = Some(Draft { header_pos: None, last_pos: pos, parent_id: 0 }),
                Some(mut cur) => {
                    cur.last_pos = pos;
                    in_progress = Some(cur);
                }
            }
        }
    }

    if let Some(cur) = in_progress {
        if cur.header_pos.is_some() {
            versions.push(cur);
        }
        // else: trailing version never got a header, dropped.
    }

    versions
}

fn is_version_allocated(chunks: &[CacheChunk], order: &[usize], header_pos: Option<usize>) -> bool {
    let Some(start) = header_pos else {
        return true;
    };
    for &global_idx in &order[start..] {
        let chunk = &chunks[global_idx];
        if chunk.chunk_id == 0 && is_tombstone_parent(chunk.parent_id) {
            return false;
        }
    }
    true
}

fn finalize_versions(image: &dyn ImageReader, page_size: u32, chunks: &[CacheChunk], order: &[usize], drafts: Vec<Draft>) -> Vec<CacheVersion> {
    let n = drafts.len();
    let mut header_cache: HashMap<usize, YaffsHeader> = HashMap::new();
    let mut versions: Vec<CacheVersion> = Vec::with_capacity(n);

    for (i, draft) in drafts.into_iter().enumerate() {
        let version_number = (n - 1 - i) as u32;
        let header = match draft.header_pos {
            Some(pos) => header_cache.entry(pos).or_insert_with(|| read_header_at(image, page_size, chunks, order, pos)).clone(),
            None => blank_header(),
        };
        versions.push(CacheVersion {
            version_number,
            parent_id: draft.parent_id,
            obj_type: header.obj_type,
            name: header.name,
            mode: header.file_mode,
            uid: header.user_id,
            gid: header.group_id,
            atime: header.atime,
            mtime: header.mtime,
            ctime: header.ctime,
            file_size: header.file_size,
            equivalent_id: header.equivalent_id,
            alias: header.alias,
            header_pos: draft.header_pos,
            last_pos: Some(draft.last_pos),
            allocated: false,
        });
    }

    versions.reverse();
    if let Some(latest) = versions.first_mut() {
        latest.allocated = is_version_allocated(chunks, order, latest.header_pos);
    }
    versions
}

fn ensure_synthetic(objects: &mut Vec<CacheObject>, obj_id: u32, name: &str, parent_id: u32) {
    if objects.iter().any(|o| o.obj_id == obj_id) {
        return;
    }
    let version = CacheVersion {
        version_number: 0,
        parent_id,
        obj_type: ObjType::Directory,
        name: name.to_string(),
        mode: 0,
        uid: 0,
        gid: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        file_size: 0,
        equivalent_id: 0,
        alias: String::new(),
        header_pos: None,
        last_pos: None,
        allocated: true,
    };
    objects.push(CacheObject { obj_id, chunk_order: Vec::new(), versions: vec![version] });
}

/// Scans the whole image and rebuilds the object/version cache. This is
/// the only place that reads every chunk's spare area; everything else in
/// the driver works off the resulting arena.
pub fn scan_and_build(image: &dyn ImageReader, page_size: u32, spare_size: u32, chunks_per_block: u32, layout: &SpareLayout) -> Result<Yaffs2Cache> {
    let chunk_total_size = (page_size as u64) + (spare_size as u64);
    let num_chunks = if chunk_total_size == 0 { 0 } else { image.size() / chunk_total_size };

    let mut chunks = Vec::new();
    let mut by_obj: HashMap<u32, Vec<usize>> = HashMap::new();

    for i in 0..num_chunks {
        let page_offset = i * chunk_total_size;
        let spare_offset = page_offset + page_size as u64;
        let tags = match spare::read_spare_tags(image, layout, spare_offset, spare_size) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if !spare::is_spare_valid(&tags) {
            continue;
        }
        let global_idx = chunks.len();
        chunks.push(CacheChunk {
            offset: page_offset,
            seq: tags.seq_number,
            obj_id: tags.object_id,
            chunk_id: if tags.is_header { 0 } else { tags.chunk_id },
            parent_id: if tags.is_header { tags.parent_id } else { 0 },
        });
        by_obj.entry(tags.object_id).or_default().push(global_idx);
    }

    let mut obj_ids: Vec<u32> = by_obj.keys().copied().collect();
    obj_ids.sort_unstable();

    let mut objects = Vec::with_capacity(obj_ids.len());
    for obj_id in obj_ids {
        let mut order = by_obj.remove(&obj_id).unwrap();
        order.sort_by(|&a, &b| chunks[a].seq.cmp(&chunks[b].seq).then(chunks[a].offset.cmp(&chunks[b].offset)));

        let drafts = build_versions(image, page_size, &chunks, &order);
        let mut versions = finalize_versions(image, page_size, &chunks, &order, drafts);

        // The root is its own parent by definition; a tombstone chunk
        // misrecording that (or a stray object-1 write predating a valid
        // header) must never make root look unlinked.
        if obj_id == OBJECT_ROOT {
            for v in &mut versions {
                v.parent_id = OBJECT_ROOT;
            }
            if let Some(latest) = versions.first_mut() {
                latest.allocated = true;
            }
        }

        objects.push(CacheObject { obj_id, chunk_order: order, versions });
    }

    ensure_synthetic(&mut objects, OBJECT_ROOT, "", OBJECT_ROOT);
    ensure_synthetic(&mut objects, OBJECT_UNLINKED, "<unlinked>", OBJECT_ROOT);
    ensure_synthetic(&mut objects, OBJECT_DELETED, "<deleted>", OBJECT_ROOT);
    objects.sort_by_key(|o| o.obj_id);

    Ok(Yaffs2Cache { chunks, objects, page_size, spare_size, chunks_per_block })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SliceImage;

    // Must be at least `header::HEADER_MIN_LEN` (460 bytes) for a header
    // chunk's fixed-offset fields (name/mode/times/alias) to fit.
    const PAGE: u32 = 512;
    const SPARE: u32 = 16;
    const CHUNKS_PER_BLOCK: u32 = 4;

    fn layout() -> SpareLayout {
        SpareLayout { seq_offset: 0, obj_id_offset: 4, chunk_id_offset: 8, nbytes_offset: 12 }
    }

    struct Builder {
        data: Vec<u8>,
    }

    impl Builder {
        fn new(num_chunks: u64) -> Builder {
            Builder { data: vec![0xFFu8; (num_chunks * (PAGE as u64 + SPARE as u64)) as usize] }
        }

        fn chunk_base(&self, index: u64) -> usize {
            (index * (PAGE as u64 + SPARE as u64)) as usize
        }

        fn write_header(&mut self, index: u64, seq: u32, obj_id: u32, parent_id: u32, obj_type: u32, name: &str, file_size: u32) {
            let base = self.chunk_base(index);
            let page = &mut self.data[base..base + PAGE as usize];
            page.fill(0);
            page[0..4].copy_from_slice(&obj_type.to_le_bytes());
            page[4..8].copy_from_slice(&parent_id.to_le_bytes());
            let name_off = 0x0A;
            if name_off + name.len() <= PAGE as usize {
                page[name_off..name_off + name.len()].copy_from_slice(name.as_bytes());
            }
            page[0x124..0x128].copy_from_slice(&file_size.to_le_bytes());

            let spare_base = base + PAGE as usize;
            let spare = &mut self.data[spare_base..spare_base + SPARE as usize];
            spare[0..4].copy_from_slice(&seq.to_le_bytes());
            let packed_obj = obj_id | ((0u32) << 28);
            spare[4..8].copy_from_slice(&packed_obj.to_le_bytes());
            let packed_chunk = spare::SPARE_FLAGS_IS_HEADER | (parent_id & spare::SPARE_PARENT_ID_MASK);
            spare[8..12].copy_from_slice(&packed_chunk.to_le_bytes());
        }

        fn write_data(&mut self, index: u64, seq: u32, obj_id: u32, chunk_id: u32, payload: u8) {
            let base = self.chunk_base(index);
            let page = &mut self.data[base..base + PAGE as usize];
            page.fill(payload);

            let spare_base = base + PAGE as usize;
            let spare = &mut self.data[spare_base..spare_base + SPARE as usize];
            spare[0..4].copy_from_slice(&seq.to_le_bytes());
            spare[4..8].copy_from_slice(&obj_id.to_le_bytes());
            spare[8..12].copy_from_slice(&chunk_id.to_le_bytes());
        }

        fn build(self) -> SliceImage {
            SliceImage::new(self.data)
        }
    }

    #[test]
    fn header_only_object_has_one_allocated_version() {
        let mut b = Builder::new(2);
        b.write_header(0, 0x1000, OBJECT_ROOT, OBJECT_ROOT, 3, "", 0);
        b.write_header(1, 0x1001, 10, 1, 1, "a.txt", 0);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        let obj = cache.object(10).unwrap();
        assert_eq!(obj.versions.len(), 1);
        let v = obj.latest().unwrap();
        assert_eq!(v.version_number, 0);
        assert!(v.allocated);
        assert_eq!(v.name, "a.txt");
        assert_eq!(v.parent_id, 1);
    }

    #[test]
    fn tombstone_marks_latest_version_unallocated() {
        let mut b = Builder::new(3);
        b.write_header(0, 0x1000, OBJECT_ROOT, OBJECT_ROOT, 3, "", 0);
        b.write_header(1, 0x1001, 10, 1, 1, "doomed.txt", 0);
        b.write_header(2, 0x1002, 10, OBJECT_UNLINKED, 1, "doomed.txt", 0);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        let obj = cache.object(10).unwrap();
        let v = obj.latest().unwrap();
        assert_eq!(v.parent_id, OBJECT_UNLINKED);
        assert!(!v.allocated);
        // name is inherited from the last real header, not re-read from
        // the (possibly meaningless) tombstone chunk content.
        assert_eq!(v.name, "doomed.txt");
    }

    #[test]
    fn second_real_header_starts_a_new_version() {
        let mut b = Builder::new(3);
        b.write_header(0, 0x1000, OBJECT_ROOT, OBJECT_ROOT, 3, "", 0);
        b.write_header(1, 0x1001, 10, 1, 1, "v-old", 0);
        b.write_header(2, 0x1002, 10, 1, 1, "v-new", 0);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        let obj = cache.object(10).unwrap();
        assert_eq!(obj.versions.len(), 2);
        assert_eq!(obj.version(0).unwrap().name, "v-new");
        assert_eq!(obj.version(1).unwrap().name, "v-old");
    }

    #[test]
    fn identical_directory_headers_denoise_into_one_version() {
        let mut b = Builder::new(3);
        b.write_header(0, 0x1000, OBJECT_ROOT, OBJECT_ROOT, 3, "", 0);
        b.write_header(1, 0x1001, 10, 1, 3, "subdir", 0);
        b.write_header(2, 0x1002, 10, 1, 3, "subdir", 0);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        let obj = cache.object(10).unwrap();
        assert_eq!(obj.versions.len(), 1);
    }

    #[test]
    fn trailing_headerless_chunk_run_is_dropped() {
        let mut b = Builder::new(3);
        b.write_header(0, 0x1000, OBJECT_ROOT, OBJECT_ROOT, 3, "", 0);
        b.write_header(1, 0x1001, 10, 1, 1, "f", 2048);
        b.write_data(2, 0x1002, 10, 1, 0xAB);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        let obj = cache.object(10).unwrap();
        // the data chunk extends the one real version; it never starts a
        // trailing headerless one of its own.
        assert_eq!(obj.versions.len(), 1);
        assert_eq!(obj.version(0).unwrap().last_pos, Some(1));
    }

    #[test]
    fn root_unlinked_deleted_are_always_present() {
        let b = Builder::new(0);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        assert!(cache.object(OBJECT_ROOT).unwrap().latest().unwrap().allocated);
        assert!(cache.object(OBJECT_UNLINKED).unwrap().latest().unwrap().allocated);
        assert!(cache.object(OBJECT_DELETED).unwrap().latest().unwrap().allocated);
    }

    #[test]
    fn find_children_matches_on_parent_id() {
        let mut b = Builder::new(3);
        b.write_header(0, 0x1000, OBJECT_ROOT, OBJECT_ROOT, 3, "", 0);
        b.write_header(1, 0x1001, 10, 1, 1, "a", 0);
        b.write_header(2, 0x1002, 11, 1, 1, "b", 0);
        let image = b.build();
        let cache = scan_and_build(&image, PAGE, SPARE, CHUNKS_PER_BLOCK, &layout()).unwrap();

        let mut children = cache.find_children(1);
        children.sort();
        assert_eq!(children, vec![(10, 0), (11, 0)]);
    }

    #[test]
    fn inode_encoding_roundtrip() {
        let inode = encode_inode(42, 3);
        assert_eq!(decode_inode(inode), (42, 3));
    }
}
