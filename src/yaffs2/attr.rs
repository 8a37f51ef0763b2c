// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute (content run list) materialization for one object version.
//!
//! A YAFFS2 file has no block map: every data chunk a write ever produced
//! is still sitting somewhere in the log, tagged with its logical chunk
//! number. Reconstructing "the file as of this version" means walking the
//! object's *entire* chunk history backward from this version's last
//! chunk, keeping the first (i.e. most recent) chunk seen for each logical
//! number and dropping anything beyond the version's recorded size.

use crate::fs::{AttrRunFlags, FsAttrRun};

use super::cache::{CacheObject, CacheVersion, Yaffs2Cache};

/// Builds the non-resident run list for `version` of `obj`: one run per
/// surviving data chunk, with gaps (holes left by truncation, or logical
/// blocks a chunk never covered) folded into filler runs.
pub fn materialize_runs(cache: &Yaffs2Cache, obj: &CacheObject, version: &CacheVersion) -> Vec<FsAttrRun> {
    let page_size = cache.page_size as u64;
    let chunk_stride = page_size + cache.spare_size as u64;
    let block_count = if page_size == 0 { 0 } else { (version.file_size as u64).div_ceil(page_size) };

    let mut mapped: Vec<Option<u64>> = vec![None; block_count as usize];

    if let Some(last_pos) = version.last_pos {
        let mut seen = std::collections::HashSet::new();
        for pos in (0..=last_pos).rev() {
            let chunk = &cache.chunks[obj.chunk_order[pos]];
            if chunk.chunk_id == 0 {
                continue;
            }
            if !seen.insert(chunk.chunk_id) {
                continue;
            }
            let logical_block = (chunk.chunk_id - 1) as u64;
            if logical_block >= block_count {
                continue;
            }
            mapped[logical_block as usize] = Some(chunk.offset / chunk_stride);
        }
    }

    let mut runs = Vec::new();
    let mut i = 0u64;
    while i < block_count {
        if let Some(addr) = mapped[i as usize] {
            runs.push(FsAttrRun { offset: i, addr, len: 1, flags: AttrRunFlags::empty() });
            i += 1;
        } else {
            let start = i;
            while i < block_count && mapped[i as usize].is_none() {
                i += 1;
            }
            runs.push(FsAttrRun { offset: start, addr: 0, len: i - start, flags: AttrRunFlags::FILLER });
        }
    }
    runs
}
