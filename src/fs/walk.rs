// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic helpers built once on top of the `FsDriver` vtable (§4.1):
//! `file_walk`, `attr_read`, `path2inum`, `parse_inum`.

use super::{AttrRunFlags, BlockFlags, FsAttr, FsAttrData, FsInfo, WalkControl};
use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Selector flags for `file_walk`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FileWalkFlags: u8 {
        const NO_SPARSE = 1 << 0;
        const AONLY     = 1 << 1;
    }
}

pub type FileWalkCallback<'a> =
    dyn FnMut(u64, &[u8], BlockFlags) -> Result<WalkControl> + 'a;

/// Reads an attribute chunk-by-chunk of at most `block_size` bytes,
/// calling `cb(logical_offset, data, flags)` for each chunk. `flags`
/// carries `Raw` for real data and `Sparse` for a hole (unless `AONLY` is
/// set, in which case the buffer is not filled at all and only the
/// address/flags are meaningful).
pub fn file_walk(fs: &FsInfo, attr: &FsAttr, flags: FileWalkFlags, cb: &mut FileWalkCallback<'_>) -> Result<()> {
    let block_size = fs.block_size() as u64;
    match &attr.data {
        FsAttrData::Resident(buf) => {
            if buf.is_empty() {
                return Ok(());
            }
            let bf = BlockFlags::RAW;
            match cb(0, buf, bf)? {
                WalkControl::Continue | WalkControl::Stop => Ok(()),
            }
        }
        FsAttrData::NonResident { runs, .. } => {
            for run in runs {
                let is_sparse = run.flags.contains(AttrRunFlags::SPARSE) || run.flags.contains(AttrRunFlags::FILLER);
                if is_sparse && flags.contains(FileWalkFlags::NO_SPARSE) {
                    continue;
                }
                for i in 0..run.len {
                    let logical_off = (run.offset + i) * block_size;
                    let mut buf = vec![0u8; block_size as usize];
                    let bf;
                    if is_sparse {
                        bf = BlockFlags::SPARSE;
                        if !flags.contains(FileWalkFlags::AONLY) {
                            buf.fill(0);
                        }
                    } else {
                        bf = BlockFlags::RAW;
                        if !flags.contains(FileWalkFlags::AONLY) {
                            let addr = (run.addr + i) * block_size;
                            fs.image().read_exact_at(addr, &mut buf)?;
                        }
                    }
                    let ctrl = cb(logical_off, if flags.contains(FileWalkFlags::AONLY) { &[] } else { &buf }, bf)?;
                    if ctrl == WalkControl::Stop {
                        return Ok(());
                    }
                }
            }
            Ok(())
        }
    }
}

/// Random-access read of `buf.len()` logical bytes from `attr` starting at
/// `offset`, filling holes with zeroes. Returns the number of bytes
/// actually available (clamped at `attr.size`).
pub fn attr_read(fs: &FsInfo, attr: &FsAttr, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let avail = attr.size.saturating_sub(offset).min(buf.len() as u64) as usize;
    if avail == 0 {
        return Ok(0);
    }
    buf[..avail].fill(0);
    match &attr.data {
        FsAttrData::Resident(data) => {
            let start = offset as usize;
            if start < data.len() {
                let n = (data.len() - start).min(avail);
                buf[..n].copy_from_slice(&data[start..start + n]);
            }
        }
        FsAttrData::NonResident { runs, .. } => {
            let block_size = fs.block_size() as u64;
            let end = offset + avail as u64;
            for run in runs {
                let run_start = run.offset * block_size;
                let run_end = run_start + run.len * block_size;
                if run_end <= offset || run_start >= end {
                    continue;
                }
                let is_sparse = run.flags.contains(AttrRunFlags::SPARSE) || run.flags.contains(AttrRunFlags::FILLER);
                if is_sparse {
                    continue; // already zero-filled above
                }
                let overlap_start = offset.max(run_start);
                let overlap_end = end.min(run_end);
                let src_addr = run.addr * block_size + (overlap_start - run_start);
                let len = (overlap_end - overlap_start) as usize;
                let dst_off = (overlap_start - offset) as usize;
                fs.image().read_exact_at(src_addr, &mut buf[dst_off..dst_off + len])?;
            }
        }
    }
    Ok(avail)
}

/// Resolve a `/`-separated path to an inode number by walking directories
/// from the root.
pub fn path2inum(fs: &FsInfo, path: &str) -> Result<u64> {
    let mut inum = fs.root_inum();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let (dir, _) = fs.dir_open_meta(inum)?;
        let found = dir.names.iter().find(|n| n.name == component).ok_or(Error::Arg)?;
        inum = found.meta_addr;
    }
    Ok(inum)
}

/// Parsed form of an `addr-type-id` attribute-qualified inode string, e.g.
/// `"123-128-0"` → `(123, 128, 0)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParsedInum {
    pub addr: u64,
    pub attr_type: u32,
    pub attr_id: u32,
}

/// Parses the CLI/forensic convention `addr[-type[-id]]` into its
/// components. Missing type/id default to 0.
pub fn parse_inum(s: &str) -> Result<ParsedInum> {
    let mut parts = s.split('-');
    let addr: u64 = parts.next().ok_or(Error::Arg)?.parse().map_err(|_| Error::Arg)?;
    let attr_type: u32 = match parts.next() {
        Some(p) => p.parse().map_err(|_| Error::Arg)?,
        None => 0,
    };
    let attr_id: u32 = match parts.next() {
        Some(p) => p.parse().map_err(|_| Error::Arg)?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(Error::Arg);
    }
    Ok(ParsedInum { addr, attr_type, attr_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inum_roundtrip() {
        let p = parse_inum("123-128-0").unwrap();
        assert_eq!(p, ParsedInum { addr: 123, attr_type: 128, attr_id: 0 });
    }

    #[test]
    fn parse_inum_bare_addr() {
        let p = parse_inum("42").unwrap();
        assert_eq!(p, ParsedInum { addr: 42, attr_type: 0, attr_id: 0 });
    }

    #[test]
    fn parse_inum_rejects_garbage() {
        assert_eq!(parse_inum("not-a-number"), Err(Error::Arg));
        assert_eq!(parse_inum("1-2-3-4"), Err(Error::Arg));
    }
}
