// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only forensic engine for XFS and YAFFS2 file systems.
//!
//! This crate never writes to an image, never replays a journal, and never
//! attempts to repair corruption it finds — corruption always surfaces as
//! a typed [`error::Error`]. Everything else (image acquisition, container
//! unwrapping, cataloguing) lives outside this crate; see [`image`] for the
//! boundary it consumes.

pub mod endian;
pub mod error;
pub mod fs;
pub mod image;
pub mod xfs;
pub mod yaffs2;

use std::rc::Rc;

use error::{Error, Result};
use fs::{FsInfo, FsType};
use image::ImageReader;

/// Mounts an image, optionally at a non-zero byte offset (for partitioned
/// images), as the requested file system type. `FsType::Detect` tries XFS
/// then YAFFS2, since YAFFS2 detection requires a spare-layout scan that is
/// cheap but not distinguishing the way a superblock magic is.
pub fn open_img(image: Rc<dyn ImageReader>, offset: u64, fs_type: FsType) -> Result<FsInfo> {
    match fs_type {
        FsType::Xfs => xfs::mount(image, offset),
        FsType::Yaffs2 => yaffs2::mount(image, offset, None),
        FsType::Detect => {
            if let Ok(fs) = xfs::mount(image.clone(), offset) {
                return Ok(fs);
            }
            yaffs2::mount(image, offset, None).map_err(|_| Error::Unsupported)
        }
    }
}
