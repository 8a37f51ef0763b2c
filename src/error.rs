// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error kinds for the forensic file system engine.

use std::fmt;

/// The primary error kinds a driver or the generic core can return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Bad caller-supplied argument (path, inode string, CLI flag).
    Arg,
    /// The image reader returned a short read or an I/O failure.
    Read,
    /// `block_walk`/`inode_walk` range is malformed or out of bounds.
    WalkRange,
    /// An inode number is out of the file system's valid range.
    InodeNum,
    /// An on-disk inode record failed a structural check (bad magic, etc).
    InodeCor,
    /// A superblock or header magic number did not match.
    Magic,
    /// A directory or tree walk hit structurally inconsistent data.
    FsWalk,
    /// The requested file system type is not recognized by any driver.
    Unsupported,
    /// The vtable operation is not implemented by this driver.
    UnsupportedFunc,
    /// A cache or index was found to be internally inconsistent.
    IndexCorrupt,
    /// An allocation failed.
    NoMemory,
    /// A caller-supplied callback requested early termination via error.
    Aborted,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arg => "invalid argument",
            Self::Read => "image read error",
            Self::WalkRange => "invalid walk range",
            Self::InodeNum => "inode number out of range",
            Self::InodeCor => "corrupt inode record",
            Self::Magic => "bad magic number",
            Self::FsWalk => "inconsistent file system structure",
            Self::Unsupported => "unsupported file system type",
            Self::UnsupportedFunc => "operation not supported by this driver",
            Self::IndexCorrupt => "corrupt internal index",
            Self::NoMemory => "allocation failure",
            Self::Aborted => "operation aborted",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// An `Error` together with a chain of call-site annotations.
///
/// This is the "concat message" mechanism of §7: each call site that
/// propagates an error may attach a short static string describing what
/// it was doing, without discarding the original error kind.
#[derive(Debug)]
pub struct Context {
    pub error: Error,
    concat: Vec<&'static str>,
}

impl Context {
    pub fn new(error: Error) -> Context {
        Context { error, concat: Vec::new() }
    }

    #[must_use]
    pub fn annotate(mut self, msg: &'static str) -> Context {
        self.concat.push(msg);
        self
    }

    pub fn kind(&self) -> Error {
        self.error
    }

    pub fn messages(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.concat.iter().copied()
    }
}

impl From<Error> for Context {
    fn from(error: Error) -> Context {
        Context::new(error)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error.as_str())?;
        for msg in &self.concat {
            write!(f, "\n  while {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Context {}

/// Extension trait so call sites can write `foo().context("mounting AG 3")?`.
pub trait ResultExt<T> {
    fn context(self, msg: &'static str) -> std::result::Result<T, Context>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, msg: &'static str) -> std::result::Result<T, Context> {
        self.map_err(|e| Context::new(e).annotate(msg))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Context> {
    fn context(self, msg: &'static str) -> std::result::Result<T, Context> {
        self.map_err(|c| c.annotate(msg))
    }
}
