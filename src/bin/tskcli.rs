// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line front end for the forensic XFS/YAFFS2 engine.
//!
//! Each subcommand mirrors one vtable operation (`fsstat` -> mount
//! parameters, `istat`/`ls`/`icat` -> `file_add_meta`/`dir_open_meta`/
//! `attr_read`, `blkstat` -> `block_getflags`), the way the teacher's REPL
//! commands each wrap one `ramdisk`/`config` call.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand, ValueEnum};

use tskfs::error::{Context, Error, Result, ResultExt};
use tskfs::fs::{self, BlockFlags, DirOpenResult, FsInfo, FsMeta};
use tskfs::image::{FileImage, ImageReader};
use tskfs::yaffs2::Yaffs2Config;

#[derive(Parser)]
#[command(
    name = "tskcli",
    version,
    about = "Forensic inspection tool for XFS and YAFFS2 images"
)]
struct Cli {
    /// Path to the disk or NAND image
    image: PathBuf,

    /// Byte offset of the file system within the image
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// File system type to mount as (auto-detects XFS then YAFFS2)
    #[arg(long, value_enum, default_value_t = FsTypeArg::Detect)]
    fstype: FsTypeArg,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum FsTypeArg {
    Detect,
    Xfs,
    Yaffs2,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the image and print the volume parameters established at mount time
    Mount,
    /// Print file system summary information
    Fsstat,
    /// Print metadata for one inode (addr[-type[-id]])
    Istat { inum: String },
    /// List the contents of a directory inode (addr[-type[-id]])
    Ls { inum: String },
    /// Print the content of a file's data attribute to stdout (addr[-type[-id]])
    Icat { inum: String },
    /// Print the allocation status of one block
    Blkstat { addr: u64 },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("tskcli: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> std::result::Result<(), Context> {
    let image: Rc<dyn ImageReader> = Rc::new(FileImage::open(&cli.image).context("opening image")?);
    let sidecar = load_sidecar(&cli.image).context("parsing .yaffs2_config sidecar")?;
    let fs = mount_image(image, cli.offset, cli.fstype, sidecar).context("mounting file system")?;

    match cli.cmd {
        Command::Mount => cmd_mount(&fs),
        Command::Fsstat => cmd_fsstat(&fs),
        Command::Istat { inum } => cmd_istat(&fs, &inum),
        Command::Ls { inum } => cmd_ls(&fs, &inum),
        Command::Icat { inum } => cmd_icat(&fs, &inum),
        Command::Blkstat { addr } => cmd_blkstat(&fs, addr),
    }
    .context("running command")?;

    fs.close();
    Ok(())
}

/// Locates `<image>.yaffs2_config` alongside the image and parses it, if
/// present. File-path policy belongs to the CLI; the library only ever
/// sees an already-parsed `Yaffs2Config`.
fn load_sidecar(image_path: &Path) -> Result<Option<Yaffs2Config>> {
    let mut sidecar_path = image_path.as_os_str().to_os_string();
    sidecar_path.push(".yaffs2_config");
    let sidecar_path = PathBuf::from(sidecar_path);
    if !sidecar_path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&sidecar_path).map_err(|_| Error::Read)?;
    Yaffs2Config::parse(&text).map(Some)
}

fn mount_image(image: Rc<dyn ImageReader>, offset: u64, fstype: FsTypeArg, sidecar: Option<Yaffs2Config>) -> Result<FsInfo> {
    match fstype {
        FsTypeArg::Xfs => tskfs::xfs::mount(image, offset),
        FsTypeArg::Yaffs2 => tskfs::yaffs2::mount(image, offset, sidecar),
        FsTypeArg::Detect => {
            if let Ok(fs) = tskfs::xfs::mount(image.clone(), offset) {
                return Ok(fs);
            }
            tskfs::yaffs2::mount(image, offset, sidecar)
        }
    }
}

fn cmd_mount(fs: &FsInfo) -> Result<()> {
    println!("file system type: {:?}", fs.fs_type());
    println!("block size:       {}", fs.block_size());
    println!("block range:      {}-{}", fs.first_block(), fs.last_block());
    println!("inode range:      {}-{}", fs.first_inum(), fs.last_inum());
    println!("root inode:       {}", fs.root_inum());
    Ok(())
}

fn cmd_fsstat(fs: &FsInfo) -> Result<()> {
    let block_count = fs.last_block() - fs.first_block() + 1;
    println!("FILE SYSTEM INFORMATION");
    println!("--------------------------------------------");
    println!("File System Type: {:?}", fs.fs_type());
    println!();
    println!("METADATA INFORMATION");
    println!("--------------------------------------------");
    println!("Root Directory: {}", fs.root_inum());
    println!("Inode Range: {} - {}", fs.first_inum(), fs.last_inum());
    println!();
    println!("CONTENT INFORMATION");
    println!("--------------------------------------------");
    println!("Block Size: {}", fs.block_size());
    println!("Block Range: {} - {}", fs.first_block(), fs.last_block());
    println!("Block Count: {block_count}");
    Ok(())
}

fn cmd_istat(fs: &FsInfo, inum: &str) -> Result<()> {
    let p = fs::parse_inum(inum)?;
    let mut meta = fs.file_add_meta(p.addr)?;
    print_meta(&meta);

    fs.load_attrs(&mut meta)?;
    if !meta.attr.is_empty() {
        println!();
        println!("ATTRIBUTES:");
        for attr in &meta.attr {
            println!("  type {} id {}: {} bytes, {} run(s)", attr.attr_type, attr.id, attr.size, attr.runs().len());
            for run in attr.runs() {
                println!("    offset {} addr {} len {} flags {:?}", run.offset, run.addr, run.len, run.flags);
            }
        }
    }
    Ok(())
}

fn print_meta(meta: &FsMeta) {
    println!("inode: {}", meta.addr);
    println!("type: {:?}", meta.file_type);
    println!("mode: {:#o}", meta.mode);
    println!("nlink: {}", meta.nlink);
    println!("size: {}", meta.size);
    println!("uid / gid: {} / {}", meta.uid, meta.gid);
    println!("flags: {:?}", meta.flags);
    if let Some(target) = &meta.symlink_target {
        println!("symlink target: {target}");
    }
    println!("mtime: {}", meta.times.mtime.secs);
    println!("atime: {}", meta.times.atime.secs);
    println!("ctime: {}", meta.times.ctime.secs);
    println!("crtime: {}", meta.times.crtime.secs);
}

fn cmd_ls(fs: &FsInfo, inum: &str) -> Result<()> {
    let p = fs::parse_inum(inum)?;
    let (dir, res) = fs.dir_open_meta(p.addr)?;
    if res == DirOpenResult::Corrupt {
        println!("(directory parse hit corrupt data; showing what was recovered)");
    }
    for name in &dir.names {
        let alloc = if name.alloc { "r/r" } else { "r/-" };
        println!("{alloc} {:?}\t{}\t{}", name.file_type, name.meta_addr, name.name);
    }
    Ok(())
}

fn cmd_icat(fs: &FsInfo, inum: &str) -> Result<()> {
    let p = fs::parse_inum(inum)?;
    let mut meta = fs.file_add_meta(p.addr)?;
    fs.load_attrs(&mut meta)?;
    let attr = meta
        .attr
        .iter()
        .find(|a| a.attr_type == p.attr_type && a.id == p.attr_id)
        .or_else(|| meta.attr.first())
        .ok_or(Error::Arg)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; fs.block_size().max(1) as usize];
    let mut offset = 0u64;
    loop {
        let n = fs::attr_read(fs, attr, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(|_| Error::Read)?;
        offset += n as u64;
    }
    Ok(())
}

fn cmd_blkstat(fs: &FsInfo, addr: u64) -> Result<()> {
    let flags = fs.block_getflags(addr)?;
    println!("block: {addr}");
    println!("allocated: {}", flags.contains(BlockFlags::ALLOC));
    println!("flags: {flags:?}");
    Ok(())
}
