//! # Command Line Interface
//!
//! Every subcommand takes the disk image with `-d`; file content moves
//! through stdin and stdout so the subcommands compose in pipelines.

use clap::{arg,Command};
use std::io::{Read,Write};
use std::str::FromStr;
use log::error;
use altokit::img::DiabloImage;
use altokit::fs::alto;

fn main() -> Result<(),Box<dyn std::error::Error>>
{
    env_logger::init();
    let long_help =
"altokit reads and writes Xerox Alto file system disk images.
A dual drive system is given as two image paths separated by a comma.
Modified images are always written to a backup path (`<image>~`); the
original file is never touched.
Set RUST_LOG environment variable to control logging level.
  levels: trace,debug,info,warn,error

Examples:
---------
create a blank image:    `altokit mkdsk -d myimg.dsk`
list the directory:      `altokit catalog -d myimg.dsk`
copy a file out:         `altokit get -f memo.txt -d myimg.dsk > memo.txt`
copy a file in:          `altokit put -f memo.txt -d myimg.dsk < memo.txt`
check consistency:       `altokit check -d myimg.dsk`";

    let matches = Command::new("altokit")
        .about("Manipulates Xerox Alto file system disk images.")
    .after_long_help(long_help)
    .arg_required_else_help(true)
    .subcommand(Command::new("mkdsk")
        .arg(arg!(-d --dimg <PATH> "path of image to create, two paths for a dual drive system"))
        .about("write a blank formatted disk image"))
    .subcommand(Command::new("catalog")
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("list the files on a disk image"))
    .subcommand(Command::new("get")
        .arg(arg!(-f --file <NAME> "file to read from the disk image"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("write a file's bytes to stdout"))
    .subcommand(Command::new("put")
        .arg(arg!(-f --file <NAME> "file to write into the disk image"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("read stdin into a file, creating it if necessary"))
    .subcommand(Command::new("create")
        .arg(arg!(-f --file <NAME> "file to create in the disk image"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("create an empty file"))
    .subcommand(Command::new("delete")
        .arg(arg!(-f --file <NAME> "file to delete from the disk image"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("delete a file"))
    .subcommand(Command::new("rename")
        .arg(arg!(-f --file <NAME> "file to rename"))
        .arg(arg!(-n --name <NAME> "new name"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("rename a file"))
    .subcommand(Command::new("truncate")
        .arg(arg!(-f --file <NAME> "file to truncate"))
        .arg(arg!(-s --size <SIZE> "new size in bytes"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("set a file's length"))
    .subcommand(Command::new("stat")
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("print a summary of the volume"))
    .subcommand(Command::new("dump")
        .arg(arg!(-p --page <PAGE> "virtual disk address of the page"))
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("dump one page's label and data"))
    .subcommand(Command::new("check")
        .arg(arg!(-d --dimg <PATH> "path to disk image"))
        .about("validate the volume, repairing it if necessary"))
    .get_matches();

    match matches.subcommand() {
        Some(("mkdsk", cmd)) => {
            let img_name = cmd.value_of("dimg").expect("path required");
            let drives = img_name.split(',').count();
            if drives > 2 {
                error!("at most two images can make up a system");
                return Err(Box::new(altokit::img::Error::TooManyDrives));
            }
            let mut disk = alto::Disk::format(DiabloImage::blank(drives), None)?;
            for (drive, path) in img_name.split(',').enumerate() {
                let dat = disk.get_img().drive_bytes(drive);
                std::fs::write(path, dat)?;
                eprintln!("wrote blank volume to {}", path);
            }
            Ok(())
        },
        Some(("catalog", cmd)) => {
            let disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            disk.catalog_to_stdout();
            Ok(())
        },
        Some(("get", cmd)) => {
            let name = cmd.value_of("file").expect("name required");
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            let handle = disk.open(name)?;
            let size = disk.getattr(name)?.size;
            let dat = disk.read(handle, size, 0)?;
            std::io::stdout().write_all(&dat)?;
            Ok(())
        },
        Some(("put", cmd)) => {
            let name = cmd.value_of("file").expect("name required");
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            let mut dat = Vec::new();
            std::io::stdin().read_to_end(&mut dat)?;
            if disk.open(name).is_err() {
                disk.create(name)?;
            }
            disk.truncate(name, 0)?;
            let handle = disk.open(name)?;
            let written = disk.write(handle, &dat, 0)?;
            if written < dat.len() {
                error!("only {} of {} bytes fit on the volume", written, dat.len());
                disk.flush()?;
                return Err(Box::new(alto::types::Error::NoSpace));
            }
            disk.flush()
        },
        Some(("create", cmd)) => {
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            disk.create(cmd.value_of("file").expect("name required"))?;
            disk.flush()
        },
        Some(("delete", cmd)) => {
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            disk.unlink(cmd.value_of("file").expect("name required"))?;
            disk.flush()
        },
        Some(("rename", cmd)) => {
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            disk.rename(cmd.value_of("file").expect("name required"), cmd.value_of("name").expect("new name required"))?;
            disk.flush()
        },
        Some(("truncate", cmd)) => {
            let size = usize::from_str(cmd.value_of("size").expect("size required"))?;
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            disk.truncate(cmd.value_of("file").expect("name required"), size)?;
            disk.flush()
        },
        Some(("stat", cmd)) => {
            let disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            let vfs = disk.statfs();
            println!("block size    {}", vfs.block_size);
            println!("total blocks  {}", vfs.total_blocks);
            println!("free blocks   {}", vfs.free_blocks);
            println!("files         {}", vfs.files);
            println!("free files    {}", vfs.free_files);
            println!("max name      {}", vfs.max_name);
            println!("fsid          {}", vfs.fsid);
            Ok(())
        },
        Some(("dump", cmd)) => {
            let page = usize::from_str(cmd.value_of("page").expect("page required"))?;
            let disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            if page >= disk.statfs().total_blocks {
                error!("page {} is outside the disk", page);
                return Err(Box::new(alto::types::Error::InvalidArgument));
            }
            disk.dump_page_to_stdout(page);
            Ok(())
        },
        Some(("check", cmd)) => {
            // a mount runs the validation, repairing as needed; flush so a
            // repaired volume lands in the backup image
            let mut disk = altokit::mount_from_file(cmd.value_of("dimg").expect("path required"))?;
            disk.flush()
        },
        _ => {
            eprintln!("No subcommand was found, try `altokit --help`");
            Err(Box::new(alto::types::Error::InvalidArgument))
        }
    }
}
