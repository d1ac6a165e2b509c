use std::env::set_var;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction, Command};
use log::*;

use rext4::block_dev::file::FileDev;
use rext4::block_dev::Bdev;
use rext4::{mkfs, FsProfile, FsRegistry, MkfsOpts};

fn init_logs() {
    env_logger::builder().format_timestamp(None).init();
}

fn parse_profile(s: &str) -> Result<FsProfile> {
    Ok(match s {
        "ext2" => FsProfile::Ext2,
        "ext3" => FsProfile::Ext3,
        "ext4" => FsProfile::Ext4,
        _ => return Err(anyhow!("unknown filesystem type {}", s)),
    })
}

fn open_image(path: &str) -> Result<Bdev> {
    Ok(Bdev::new(Box::new(FileDev::new(path)?)))
}

fn mount_image(reg: &mut FsRegistry, path: &str, ro: bool) -> Result<()> {
    reg.register_device("img", open_image(path)?)?;
    reg.mount("img", "m", ro)?;
    Ok(())
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .subcommand_required(true)
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .global(true))
        .subcommand(
            Command::new("mkfs")
                .about("Format an image file")
                .arg(arg!(<image> "Image file"))
                .arg(arg!(-t --profile <TYPE> "ext2, ext3 or ext4").default_value("ext4"))
                .arg(arg!(-b --block_size <BYTES> "Block size").default_value("4096"))
                .arg(arg!(-L --label <LABEL> "Volume label").default_value(""))
                .arg(arg!(-s --size <MIB> "Create the image with this size first")
                    .required(false)),
        )
        .subcommand(
            Command::new("info")
                .about("Print superblock and device statistics")
                .arg(arg!(<image> "Image file")),
        )
        .subcommand(
            Command::new("ls")
                .about("List a directory")
                .arg(arg!(<image> "Image file"))
                .arg(arg!([path] "Directory path").default_value("/")),
        )
        .subcommand(
            Command::new("cat")
                .about("Print a file's contents")
                .arg(arg!(<image> "Image file"))
                .arg(arg!(<path> "File path")),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    match matches.subcommand() {
        Some(("mkfs", sub)) => {
            let image = sub.get_one::<String>("image").unwrap();
            let profile = parse_profile(sub.get_one::<String>("profile").unwrap())?;
            let block_size: u32 = sub.get_one::<String>("block_size").unwrap().parse()?;
            let label = sub.get_one::<String>("label").unwrap().clone();
            let mut bdev = match sub.get_one::<String>("size") {
                Some(mib) => {
                    let bytes: u64 = mib.parse::<u64>()? * 1024 * 1024;
                    Bdev::new(Box::new(FileDev::create(image, bytes)?))
                }
                None => open_image(image)?,
            };
            mkfs(&mut bdev, &MkfsOpts { profile, block_size, label, ..Default::default() })?;
            info!("{} formatted as {:?}", image, profile);
            Ok(())
        }
        Some(("info", sub)) => {
            let image = sub.get_one::<String>("image").unwrap();
            let mut reg = FsRegistry::new();
            mount_image(&mut reg, image, true)?;
            let stats = reg.mount_point_stats("m")?;
            println!(
                "label '{}': {} blocks of {} ({} free), {} inodes ({} free), {} directories",
                stats.volume_name,
                stats.blocks_count,
                stats.block_size,
                stats.free_blocks_count,
                stats.inodes_count,
                stats.free_inodes_count,
                stats.used_dirs_count
            );
            let dev = reg.device_stats("m")?;
            println!(
                "device: {} block reads ({} bytes), {} block writes ({} bytes)",
                dev.bread_ctr, dev.bytes_read, dev.bwrite_ctr, dev.bytes_written
            );
            reg.umount("m")?;
            Ok(())
        }
        Some(("ls", sub)) => {
            let image = sub.get_one::<String>("image").unwrap();
            let path = sub.get_one::<String>("path").unwrap();
            let mut reg = FsRegistry::new();
            mount_image(&mut reg, image, true)?;
            let full = format!("/m{}", if path.starts_with('/') { path.clone() } else { format!("/{}", path) });
            let mut dir = reg.dir_open(&full)?;
            while let Some(entry) = reg.dir_entry_next(&mut dir)? {
                println!("{:>10}  {}", entry.ino, entry.name_str());
            }
            reg.dir_close(dir)?;
            reg.umount("m")?;
            Ok(())
        }
        Some(("cat", sub)) => {
            let image = sub.get_one::<String>("image").unwrap();
            let path = sub.get_one::<String>("path").unwrap();
            let mut reg = FsRegistry::new();
            mount_image(&mut reg, image, true)?;
            let full = format!("/m{}", if path.starts_with('/') { path.clone() } else { format!("/{}", path) });
            let mut file = reg.fopen(&full, "r")?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reg.fread(&mut file, &mut buf)?;
                if n == 0 {
                    break;
                }
                use std::io::Write;
                std::io::stdout().write_all(&buf[..n])?;
            }
            reg.fclose(file)?;
            reg.umount("m")?;
            Ok(())
        }
        _ => unreachable!(),
    }
}
