//! Small inspection tool over a mounted image, used to exercise the core
//! end to end. Not a general-purpose exFAT utility; the path-based facade,
//! mkfs, and fsck are explicitly out of this crate's scope (§1).

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use exfat::{Fs, MountOptions};

#[derive(Parser)]
#[command(name = "exfat-info", about = "Inspect an exFAT image")]
struct Cli {
    /// Path to the image file or block device.
    image: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print superblock fields and free-space summary.
    Info,
    /// List the root directory's immediate children.
    Ls,
    /// Print the volume label, if any.
    Label,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let file = OpenOptions::new().read(true).write(true).open(&cli.image)?;
    let mut fs = Fs::mount(file, MountOptions::default())
        .map_err(|e| format!("mount {}: {e}", cli.image.display()))?;

    match cli.command {
        Command::Info => {
            let sb = fs.superblock();
            println!("sector size:        {}", sb.sector_size());
            println!("cluster size:       {}", sb.cluster_size());
            println!("cluster count:      {}", sb.cluster_count);
            println!("free clusters:      {}", fs.count_free_clusters());
            println!("root dir cluster:   {}", sb.rootdir_cluster);
            println!("volume serial:      {:#010x}", sb.volume_serial);
            println!("version:            {}.{}", sb.version.0, sb.version.1);
        }
        Command::Ls => {
            let root = fs.root();
            fs.cache_directory(&root).map_err(|e| format!("cache_directory: {e}"))?;
            for child in root.borrow().children.iter() {
                let c = child.borrow();
                let name = String::from_utf16_lossy(&c.name);
                let kind = if c.flags.contains(exfat::NodeFlags::DIRECTORY) { "d" } else { "-" };
                println!("{kind} {:>10}  {}", c.size, name);
            }
        }
        Command::Label => {
            println!("{}", fs.get_volume_label().unwrap_or_default());
        }
    }

    fs.unmount().map_err(|e| format!("unmount: {e}"))?;
    Ok(())
}
