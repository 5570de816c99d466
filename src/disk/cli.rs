use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
pub struct DiskCli {
    /// Raw block device or disk image path
    #[arg(long, value_name = "PATH")]
    pub disk: PathBuf,

    #[command(subcommand)]
    pub action: DiskAction,
}

#[derive(Subcommand, Debug)]
pub enum DiskAction {
    /// List the partitions of the disk
    List {
        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Describe a raw-disk image that passes host partitions through
    Rawdisk {
        /// Partition indices to expose, e.g. 1,5 (default: whole disk)
        #[arg(long, value_name = "LIST")]
        partitions: Option<String>,

        /// Replacement boot sector (512 bytes) presented instead of the host's
        #[arg(long, value_name = "PATH")]
        mbr: Option<PathBuf>,

        /// Address partitions relative to their own start (partition devices)
        #[arg(long)]
        relative: bool,

        /// Write the descriptor here instead of stdout
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}
