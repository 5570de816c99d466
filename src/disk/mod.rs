mod cli;
pub mod commands;
pub mod io;
pub mod layout;
pub mod rawdisk;
pub mod reader;
pub mod types;
pub mod validate;

pub use cli::DiskCli;
pub use commands::run;

use std::path::Path;

use crate::error::Result;
use types::PartitionTable;

/// Read and validate the partition table of a raw device or image file.
pub fn load_partition_table(device: &Path, max_partitions: usize) -> Result<PartitionTable> {
    let mut dev = io::open_device(device)?;
    let limit = max_partitions.min(types::MAX_PARTITIONS);
    let table = reader::read_partition_table(&mut dev, limit)?;
    validate::validate(table)
}
