use anyhow::Result;

use super::cli::{DiskAction, DiskCli};
use super::types::MAX_PARTITIONS;
use crate::config::DiskConfig;
use crate::utils::parse_index_list;

pub mod list;
pub mod rawdisk;

pub fn run(cli: DiskCli, config: Option<&DiskConfig>) -> Result<()> {
    let max_partitions = config.map_or(MAX_PARTITIONS, DiskConfig::max_partitions);

    match cli.action {
        DiskAction::List { json } => list::list(&cli.disk, max_partitions, json),
        DiskAction::Rawdisk {
            partitions,
            mbr,
            relative,
            output,
        } => {
            let indices = match partitions.as_deref() {
                Some(list) => parse_index_list(list)?,
                None => Vec::new(),
            };
            rawdisk::rawdisk(
                &cli.disk,
                max_partitions,
                &indices,
                mbr.as_deref(),
                relative,
                output.as_deref(),
            )
        }
    }
}
