use anyhow::{Context, Result};
use log::info;
use std::path::Path;

use super::super::load_partition_table;
use super::super::rawdisk::RawDiskBuilder;

pub fn rawdisk(
    disk: &Path,
    max_partitions: usize,
    partitions: &[u32],
    mbr: Option<&Path>,
    relative: bool,
    output: Option<&Path>,
) -> Result<()> {
    let table = load_partition_table(disk, max_partitions)?;

    let mut builder = RawDiskBuilder::new(disk, &table)
        .with_partitions(partitions)
        .with_relative(relative);
    if let Some(mbr) = mbr {
        let sector = std::fs::read(mbr)
            .with_context(|| format!("failed to read boot sector file {}", mbr.display()))?;
        builder = builder.with_header_override(sector);
    }
    let descriptor = builder.build()?;

    let json = serde_json::to_string_pretty(&descriptor)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write descriptor {}", path.display()))?;
            info!(
                "Raw disk descriptor for {} written to {} ({} extents)",
                disk.display(),
                path.display(),
                descriptor.extents.len()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}
