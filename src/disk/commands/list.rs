use anyhow::Result;
use std::path::Path;

use super::super::load_partition_table;
use super::super::types::{DiskInfo, PartitionInfo};
use crate::utils::format_mib;

pub fn list(disk: &Path, max_partitions: usize, json: bool) -> Result<()> {
    let table = load_partition_table(disk, max_partitions)?;
    let partitions: Vec<PartitionInfo> = table.partitions.iter().map(PartitionInfo::from).collect();

    if json {
        let info = DiskInfo {
            disk: disk.display().to_string(),
            scheme: table.scheme,
            partitions,
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Disk: {} ({})", disk.display(), table.scheme);
    if table.is_empty() {
        println!("No partitions found.");
        return Ok(());
    }

    println!(
        "{:>3} {:>3} {:<36} {:>12} {:>12} {:>10} {:>12}",
        "#", "OS", "Type", "Start CHS", "End CHS", "Size (M)", "Start sector"
    );
    for (p, part) in partitions.iter().zip(&table.partitions) {
        let os = p.os_index.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3} {:>3} {:<36} {:>12} {:>12} {:>10} {:>12}",
            p.index,
            os,
            p.kind,
            p.chs_start,
            p.chs_end,
            format_mib(part.size_bytes()),
            p.start_sector
        );
    }
    Ok(())
}
