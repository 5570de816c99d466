use super::types::{GPT_BACKUP_SECTORS, PartitionScheme, PartitionTable};
use crate::error::{Error, Result};

/// Sort `table` by start sector, assign partition-table metadata regions and
/// reject ambiguous or overlapping layouts.
pub fn validate(mut table: PartitionTable) -> Result<PartitionTable> {
    sort_by_start(&mut table)?;

    if table.scheme == PartitionScheme::Gpt {
        let last_usable = table
            .last_usable_lba
            .ok_or_else(|| Error::invalid_layout("GPT table without last usable LBA"))?;
        if last_usable.checked_add(1 + GPT_BACKUP_SECTORS).is_none() {
            return Err(Error::invalid_layout(format!(
                "GPT last usable LBA {last_usable} leaves no room for the backup GPT"
            )));
        }
    }
    if table.partitions.is_empty() {
        return Ok(table);
    }
    let first = &mut table.partitions[0];
    first.table_start = 0;
    first.table_sectors = first.start;

    check_overlaps(&table)?;

    if let (Some((backup_start, _)), Some(last)) = (table.backup_table(), table.partitions.last())
        && last.end() > backup_start
    {
        return Err(Error::invalid_layout(format!(
            "GPT partition {} (sectors {}..{}) extends into the backup GPT at sector {}",
            last.index,
            last.start,
            last.end(),
            backup_start
        )));
    }
    Ok(table)
}

fn sort_by_start(table: &mut PartitionTable) -> Result<()> {
    let parts = &mut table.partitions;
    if let Some(zero) = parts.iter().find(|p| p.start == 0) {
        return Err(Error::invalid_layout(format!(
            "partition {} starts at sector 0",
            zero.index
        )));
    }
    if let Some(wide) = parts.iter().find(|p| p.start.checked_add(p.sectors).is_none()) {
        return Err(Error::invalid_layout(format!(
            "partition {} (start {}, {} sectors) runs past the addressable range",
            wide.index, wide.start, wide.sectors
        )));
    }

    for i in 0..parts.len() {
        let mut min = i;
        for j in i + 1..parts.len() {
            if parts[j].start == parts[min].start {
                return Err(Error::invalid_layout(format!(
                    "partitions {} and {} both start at sector {}",
                    parts[min].index, parts[j].index, parts[j].start
                )));
            }
            if parts[j].start < parts[min].start {
                min = j;
            }
        }
        parts.swap(i, min);
    }
    Ok(())
}

fn check_overlaps(table: &PartitionTable) -> Result<()> {
    let mut prev_end = 0u64;
    let mut prev_index: Option<u32> = None;

    for part in &table.partitions {
        if part.table_sectors > 0 {
            if part.table_start < prev_end {
                return Err(overlap(table.scheme, prev_index, part.index, part.table_start));
            }
            prev_end = part.table_end();
        }
        if part.start < prev_end {
            return Err(overlap(table.scheme, prev_index, part.index, part.start));
        }
        // The extended container holds no data of its own.
        if table.scheme == PartitionScheme::Gpt || !part.is_extended() {
            prev_end = part.end();
            prev_index = Some(part.index);
        }
    }
    Ok(())
}

fn overlap(scheme: PartitionScheme, prev: Option<u32>, index: u32, sector: u64) -> Error {
    let with = match prev {
        Some(prev) => format!("partition {prev}"),
        None => "partition table metadata".to_string(),
    };
    Error::invalid_layout(format!(
        "{scheme} partition {index} overlaps {with} at sector {sector}"
    ))
}
