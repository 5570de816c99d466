//! Boot sector parsing for MBR (with extended/logical chains) and GPT.
//!
//! The reader produces entries in on-disk order; `validate` sorts them and
//! fills in the metadata regions.

use log::{debug, warn};
use std::io::{Read, Seek};

use super::io::{SectorReader, lba_to_offset};
use super::layout::LeFields;
use super::types::{Chs, MBR_EXTENDED_TYPES, Partition, PartitionScheme, PartitionTable, PartitionType};
use crate::error::{Error, Result};

const MBR_TABLE_OFFSET: usize = 0x1BE;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_PRIMARY_SLOTS: usize = 4;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const BOOT_SIGNATURE_OFFSET: usize = 510;
/// Type byte of the first MBR slot on a protective MBR.
const PROTECTIVE_TYPE_OFFSET: usize = 450;
const GPT_PROTECTIVE_TYPE: u8 = 0xEE;
const FIRST_LOGICAL_INDEX: u32 = 5;

const GPT_HEADER_LBA: u64 = 1;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION_MAJOR: u32 = 1;
const GPT_EXPECTED_ENTRY_LBA: u64 = 2;
const GPT_MAX_ENTRY_ARRAY: u64 = 4 * 1024 * 1024;
/// Smallest entry holding both LBA fields.
const GPT_MIN_ENTRY_SIZE: u32 = 48;

struct MbrEntry {
    kind: u8,
    chs_start: Chs,
    chs_end: Chs,
    start: u32,
    sectors: u32,
}

impl MbrEntry {
    fn decode(entry: &LeFields<'_>) -> Result<Self> {
        Ok(Self {
            kind: entry.u8(4)?,
            chs_start: Chs::decode(entry.array::<3>(1)?),
            chs_end: Chs::decode(entry.array::<3>(5)?),
            start: entry.u32(8)?,
            sectors: entry.u32(12)?,
        })
    }

    fn at(sector: &LeFields<'_>, slot: usize) -> Result<Self> {
        let entry = sector.slice(
            MBR_TABLE_OFFSET + slot * MBR_ENTRY_SIZE,
            MBR_ENTRY_SIZE,
            "MBR partition entry",
        )?;
        Self::decode(&entry)
    }

    fn is_extended(&self) -> bool {
        MBR_EXTENDED_TYPES.contains(&self.kind)
    }
}

/// Read the partition table of `dev`, keeping at most `limit` entries.
pub fn read_partition_table<R: Read + Seek>(
    dev: &mut SectorReader<R>,
    limit: usize,
) -> Result<PartitionTable> {
    let boot = dev.read_sector(0)?;
    let sector = LeFields::new(&boot, "boot sector");
    check_boot_signature(&sector, 0)?;

    let table = if sector.u8(PROTECTIVE_TYPE_OFFSET)? == GPT_PROTECTIVE_TYPE {
        read_gpt(dev, limit)?
    } else {
        read_mbr(dev, &sector, limit)?
    };
    debug!(
        "{}: {} table with {} entries",
        dev.path().display(),
        table.scheme,
        table.len()
    );
    Ok(table)
}

fn check_boot_signature(sector: &LeFields<'_>, lba: u64) -> Result<()> {
    if sector.array::<2>(BOOT_SIGNATURE_OFFSET)? != BOOT_SIGNATURE {
        return Err(Error::invalid_layout(format!(
            "missing boot signature 0x55AA in sector {lba}"
        )));
    }
    Ok(())
}

fn push_partition(table: &mut PartitionTable, partition: Partition, limit: usize) -> Result<()> {
    if table.partitions.len() >= limit {
        return Err(Error::invalid_layout(format!(
            "more than {limit} partitions, table is likely corrupt"
        )));
    }
    table.partitions.push(partition);
    Ok(())
}

fn read_gpt<R: Read + Seek>(dev: &mut SectorReader<R>, limit: usize) -> Result<PartitionTable> {
    let raw = dev.read_sector(GPT_HEADER_LBA)?;
    let header = LeFields::new(&raw, "GPT header");
    if header.bytes(0, 8)? != GPT_SIGNATURE {
        return Err(Error::invalid_layout("GPT header signature \"EFI PART\" missing"));
    }

    let revision = header.u32(8)?;
    if revision >> 16 != GPT_REVISION_MAJOR {
        return Err(Error::UnsupportedLayout(format!(
            "GPT revision {}.{}",
            revision >> 16,
            revision & 0xFFFF
        )));
    }

    let last_usable = header.u64(48)?;
    let entry_lba = header.u64(72)?;
    let entry_count = header.u32(80)?;
    let entry_size = header.u32(84)?;

    let array_bytes = entry_count as u64 * entry_size as u64;
    if array_bytes > GPT_MAX_ENTRY_ARRAY {
        return Err(Error::invalid_layout(format!(
            "GPT header claims {entry_count} entries of {entry_size} bytes, exceeding {GPT_MAX_ENTRY_ARRAY} bytes"
        )));
    }
    if entry_count > 0 && entry_size < GPT_MIN_ENTRY_SIZE {
        return Err(Error::invalid_layout(format!(
            "GPT entry size {entry_size} is too small"
        )));
    }
    if entry_lba <= GPT_HEADER_LBA {
        return Err(Error::invalid_layout(format!(
            "GPT entry array at LBA {entry_lba} overlaps the header"
        )));
    }
    if entry_lba != GPT_EXPECTED_ENTRY_LBA {
        warn!(
            "{}: GPT entry array starts at LBA {entry_lba}, not {GPT_EXPECTED_ENTRY_LBA}",
            dev.path().display()
        );
    }

    let array = dev.read_at(lba_to_offset(entry_lba)?, array_bytes as usize)?;
    let entries = LeFields::new(&array, "GPT partition entry array");

    let mut table = PartitionTable::new(PartitionScheme::Gpt);
    table.last_usable_lba = Some(last_usable);

    let entry_size = entry_size as usize;
    for slot in 0..entry_count as usize {
        let entry = entries.slice(slot * entry_size, entry_size, "GPT partition entry")?;
        let first = entry.u64(32)?;
        let last = entry.u64(40)?;
        if first == 0 || last == 0 {
            break;
        }
        if last < first {
            return Err(Error::invalid_layout(format!(
                "GPT entry {} ends (LBA {last}) before it starts (LBA {first})",
                slot + 1
            )));
        }

        let index = slot as u32 + 1;
        push_partition(
            &mut table,
            Partition {
                index,
                os_index: Some(index),
                kind: PartitionType::Gpt(entry.array::<16>(0)?),
                chs_start: Chs::default(),
                chs_end: Chs::default(),
                start: first,
                sectors: last - first + 1,
                table_start: 0,
                table_sectors: 0,
            },
            limit,
        )?;
    }
    Ok(table)
}

fn read_mbr<R: Read + Seek>(
    dev: &mut SectorReader<R>,
    sector: &LeFields<'_>,
    limit: usize,
) -> Result<PartitionTable> {
    let mut table = PartitionTable::new(PartitionScheme::Mbr);
    let mut extended: Option<u64> = None;
    let mut os_index = 1u32;

    for slot in 0..MBR_PRIMARY_SLOTS {
        let entry = MbrEntry::at(sector, slot)?;
        if entry.kind == 0 {
            continue;
        }

        let host_number = if entry.is_extended() {
            if extended.is_some() {
                return Err(Error::invalid_layout("more than one extended partition"));
            }
            extended = Some(entry.start as u64);
            None
        } else {
            os_index += 1;
            Some(os_index - 1)
        };

        push_partition(
            &mut table,
            Partition {
                index: slot as u32 + 1,
                os_index: host_number,
                kind: PartitionType::Mbr(entry.kind),
                chs_start: entry.chs_start,
                chs_end: entry.chs_end,
                start: entry.start as u64,
                sectors: entry.sectors as u64,
                table_start: 0,
                table_sectors: 0,
            },
            limit,
        )?;
    }

    if let Some(ext_start) = extended {
        read_logical_chain(dev, &mut table, ext_start, os_index, limit)?;
    }
    Ok(table)
}

/// Walk the EBR chain of the extended partition starting at `ext_start`.
///
/// Each EBR's first entry is relative to the EBR itself; the link entry is
/// relative to the start of the extended partition.
fn read_logical_chain<R: Read + Seek>(
    dev: &mut SectorReader<R>,
    table: &mut PartitionTable,
    ext_start: u64,
    mut os_index: u32,
    limit: usize,
) -> Result<()> {
    if ext_start == 0 {
        return Err(Error::invalid_layout("extended partition starts at sector 0"));
    }

    let mut index = FIRST_LOGICAL_INDEX;
    let mut offset = 0u64;
    loop {
        let ebr_lba = ext_start + offset;
        let raw = dev.read_sector(ebr_lba)?;
        let ebr = LeFields::new(&raw, "extended boot record");
        check_boot_signature(&ebr, ebr_lba)?;

        let logical = MbrEntry::at(&ebr, 0)?;
        if logical.kind == 0 {
            return Err(Error::invalid_layout(format!(
                "EBR at sector {ebr_lba} has no logical partition entry"
            )));
        }
        if logical.start == 0 {
            return Err(Error::invalid_layout(format!(
                "logical partition in EBR at sector {ebr_lba} overlaps its own EBR"
            )));
        }

        push_partition(
            table,
            Partition {
                index,
                os_index: Some(os_index),
                kind: PartitionType::Mbr(logical.kind),
                chs_start: logical.chs_start,
                chs_end: logical.chs_end,
                start: ebr_lba + logical.start as u64,
                sectors: logical.sectors as u64,
                table_start: ebr_lba,
                table_sectors: logical.start as u64,
            },
            limit,
        )?;
        index += 1;
        os_index += 1;

        let link = MbrEntry::at(&ebr, 1)?;
        if link.kind == 0 {
            break;
        }
        if !link.is_extended() {
            return Err(Error::invalid_layout(format!(
                "broken EBR chain at sector {ebr_lba}: link entry has type 0x{:02x}",
                link.kind
            )));
        }
        let next = link.start as u64;
        if next <= offset {
            return Err(Error::invalid_layout(format!(
                "EBR chain loops back from sector {ebr_lba} to sector {}",
                ext_start + next
            )));
        }
        offset = next;
    }
    Ok(())
}
