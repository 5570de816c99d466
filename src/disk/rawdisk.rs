//! Parameters for a pass-through image of a host disk.
//!
//! Nothing here touches the device: the descriptor is handed to the virtual
//! disk engine, which materialises the extents.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::io::SECTOR_SIZE;
use super::types::{PartitionScheme, PartitionTable};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtentKind {
    /// Partition-table sectors, copied from the device (sector 0 replaced by
    /// the header override when one is given).
    Metadata,
    /// Mapped straight to the device at `device_offset` (in sectors).
    PassThrough { partition: u32, device_offset: u64 },
    /// Reads as zeroes, writes are discarded.
    Zero,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawExtent {
    pub start: u64,
    pub sectors: u64,
    #[serde(flatten)]
    pub kind: ExtentKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct RawDiskDescriptor {
    pub device: PathBuf,
    pub scheme: PartitionScheme,
    /// Selected partition indices; empty means the whole device.
    pub partitions: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_override: Option<Vec<u8>>,
    pub relative: bool,
    /// Ordered, gap-free extent map; empty for whole-device access.
    pub extents: Vec<RawExtent>,
}

pub struct RawDiskBuilder<'a> {
    device: PathBuf,
    table: &'a PartitionTable,
    selection: Vec<u32>,
    header_override: Option<Vec<u8>>,
    relative: bool,
}

impl<'a> RawDiskBuilder<'a> {
    pub fn new(device: &Path, table: &'a PartitionTable) -> Self {
        Self {
            device: device.to_path_buf(),
            table,
            selection: Vec::new(),
            header_override: None,
            relative: false,
        }
    }

    pub fn with_partitions(mut self, indices: &[u32]) -> Self {
        self.selection = indices.to_vec();
        self
    }

    pub fn with_header_override(mut self, sector: Vec<u8>) -> Self {
        self.header_override = Some(sector);
        self
    }

    pub fn with_relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    pub fn build(self) -> Result<RawDiskDescriptor> {
        if self.selection.is_empty() {
            if self.header_override.is_some() {
                return Err(Error::invalid_argument(
                    "header override requires restricted access: select at least one partition",
                ));
            }
            if self.relative {
                return Err(Error::invalid_argument(
                    "relative addressing requires a partition selection",
                ));
            }
        }

        if let Some(sector) = &self.header_override
            && sector.len() as u64 != SECTOR_SIZE
        {
            return Err(Error::invalid_argument(format!(
                "header override must be exactly {SECTOR_SIZE} bytes, got {}",
                sector.len()
            )));
        }

        let mut selected = BTreeSet::new();
        for &index in &self.selection {
            let part = self.table.get(index).ok_or_else(|| {
                let known = self
                    .table
                    .partitions
                    .iter()
                    .map(|p| p.index.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Error::invalid_argument(format!(
                    "partition {index} does not exist on {} (available: {known})",
                    self.device.display()
                ))
            })?;
            if part.is_extended() {
                return Err(Error::invalid_argument(format!(
                    "partition {index} is an extended partition container"
                )));
            }
            if !selected.insert(index) {
                return Err(Error::invalid_argument(format!(
                    "partition {index} selected more than once"
                )));
            }
        }

        let extents = if self.selection.is_empty() {
            Vec::new()
        } else {
            extent_map(self.table, &selected, self.relative)?
        };

        Ok(RawDiskDescriptor {
            device: self.device,
            scheme: self.table.scheme,
            partitions: self.selection,
            header_override: self.header_override,
            relative: self.relative,
            extents,
        })
    }
}

fn extent_map(
    table: &PartitionTable,
    selected: &BTreeSet<u32>,
    relative: bool,
) -> Result<Vec<RawExtent>> {
    let mut regions = Vec::new();
    for part in &table.partitions {
        if part.table_sectors > 0 {
            regions.push(RawExtent {
                start: part.table_start,
                sectors: part.table_sectors,
                kind: ExtentKind::Metadata,
            });
        }
        if part.is_extended() || part.sectors == 0 {
            continue;
        }
        let kind = if selected.contains(&part.index) {
            ExtentKind::PassThrough {
                partition: part.index,
                device_offset: if relative { 0 } else { part.start },
            }
        } else {
            ExtentKind::Zero
        };
        regions.push(RawExtent {
            start: part.start,
            sectors: part.sectors,
            kind,
        });
    }
    if let Some((start, sectors)) = table.backup_table() {
        regions.push(RawExtent {
            start,
            sectors,
            kind: ExtentKind::Metadata,
        });
    }
    regions.sort_by_key(|r| r.start);

    let mut extents = Vec::with_capacity(regions.len() * 2);
    let mut cursor = 0u64;
    for region in regions {
        if region.start > cursor {
            extents.push(RawExtent {
                start: cursor,
                sectors: region.start - cursor,
                kind: ExtentKind::Zero,
            });
        }
        let end = region.start.checked_add(region.sectors).ok_or_else(|| {
            Error::invalid_layout(format!(
                "region at sector {} ({} sectors) runs past the addressable range",
                region.start, region.sectors
            ))
        })?;
        cursor = cursor.max(end);
        extents.push(region);
    }
    Ok(extents)
}
