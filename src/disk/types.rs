use serde::Serialize;
use std::fmt;

use super::io::SECTOR_SIZE;

/// Upper bound on entries kept from a single device; larger tables are
/// treated as corrupt.
pub const MAX_PARTITIONS: usize = 100;

pub const MBR_EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

/// Sectors occupied by the backup GPT header plus its entry array.
pub const GPT_BACKUP_SECTORS: u64 = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScheme::Mbr => f.write_str("MBR"),
            PartitionScheme::Gpt => f.write_str("GPT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Mbr(u8),
    Gpt([u8; 16]),
}

impl PartitionType {
    pub fn is_extended(&self) -> bool {
        matches!(self, PartitionType::Mbr(t) if MBR_EXTENDED_TYPES.contains(t))
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Mbr(t) => write!(f, "0x{t:02x}"),
            // Mixed-endian: first three groups are stored little-endian.
            PartitionType::Gpt(g) => write!(
                f,
                "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
                g[3], g[2], g[1], g[0], g[5], g[4], g[7], g[6], g[8], g[9], g[10], g[11],
                g[12], g[13], g[14], g[15]
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Chs {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl Chs {
    /// Decode the packed 3-byte MBR form: head, sector with the top two
    /// cylinder bits, low cylinder byte.
    pub fn decode(raw: [u8; 3]) -> Self {
        Self {
            head: raw[0],
            sector: raw[1] & 0x3F,
            cylinder: raw[2] as u16 | (((raw[1] & 0xC0) as u16) << 2),
        }
    }
}

impl fmt::Display for Chs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cylinder, self.head, self.sector)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 1-based index as shown to the user (MBR logical partitions start at 5).
    pub index: u32,
    /// Host OS numbering; `None` for the extended container slot.
    pub os_index: Option<u32>,
    pub kind: PartitionType,
    pub chs_start: Chs,
    pub chs_end: Chs,
    pub start: u64,
    pub sectors: u64,
    /// Sectors holding the partition-table metadata that describes this entry.
    pub table_start: u64,
    pub table_sectors: u64,
}

impl Partition {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.sectors)
    }

    pub fn is_extended(&self) -> bool {
        self.kind.is_extended()
    }

    pub fn table_end(&self) -> u64 {
        self.table_start.saturating_add(self.table_sectors)
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors.saturating_mul(SECTOR_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub scheme: PartitionScheme,
    pub partitions: Vec<Partition>,
    /// Last usable LBA from the GPT header; the backup GPT follows it.
    pub last_usable_lba: Option<u64>,
}

impl PartitionTable {
    pub fn new(scheme: PartitionScheme) -> Self {
        Self {
            scheme,
            partitions: Vec::new(),
            last_usable_lba: None,
        }
    }

    pub fn get(&self, index: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// Trailing metadata owned by the last GPT partition: the backup header
    /// and entry array right after the last usable LBA.
    pub fn backup_table(&self) -> Option<(u64, u64)> {
        match self.scheme {
            PartitionScheme::Gpt => self
                .last_usable_lba
                .map(|lba| (lba.saturating_add(1), GPT_BACKUP_SECTORS)),
            PartitionScheme::Mbr => None,
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[derive(Serialize)]
pub struct PartitionInfo {
    pub index: u32,
    pub os_index: Option<u32>,
    #[serde(rename = "type")]
    pub kind: String,
    pub chs_start: String,
    pub chs_end: String,
    pub size_mib: u64,
    pub start_sector: u64,
}

impl From<&Partition> for PartitionInfo {
    fn from(p: &Partition) -> Self {
        Self {
            index: p.index,
            os_index: p.os_index,
            kind: p.kind.to_string(),
            chs_start: p.chs_start.to_string(),
            chs_end: p.chs_end.to_string(),
            size_mib: p.size_bytes() / (1024 * 1024),
            start_sector: p.start,
        }
    }
}

#[derive(Serialize)]
pub struct DiskInfo {
    pub disk: String,
    pub scheme: PartitionScheme,
    pub partitions: Vec<PartitionInfo>,
}
