use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use vmtool::disk::load_partition_table;
use vmtool::disk::rawdisk::{ExtentKind, RawDiskBuilder};
use vmtool::disk::types::{MAX_PARTITIONS, PartitionScheme};
use vmtool::error::ErrorKind;

const SECTOR: usize = 512;

type Sector = [u8; SECTOR];

fn blank() -> Sector {
    [0u8; SECTOR]
}

fn sign(sector: &mut Sector) {
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

fn mbr_entry(sector: &mut Sector, slot: usize, kind: u8, start: u32, sectors: u32) {
    let off = 0x1BE + slot * 16;
    sector[off + 4] = kind;
    sector[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
    sector[off + 12..off + 16].copy_from_slice(&sectors.to_le_bytes());
}

/// Write `sectors` at their LBAs into a sparse image of `total` sectors.
fn write_image(dir: &TempDir, total: u64, sectors: &[(u64, Sector)]) -> PathBuf {
    let path = dir.path().join("disk.img");
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)
        .expect("create image");
    file.set_len(total * SECTOR as u64).expect("size image");
    for (lba, data) in sectors {
        file.seek(SeekFrom::Start(lba * SECTOR as u64)).expect("seek");
        file.write_all(data).expect("write sector");
    }
    path
}

fn kind_of(path: &Path) -> ErrorKind {
    load_partition_table(path, MAX_PARTITIONS)
        .expect_err("layout must be rejected")
        .kind()
}

/// Extended partition in slot 0 holding three logicals, one primary after it.
fn extended_layout(dir: &TempDir) -> PathBuf {
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x05, 2048, 6144);
    mbr_entry(&mut mbr, 1, 0x83, 8192, 2048);
    sign(&mut mbr);

    let ebr = |next: Option<u32>| {
        let mut s = blank();
        mbr_entry(&mut s, 0, 0x83, 1, 1000);
        if let Some(next) = next {
            mbr_entry(&mut s, 1, 0x05, next, 1025);
        }
        sign(&mut s);
        s
    };

    write_image(
        dir,
        10240,
        &[
            (0, mbr),
            (2048, ebr(Some(1024))),
            (3072, ebr(Some(2048))),
            (4096, ebr(None)),
        ],
    )
}

#[test]
fn mbr_partitions_come_back_sorted() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x83, 6144, 2048);
    mbr_entry(&mut mbr, 2, 0x07, 2048, 4096);
    sign(&mut mbr);
    let disk = write_image(&dir, 16, &[(0, mbr)]);

    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid table");
    assert_eq!(table.scheme, PartitionScheme::Mbr);
    let starts: Vec<u64> = table.partitions.iter().map(|p| p.start).collect();
    assert_eq!(starts, [2048, 6144]);

    let indices: Vec<u32> = table.partitions.iter().map(|p| p.index).collect();
    assert_eq!(indices, [3, 1]);
    assert_eq!(table.partitions[1].os_index, Some(1));
    assert_eq!(table.partitions[0].os_index, Some(2));

    // Everything before the first partition is table metadata.
    assert_eq!(table.partitions[0].table_start, 0);
    assert_eq!(table.partitions[0].table_sectors, 2048);
}

#[test]
fn logical_partitions_are_numbered_from_five() {
    let dir = TempDir::new().expect("temp dir");
    let disk = extended_layout(&dir);

    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid table");
    let layout: Vec<(u32, Option<u32>, u64)> = table
        .partitions
        .iter()
        .map(|p| (p.index, p.os_index, p.start))
        .collect();
    assert_eq!(
        layout,
        [
            (1, None, 2048),
            (5, Some(2), 2049),
            (6, Some(3), 3073),
            (7, Some(4), 4097),
            (2, Some(1), 8192),
        ]
    );

    // Each logical partition owns the EBR sector in front of it.
    let sixth = table.get(6).expect("partition 6");
    assert_eq!((sixth.table_start, sixth.table_sectors), (3072, 1));
}

#[test]
fn second_extended_partition_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x05, 2048, 2048);
    mbr_entry(&mut mbr, 1, 0x0F, 8192, 2048);
    sign(&mut mbr);
    let disk = write_image(&dir, 16, &[(0, mbr)]);

    let err = load_partition_table(&disk, MAX_PARTITIONS).expect_err("two extended");
    assert_eq!(err.kind(), ErrorKind::InvalidLayout);
    assert!(err.to_string().contains("more than one extended partition"));
}

#[test]
fn mbr_overlap_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x83, 2048, 4096);
    mbr_entry(&mut mbr, 1, 0x83, 4000, 100);
    sign(&mut mbr);
    let disk = write_image(&dir, 16, &[(0, mbr)]);

    let err = load_partition_table(&disk, MAX_PARTITIONS).expect_err("overlap");
    assert_eq!(err.kind(), ErrorKind::InvalidLayout);
    assert!(err.to_string().contains("MBR partition 2 overlaps partition 1"));
}

#[test]
fn broken_ebr_chain_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x05, 2048, 4096);
    sign(&mut mbr);
    let mut ebr = blank();
    mbr_entry(&mut ebr, 0, 0x83, 1, 100);
    mbr_entry(&mut ebr, 1, 0x83, 512, 100);
    sign(&mut ebr);
    let disk = write_image(&dir, 4096, &[(0, mbr), (2048, ebr)]);

    assert_eq!(kind_of(&disk), ErrorKind::InvalidLayout);
}

#[test]
fn looping_ebr_chain_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x05, 2048, 4096);
    sign(&mut mbr);
    let mut first = blank();
    mbr_entry(&mut first, 0, 0x83, 1, 100);
    mbr_entry(&mut first, 1, 0x05, 1024, 200);
    sign(&mut first);
    // Points back at the first EBR.
    let mut second = blank();
    mbr_entry(&mut second, 0, 0x83, 1, 100);
    mbr_entry(&mut second, 1, 0x05, 0, 200);
    sign(&mut second);
    let disk = write_image(&dir, 8192, &[(0, mbr), (2048, first), (3072, second)]);

    let err = load_partition_table(&disk, MAX_PARTITIONS).expect_err("loop");
    assert_eq!(err.kind(), ErrorKind::InvalidLayout);
    assert!(err.to_string().contains("loops"));
}

#[test]
fn missing_boot_signature_is_invalid() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x83, 2048, 100);
    let disk = write_image(&dir, 16, &[(0, mbr)]);

    assert_eq!(kind_of(&disk), ErrorKind::InvalidLayout);
}

struct GptPart {
    first: u64,
    last: u64,
}

fn gpt_image(dir: &TempDir, entry_count: u32, parts: &[GptPart], last_usable: u64) -> PathBuf {
    gpt_image_at(dir, 2, entry_count, parts, last_usable, &[])
}

/// GPT image whose entry array starts at `entry_lba`; `extra` sectors are
/// written as-is.
fn gpt_image_at(
    dir: &TempDir,
    entry_lba: u64,
    entry_count: u32,
    parts: &[GptPart],
    last_usable: u64,
    extra: &[(u64, Sector)],
) -> PathBuf {
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0xEE, 1, u32::MAX);
    sign(&mut mbr);

    let mut header = blank();
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[48..56].copy_from_slice(&last_usable.to_le_bytes());
    header[72..80].copy_from_slice(&entry_lba.to_le_bytes());
    header[80..84].copy_from_slice(&entry_count.to_le_bytes());
    header[84..88].copy_from_slice(&128u32.to_le_bytes());

    let mut sectors = vec![(0, mbr), (1, header)];
    sectors.extend_from_slice(extra);
    for (i, part) in parts.iter().enumerate() {
        let lba = entry_lba + (i * 128 / SECTOR) as u64;
        if sectors.iter().all(|(l, _)| *l != lba) {
            sectors.push((lba, blank()));
        }
        let (_, sector) = sectors
            .iter_mut()
            .find(|(l, _)| *l == lba)
            .expect("entry sector");
        let off = (i * 128) % SECTOR;
        sector[off] = 0xAF;
        sector[off + 1] = 0x3D;
        sector[off + 32..off + 40].copy_from_slice(&part.first.to_le_bytes());
        sector[off + 40..off + 48].copy_from_slice(&part.last.to_le_bytes());
    }

    let total = entry_lba + (entry_count as u64 * 128).div_ceil(SECTOR as u64);
    let total = sectors.iter().map(|(lba, _)| lba + 1).fold(total, u64::max);
    write_image(dir, total, &sectors)
}

#[test]
fn gpt_partitions_come_back_sorted() {
    let dir = TempDir::new().expect("temp dir");
    let disk = gpt_image(
        &dir,
        4,
        &[
            GptPart { first: 4096, last: 8191 },
            GptPart { first: 2048, last: 4095 },
        ],
        16000,
    );

    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid gpt");
    assert_eq!(table.scheme, PartitionScheme::Gpt);
    let layout: Vec<(u32, u64, u64)> = table
        .partitions
        .iter()
        .map(|p| (p.index, p.start, p.sectors))
        .collect();
    assert_eq!(layout, [(2, 2048, 2048), (1, 4096, 4096)]);
    assert_eq!(table.partitions[0].chs_start.cylinder, 0);
    assert_eq!(table.backup_table(), Some((16001, 33)));
}

#[test]
fn gpt_overlap_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let disk = gpt_image(
        &dir,
        4,
        &[
            GptPart { first: 34, last: 2081 },
            GptPart { first: 2000, last: 4000 },
        ],
        16000,
    );

    let err = load_partition_table(&disk, MAX_PARTITIONS).expect_err("overlap");
    assert_eq!(err.kind(), ErrorKind::InvalidLayout);
    assert!(err.to_string().contains("GPT partition 2 overlaps partition 1"));
}

#[test]
fn gpt_partition_may_not_reach_backup_table() {
    let dir = TempDir::new().expect("temp dir");
    let disk = gpt_image(&dir, 4, &[GptPart { first: 34, last: 20000 }], 16000);

    assert_eq!(kind_of(&disk), ErrorKind::InvalidLayout);
}

#[test]
fn gpt_entry_array_location_comes_from_the_header() {
    let dir = TempDir::new().expect("temp dir");
    // A stale entry at LBA 2 that must not be picked up.
    let mut stale = blank();
    stale[0] = 0xAF;
    stale[32..40].copy_from_slice(&5000u64.to_le_bytes());
    stale[40..48].copy_from_slice(&5999u64.to_le_bytes());
    let disk = gpt_image_at(
        &dir,
        8,
        4,
        &[GptPart { first: 2048, last: 4095 }],
        16000,
        &[(2, stale)],
    );

    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid gpt");
    let layout: Vec<(u32, u64, u64)> = table
        .partitions
        .iter()
        .map(|p| (p.index, p.start, p.sectors))
        .collect();
    assert_eq!(layout, [(1, 2048, 2048)]);
}

#[test]
fn gpt_backup_table_beyond_addressable_range_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let disk = gpt_image(&dir, 4, &[GptPart { first: 34, last: 100 }], u64::MAX - 4);

    let err = load_partition_table(&disk, MAX_PARTITIONS).expect_err("unaddressable backup");
    assert_eq!(err.kind(), ErrorKind::InvalidLayout);
    assert!(err.to_string().contains("backup GPT"));
}

#[test]
fn oversized_gpt_entry_array_fails_before_reading_it() {
    let dir = TempDir::new().expect("temp dir");
    // 65536 entries of 128 bytes is 8 MiB. The image holds only the
    // protective MBR and the header, so any attempt to read the array would
    // surface as an I/O error instead.
    let path = {
        let mut mbr = blank();
        mbr_entry(&mut mbr, 0, 0xEE, 1, u32::MAX);
        sign(&mut mbr);
        let mut header = blank();
        header[0..8].copy_from_slice(b"EFI PART");
        header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        header[48..56].copy_from_slice(&16000u64.to_le_bytes());
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        header[80..84].copy_from_slice(&65536u32.to_le_bytes());
        header[84..88].copy_from_slice(&128u32.to_le_bytes());
        write_image(&dir, 2, &[(0, mbr), (1, header)])
    };
    assert_eq!(std::fs::metadata(&path).expect("image").len(), 1024);

    assert_eq!(kind_of(&path), ErrorKind::InvalidLayout);
}

#[test]
fn unknown_gpt_revision_is_unsupported() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0xEE, 1, u32::MAX);
    sign(&mut mbr);
    let mut header = blank();
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0002_0000u32.to_le_bytes());
    let disk = write_image(&dir, 4, &[(0, mbr), (1, header)]);

    assert_eq!(kind_of(&disk), ErrorKind::UnsupportedLayout);
}

#[test]
fn partition_limit_is_enforced() {
    let dir = TempDir::new().expect("temp dir");
    let mut mbr = blank();
    mbr_entry(&mut mbr, 0, 0x83, 2048, 100);
    mbr_entry(&mut mbr, 1, 0x83, 4096, 100);
    sign(&mut mbr);
    let disk = write_image(&dir, 16, &[(0, mbr)]);

    let err = load_partition_table(&disk, 1).expect_err("over limit");
    assert_eq!(err.kind(), ErrorKind::InvalidLayout);
}

#[test]
fn extent_map_covers_the_disk_without_gaps() {
    let dir = TempDir::new().expect("temp dir");
    let disk = extended_layout(&dir);
    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid table");

    let descriptor = RawDiskBuilder::new(&disk, &table)
        .with_partitions(&[6])
        .build()
        .expect("descriptor");

    let mut cursor = 0;
    for extent in &descriptor.extents {
        assert_eq!(extent.start, cursor, "extent map has a gap or overlap");
        cursor = extent.start + extent.sectors;
    }
    assert_eq!(cursor, 8192 + 2048);

    let passed: Vec<_> = descriptor
        .extents
        .iter()
        .filter(|e| matches!(e.kind, ExtentKind::PassThrough { .. }))
        .collect();
    assert_eq!(passed.len(), 1);
    assert_eq!(passed[0].start, 3073);
    assert_eq!(
        passed[0].kind,
        ExtentKind::PassThrough {
            partition: 6,
            device_offset: 3073
        }
    );

    // EBR sectors of unselected logicals are still exposed as metadata.
    assert!(descriptor
        .extents
        .iter()
        .any(|e| e.start == 2048 && e.sectors == 1 && e.kind == ExtentKind::Metadata));

    let relative = RawDiskBuilder::new(&disk, &table)
        .with_partitions(&[6])
        .with_relative(true)
        .build()
        .expect("relative descriptor");
    assert!(relative.extents.iter().any(|e| e.kind
        == ExtentKind::PassThrough {
            partition: 6,
            device_offset: 0
        }));
}

#[test]
fn whole_disk_descriptor_has_no_extents() {
    let dir = TempDir::new().expect("temp dir");
    let disk = extended_layout(&dir);
    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid table");

    let descriptor = RawDiskBuilder::new(&disk, &table).build().expect("descriptor");
    assert!(descriptor.extents.is_empty());
    assert!(descriptor.partitions.is_empty());
}

#[test]
fn builder_rejects_bad_selections() {
    let dir = TempDir::new().expect("temp dir");
    let disk = extended_layout(&dir);
    let table = load_partition_table(&disk, MAX_PARTITIONS).expect("valid table");
    let build = |parts: &[u32], header: Option<Vec<u8>>, relative: bool| {
        let mut builder = RawDiskBuilder::new(&disk, &table)
            .with_partitions(parts)
            .with_relative(relative);
        if let Some(header) = header {
            builder = builder.with_header_override(header);
        }
        builder.build().expect_err("must be rejected").kind()
    };

    assert_eq!(build(&[9], None, false), ErrorKind::InvalidArgument);
    assert_eq!(build(&[1], None, false), ErrorKind::InvalidArgument);
    assert_eq!(build(&[5, 5], None, false), ErrorKind::InvalidArgument);
    assert_eq!(build(&[5], Some(vec![0; 100]), false), ErrorKind::InvalidArgument);
    assert_eq!(build(&[], Some(vec![0; 512]), false), ErrorKind::InvalidArgument);
    assert_eq!(build(&[], None, true), ErrorKind::InvalidArgument);

    let ok = RawDiskBuilder::new(&disk, &table)
        .with_partitions(&[5, 2])
        .with_header_override(vec![0; 512])
        .build()
        .expect("valid override");
    assert_eq!(ok.header_override.map(|h| h.len()), Some(512));
}
