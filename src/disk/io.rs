use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

pub const SECTOR_SIZE: u64 = 512;

/// Sector-addressed reader over a raw device or image file.
///
/// I/O failures carry the device path and the byte offset being read.
pub struct SectorReader<R> {
    inner: R,
    path: PathBuf,
}

impl<R: Read + Seek> SectorReader<R> {
    pub fn new(inner: R, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io_at(&self.path, offset, e))?;
        self.inner.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::io_at(
                    &self.path,
                    offset,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("device ends before {} bytes could be read", len),
                    ),
                )
            } else {
                Error::io_at(&self.path, offset, e)
            }
        })?;
        Ok(buf)
    }

    pub fn read_sector(&mut self, lba: u64) -> Result<Vec<u8>> {
        let offset = lba_to_offset(lba)?;
        self.read_at(offset, SECTOR_SIZE as usize)
    }
}

pub fn lba_to_offset(lba: u64) -> Result<u64> {
    lba.checked_mul(SECTOR_SIZE)
        .ok_or_else(|| Error::invalid_layout(format!("sector {lba} is beyond addressable range")))
}

pub fn open_device(path: &Path) -> Result<SectorReader<File>> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    Ok(SectorReader::new(file, path))
}
