//! Host filesystem operations the relocation needs, behind a trait so tests
//! can inject failures.

use log::debug;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub total: u64,
    pub free: u64,
    pub block_size: u64,
    pub sector_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsProperties {
    pub remote: bool,
    pub read_only: bool,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub parent: PathBuf,
    pub name: OsString,
    pub kind: EntryKind,
}

impl WalkEntry {
    pub fn path(&self) -> PathBuf {
        self.parent.join(&self.name)
    }
}

pub trait HostFs {
    fn free_space(&self, path: &Path) -> Result<SpaceInfo>;

    fn properties(&self, path: &Path) -> Result<FsProperties>;

    /// Create and remove a temporary file in `dir`.
    fn write_probe(&self, dir: &Path) -> Result<()>;

    /// Every entry below `dir`, parents before children.
    fn list_recursive(&self, dir: &Path) -> Result<Vec<WalkEntry>>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    fn exists(&self, path: &Path) -> bool;

    /// Copy `src` to a new file `dst`. `progress` receives the completed
    /// percentage after each chunk; returning false aborts the copy with
    /// `Error::Cancelled`. A partially written `dst` is removed on failure.
    fn copy_file(
        &self,
        src: &Path,
        dst: &Path,
        progress: &mut dyn FnMut(u32) -> bool,
    ) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Returns false if the directory is missing or still has entries.
    fn remove_dir_if_empty(&self, path: &Path) -> Result<bool>;
}

/// The real host filesystem.
#[derive(Debug, Clone)]
pub struct LocalFs {
    chunk_size: usize,
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl LocalFs {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(4096),
        }
    }

    fn copy_chunks(
        &self,
        src: &Path,
        dst: &Path,
        out: &mut File,
        progress: &mut dyn FnMut(u32) -> bool,
    ) -> Result<()> {
        let mut input = File::open(src).map_err(|e| Error::io(src, e))?;
        let total = input.metadata().map_err(|e| Error::io(src, e))?.len();
        let mut buf = vec![0u8; self.chunk_size];
        let mut copied = 0u64;

        loop {
            let n = input.read(&mut buf).map_err(|e| Error::io_at(src, copied, e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| Error::io_at(dst, copied, e))?;
            copied += n as u64;
            let percent = if total == 0 { 100 } else { (copied * 100 / total).min(100) as u32 };
            if !progress(percent) {
                return Err(Error::Cancelled);
            }
        }
        out.sync_all().map_err(|e| Error::io(dst, e))?;

        if let Ok(meta) = fs::metadata(src) {
            let _ = fs::set_permissions(dst, meta.permissions());
        }
        Ok(())
    }
}

impl HostFs for LocalFs {
    fn free_space(&self, path: &Path) -> Result<SpaceInfo> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| Error::io(path, io::Error::from(e)))?;
        let fragment = stat.fragment_size() as u64;
        Ok(SpaceInfo {
            total: stat.blocks() as u64 * fragment,
            free: stat.blocks_available() as u64 * fragment,
            block_size: stat.block_size() as u64,
            sector_size: 512,
        })
    }

    fn properties(&self, path: &Path) -> Result<FsProperties> {
        use nix::sys::statvfs::{statvfs, FsFlags};

        let stat = statvfs(path).map_err(|e| Error::io(path, io::Error::from(e)))?;
        Ok(FsProperties {
            remote: is_remote(path),
            read_only: stat.flags().contains(FsFlags::ST_RDONLY),
            compressed: false,
        })
    }

    fn write_probe(&self, dir: &Path) -> Result<()> {
        let probe = tempfile::Builder::new()
            .prefix(".vmtool-probe-")
            .tempfile_in(dir)
            .map_err(|e| Error::PermissionDenied {
                path: dir.to_path_buf(),
                reason: format!("cannot create files: {e}"),
            })?;
        debug!("write probe {} ok", probe.path().display());
        probe.close().map_err(|e| Error::io(dir, e))
    }

    fn list_recursive(&self, dir: &Path) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                Error::io(path, io::Error::other(e.to_string()))
            })?;
            let kind = if entry.file_type().is_dir() {
                EntryKind::Directory
            } else if entry.file_type().is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            entries.push(WalkEntry {
                parent: entry.path().parent().unwrap_or(dir).to_path_buf(),
                name: entry.file_name().to_os_string(),
                kind,
            });
        }
        Ok(entries)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| Error::io(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn copy_file(
        &self,
        src: &Path,
        dst: &Path,
        progress: &mut dyn FnMut(u32) -> bool,
    ) -> Result<()> {
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst)
            .map_err(|e| Error::io(dst, e))?;

        let result = self.copy_chunks(src, dst, &mut out, progress);
        drop(out);
        if result.is_err() {
            let _ = fs::remove_file(dst);
        }
        result
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| Error::io(path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| Error::io(path, e))
    }

    fn remove_dir_if_empty(&self, path: &Path) -> Result<bool> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(false),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

#[cfg(target_os = "linux")]
fn is_remote(path: &Path) -> bool {
    use nix::sys::statfs::{statfs, NFS_SUPER_MAGIC, SMB_SUPER_MAGIC};

    match statfs(path) {
        Ok(stat) => {
            let fs_type = stat.filesystem_type();
            fs_type == NFS_SUPER_MAGIC || fs_type == SMB_SUPER_MAGIC
        }
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_remote(_path: &Path) -> bool {
    false
}
