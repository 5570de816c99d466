//! Virtual disk engine: format detection, sizing and asynchronous moves of
//! disk images.

use log::debug;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::model::DeviceKind;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub name: String,
    /// The engine can write new images of this format.
    pub creatable: bool,
    /// Backed by a host file rather than a network target.
    pub file_based: bool,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DiskHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStatus {
    Running { percent: u32 },
    Done,
}

/// A move started by [`VirtualDiskEngine::move_to`]. Work advances on each
/// `poll`.
pub trait MoveProgress {
    fn poll(&mut self) -> Result<MoveStatus>;

    /// Stop the move and leave the image at its original location.
    fn cancel(&mut self);
}

pub trait VirtualDiskEngine {
    fn open(&mut self, path: &Path, mode: AccessMode) -> Result<DiskHandle>;

    fn format_and_kind(&self, path: &Path) -> Result<(FormatInfo, DeviceKind)>;

    fn size(&self, handle: &DiskHandle) -> Result<u64>;

    fn move_to(&mut self, handle: &DiskHandle, new_location: &Path) -> Result<Box<dyn MoveProgress>>;

    fn close(&mut self, handle: DiskHandle);
}

struct KnownFormat {
    extensions: &'static [&'static str],
    name: &'static str,
    creatable: bool,
    device: DeviceKind,
}

const FORMATS: &[KnownFormat] = &[
    KnownFormat { extensions: &["vdi"], name: "VDI", creatable: true, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["vmdk"], name: "VMDK", creatable: true, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["vhd"], name: "VHD", creatable: true, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["qed"], name: "QED", creatable: true, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["img", "raw"], name: "RAW", creatable: true, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["vhdx"], name: "VHDX", creatable: false, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["hdd"], name: "Parallels", creatable: false, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["qcow", "qcow2"], name: "QCOW", creatable: false, device: DeviceKind::HardDisk },
    KnownFormat { extensions: &["iso"], name: "RAW", creatable: true, device: DeviceKind::Dvd },
    KnownFormat { extensions: &["dmg"], name: "DMG", creatable: false, device: DeviceKind::Dvd },
];

/// Images are plain host files; the format is taken from the extension and
/// network targets are recognised by a `scheme://` prefix.
#[derive(Debug, Default)]
pub struct FileDiskEngine {
    next_handle: u64,
    open: HashMap<u64, PathBuf>,
}

impl FileDiskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn path_of(&self, handle: &DiskHandle) -> Result<&PathBuf> {
        self.open.get(&handle.0).ok_or_else(|| Error::DiskEngine {
            path: PathBuf::new(),
            reason: format!("stale disk handle {}", handle.0),
        })
    }
}

fn is_network(path: &Path) -> bool {
    path.to_str().is_some_and(|s| s.contains("://"))
}

impl VirtualDiskEngine for FileDiskEngine {
    fn open(&mut self, path: &Path, mode: AccessMode) -> Result<DiskHandle> {
        if !is_network(path) {
            let mut opts = OpenOptions::new();
            opts.read(true).write(mode == AccessMode::ReadWrite);
            opts.open(path).map_err(|e| Error::io(path, e))?;
        }
        self.next_handle += 1;
        self.open.insert(self.next_handle, path.to_path_buf());
        debug!("opened {} as disk {}", path.display(), self.next_handle);
        Ok(DiskHandle(self.next_handle))
    }

    fn format_and_kind(&self, path: &Path) -> Result<(FormatInfo, DeviceKind)> {
        if is_network(path) {
            let info = FormatInfo {
                name: "iSCSI".to_string(),
                creatable: false,
                file_based: false,
            };
            return Ok((info, DeviceKind::HardDisk));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let known = FORMATS
            .iter()
            .find(|f| f.extensions.contains(&ext.as_str()))
            .ok_or_else(|| Error::DiskEngine {
                path: path.to_path_buf(),
                reason: "unrecognised image format".to_string(),
            })?;
        let info = FormatInfo {
            name: known.name.to_string(),
            creatable: known.creatable,
            file_based: true,
        };
        Ok((info, known.device))
    }

    fn size(&self, handle: &DiskHandle) -> Result<u64> {
        let path = self.path_of(handle)?;
        if is_network(path) {
            return Ok(0);
        }
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| Error::io(path, e))
    }

    fn move_to(&mut self, handle: &DiskHandle, new_location: &Path) -> Result<Box<dyn MoveProgress>> {
        let src = self.path_of(handle)?.clone();
        if is_network(&src) {
            return Err(Error::DiskEngine {
                path: src,
                reason: "network images cannot be moved".to_string(),
            });
        }
        if new_location.exists() {
            return Err(Error::io(
                new_location,
                io::Error::new(io::ErrorKind::AlreadyExists, "destination image exists"),
            ));
        }
        self.open.insert(handle.0, new_location.to_path_buf());
        Ok(Box::new(FileMove {
            src,
            dst: new_location.to_path_buf(),
            stage: Stage::Pending,
        }))
    }

    fn close(&mut self, handle: DiskHandle) {
        self.open.remove(&handle.0);
    }
}

const MOVE_CHUNK: usize = 1024 * 1024;
const CHUNKS_PER_POLL: usize = 16;

enum Stage {
    Pending,
    Copying {
        input: File,
        output: File,
        copied: u64,
        total: u64,
    },
    Done,
    Cancelled,
}

/// Rename when possible, otherwise copy a few chunks per poll and delete the
/// source once the copy is complete.
struct FileMove {
    src: PathBuf,
    dst: PathBuf,
    stage: Stage,
}

impl FileMove {
    fn start(&mut self) -> Result<MoveStatus> {
        match fs::rename(&self.src, &self.dst) {
            Ok(()) => {
                self.stage = Stage::Done;
                return Ok(MoveStatus::Done);
            }
            Err(e) if !self.src.exists() => return Err(Error::io(&self.src, e)),
            Err(e) => debug!("rename {} failed ({e}), copying", self.src.display()),
        }

        let input = File::open(&self.src).map_err(|e| Error::io(&self.src, e))?;
        let total = input.metadata().map_err(|e| Error::io(&self.src, e))?.len();
        let output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.dst)
            .map_err(|e| Error::io(&self.dst, e))?;
        self.stage = Stage::Copying {
            input,
            output,
            copied: 0,
            total,
        };
        Ok(MoveStatus::Running { percent: 0 })
    }

    fn step(&mut self) -> Result<MoveStatus> {
        let Stage::Copying {
            input,
            output,
            copied,
            total,
        } = &mut self.stage
        else {
            return Ok(MoveStatus::Done);
        };

        let mut buf = vec![0u8; MOVE_CHUNK];
        for _ in 0..CHUNKS_PER_POLL {
            let n = input.read(&mut buf).map_err(|e| Error::io_at(&self.src, *copied, e))?;
            if n == 0 {
                output.sync_all().map_err(|e| Error::io(&self.dst, e))?;
                fs::remove_file(&self.src).map_err(|e| Error::io(&self.src, e))?;
                self.stage = Stage::Done;
                return Ok(MoveStatus::Done);
            }
            output
                .write_all(&buf[..n])
                .map_err(|e| Error::io_at(&self.dst, *copied, e))?;
            *copied += n as u64;
        }
        let percent = if *total == 0 { 99 } else { (*copied * 100 / *total).min(99) as u32 };
        Ok(MoveStatus::Running { percent })
    }

    fn discard_copy(&mut self) {
        if matches!(self.stage, Stage::Copying { .. }) {
            self.stage = Stage::Cancelled;
            let _ = fs::remove_file(&self.dst);
        }
    }
}

impl MoveProgress for FileMove {
    fn poll(&mut self) -> Result<MoveStatus> {
        let result = match self.stage {
            Stage::Pending => self.start(),
            Stage::Copying { .. } => self.step(),
            Stage::Done => Ok(MoveStatus::Done),
            Stage::Cancelled => Err(Error::Cancelled),
        };
        if result.is_err() {
            self.discard_copy();
        }
        result
    }

    fn cancel(&mut self) {
        self.discard_copy();
        if matches!(self.stage, Stage::Pending) {
            self.stage = Stage::Cancelled;
        }
    }
}
