//! Machine configuration as persisted in its settings file, plus the
//! relocation plan derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::progress::ProgressBudget;
use crate::error::{Error, Result};

/// Folder under the machine root holding snapshot images and state files.
pub const SNAPSHOTS_DIR: &str = "Snapshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    HardDisk,
    Dvd,
    Floppy,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::HardDisk => f.write_str("hard disk"),
            DeviceKind::Dvd => f.write_str("DVD"),
            DeviceKind::Floppy => f.write_str("floppy"),
        }
    }
}

/// One image in a differencing chain. `parent` points towards the base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medium {
    pub id: String,
    pub location: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Medium>>,
}

impl Medium {
    /// Leaf first, base last.
    pub fn chain(&self) -> Vec<&Medium> {
        let mut out = vec![self];
        let mut cur = self;
        while let Some(parent) = cur.parent.as_deref() {
            out.push(parent);
            cur = parent;
        }
        out
    }

    pub fn base(&self) -> &Medium {
        let mut cur = self;
        while let Some(parent) = cur.parent.as_deref() {
            cur = parent;
        }
        cur
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut Medium)) {
        let mut cur = Some(self);
        while let Some(medium) = cur {
            f(medium);
            cur = medium.parent.as_deref_mut();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumAttachment {
    pub device: DeviceKind,
    pub medium: Medium,
}

/// Files and disks one machine state (current or snapshot) refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvram_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<MediumAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub view: MachineView,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotRef {
    Current,
    Snapshot(String),
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotRef::Current => f.write_str("current state"),
            SnapshotRef::Snapshot(id) => write!(f, "snapshot {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub id: String,
    pub name: String,
    /// Machine is powered off with its memory saved to `current.state_file`.
    #[serde(default)]
    pub saved: bool,
    pub snapshot_folder: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_folder: Option<PathBuf>,
    #[serde(default)]
    pub current: MachineView,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<Snapshot>,

    /// Where this configuration lives; not part of the file itself.
    #[serde(skip)]
    pub settings_file: PathBuf,
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut machine: MachineConfig = toml::from_str(&text).map_err(|e| {
            Error::invalid_argument(format!("malformed settings file {}: {e}", path.display()))
        })?;
        machine.settings_file = path.to_path_buf();
        Ok(machine)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::invalid_argument(format!("cannot serialize machine {}: {e}", self.name)))
    }

    /// Write the configuration to `settings_file`.
    pub fn save(&self) -> Result<()> {
        fs::write(&self.settings_file, self.to_toml()?).map_err(|e| Error::io(&self.settings_file, e))
    }

    pub fn settings_dir(&self) -> &Path {
        self.settings_file.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn log_folder(&self) -> PathBuf {
        self.log_folder
            .clone()
            .unwrap_or_else(|| self.settings_dir().join("Logs"))
    }

    /// Current state first, then snapshots depth-first.
    pub fn views(&self) -> Vec<(SnapshotRef, &MachineView)> {
        fn walk<'a>(snapshots: &'a [Snapshot], out: &mut Vec<(SnapshotRef, &'a MachineView)>) {
            for snap in snapshots {
                out.push((SnapshotRef::Snapshot(snap.id.clone()), &snap.view));
                walk(&snap.children, out);
            }
        }
        let mut out = vec![(SnapshotRef::Current, &self.current)];
        walk(&self.snapshots, &mut out);
        out
    }

    pub fn for_each_view_mut(&mut self, f: &mut dyn FnMut(&mut MachineView)) {
        fn walk(snapshots: &mut [Snapshot], f: &mut dyn FnMut(&mut MachineView)) {
            for snap in snapshots {
                f(&mut snap.view);
                walk(&mut snap.children, f);
            }
        }
        f(&mut self.current);
        walk(&mut self.snapshots, f);
    }

    /// Point every reference to medium `id` at `location`. Returns the
    /// number of references changed.
    pub fn set_medium_location(&mut self, id: &str, location: &Path) -> usize {
        let mut changed = 0;
        self.for_each_view_mut(&mut |view| {
            for att in &mut view.attachments {
                att.medium.for_each_mut(&mut |m| {
                    if m.id == id && m.location != location {
                        m.location = location.to_path_buf();
                        changed += 1;
                    }
                });
            }
        });
        changed
    }

    /// Replace every state, NVRAM or folder path equal to `from` with `to`.
    pub fn replace_path(&mut self, from: &Path, to: &Path) -> usize {
        let mut changed = 0;
        let mut swap = |p: &mut PathBuf| {
            if p.as_path() == from {
                *p = to.to_path_buf();
                changed += 1;
            }
        };
        swap(&mut self.snapshot_folder);
        if let Some(log) = self.log_folder.as_mut() {
            swap(log);
        }
        self.for_each_view_mut(&mut |view| {
            if let Some(p) = view.state_file.as_mut() {
                swap(p);
            }
            if let Some(p) = view.nvram_file.as_mut() {
                swap(p);
            }
        });
        changed
    }
}

/// `path` moved from under `from` to under `to`. Paths outside `from` are
/// re-based to their file name directly under `to`.
pub fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rel) => to.join(rel),
        Err(_) => match path.file_name() {
            Some(name) => to.join(name),
            None => to.to_path_buf(),
        },
    }
}

/// Progress weight of a file: its size in MiB rounded up, at least one.
pub fn weight_for(bytes: u64) -> u64 {
    bytes.div_ceil(crate::utils::MIB).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumItem {
    pub id: String,
    /// 0 is the base image.
    pub position: usize,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
    pub weight: u64,
    pub in_snapshot_folder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumChain {
    /// Id of the base image.
    pub id: String,
    /// Ordered leaf first, as it is moved.
    pub media: Vec<MediumItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub owner: SnapshotRef,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
    pub weight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialFolders {
    pub settings: PathBuf,
    pub log: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationPlan {
    pub machine_id: String,
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub chains: Vec<MediumChain>,
    pub state_files: Vec<SnapshotFile>,
    pub nvram_files: Vec<SnapshotFile>,
    pub folders: SpecialFolders,
    pub settings_size: u64,
    pub log_files: u32,
    pub log_bytes: u64,
    pub total_bytes: u64,
    /// 1 plus the weight of every planned item.
    pub total_weight: u64,
    pub budget: ProgressBudget,
}

impl RelocationPlan {
    pub fn media(&self) -> impl Iterator<Item = &MediumItem> {
        self.chains.iter().flat_map(|c| c.media.iter())
    }

    pub fn item_count(&self) -> usize {
        self.media().count() + self.state_files.len() + self.nvram_files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MachineConfig {
        let base = Medium {
            id: "base".into(),
            location: "/vms/a/a.vdi".into(),
            parent: None,
        };
        let diff = Medium {
            id: "diff".into(),
            location: "/vms/a/Snapshots/{d}.vdi".into(),
            parent: Some(Box::new(base.clone())),
        };
        MachineConfig {
            id: "m1".into(),
            name: "a".into(),
            saved: false,
            snapshot_folder: "/vms/a/Snapshots".into(),
            log_folder: None,
            current: MachineView {
                state_file: None,
                nvram_file: Some("/vms/a/a.nvram".into()),
                attachments: vec![MediumAttachment {
                    device: DeviceKind::HardDisk,
                    medium: diff,
                }],
            },
            snapshots: vec![Snapshot {
                id: "s1".into(),
                name: "first".into(),
                view: MachineView {
                    state_file: Some("/vms/a/Snapshots/s1.sav".into()),
                    nvram_file: None,
                    attachments: vec![MediumAttachment {
                        device: DeviceKind::HardDisk,
                        medium: base,
                    }],
                },
                children: Vec::new(),
            }],
            settings_file: "/vms/a/a.vbox".into(),
        }
    }

    #[test]
    fn chain_is_leaf_first() {
        let m = sample();
        let ids: Vec<_> = m.current.attachments[0]
            .medium
            .chain()
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, ["diff", "base"]);
        assert_eq!(m.current.attachments[0].medium.base().id, "base");
    }

    #[test]
    fn medium_location_updates_every_reference() {
        let mut m = sample();
        assert_eq!(m.set_medium_location("base", Path::new("/new/a.vdi")), 2);
        assert_eq!(m.snapshots[0].view.attachments[0].medium.location, Path::new("/new/a.vdi"));
    }

    #[test]
    fn replace_path_and_rebase() {
        let mut m = sample();
        let moved = rebase(Path::new("/vms/a/Snapshots/s1.sav"), Path::new("/vms/a"), Path::new("/dst"));
        assert_eq!(moved, Path::new("/dst/Snapshots/s1.sav"));
        assert_eq!(rebase(Path::new("/other/x.sav"), Path::new("/vms/a"), Path::new("/dst")), Path::new("/dst/x.sav"));

        assert_eq!(m.replace_path(Path::new("/vms/a/Snapshots/s1.sav"), &moved), 1);
        assert_eq!(m.snapshots[0].view.state_file.as_deref(), Some(moved.as_path()));
        assert_eq!(m.log_folder(), Path::new("/vms/a/Logs"));
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let m = sample();
        let text = m.to_toml().expect("serialize");
        let mut back: MachineConfig = toml::from_str(&text).expect("parse");
        back.settings_file = m.settings_file.clone();
        assert_eq!(back, m);
    }

    #[test]
    fn weights_round_up() {
        assert_eq!(weight_for(0), 1);
        assert_eq!(weight_for(1), 1);
        assert_eq!(weight_for(crate::utils::MIB + 1), 2);
    }
}
