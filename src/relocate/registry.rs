//! Persistence of machine settings and the global machine registry.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::model::MachineConfig;
use crate::error::{Error, Result};

pub trait MachineStore {
    /// Write `machine` to its `settings_file`.
    fn save_settings(&mut self, machine: &MachineConfig) -> Result<()>;

    /// Record the machine's current settings location in the registry and
    /// mark the registry modified.
    fn register(&mut self, machine: &MachineConfig) -> Result<()>;

    /// Persist the registry if it was modified.
    fn save_registry(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub settings_file: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    machines: BTreeMap<String, RegistryEntry>,
}

/// Registry kept as a TOML file mapping machine id to settings location.
#[derive(Debug)]
pub struct TomlRegistry {
    path: PathBuf,
    machines: BTreeMap<String, RegistryEntry>,
    modified: bool,
}

impl TomlRegistry {
    /// A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let machines = match fs::read_to_string(path) {
            Ok(text) => {
                let file: RegistryFile = toml::from_str(&text).map_err(|e| {
                    Error::invalid_argument(format!("malformed registry {}: {e}", path.display()))
                })?;
                file.machines
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::io(path, e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            machines,
            modified: false,
        })
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.machines.get(id)
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

impl MachineStore for TomlRegistry {
    fn save_settings(&mut self, machine: &MachineConfig) -> Result<()> {
        debug!("saving settings {}", machine.settings_file.display());
        machine.save()
    }

    fn register(&mut self, machine: &MachineConfig) -> Result<()> {
        let entry = RegistryEntry {
            name: machine.name.clone(),
            settings_file: machine.settings_file.clone(),
        };
        if self.machines.get(&machine.id) != Some(&entry) {
            self.machines.insert(machine.id.clone(), entry);
            self.modified = true;
        }
        Ok(())
    }

    fn save_registry(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }
        let file = RegistryFile {
            machines: self.machines.clone(),
        };
        let text = toml::to_string_pretty(&file)
            .map_err(|e| Error::invalid_argument(format!("cannot serialize registry: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(&self.path, text).map_err(|e| Error::io(&self.path, e))?;
        self.modified = false;
        info!("Machine registry saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relocate::model::MachineView;

    #[test]
    fn register_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.toml");
        let machine = MachineConfig {
            id: "m1".into(),
            name: "vm".into(),
            saved: false,
            snapshot_folder: dir.path().join("Snapshots"),
            log_folder: None,
            current: MachineView::default(),
            snapshots: Vec::new(),
            settings_file: dir.path().join("vm.vbox"),
        };

        let mut registry = TomlRegistry::load(&path).expect("empty registry");
        registry.register(&machine).expect("register");
        assert!(registry.is_modified());
        registry.save_registry().expect("save");
        assert!(!registry.is_modified());

        let reloaded = TomlRegistry::load(&path).expect("reload");
        assert_eq!(
            reloaded.get("m1").map(|e| e.settings_file.clone()),
            Some(machine.settings_file.clone())
        );
    }
}
