//! Works out what a machine move has to touch and whether the destination
//! can take it, without changing anything on disk.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::engine::{AccessMode, VirtualDiskEngine};
use super::host::{EntryKind, HostFs, SpaceInfo};
use super::model::{
    rebase, weight_for, DeviceKind, MachineConfig, Medium, MediumChain, MediumItem,
    RelocationPlan, SnapshotFile, SnapshotRef, SpecialFolders, SNAPSHOTS_DIR,
};
use super::progress::{Budget, ProgressBudget};
use crate::error::{Error, Result};

/// Longest destination path accepted, separator included.
pub const MAX_PATH_LEN: usize = 4096;

enum Support {
    Movable,
    Skip(String),
}

/// Plan moving `machine` so its settings folder becomes `target`.
pub fn plan_relocation(
    machine: &MachineConfig,
    target: &Path,
    fs: &dyn HostFs,
    engine: &mut dyn VirtualDiskEngine,
    space_margin: u64,
) -> Result<RelocationPlan> {
    let source_root = machine.settings_dir().to_path_buf();
    let target_root = normalize_target(target)?;
    if target_root.starts_with(&source_root) {
        return Err(Error::invalid_argument(format!(
            "destination {} is inside the machine folder {}",
            target_root.display(),
            source_root.display()
        )));
    }

    let probe_dir = existing_ancestor(fs, &target_root)?;
    let space = fs.free_space(&probe_dir)?;
    let props = fs.properties(&probe_dir)?;
    if props.read_only {
        return Err(Error::PermissionDenied {
            path: probe_dir,
            reason: "destination file system is read-only".to_string(),
        });
    }
    if props.remote {
        warn!(
            "Destination {} is on a network file system, the move may be slow",
            probe_dir.display()
        );
    }
    fs.write_probe(&probe_dir).map_err(|e| match e {
        Error::PermissionDenied { .. } => e,
        other => Error::PermissionDenied {
            path: probe_dir.clone(),
            reason: other.to_string(),
        },
    })?;

    let mut plan = PlanBuilder {
        machine,
        fs,
        source_root: source_root.clone(),
        target_root: target_root.clone(),
        chains: Vec::new(),
        state_files: Vec::new(),
        nvram_files: Vec::new(),
        seen_media: HashSet::new(),
        seen_files: HashSet::new(),
        destinations: HashSet::new(),
    };
    for (owner, view) in machine.views() {
        for att in &view.attachments {
            plan.add_chain(engine, att.device, &att.medium)?;
        }
        if let Some(state) = &view.state_file {
            plan.add_snapshot_file(&owner, state, true)?;
        }
        if let Some(nvram) = &view.nvram_file {
            plan.add_snapshot_file(&owner, nvram, false)?;
        }
    }

    let settings_size = fs.file_size(&machine.settings_file)?;
    let log_folder = machine.log_folder();
    let (log_files, log_bytes, log_weight) =
        if log_folder.starts_with(&source_root) && fs.exists(&log_folder) {
            summarize_logs(fs, &log_folder)?
        } else {
            (0, 0, 0)
        };

    let PlanBuilder {
        chains,
        state_files,
        nvram_files,
        ..
    } = plan;

    let media_bytes: u64 = chains.iter().flat_map(|c| &c.media).map(|m| m.size).sum();
    let media_weight: u64 = chains.iter().flat_map(|c| &c.media).map(|m| m.weight).sum();
    let media_count = chains.iter().map(|c| c.media.len()).sum::<usize>();
    let file_bytes: u64 = state_files.iter().chain(&nvram_files).map(|f| f.size).sum();
    let file_weight: u64 = state_files.iter().chain(&nvram_files).map(|f| f.weight).sum();

    let total_bytes = media_bytes + file_bytes + settings_size + log_bytes;
    check_space(&space, total_bytes, space_margin, &probe_dir)?;

    let mut forward = Budget::default();
    for m in chains.iter().flat_map(|c| &c.media) {
        forward.add(m.weight);
    }
    for f in state_files.iter().chain(&nvram_files) {
        forward.add(f.weight);
    }
    forward.add(weight_for(settings_size));
    forward.operations += log_files;
    forward.weight += log_weight;
    // Removing the originals once everything is committed.
    forward.add(1);

    let snapshot_folder = machine.snapshot_folder.clone();
    let folders = SpecialFolders {
        settings: source_root.clone(),
        log: (log_folder.starts_with(&source_root) && fs.exists(&log_folder))
            .then_some(log_folder),
        state: machine.saved.then(|| snapshot_folder.clone()),
        snapshot: fs.exists(&snapshot_folder).then_some(snapshot_folder),
    };

    let plan = RelocationPlan {
        machine_id: machine.id.clone(),
        source_root,
        target_root,
        chains,
        state_files,
        nvram_files,
        folders,
        settings_size,
        log_files,
        log_bytes,
        total_bytes,
        total_weight: 1 + media_weight + file_weight,
        // Every forward step can be undone by at most one step of the same
        // size, so the rollback mirrors the forward budget.
        budget: ProgressBudget {
            forward,
            rollback: forward,
        },
    };
    info!(
        "Planned move of {} to {}: {} disk image(s), {} state file(s), {} NVRAM file(s), {} log file(s), {} bytes",
        machine.name,
        plan.target_root.display(),
        media_count,
        plan.state_files.len(),
        plan.nvram_files.len(),
        plan.log_files,
        plan.total_bytes
    );
    Ok(plan)
}

/// Fails unless `free - needed` stays above `margin`.
pub fn check_space(space: &SpaceInfo, needed: u64, margin: u64, path: &Path) -> Result<()> {
    if space.free.saturating_sub(needed) <= margin {
        return Err(Error::InsufficientSpace {
            path: path.to_path_buf(),
            needed: needed.saturating_add(margin),
            available: space.free,
        });
    }
    Ok(())
}

/// Nearest existing directory at or above `path`.
pub fn existing_ancestor(fs: &dyn HostFs, path: &Path) -> Result<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && fs.exists(p))
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            Error::invalid_argument(format!("no existing parent for {}", path.display()))
        })
}

fn normalize_target(target: &Path) -> Result<PathBuf> {
    if target.as_os_str().is_empty() {
        return Err(Error::invalid_argument("destination path is empty"));
    }
    let absolute = std::path::absolute(target).map_err(|e| Error::io(target, e))?;
    let normalized: PathBuf = absolute.components().collect();
    if normalized.as_os_str().len() + 1 > MAX_PATH_LEN {
        return Err(Error::invalid_argument(format!(
            "destination path is longer than {MAX_PATH_LEN} bytes"
        )));
    }
    Ok(normalized)
}

fn summarize_logs(fs: &dyn HostFs, folder: &Path) -> Result<(u32, u64, u64)> {
    let mut count = 0u32;
    let mut bytes = 0u64;
    let mut weight = 0u64;
    for entry in fs.list_recursive(folder)? {
        if entry.kind != EntryKind::File {
            continue;
        }
        let size = fs.file_size(&entry.path())?;
        count += 1;
        bytes += size;
        weight += weight_for(size);
    }
    Ok((count, bytes, weight))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn classify(engine: &dyn VirtualDiskEngine, device: DeviceKind, medium: &Medium) -> Result<Support> {
    if device == DeviceKind::Dvd && !has_extension(&medium.location, "iso") {
        return Ok(Support::Skip("only ISO images are moved".to_string()));
    }
    let format = match engine.format_and_kind(&medium.location) {
        Ok((format, _)) => format,
        Err(Error::DiskEngine { reason, .. }) => return Ok(Support::Skip(reason)),
        Err(e) => return Err(e),
    };
    let support = match device {
        _ if !format.file_based => {
            Support::Skip(format!("{} image is not stored in a host file", format.name))
        }
        DeviceKind::HardDisk | DeviceKind::Floppy if !format.creatable => {
            Support::Skip(format!("{} images cannot be written", format.name))
        }
        DeviceKind::HardDisk | DeviceKind::Floppy | DeviceKind::Dvd => Support::Movable,
    };
    Ok(support)
}

struct PlanBuilder<'a> {
    machine: &'a MachineConfig,
    fs: &'a dyn HostFs,
    source_root: PathBuf,
    target_root: PathBuf,
    chains: Vec<MediumChain>,
    state_files: Vec<SnapshotFile>,
    nvram_files: Vec<SnapshotFile>,
    seen_media: HashSet<String>,
    seen_files: HashSet<PathBuf>,
    destinations: HashSet<PathBuf>,
}

impl PlanBuilder<'_> {
    fn claim_destination(&mut self, source: &Path, destination: &Path) -> Result<()> {
        if !self.destinations.insert(destination.to_path_buf()) {
            return Err(Error::invalid_argument(format!(
                "{} would overwrite another file moved to {}",
                source.display(),
                destination.display()
            )));
        }
        Ok(())
    }

    fn add_chain(
        &mut self,
        engine: &mut dyn VirtualDiskEngine,
        device: DeviceKind,
        leaf: &Medium,
    ) -> Result<()> {
        let chain = leaf.chain();
        let base_id = leaf.base().id.clone();
        let len = chain.len();

        for (depth, medium) in chain.into_iter().enumerate() {
            if self.seen_media.contains(&medium.id) {
                continue;
            }
            if !medium.location.starts_with(&self.source_root) {
                debug!(
                    "{} lives outside the machine folder, left in place",
                    medium.location.display()
                );
                self.seen_media.insert(medium.id.clone());
                continue;
            }
            if let Support::Skip(reason) = classify(engine, device, medium)? {
                info!("Skipping {} {}: {}", device, medium.location.display(), reason);
                self.seen_media.insert(medium.id.clone());
                continue;
            }

            let in_snapshot_folder = medium.location.starts_with(&self.machine.snapshot_folder);
            let destination = if in_snapshot_folder {
                file_under(&self.target_root.join(SNAPSHOTS_DIR), &medium.location)
            } else {
                rebase(&medium.location, &self.source_root, &self.target_root)
            };
            self.claim_destination(&medium.location, &destination)?;

            let handle = engine.open(&medium.location, AccessMode::ReadOnly)?;
            let size = engine.size(&handle);
            engine.close(handle);
            let size = size?;

            self.seen_media.insert(medium.id.clone());
            let item = MediumItem {
                id: medium.id.clone(),
                position: len - 1 - depth,
                source: medium.location.clone(),
                destination,
                size,
                weight: weight_for(size),
                in_snapshot_folder,
            };
            match self.chains.iter_mut().find(|c| c.id == base_id) {
                Some(existing) => existing.media.push(item),
                None => self.chains.push(MediumChain {
                    id: base_id.clone(),
                    media: vec![item],
                }),
            }
        }
        Ok(())
    }

    fn add_snapshot_file(&mut self, owner: &SnapshotRef, path: &Path, is_state: bool) -> Result<()> {
        if !path.starts_with(&self.source_root) {
            warn!(
                "{} of {} lives outside the machine folder, left in place",
                path.display(),
                owner
            );
            return Ok(());
        }
        if !self.seen_files.insert(path.to_path_buf()) {
            return Ok(());
        }

        let destination = match (owner, is_state) {
            (SnapshotRef::Current, false) => file_under(&self.target_root, path),
            _ => file_under(&self.target_root.join(SNAPSHOTS_DIR), path),
        };
        self.claim_destination(path, &destination)?;

        let size = self.fs.file_size(path)?;
        // Copied and then deleted, so these count twice.
        let file = SnapshotFile {
            owner: owner.clone(),
            source: path.to_path_buf(),
            destination,
            size,
            weight: 2 * weight_for(size),
        };
        if is_state {
            self.state_files.push(file);
        } else {
            self.nvram_files.push(file);
        }
        Ok(())
    }
}

fn file_under(dir: &Path, source: &Path) -> PathBuf {
    match source.file_name() {
        Some(name) => dir.join(name),
        None => dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_check_keeps_margin() {
        let space = SpaceInfo {
            total: 100 << 20,
            free: 10 << 20,
            block_size: 4096,
            sector_size: 512,
        };
        let mib = 1 << 20;
        assert!(check_space(&space, 8 * mib, mib, Path::new("/d")).is_ok());
        assert!(check_space(&space, 9 * mib, mib, Path::new("/d")).is_err());
        assert!(check_space(&space, 20 * mib, mib, Path::new("/d")).is_err());
    }

    #[test]
    fn target_is_normalized() {
        let t = normalize_target(Path::new("/srv/vms/new/")).expect("normalize");
        assert_eq!(t, Path::new("/srv/vms/new"));
        assert!(normalize_target(Path::new("")).is_err());

        let long = format!("/{}", "a".repeat(MAX_PATH_LEN));
        let err = normalize_target(Path::new(&long)).expect_err("too long");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
