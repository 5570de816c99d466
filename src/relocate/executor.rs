//! Carries out a [`RelocationPlan`] phase by phase, journaling every change
//! so a failure or cancellation can be walked back.

use log::{debug, error, info, warn};
use std::cmp::Reverse;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::engine::{AccessMode, MoveProgress, MoveStatus, VirtualDiskEngine};
use super::host::{EntryKind, HostFs};
use super::model::{rebase, weight_for, MachineConfig, RelocationPlan, SnapshotFile, SNAPSHOTS_DIR};
use super::planner::{check_space, existing_ancestor};
use super::progress::{OperationHandle, ProgressCoordinator};
use super::registry::MachineStore;
use crate::error::{Error, Result};

/// External services a move works through.
pub struct Collaborators<'a> {
    pub fs: &'a dyn HostFs,
    pub engine: &'a mut dyn VirtualDiskEngine,
    pub store: &'a mut dyn MachineStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MoveDisks,
    MoveSaveStates,
    MoveNvram,
    UpdateStatePaths,
    UpdateNvramPaths,
    CopySettingsFile,
    CopyLogs,
    CommitSettings,
}

impl Phase {
    /// Phases that are undone if anything fails.
    pub const FORWARD: [Phase; 8] = [
        Phase::MoveDisks,
        Phase::MoveSaveStates,
        Phase::MoveNvram,
        Phase::UpdateStatePaths,
        Phase::UpdateNvramPaths,
        Phase::CopySettingsFile,
        Phase::CopyLogs,
        Phase::CommitSettings,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::MoveDisks => "move disks",
            Phase::MoveSaveStates => "move save states",
            Phase::MoveNvram => "move NVRAM files",
            Phase::UpdateStatePaths => "update state paths",
            Phase::UpdateNvramPaths => "update NVRAM paths",
            Phase::CopySettingsFile => "copy settings file",
            Phase::CopyLogs => "copy logs",
            Phase::CommitSettings => "commit settings",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct MovedMedium {
    id: String,
    from: PathBuf,
    to: PathBuf,
}

#[derive(Debug)]
struct CopiedFile {
    from: PathBuf,
    to: PathBuf,
}

#[derive(Debug, Default)]
struct Journal {
    created_dirs: Vec<PathBuf>,
    moved_media: Vec<MovedMedium>,
    copies: Vec<CopiedFile>,
    /// (old, new) pairs applied to the machine configuration.
    rewrites: Vec<(PathBuf, PathBuf)>,
    original_settings: Option<PathBuf>,
    source_dirs: Vec<PathBuf>,
    settings_saved: bool,
    registry_updated: bool,
}

pub struct Executor<'a, 'b> {
    machine: &'a mut MachineConfig,
    plan: &'a RelocationPlan,
    env: &'a mut Collaborators<'b>,
    progress: &'a ProgressCoordinator,
    poll_interval: Duration,
    space_margin: u64,
    journal: Journal,
}

impl<'a, 'b> Executor<'a, 'b> {
    pub fn new(
        machine: &'a mut MachineConfig,
        plan: &'a RelocationPlan,
        env: &'a mut Collaborators<'b>,
        progress: &'a ProgressCoordinator,
        poll_interval: Duration,
        space_margin: u64,
    ) -> Self {
        Self {
            machine,
            plan,
            env,
            progress,
            poll_interval,
            space_margin,
            journal: Journal::default(),
        }
    }

    pub fn run(mut self) -> Result<()> {
        match self.forward() {
            Ok(()) => {
                self.delete_originals();
                info!(
                    "Machine {} moved to {}",
                    self.machine.name,
                    self.plan.target_root.display()
                );
                Ok(())
            }
            Err(err) => {
                error!("Moving machine {} failed: {}", self.machine.name, err);
                self.progress.skip_to(self.plan.budget.forward.operations);
                match self.rollback() {
                    Ok(()) => {
                        info!("Rolled back machine {}", self.machine.name);
                        Err(err)
                    }
                    Err(failures) => {
                        for f in &failures {
                            error!("Rollback: {f}");
                        }
                        Err(Error::RollbackFailed {
                            original: Box::new(err),
                            failures,
                        })
                    }
                }
            }
        }
    }

    fn forward(&mut self) -> Result<()> {
        self.recheck_space()?;
        for phase in Phase::FORWARD {
            self.progress.check_cancelled()?;
            debug!("phase: {phase}");
            match phase {
                Phase::MoveDisks => self.move_disks()?,
                Phase::MoveSaveStates => {
                    let plan = self.plan;
                    self.copy_snapshot_files(&plan.state_files, "saved state")?;
                }
                Phase::MoveNvram => {
                    let plan = self.plan;
                    self.copy_snapshot_files(&plan.nvram_files, "NVRAM file")?;
                }
                Phase::UpdateStatePaths => {
                    let plan = self.plan;
                    self.rewrite_paths(&plan.state_files);
                    let snapshot_folder = self.machine.snapshot_folder.clone();
                    if snapshot_folder.starts_with(&plan.source_root) {
                        self.rewrite(&snapshot_folder, &plan.target_root.join(SNAPSHOTS_DIR));
                    }
                }
                Phase::UpdateNvramPaths => {
                    let plan = self.plan;
                    self.rewrite_paths(&plan.nvram_files);
                }
                Phase::CopySettingsFile => self.copy_settings()?,
                Phase::CopyLogs => self.copy_logs()?,
                Phase::CommitSettings => self.commit_settings()?,
            }
        }
        Ok(())
    }

    fn recheck_space(&self) -> Result<()> {
        let dir = existing_ancestor(self.env.fs, &self.plan.target_root)?;
        let space = self.env.fs.free_space(&dir)?;
        check_space(&space, self.plan.total_bytes, self.space_margin, &dir)
    }

    fn ensure_dir(&mut self, dir: &Path) -> Result<()> {
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && !self.env.fs.exists(p))
            .map(Path::to_path_buf)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.env.fs.create_dir_all(dir)?;
        self.journal.created_dirs.extend(missing.into_iter().rev());
        Ok(())
    }

    fn ensure_parent(&mut self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) => self.ensure_dir(parent),
            None => Ok(()),
        }
    }

    fn move_disks(&mut self) -> Result<()> {
        let plan = self.plan;
        self.ensure_dir(&plan.target_root)?;
        for item in plan.media() {
            self.progress.check_cancelled()?;
            self.ensure_parent(&item.destination)?;
            let op = self
                .progress
                .next_operation(format!("Moving disk image {}", display_name(&item.source)), item.weight);
            self.move_image(&item.source, &item.destination, op, true)?;
            self.journal.moved_media.push(MovedMedium {
                id: item.id.clone(),
                from: item.source.clone(),
                to: item.destination.clone(),
            });
            self.machine.set_medium_location(&item.id, &item.destination);
            info!(
                "Moved {} to {}",
                item.source.display(),
                item.destination.display()
            );
        }
        Ok(())
    }

    fn move_image(&mut self, from: &Path, to: &Path, op: OperationHandle, honor_cancel: bool) -> Result<()> {
        let handle = self.env.engine.open(from, AccessMode::ReadWrite)?;
        let result = self
            .env
            .engine
            .move_to(&handle, to)
            .and_then(|mut task| self.wait_for_move(task.as_mut(), op, honor_cancel));
        self.env.engine.close(handle);
        result
    }

    fn wait_for_move(&self, task: &mut dyn MoveProgress, op: OperationHandle, honor_cancel: bool) -> Result<()> {
        loop {
            match task.poll()? {
                MoveStatus::Done => {
                    self.progress.set_percent(op, 100);
                    return Ok(());
                }
                MoveStatus::Running { percent } => {
                    self.progress.set_percent(op, percent);
                    if honor_cancel && self.progress.is_cancelled() {
                        task.cancel();
                        return Err(Error::Cancelled);
                    }
                    thread::sleep(self.poll_interval);
                }
            }
        }
    }

    fn copy(&mut self, from: &Path, to: &Path, op: OperationHandle) -> Result<()> {
        let progress = self.progress;
        self.env.fs.copy_file(from, to, &mut |percent| {
            progress.set_percent(op, percent);
            !progress.is_cancelled()
        })?;
        self.journal.copies.push(CopiedFile {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }

    fn copy_snapshot_files(&mut self, files: &[SnapshotFile], what: &str) -> Result<()> {
        for file in files {
            self.progress.check_cancelled()?;
            self.ensure_parent(&file.destination)?;
            let op = self
                .progress
                .next_operation(format!("Copying {what} {}", display_name(&file.source)), file.weight);
            self.copy(&file.source, &file.destination, op)?;
            debug!("{} of {} copied", what, file.owner);
        }
        Ok(())
    }

    fn rewrite(&mut self, old: &Path, new: &Path) {
        if self.machine.replace_path(old, new) > 0 {
            self.journal.rewrites.push((old.to_path_buf(), new.to_path_buf()));
        }
    }

    fn rewrite_paths(&mut self, files: &[SnapshotFile]) {
        for file in files {
            self.rewrite(&file.source, &file.destination);
        }
    }

    fn copy_settings(&mut self) -> Result<()> {
        let source = self.machine.settings_file.clone();
        let destination = match source.file_name() {
            Some(name) => self.plan.target_root.join(name),
            None => return Err(Error::invalid_argument("machine has no settings file name")),
        };
        let op = self
            .progress
            .next_operation("Copying settings file", weight_for(self.plan.settings_size));
        self.copy(&source, &destination, op)
    }

    fn copy_logs(&mut self) -> Result<()> {
        let plan = self.plan;
        let Some(log_src) = plan.folders.log.as_deref() else {
            return Ok(());
        };
        let log_dst = rebase(log_src, &plan.source_root, &plan.target_root);
        let entries = self.env.fs.list_recursive(log_src)?;
        self.ensure_dir(&log_dst)?;

        for entry in entries {
            self.progress.check_cancelled()?;
            let path = entry.path();
            let dst = match path.strip_prefix(log_src) {
                Ok(rel) => log_dst.join(rel),
                Err(_) => log_dst.join(&entry.name),
            };
            match entry.kind {
                EntryKind::Directory => {
                    self.ensure_dir(&dst)?;
                    self.journal.source_dirs.push(path);
                }
                EntryKind::File => {
                    let size = self.env.fs.file_size(&path)?;
                    let op = self
                        .progress
                        .next_operation(format!("Copying log {}", display_name(&path)), weight_for(size));
                    self.copy(&path, &dst, op)?;
                }
                EntryKind::Other => debug!("skipping {}", path.display()),
            }
        }
        self.journal.source_dirs.push(log_src.to_path_buf());

        if self.machine.log_folder.is_some() {
            self.rewrite(log_src, &log_dst);
        }
        Ok(())
    }

    fn commit_settings(&mut self) -> Result<()> {
        self.journal.settings_saved = true;
        self.env.store.save_settings(self.machine)?;

        let old = self.machine.settings_file.clone();
        let new = match old.file_name() {
            Some(name) => self.plan.target_root.join(name),
            None => return Err(Error::invalid_argument("machine has no settings file name")),
        };
        self.machine.settings_file = new;
        self.journal.original_settings = Some(old);
        self.env.store.save_settings(self.machine)?;

        self.journal.registry_updated = true;
        self.env.store.register(self.machine)?;
        self.env.store.save_registry()
    }

    /// Runs after the commit; failures only leave stale files behind and
    /// cancellation is no longer honoured.
    fn delete_originals(&mut self) {
        debug!("phase: delete originals");
        self.progress.next_operation("Removing original files", 1);
        for copy in &self.journal.copies {
            if let Err(e) = self.env.fs.remove_file(&copy.from) {
                warn!("Could not remove {}: {}", copy.from.display(), e);
            }
        }

        let root = &self.plan.source_root;
        let mut dirs: Vec<PathBuf> = self
            .journal
            .copies
            .iter()
            .map(|c| c.from.as_path())
            .chain(self.journal.moved_media.iter().map(|m| m.from.as_path()))
            .filter_map(Path::parent)
            .map(Path::to_path_buf)
            .chain(self.journal.source_dirs.iter().cloned())
            .chain(self.plan.folders.snapshot.iter().cloned())
            .filter(|d| d.starts_with(root) && d != root)
            .collect();
        dirs.sort_by_key(|d| (Reverse(d.components().count()), d.clone()));
        dirs.dedup();
        dirs.push(root.clone());

        for dir in dirs {
            match self.env.fs.remove_dir_if_empty(&dir) {
                Ok(true) => debug!("removed {}", dir.display()),
                Ok(false) => {
                    if self.env.fs.exists(&dir) {
                        info!("{} still has other files, left in place", dir.display());
                    }
                }
                Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
            }
        }
    }

    fn rollback(&mut self) -> std::result::Result<(), Vec<String>> {
        let mut failures = Vec::new();

        for moved in mem::take(&mut self.journal.moved_media).iter().rev() {
            let op = self
                .progress
                .next_operation(format!("Restoring disk image {}", display_name(&moved.from)), 1);
            match self.move_image(&moved.to, &moved.from, op, false) {
                Ok(()) => {
                    self.machine.set_medium_location(&moved.id, &moved.from);
                }
                Err(e) => failures.push(format!("restore {}: {}", moved.from.display(), e)),
            }
        }

        for (old, new) in mem::take(&mut self.journal.rewrites).iter().rev() {
            self.machine.replace_path(new, old);
        }
        if let Some(original) = self.journal.original_settings.take() {
            self.machine.settings_file = original;
        }

        for copy in mem::take(&mut self.journal.copies).iter().rev() {
            self.progress
                .next_operation(format!("Removing {}", copy.to.display()), 1);
            if let Err(e) = self.env.fs.remove_file(&copy.to) {
                failures.push(format!("remove {}: {}", copy.to.display(), e));
            }
        }

        for dir in mem::take(&mut self.journal.created_dirs).iter().rev() {
            if let Err(e) = self.env.fs.remove_dir_if_empty(dir) {
                failures.push(format!("remove {}: {}", dir.display(), e));
            }
        }

        if self.journal.settings_saved {
            self.progress.next_operation("Restoring machine settings", 1);
            if let Err(e) = self.env.store.save_settings(self.machine) {
                failures.push(format!("restore settings {}: {}", self.machine.settings_file.display(), e));
            }
            if self.journal.registry_updated {
                let registry = self
                    .env
                    .store
                    .register(self.machine)
                    .and_then(|()| self.env.store.save_registry());
                if let Err(e) = registry {
                    failures.push(format!("restore registry: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
