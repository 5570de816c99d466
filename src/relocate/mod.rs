mod cli;
pub mod engine;
pub mod executor;
pub mod host;
pub mod model;
pub mod planner;
pub mod progress;
pub mod registry;

pub use cli::{run, MoveCli};
pub use executor::Collaborators;

use clap::ValueEnum;
use log::info;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::RelocateConfig;
use crate::error::{Error, Result};
use executor::Executor;
use model::MachineConfig;
use progress::ProgressCoordinator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum MoveType {
    /// Move disks, state files, settings and logs; delete the originals
    #[default]
    Basic,
}

impl FromStr for MoveType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(MoveType::Basic),
            other => Err(Error::invalid_argument(format!("unknown move type: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelocateOptions {
    pub move_type: MoveType,
    pub poll_interval: Duration,
    pub space_margin: u64,
}

impl Default for RelocateOptions {
    fn default() -> Self {
        Self::from(&RelocateConfig::default())
    }
}

impl From<&RelocateConfig> for RelocateOptions {
    fn from(config: &RelocateConfig) -> Self {
        Self {
            move_type: MoveType::Basic,
            poll_interval: config.poll_interval(),
            space_margin: config.space_margin(),
        }
    }
}

/// Move `machine` and the files it owns so its settings folder becomes
/// `target`. On failure everything already moved is put back. The outcome
/// is always recorded on `progress`.
pub fn relocate_machine(
    machine: &mut MachineConfig,
    target: &Path,
    env: &mut Collaborators<'_>,
    progress: &ProgressCoordinator,
    options: &RelocateOptions,
) -> Result<()> {
    let result = relocate_inner(machine, target, env, progress, options);
    progress.complete(&result);
    result
}

fn relocate_inner(
    machine: &mut MachineConfig,
    target: &Path,
    env: &mut Collaborators<'_>,
    progress: &ProgressCoordinator,
    options: &RelocateOptions,
) -> Result<()> {
    progress.check_cancelled()?;
    let plan = match options.move_type {
        MoveType::Basic => {
            planner::plan_relocation(machine, target, env.fs, &mut *env.engine, options.space_margin)?
        }
    };
    info!(
        "Moving machine {} ({} bytes) from {} to {}",
        machine.name,
        plan.total_bytes,
        plan.source_root.display(),
        plan.target_root.display()
    );
    progress.begin_budget(&plan.budget);
    Executor::new(
        machine,
        &plan,
        env,
        progress,
        options.poll_interval,
        options.space_margin,
    )
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_basic_moves_exist() {
        assert_eq!("Basic".parse::<MoveType>().expect("basic"), MoveType::Basic);
        let err = "full".parse::<MoveType>().expect_err("unknown type");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
