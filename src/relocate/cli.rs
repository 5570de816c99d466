use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::PathBuf;

use super::engine::FileDiskEngine;
use super::host::LocalFs;
use super::model::{MachineConfig, RelocationPlan};
use super::planner::plan_relocation;
use super::progress::{CancelToken, ProgressCoordinator};
use super::registry::TomlRegistry;
use super::{relocate_machine, Collaborators, MoveType, RelocateOptions};
use crate::config::RelocateConfig;
use crate::utils::{confirm_or_yes, format_mib, parse_size, MIB};

#[derive(Parser, Debug)]
pub struct MoveCli {
    /// Machine settings file
    #[arg(long, value_name = "PATH")]
    pub machine: PathBuf,

    /// New machine folder
    #[arg(long, value_name = "DIR")]
    pub target: PathBuf,

    /// Move strategy
    #[arg(long = "type", value_enum, default_value_t = MoveType::Basic)]
    pub move_type: MoveType,

    /// Free space to keep at the destination, e.g. 64M (minimum 1M)
    #[arg(long, value_name = "SIZE")]
    pub margin: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

pub fn run(cli: MoveCli, config: Option<&RelocateConfig>) -> Result<()> {
    let defaults = RelocateConfig::default();
    let config = config.unwrap_or(&defaults);

    let mut options = RelocateOptions::from(config);
    options.move_type = cli.move_type;
    if let Some(margin) = cli.margin.as_deref() {
        options.space_margin = parse_size(margin)?.max(MIB);
    }

    let settings = std::path::absolute(&cli.machine)
        .with_context(|| format!("invalid machine path {}", cli.machine.display()))?;
    let mut machine = MachineConfig::load(&settings)?;
    let fs = LocalFs::new(config.copy_chunk_size());
    let mut engine = FileDiskEngine::new();
    let mut registry = TomlRegistry::load(&config.registry())?;

    let plan = plan_relocation(&machine, &cli.target, &fs, &mut engine, options.space_margin)?;
    print_plan(&machine, &plan);
    confirm_or_yes(
        cli.yes,
        &format!(
            "Move machine {} to {}?",
            machine.name,
            plan.target_root.display()
        ),
    )?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{msg} {spinner:.green} ({pos}%) [{bar:40.cyan/blue}] {elapsed}")?
            .progress_chars("=>-"),
    );
    let observer = bar.clone();
    let progress = ProgressCoordinator::new().with_observer(move |state| {
        observer.set_position(state.percent() as u64);
        observer.set_message(state.description.clone());
    });
    spawn_interrupt_listener(progress.cancel_token());

    let mut env = Collaborators {
        fs: &fs,
        engine: &mut engine,
        store: &mut registry,
    };
    let result = relocate_machine(&mut machine, &cli.target, &mut env, &progress, &options);
    bar.finish_and_clear();
    result?;

    info!(
        "Machine {} now lives in {}",
        machine.name,
        machine.settings_file.display()
    );
    Ok(())
}

fn print_plan(machine: &MachineConfig, plan: &RelocationPlan) {
    println!("Machine: {} ({})", machine.name, plan.machine_id);
    println!("From:    {}", plan.source_root.display());
    println!("To:      {}", plan.target_root.display());
    for item in plan.media() {
        println!(
            "  disk   {:>10}M  {}",
            format_mib(item.size),
            item.source.display()
        );
    }
    for file in plan.state_files.iter().chain(&plan.nvram_files) {
        println!(
            "  state  {:>10}M  {}",
            format_mib(file.size),
            file.source.display()
        );
    }
    if plan.log_files > 0 {
        println!(
            "  logs   {:>10}M  {} file(s)",
            format_mib(plan.log_bytes),
            plan.log_files
        );
    }
    println!("Total:   {}M", format_mib(plan.total_bytes));
}

/// Ctrl-C flips the cancel token; the move then rolls back.
fn spawn_interrupt_listener(token: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("Interrupt handling unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling move");
                token.cancel();
            }
        });
    });
}
