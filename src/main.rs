use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use vmtool::config::{self, AppConfig};
use vmtool::disk::{self, DiskCli};
use vmtool::relocate::{self, MoveCli};

#[derive(Parser)]
#[command(name = "vmtool")]
#[command(about = "Raw disk and virtual machine tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect host disk partitions and describe raw-disk images
    Disk(DiskCli),

    /// Move a virtual machine and its files to another folder
    Move(MoveCli),

    /// Generate configuration file (.vmtool.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logger, default info level, display file line number and time
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let app_config = if std::path::Path::new(config::CONFIG_FILE).exists() {
        match AppConfig::load_from_file(config::CONFIG_FILE) {
            Ok(cfg) => {
                let abs_path = std::fs::canonicalize(config::CONFIG_FILE)
                    .unwrap_or_else(|_| std::path::PathBuf::from(config::CONFIG_FILE));
                info!("Using configuration file: {}", abs_path.display());
                Some(cfg)
            }
            Err(e) => {
                error!("Failed to load configuration file: {}, using defaults", e);
                None
            }
        }
    } else {
        None
    };

    match cli.command {
        Commands::Disk(args) => {
            disk::run(args, app_config.as_ref().and_then(|c| c.disk.as_ref()))?;
        }

        Commands::Move(args) => {
            relocate::run(args, app_config.as_ref().and_then(|c| c.relocate.as_ref()))?;
        }

        Commands::Genconfig { force } => {
            if let Err(e) = AppConfig::generate_config_file(force) {
                error!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
