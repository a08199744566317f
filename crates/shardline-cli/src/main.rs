//! shardline - inspect and maintain sharded record datasets
//!
//! Lists, verifies and deletes datasets written by shardline pipelines,
//! and removes scratch branches left behind by interrupted runs.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Inspect and maintain sharded record datasets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./shardline.toml or ~/.config/shardline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage root (overrides [storage] root)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Project (overrides [storage] project)
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Branch (overrides [storage] branch)
    #[arg(short, long, global = true)]
    branch: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// List datasets on the branch
    Ls,
    /// Show a dataset's definition, lineage and stale dependencies
    Show {
        name: String,
    },
    /// Recompute shard checksums (default: every dataset on the branch)
    Verify {
        name: Option<String>,
    },
    /// Delete a dataset
    Delete {
        name: String,

        /// Actually delete (otherwise dry-run)
        #[arg(long)]
        confirm: bool,
    },
    /// Remove scratch branches left by interrupted runs
    Clean {
        /// Actually delete (otherwise dry-run)
        #[arg(long)]
        confirm: bool,
    },
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // No progress bars here: logs go straight to stderr
    shardline_core::init_logging(false, cli.debug, None);

    let mut config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    if let Some(project) = cli.project {
        config.storage.project = project;
    }
    if let Some(branch) = cli.branch {
        config.storage.branch = branch;
    }
    let location = config.location();

    match cli.command {
        Command::Ls => cmd::datasets::ls(&location),
        Command::Show { name } => cmd::datasets::show(&location, &name),
        Command::Verify { name } => cmd::verify::run(&location, name.as_deref()),
        Command::Delete { name, confirm } => cmd::datasets::delete(&location, &name, confirm),
        Command::Clean { confirm } => cmd::clean::run(&location, confirm),
        Command::Config => {
            let pipeline = config.pipeline_config();
            let mut table = cmd::table(&["Setting", "Value"]);

            table.add_row(vec![
                "Storage root",
                &config.storage.root.display().to_string(),
            ]);
            table.add_row(vec!["Project", &config.storage.project]);
            table.add_row(vec!["Branch", &config.storage.branch]);
            table.add_row(vec![
                "Workers",
                &format!(
                    "{} (configured: {}, max: {})",
                    pipeline.workers, config.workers.default, config.workers.max
                ),
            ]);
            table.add_row(vec![
                "Repo commit",
                if location.repo.commit_hash.is_empty() {
                    "not set"
                } else {
                    location.repo.commit_hash.as_str()
                },
            ]);
            table.add_row(vec![
                "Committer",
                if location.repo.committer_name.is_empty() {
                    "not set"
                } else {
                    location.repo.committer_name.as_str()
                },
            ]);

            eprintln!("\n{table}");
            Ok(())
        }
    }
}
