//! `shardline clean` - remove scratch branches left by interrupted runs

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use comfy_table::Cell;
use shardline_store::{Location, TEMP_BRANCH_SUFFIX};

use super::table;

/// A `{branch}_temp` directory and the scratch datasets inside it.
#[derive(Debug)]
pub struct TempBranch {
    pub branch: String,
    pub path: PathBuf,
    pub datasets: Vec<String>,
}

/// Every scratch branch of the configured project, sorted by name.
pub fn temp_branches(location: &Location) -> Result<Vec<TempBranch>> {
    let project_dir = location.root.join(&location.project);
    if !project_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(&project_dir)? {
        let entry = entry?;
        let branch = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() || !branch.ends_with(TEMP_BRANCH_SUFFIX) {
            continue;
        }
        let mut datasets = Vec::new();
        for sub in fs::read_dir(entry.path())? {
            let sub = sub?;
            if sub.path().is_dir() {
                datasets.push(sub.file_name().to_string_lossy().into_owned());
            }
        }
        datasets.sort();
        found.push(TempBranch {
            branch,
            path: entry.path(),
            datasets,
        });
    }
    found.sort_by(|a, b| a.branch.cmp(&b.branch));
    Ok(found)
}

pub fn run(location: &Location, confirm: bool) -> Result<()> {
    let branches = temp_branches(location)?;
    if branches.is_empty() {
        eprintln!("Nothing to clean up.");
        return Ok(());
    }

    if !confirm {
        let mut t = table(&["Branch", "Scratch datasets"]);
        for b in &branches {
            t.add_row(vec![Cell::new(&b.branch), Cell::new(b.datasets.join("\n"))]);
        }
        eprintln!("\nWould remove {} scratch branches:", branches.len());
        eprintln!("{t}");
        eprintln!("Run with --confirm to actually delete.");
        return Ok(());
    }

    for b in &branches {
        fs::remove_dir_all(&b.path)
            .with_context(|| format!("Failed to remove {}", b.path.display()))?;
        log::debug!("removed {} ({} datasets)", b.path.display(), b.datasets.len());
    }
    eprintln!("Removed {} scratch branches:", branches.len());
    for b in &branches {
        eprintln!("  {}", b.branch);
    }
    Ok(())
}
