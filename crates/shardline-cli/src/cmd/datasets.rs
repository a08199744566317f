//! `shardline ls`, `shardline show`, `shardline delete`

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color};
use shardline_store::{ChkFile, DatasetDesc, DefFile, Location, list_datasets, short_hash};

use super::table;

/// One line of `ls` output.
#[derive(Debug)]
pub struct DatasetRow {
    pub name: String,
    pub record_type: String,
    pub chunk_count: u32,
    pub complete: bool,
    pub created: String,
    pub dependencies: usize,
    pub stale: usize,
}

pub fn dataset_rows(location: &Location) -> Result<Vec<DatasetRow>> {
    let mut rows = Vec::new();
    for desc in list_datasets(location)? {
        let def = desc.read_def()?;
        let complete = desc.is_complete();
        let stale = if complete {
            desc.stale_dependencies()?.len()
        } else {
            0
        };
        rows.push(DatasetRow {
            name: desc.name.clone(),
            record_type: def.record_type,
            chunk_count: desc.chunk_count.count(),
            complete,
            created: def.creation_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            dependencies: def.dependencies.len(),
            stale,
        });
    }
    Ok(rows)
}

pub fn ls(location: &Location) -> Result<()> {
    let rows = dataset_rows(location)
        .with_context(|| format!("Failed to list {}", location.branch_dir().display()))?;

    if rows.is_empty() {
        eprintln!("No datasets in {}/{}.", location.project, location.branch);
        return Ok(());
    }

    let mut t = table(&["Name", "Type", "Shards", "Status", "Created", "Deps"]);
    for row in &rows {
        let status = if row.complete {
            Cell::new("complete").fg(Color::Green)
        } else {
            Cell::new("incomplete").fg(Color::Red)
        };
        let deps = if row.stale > 0 {
            Cell::new(format!("{} ({} stale)", row.dependencies, row.stale)).fg(Color::Yellow)
        } else {
            Cell::new(row.dependencies)
        };
        t.add_row(vec![
            Cell::new(&row.name),
            Cell::new(&row.record_type),
            Cell::new(row.chunk_count),
            status,
            Cell::new(&row.created),
            deps,
        ]);
    }

    eprintln!("\n{t}");
    eprintln!("{} datasets total", rows.len());
    Ok(())
}

/// Indented lineage, one dependency per line.
pub fn lineage_lines(def: &DefFile) -> Vec<String> {
    let mut lines = Vec::new();
    def.walk_lineage(|depth, dep| {
        lines.push(format!(
            "{}└─ {} ({}, chk {})",
            "   ".repeat(depth - 1),
            dep.definition.label(),
            dep.definition.record_type,
            short_hash(&dep.chk_digest)
        ));
    });
    lines
}

fn load(location: &Location, name: &str) -> Result<DatasetDesc> {
    DatasetDesc::load(location, name).with_context(|| {
        format!(
            "No dataset '{name}' in {}/{}",
            location.project, location.branch
        )
    })
}

pub fn show(location: &Location, name: &str) -> Result<()> {
    let desc = load(location, name)?;
    let def = desc.read_def()?;

    let mut t = table(&["Field", "Value"]);
    t.add_row(vec!["Dataset", &def.label()]);
    t.add_row(vec!["Record type", &def.record_type]);
    t.add_row(vec!["Shards", &def.chunk_count.to_string()]);
    t.add_row(vec!["Created", &def.creation_time.to_rfc3339()]);
    t.add_row(vec![
        "Status",
        if desc.is_complete() {
            "complete"
        } else {
            "incomplete"
        },
    ]);
    if desc.is_complete() {
        t.add_row(vec!["Checksum", &ChkFile::digest(&desc)?]);
    }
    if !def.repo_info.commit_hash.is_empty() {
        t.add_row(vec![
            "Commit",
            &format!(
                "{} ({})",
                short_hash(&def.repo_info.commit_hash),
                def.repo_info.branch
            ),
        ]);
        t.add_row(vec!["Committer", &def.repo_info.committer_name]);
    }
    eprintln!("\n{t}");

    let lineage = lineage_lines(&def);
    if lineage.is_empty() {
        eprintln!("No dependencies.");
    } else {
        eprintln!("Lineage:");
        for line in &lineage {
            eprintln!("  {line}");
        }
    }

    if desc.is_complete() {
        let stale = desc.stale_dependencies()?;
        if !stale.is_empty() {
            eprintln!("Stale dependencies (changed since this dataset was built):");
            for label in &stale {
                eprintln!("  {label}");
            }
        }
    }
    Ok(())
}

pub fn delete(location: &Location, name: &str, confirm: bool) -> Result<()> {
    let desc = load(location, name)?;

    let dependents: Vec<String> = list_datasets(location)?
        .into_iter()
        .filter_map(|d| d.read_def().ok())
        .filter(|def| {
            def.dependencies.iter().any(|dep| {
                dep.definition.name == desc.name && dep.definition.branch == desc.location.branch
            })
        })
        .map(|def| def.name)
        .collect();

    if !confirm {
        eprintln!("Would delete {} ({} shards).", desc.label(), desc.chunk_count);
        if !dependents.is_empty() {
            eprintln!("Datasets depending on it: {}", dependents.join(", "));
        }
        eprintln!("Run with --confirm to actually delete.");
        return Ok(());
    }

    if !dependents.is_empty() {
        log::warn!(
            "{} is a dependency of {}; they will report it as stale",
            desc.label(),
            dependents.join(", ")
        );
    }
    desc.delete()
        .with_context(|| format!("Failed to delete {}", desc.label()))?;
    if desc.dir().exists() {
        bail!(
            "{} left files behind in {}",
            desc.label(),
            desc.dir().display()
        );
    }
    eprintln!("Deleted {}.", desc.label());
    Ok(())
}
