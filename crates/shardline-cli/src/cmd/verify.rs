//! `shardline verify` - recompute shard digests against the ChkFile

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color};
use shardline_store::{ChkFile, DatasetDesc, Location, VerifyResult, list_datasets, short_hash};

use super::table;

pub fn run(location: &Location, name: Option<&str>) -> Result<()> {
    let all_ok = match name {
        Some(name) => {
            let desc = DatasetDesc::load(location, name).with_context(|| {
                format!(
                    "No dataset '{name}' in {}",
                    location.branch_dir().display()
                )
            })?;
            verify_one(&desc)?
        }
        None => verify_all(location)?,
    };
    if !all_ok {
        bail!("integrity check failed");
    }
    Ok(())
}

fn verify_one(desc: &DatasetDesc) -> Result<bool> {
    let results = ChkFile::verify_report(desc)?;
    let all_ok = results.iter().all(|r| r.ok);
    let status = if all_ok { "OK" } else { "FAIL" };
    eprintln!("[{status}] {} ({} files)", desc.label(), results.len());
    print_mismatches(&desc.label(), &results);
    Ok(all_ok)
}

fn verify_all(location: &Location) -> Result<bool> {
    let datasets = list_datasets(location)?;
    if datasets.is_empty() {
        eprintln!("No datasets to verify.");
        return Ok(true);
    }

    let mut t = table(&["Dataset", "Files", "Status"]);
    let mut reports = Vec::with_capacity(datasets.len());
    for desc in &datasets {
        if !desc.is_complete() {
            t.add_row(vec![
                Cell::new(&desc.name),
                Cell::new("-"),
                Cell::new("INCOMPLETE").fg(Color::Yellow),
            ]);
            continue;
        }
        let results = ChkFile::verify_report(desc)?;
        let status = if results.iter().all(|r| r.ok) {
            Cell::new("OK").fg(Color::Green)
        } else {
            Cell::new("FAIL").fg(Color::Red)
        };
        t.add_row(vec![Cell::new(&desc.name), Cell::new(results.len()), status]);
        reports.push((desc.label(), results));
    }
    eprintln!("\n{t}");

    // Show mismatch details after summary table
    for (label, results) in &reports {
        print_mismatches(label, results);
    }

    let all_ok = reports.iter().all(|(_, rs)| rs.iter().all(|r| r.ok));
    if all_ok {
        eprintln!("All datasets verified OK.");
    } else {
        eprintln!("Some datasets have integrity issues!");
    }
    Ok(all_ok)
}

fn print_mismatches(label: &str, results: &[VerifyResult]) {
    for r in results {
        if !r.ok {
            eprintln!("  MISMATCH in {label}: {}", r.file);
            eprintln!("    expected: {}", short_hash(&r.expected));
            eprintln!("    actual:   {}", short_hash(&r.actual));
        }
    }
}
