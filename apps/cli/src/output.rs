//! Output formatting utilities

use crate::OutputFormat;
use anyhow::Result;
use chrono::Local;
use console::style;
use pansync_types::{DiffResult, RemoteFile, SyncReport};
use serde::Serialize;
use std::collections::BTreeSet;
use tabled::{Table, Tabled};

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

fn format_modified(file: &RemoteFile) -> String {
    file.modified()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ============================================================================
// Remote listings
// ============================================================================

#[derive(Tabled)]
struct FileRow {
    kind: &'static str,
    size: String,
    modified: String,
    path: String,
}

pub fn print_files(files: &[RemoteFile], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(files)?,
        OutputFormat::Table => {
            let rows: Vec<FileRow> = files
                .iter()
                .map(|f| FileRow {
                    kind: if f.is_dir { "dir" } else { "file" },
                    size: if f.is_dir { "-".to_string() } else { format_bytes(f.size) },
                    modified: format_modified(f),
                    path: f.path.clone(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if files.is_empty() {
                println!("{}", style("No files found").dim());
                return Ok(());
            }
            for file in files {
                if file.is_dir {
                    println!("{:>10}  {}  {}/", "-", format_modified(file), style(&file.path).blue().bold());
                } else {
                    println!("{:>10}  {}  {}", format_bytes(file.size), format_modified(file), file.path);
                }
            }
            println!();
            println!("{} entr(ies) total", style(files.len()).bold());
        }
    }
    Ok(())
}

// ============================================================================
// Diff and sync reports
// ============================================================================

#[derive(Serialize)]
struct DiffSummary<'a> {
    local_only: &'a BTreeSet<String>,
    remote_only: &'a BTreeSet<String>,
    size_different: &'a BTreeSet<String>,
    identical: usize,
}

#[derive(Tabled)]
struct DiffRow {
    status: &'static str,
    path: String,
}

pub fn print_diff(diff: &DiffResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&DiffSummary {
            local_only: &diff.local_only,
            remote_only: &diff.remote_only,
            size_different: &diff.size_different,
            identical: diff.identical.len(),
        })?,
        OutputFormat::Table => {
            let rows: Vec<DiffRow> = [
                ("local only", &diff.local_only),
                ("remote only", &diff.remote_only),
                ("size differs", &diff.size_different),
            ]
            .into_iter()
            .flat_map(|(status, paths)| {
                paths.iter().map(move |p| DiffRow {
                    status,
                    path: p.clone(),
                })
            })
            .collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for path in &diff.local_only {
                println!("{} {}", style("+").green().bold(), path);
            }
            for path in &diff.remote_only {
                println!("{} {}", style("-").red().bold(), path);
            }
            for path in &diff.size_different {
                println!("{} {}", style("~").yellow().bold(), path);
            }
            if diff.is_in_sync() {
                println!("{} In sync ({} files)", style("✓").green().bold(), diff.identical.len());
            } else {
                println!(
                    "\n{} local only, {} remote only, {} different, {} identical",
                    diff.local_only.len(),
                    diff.remote_only.len(),
                    diff.size_different.len(),
                    diff.identical.len()
                );
            }
        }
    }
    Ok(())
}

pub fn print_report(report: &SyncReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Human | OutputFormat::Table => {
            for path in &report.transferred {
                println!("{} {}", style("✓").green().bold(), path);
            }
            for path in &report.deleted {
                println!("{} {} (deleted)", style("-").red().bold(), path);
            }
            for failure in &report.failures {
                println!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    failure.path,
                    style(&failure.error).red()
                );
            }
            println!(
                "\n{} transferred, {} deleted, {} unchanged, {} failed",
                report.transferred.len(),
                report.deleted.len(),
                report.unchanged,
                report.failures.len()
            );
        }
    }
    Ok(())
}
