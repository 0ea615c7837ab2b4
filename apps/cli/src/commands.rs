//! CLI command implementations

use crate::output::{format_bytes, print_diff, print_files, print_json, print_report};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{bail, Context, Result};
use console::style;
use pansync_core::{ConfigPaths, Pansync};
use pansync_types::{Settings, SyncReport};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flags shared by every transfer command
pub struct TransferOptions {
    pub workers: Option<usize>,
    pub segmented: bool,
    pub format: OutputFormat,
}

/// Run `transfer` with progress bars attached to the core's events
async fn with_progress<T>(
    core: &Pansync,
    format: OutputFormat,
    transfer: impl Future<Output = T>,
) -> T {
    let progress = Arc::new(TransferProgress::new(format != OutputFormat::Json));
    let handle = progress.clone().spawn(core.subscribe());
    let result = transfer.await;
    handle.abort();
    progress.clear().await;
    result
}

fn finish_report(report: &SyncReport, format: OutputFormat) -> Result<()> {
    print_report(report, format)?;
    if !report.is_success() {
        bail!("{} file(s) failed", report.failures.len());
    }
    Ok(())
}

fn done(message: String, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "ok": true, "message": message })),
        OutputFormat::Human | OutputFormat::Table => {
            println!("{} {}", style("✓").green().bold(), message);
            Ok(())
        }
    }
}

// ============================================================================
// Transfers
// ============================================================================

pub async fn upload(
    core: &Pansync,
    local: &Path,
    remote: Option<String>,
    options: &TransferOptions,
) -> Result<()> {
    let metadata = std::fs::metadata(local)
        .with_context(|| format!("cannot read {}", local.display()))?;

    if metadata.is_dir() {
        let remote = match remote {
            Some(remote) => remote,
            None => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("cannot derive a remote name; pass one explicitly")?,
        };
        let report = with_progress(
            core,
            options.format,
            core.upload_dir(local, &remote, options.workers),
        )
        .await?;
        return finish_report(&report, options.format);
    }

    let remote = remote.unwrap_or_else(|| "/".to_string());
    let outcome = with_progress(core, options.format, core.upload(local, &remote, options.workers))
        .await?;

    match options.format {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Human | OutputFormat::Table => {
            let how = if outcome.rapid {
                "rapid upload".to_string()
            } else {
                format!("{} slice(s) sent", outcome.slices_sent)
            };
            println!(
                "{} Uploaded {} ({}, {})",
                style("✓").green().bold(),
                style(&outcome.remote_path).cyan(),
                format_bytes(outcome.size),
                how
            );
        }
    }
    Ok(())
}

pub async fn download(
    core: &Pansync,
    remote: &str,
    local: Option<PathBuf>,
    options: &TransferOptions,
) -> Result<()> {
    let local = match local {
        Some(local) => local,
        None => std::env::current_dir()?,
    };
    let entry = core.stat(remote).await?;

    if entry.is_dir {
        let target = local.join(entry.name());
        let report = with_progress(
            core,
            options.format,
            core.download_dir(remote, &target, options.workers, options.segmented),
        )
        .await?;
        return finish_report(&report, options.format);
    }

    let path = with_progress(
        core,
        options.format,
        core.download(remote, &local, options.workers, options.segmented),
    )
    .await?;

    match options.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "remote_path": entry.path,
            "local_path": path,
            "size": entry.size,
        }))?,
        OutputFormat::Human | OutputFormat::Table => println!(
            "{} Downloaded {} ({})",
            style("✓").green().bold(),
            style(path.display()).cyan(),
            format_bytes(entry.size)
        ),
    }
    Ok(())
}

// ============================================================================
// Sync
// ============================================================================

pub async fn compare(core: &Pansync, local: &Path, remote: &str, format: OutputFormat) -> Result<()> {
    let diff = core.compare(local, remote).await?;
    print_diff(&diff, format)
}

pub async fn sync_up(
    core: &Pansync,
    local: &Path,
    remote: &str,
    delete: bool,
    options: &TransferOptions,
) -> Result<()> {
    if !local.is_dir() {
        bail!("{} is not a directory", local.display());
    }
    let report = with_progress(
        core,
        options.format,
        core.sync_up(local, remote, delete, options.workers),
    )
    .await?;
    finish_report(&report, options.format)
}

pub async fn sync_down(
    core: &Pansync,
    remote: &str,
    local: &Path,
    delete: bool,
    options: &TransferOptions,
) -> Result<()> {
    let report = with_progress(
        core,
        options.format,
        core.sync_down(remote, local, delete, options.workers, options.segmented),
    )
    .await?;
    finish_report(&report, options.format)
}

// ============================================================================
// Remote file management
// ============================================================================

pub async fn list(core: &Pansync, remote: &str, recursive: bool, format: OutputFormat) -> Result<()> {
    let files = core.list(remote, recursive).await?;
    print_files(&files, format)
}

pub async fn search(
    core: &Pansync,
    key: &str,
    dir: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let files = core.search(key, dir).await?;
    print_files(&files, format)
}

pub async fn mkdir(core: &Pansync, remote: &str, format: OutputFormat) -> Result<()> {
    let dir = core.mkdir(remote).await?;
    done(format!("Created {}", dir.path), format)
}

pub async fn remove(core: &Pansync, remotes: &[String], format: OutputFormat) -> Result<()> {
    core.delete(remotes).await?;
    done(format!("Deleted {} path(s)", remotes.len()), format)
}

pub async fn relocate(
    core: &Pansync,
    src: &str,
    dst: &str,
    copy: bool,
    format: OutputFormat,
) -> Result<()> {
    if copy {
        core.copy_to(src, dst).await?;
        done(format!("Copied {} -> {}", core.resolve(src), core.resolve(dst)), format)
    } else {
        core.move_to(src, dst).await?;
        done(format!("Moved {} -> {}", core.resolve(src), core.resolve(dst)), format)
    }
}

pub async fn rename(core: &Pansync, remote: &str, newname: &str, format: OutputFormat) -> Result<()> {
    core.rename(remote, newname).await?;
    done(format!("Renamed {} -> {}", core.resolve(remote), newname), format)
}

// ============================================================================
// Config
// ============================================================================

pub fn config_action(
    paths: &ConfigPaths,
    settings: &Settings,
    action: ConfigAction,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ConfigAction::Show => match format {
            OutputFormat::Table => {
                use tabled::{Table, Tabled};

                #[derive(Tabled)]
                struct SettingRow {
                    key: String,
                    value: String,
                }

                let value = serde_json::to_value(settings)?;
                let rows: Vec<SettingRow> = value
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(key, value)| SettingRow {
                                key: key.clone(),
                                value: value.to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                println!("{}", Table::new(rows));
            }
            OutputFormat::Json | OutputFormat::Human => print_json(settings)?,
        },

        ConfigAction::Path => match format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "root": paths.root(),
                "settings": paths.settings_file(),
                "hash_cache": paths.hash_cache_file(),
                "progress_db": paths.progress_db(),
                "token": paths.token_file(),
            }))?,
            OutputFormat::Human | OutputFormat::Table => {
                println!("{}", style(paths.root().display()).bold());
                println!("  settings:    {}", paths.settings_file().display());
                println!("  hash cache:  {}", paths.hash_cache_file().display());
                println!("  progress db: {}", paths.progress_db().display());
                println!("  token:       {}", paths.token_file().display());
            }
        },
    }
    Ok(())
}
