use std::fs::{OpenOptions, create_dir_all};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Settings;

use super::{RegistryError, RegistryResult};

/// Metadata captured when a run starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub command: String,
    pub engine: String,
    /// Settings with the DSN already redacted.
    pub settings: Settings,
}

/// `config.json` of a run directory.
#[derive(Debug, Serialize)]
struct RunConfig<'a> {
    run_id: &'a str,
    started_at: String,
    command: &'a str,
    engine: &'a str,
    catalog_version: &'static str,
    settings: &'a Settings,
    git: GitInfo,
}

#[derive(Debug, Serialize)]
struct GitInfo {
    commit: Option<String>,
    dirty: Option<bool>,
}

/// Artifact paths inside `runs/<timestamp>__run_<id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub logs_path: PathBuf,
    pub plan_path: PathBuf,
    pub report_path: PathBuf,
}

pub fn start_run(ctx: &RunContext) -> RegistryResult<RunPaths> {
    let timestamp = ctx.started_at.format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let root = ctx
        .settings
        .run_dir
        .join(format!("{timestamp}__run_{}", ctx.run_id));
    create_dir_all(&root)?;

    let config = RunConfig {
        run_id: &ctx.run_id,
        started_at: ctx.started_at.to_rfc3339(),
        command: &ctx.command,
        engine: &ctx.engine,
        catalog_version: dataloom_core::CATALOG_VERSION,
        settings: &ctx.settings,
        git: collect_git_info(),
    };
    write_json(&root.join("config.json"), &config)?;

    let logs_path = root.join("logs.ndjson");
    OpenOptions::new().create(true).append(true).open(&logs_path)?;

    Ok(RunPaths {
        plan_path: root.join("plan.json"),
        report_path: root.join("report.json"),
        logs_path,
        root,
    })
}

fn git_output(args: &[&str]) -> Option<Vec<u8>> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| output.stdout)
}

fn collect_git_info() -> GitInfo {
    let commit = git_output(&["rev-parse", "HEAD"])
        .map(|stdout| String::from_utf8_lossy(&stdout).trim().to_string())
        .filter(|value| !value.is_empty());
    let dirty = git_output(&["status", "--porcelain"]).map(|stdout| !stdout.is_empty());
    GitInfo { commit, dirty }
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> RegistryResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    serde_json::to_writer_pretty(file, value).map_err(RegistryError::from)
}
