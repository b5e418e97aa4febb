pub mod backup;
pub mod databases;
pub mod system;

use crate::config::Config;
use crate::report::{DatabaseReport, Report};
use crate::shell::{CommandRunner, LocalShell, RemoteShell};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_load: String,
    pub memory: MemoryStat,
    pub disk: DiskUsage,
}

/// Megabytes, as reported by `free -m`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStat {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub avail: u64,
}

/// Human-readable `df -h` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub path: String,
    pub size: String,
    pub used: String,
    pub avail: String,
    pub percent_used: String,
}

impl DiskUsage {
    pub fn unavailable(path: &str) -> Self {
        Self {
            path: path.to_string(),
            size: NOT_AVAILABLE.to_string(),
            used: NOT_AVAILABLE.to_string(),
            avail: NOT_AVAILABLE.to_string(),
            percent_used: NOT_AVAILABLE.to_string(),
        }
    }
}

/// Runs the whole pipeline once, strictly in sequence: resources, database
/// stats, then backup location and validation on the remote host.
pub async fn collect_report<L, R>(
    cfg: &Config,
    local: &L,
    remote: &R,
    host_name: String,
    now: DateTime<Local>,
) -> Report
where
    L: CommandRunner + ?Sized,
    R: CommandRunner + ?Sized,
{
    let resources = system::collect_resources(local, &cfg.resources).await;

    let parsed = databases::parse_credentials(&cfg.databases);
    let mut database_reports = Vec::with_capacity(parsed.valid.len());
    for cred in &parsed.valid {
        let stats = databases::collect_database_stats(local, &cfg.mysql, cred).await;
        database_reports.push(DatabaseReport {
            name: cred.name.clone(),
            stats,
        });
    }
    let totals = databases::totals(database_reports.iter().map(|d| &d.stats));

    let candidates =
        backup::candidate_locations(&cfg.backup.root, &cfg.client_name, now.date_naive());
    let search = backup::locate_backup(remote, candidates).await;
    let verification = match &search.found {
        Some(location) => Some(backup::validate_backup(remote, location, &parsed.valid).await),
        None => None,
    };

    info!(
        client = %cfg.client_name,
        databases = database_reports.len(),
        skipped = parsed.skipped.len(),
        backup_found = search.found.is_some(),
        "сбор отчёта завершён"
    );

    Report {
        client_name: cfg.client_name.clone(),
        host_name,
        generated_at: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        resources,
        databases: database_reports,
        totals,
        skipped_entries: parsed.skipped,
        backup_search: search,
        backup: verification,
    }
}

/// Collects a report from this host and the configured backup server.
pub async fn run_report(cfg: &Config) -> Report {
    let timeout = Duration::from_secs(cfg.command_timeout_secs);
    let local = LocalShell::new(timeout);
    let remote = RemoteShell::new(cfg.backup.ssh_target(), timeout);
    collect_report(cfg, &local, &remote, system::host_name(), Local::now()).await
}
