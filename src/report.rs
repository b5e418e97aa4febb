use crate::collectors::backup::{BackupArtifact, BackupSearch, BackupVerification};
use crate::collectors::databases::DatabaseStats;
use crate::collectors::ResourceSnapshot;
use serde::Serialize;
use std::fmt::Write;

const RULE_WIDTH: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub client_name: String,
    pub host_name: String,
    pub generated_at: String,
    pub resources: ResourceSnapshot,
    pub databases: Vec<DatabaseReport>,
    pub totals: DatabaseStats,
    pub skipped_entries: Vec<usize>,
    pub backup_search: BackupSearch,
    /// `None` when no backup directory exists for today.
    pub backup: Option<BackupVerification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseReport {
    pub name: String,
    pub stats: DatabaseStats,
}

pub fn render_report(report: &Report) -> String {
    let mut out = String::new();
    let rule = "=".repeat(RULE_WIDTH);

    let _ = writeln!(
        out,
        "🔍 SYSTEM REPORT for {} ({}) at {}",
        report.client_name, report.host_name, report.generated_at
    );
    let _ = writeln!(out, "{rule}");

    render_resources(&mut out, &report.resources);
    render_databases(&mut out, report);

    let _ = writeln!(out, "\n💾 BACKUP VERIFICATION:");
    match &report.backup {
        Some(verification) => render_verification(&mut out, verification),
        None => render_not_found(&mut out, &report.backup_search),
    }

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "✔ Report completed.");
    out
}

fn render_resources(out: &mut String, res: &ResourceSnapshot) {
    let mem = &res.memory;
    let disk = &res.disk;
    let _ = writeln!(out, "CPU Load: {}", res.cpu_load);
    let _ = writeln!(
        out,
        "Memory: {}/{} MB used | Free: {} MB | Avail: {} MB",
        mem.used, mem.total, mem.free, mem.avail
    );
    let _ = writeln!(
        out,
        "{} usage: {}/{} ({}) available {}",
        disk.path, disk.used, disk.size, disk.percent_used, disk.avail
    );
}

fn render_databases(out: &mut String, report: &Report) {
    let _ = writeln!(out, "\n📦 DATABASE DETAILS:");
    if report.databases.is_empty() && report.skipped_entries.is_empty() {
        let _ = writeln!(out, "  (no databases configured)");
    }
    for db in &report.databases {
        let _ = writeln!(
            out,
            "  {:<15} ➜ Tables: {:<5} Rows: {:<8} Columns: {:<6}",
            db.name, db.stats.table_count, db.stats.row_count, db.stats.column_count
        );
    }
    for position in &report.skipped_entries {
        let _ = writeln!(out, "  ⚠️  Skipped invalid database entry #{position}");
    }
    let _ = writeln!(
        out,
        "\n📊 TOTALS ➜ Tables: {}, Rows: ~{}, Columns: {}",
        report.totals.table_count, report.totals.row_count, report.totals.column_count
    );
}

fn render_not_found(out: &mut String, search: &BackupSearch) {
    let _ = writeln!(out, "❌ Backup not found: no backup directory for today");
    for candidate in &search.tried {
        let _ = writeln!(out, "  tried {:<7} {}", candidate.period.as_str(), candidate.path);
    }
}

fn render_verification(out: &mut String, v: &BackupVerification) {
    let _ = writeln!(
        out,
        "✅ Backup folder: {} ({})",
        v.location.path,
        v.location.period.as_str()
    );
    match &v.home.file_path {
        Some(file) => {
            let _ = writeln!(out, "  /home backup: {} ({} bytes)", file, v.home.size_bytes);
        }
        None => {
            let _ = writeln!(out, "  ⚠️ /home backup missing!");
        }
    }
    for db in &v.databases {
        let _ = writeln!(out, "{}", database_line(&db.name, &db.artifact));
    }
}

fn database_line(name: &str, artifact: &BackupArtifact) -> String {
    match &artifact.file_path {
        Some(file) => {
            let (marker, note) = if artifact.content_valid == Some(true) {
                ("✅", "")
            } else {
                ("⚠️", " no CREATE TABLE/INSERT INTO found")
            };
            format!(
                "  DB {:<15}: {} {} ({} bytes){}",
                name, marker, file, artifact.size_bytes, note
            )
        }
        None => format!("  ❌ DB {:<15}: No backup found", name),
    }
}
