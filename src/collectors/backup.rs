use crate::collectors::databases::DatabaseCredential;
use crate::shell::{shell_quote, CommandOutput, CommandRunner};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BackupPeriod {
    /// Most granular retention period first.
    pub const SEARCH_ORDER: [BackupPeriod; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    fn dir_name(self, date: NaiveDate) -> String {
        match self {
            Self::Daily => date.format("%Y-%m-%d").to_string(),
            Self::Weekly => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Self::Monthly => format!("{}-{:02}", date.year(), date.month()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupLocation {
    pub period: BackupPeriod,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    pub file_path: Option<String>,
    pub size_bytes: u64,
    pub content_valid: Option<bool>,
}

impl BackupArtifact {
    pub fn missing() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSearch {
    /// Every candidate that was tested, in order.
    pub tried: Vec<BackupLocation>,
    pub found: Option<BackupLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseBackup {
    pub name: String,
    pub artifact: BackupArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupVerification {
    pub location: BackupLocation,
    pub home: BackupArtifact,
    pub databases: Vec<DatabaseBackup>,
}

pub fn candidate_locations(root: &str, client: &str, date: NaiveDate) -> Vec<BackupLocation> {
    let base = format!("{}/{}", root.trim_end_matches('/'), client);
    BackupPeriod::SEARCH_ORDER
        .iter()
        .map(|&period| BackupLocation {
            period,
            path: format!("{base}/{}/{}", period.as_str(), period.dir_name(date)),
        })
        .collect()
}

/// Tests candidates in order and stops at the first existing directory.
pub async fn locate_backup<R: CommandRunner + ?Sized>(
    runner: &R,
    candidates: Vec<BackupLocation>,
) -> BackupSearch {
    let mut tried = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let script = format!("test -d {}", shell_quote(&candidate.path));
        let exists = remote(runner, &script, "test -d")
            .await
            .is_some_and(|out| out.success());
        tried.push(candidate.clone());
        if exists {
            info!(period = candidate.period.as_str(), path = %candidate.path, "найден каталог бэкапа");
            return BackupSearch {
                tried,
                found: Some(candidate),
            };
        }
    }
    warn!(tried = tried.len(), "каталог бэкапа за сегодня не найден");
    BackupSearch { tried, found: None }
}

pub async fn validate_backup<R: CommandRunner + ?Sized>(
    runner: &R,
    location: &BackupLocation,
    databases: &[DatabaseCredential],
) -> BackupVerification {
    let home_pattern = format!("{}/home-*.tar.gz", shell_quote(&format!("{}/home", location.path)));
    let home = match newest_file(runner, &home_pattern).await {
        Some(file) => {
            let size_bytes = file_size(runner, &file).await;
            BackupArtifact {
                file_path: Some(file),
                size_bytes,
                content_valid: None,
            }
        }
        None => {
            warn!(path = %location.path, "архив /home не найден");
            BackupArtifact::missing()
        }
    };

    let mut db_backups = Vec::with_capacity(databases.len());
    for db in databases {
        let pattern = format!(
            "{}-*.sql.gz",
            shell_quote(&format!("{}/databases/{}", location.path, db.name))
        );
        let artifact = match newest_file(runner, &pattern).await {
            Some(file) => {
                let size_bytes = file_size(runner, &file).await;
                let markers = dump_marker_count(runner, &file).await;
                if markers == 0 {
                    warn!(database = %db.name, file = %file, "дамп не содержит CREATE TABLE / INSERT INTO");
                }
                BackupArtifact {
                    file_path: Some(file),
                    size_bytes,
                    content_valid: Some(markers > 0),
                }
            }
            None => {
                warn!(database = %db.name, "дамп базы данных не найден");
                BackupArtifact::missing()
            }
        };
        db_backups.push(DatabaseBackup {
            name: db.name.clone(),
            artifact,
        });
    }

    BackupVerification {
        location: location.clone(),
        home,
        databases: db_backups,
    }
}

/// `pattern` is a pre-quoted glob; the newest match by mtime wins.
async fn newest_file<R: CommandRunner + ?Sized>(runner: &R, pattern: &str) -> Option<String> {
    let script = format!("ls -1t {pattern} 2>/dev/null | head -n 1");
    let out = remote(runner, &script, "ls").await?;
    out.non_empty_stdout()?
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

async fn file_size<R: CommandRunner + ?Sized>(runner: &R, file: &str) -> u64 {
    let script = format!("stat -c %s {}", shell_quote(file));
    remote(runner, &script, "stat")
        .await
        .and_then(|out| out.non_empty_stdout().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
}

/// Lines matching "create table" or "insert into", case-insensitive.
async fn dump_marker_count<R: CommandRunner + ?Sized>(runner: &R, file: &str) -> u64 {
    let script = format!(
        "gzip -cd {} | grep -Eic 'create table|insert into'",
        shell_quote(file)
    );
    // grep -c exits 1 with "0" on no match, so the exit code is not checked.
    remote(runner, &script, "gzip")
        .await
        .and_then(|out| out.stdout.trim().parse().ok())
        .unwrap_or(0)
}

async fn remote<R: CommandRunner + ?Sized>(
    runner: &R,
    script: &str,
    probe: &str,
) -> Option<CommandOutput> {
    match runner.run(script).await {
        Ok(out) => Some(out),
        Err(err) => {
            warn!(probe, error = %err, "удалённая проверка не выполнена");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedRunner;

    const ROOT: &str = "/data/main";

    fn acme_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn creds(names: &[&str]) -> Vec<DatabaseCredential> {
        names
            .iter()
            .map(|n| DatabaseCredential {
                name: n.to_string(),
                user: "ro".to_string(),
                secret: "x".to_string(),
            })
            .collect()
    }

    fn weekly() -> BackupLocation {
        BackupLocation {
            period: BackupPeriod::Weekly,
            path: "/data/main/Acme/weekly/2024-W11".to_string(),
        }
    }

    #[test]
    fn candidates_follow_fixed_template_and_order() {
        let paths: Vec<String> = candidate_locations("/data/main/", "Acme", acme_date())
            .into_iter()
            .map(|c| c.path)
            .collect();
        assert_eq!(
            paths,
            vec![
                "/data/main/Acme/daily/2024-03-15",
                "/data/main/Acme/weekly/2024-W11",
                "/data/main/Acme/monthly/2024-03",
            ]
        );
    }

    #[test]
    fn weekly_uses_iso_week_year_and_zero_padding() {
        let early = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        assert_eq!(BackupPeriod::Weekly.dir_name(early), "2024-W01");
        let year_end = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        assert_eq!(BackupPeriod::Weekly.dir_name(year_end), "2025-W01");
        assert_eq!(BackupPeriod::Monthly.dir_name(year_end), "2024-12");
    }

    #[tokio::test]
    async fn monthly_wins_after_daily_and_weekly_are_rejected() {
        let runner = ScriptedRunner::new().ok("test -d '/data/main/Acme/monthly/2024-03'", "");
        let search = locate_backup(&runner, candidate_locations(ROOT, "Acme", acme_date())).await;

        let found = search.found.expect("monthly должен быть найден");
        assert_eq!(found.period, BackupPeriod::Monthly);
        assert_eq!(found.path, "/data/main/Acme/monthly/2024-03");
        assert_eq!(
            runner.calls(),
            vec![
                "test -d '/data/main/Acme/daily/2024-03-15'",
                "test -d '/data/main/Acme/weekly/2024-W11'",
                "test -d '/data/main/Acme/monthly/2024-03'",
            ]
        );
        assert_eq!(search.tried.len(), 3);
    }

    #[tokio::test]
    async fn search_stops_at_first_hit() {
        let runner = ScriptedRunner::new().ok("test -d", "");
        let search = locate_backup(&runner, candidate_locations(ROOT, "Acme", acme_date())).await;
        assert_eq!(search.found.map(|l| l.period), Some(BackupPeriod::Daily));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_host_means_not_found() {
        let runner = ScriptedRunner::new().unreachable("test -d");
        let search = locate_backup(&runner, candidate_locations(ROOT, "Acme", acme_date())).await;
        assert!(search.found.is_none());
        assert_eq!(search.tried.len(), 3);
    }

    #[tokio::test]
    async fn missing_home_archive_has_no_file_and_zero_size() {
        let runner = ScriptedRunner::new().ok("home-*.tar.gz", "");
        let result = validate_backup(&runner, &weekly(), &[]).await;
        assert_eq!(result.home.file_path, None);
        assert_eq!(result.home.size_bytes, 0);
        assert!(runner.calls_containing("stat -c").is_empty());
    }

    #[tokio::test]
    async fn newest_home_archive_is_sized() {
        let file = "/data/main/Acme/weekly/2024-W11/home/home-2024-03-14.tar.gz";
        let runner = ScriptedRunner::new()
            .ok("ls -1t '/data/main/Acme/weekly/2024-W11/home'/home-*.tar.gz", file)
            .ok("stat -c %s", "52428800");
        let result = validate_backup(&runner, &weekly(), &[]).await;
        assert_eq!(result.home.file_path.as_deref(), Some(file));
        assert_eq!(result.home.size_bytes, 52_428_800);
        assert_eq!(result.home.content_valid, None);
    }

    #[tokio::test]
    async fn empty_dump_is_listed_but_invalid() {
        let file = "/data/main/Acme/weekly/2024-W11/databases/shop-2024-03-14.sql.gz";
        let runner = ScriptedRunner::new()
            .ok("databases/shop'-*.sql.gz", file)
            .ok("stat -c %s", "0")
            .exit("gzip -cd", 1, "0");
        let result = validate_backup(&runner, &weekly(), &creds(&["shop"])).await;
        let shop = &result.databases[0];
        assert_eq!(shop.name, "shop");
        assert_eq!(shop.artifact.file_path.as_deref(), Some(file));
        assert_eq!(shop.artifact.size_bytes, 0);
        assert_eq!(shop.artifact.content_valid, Some(false));
    }

    #[tokio::test]
    async fn non_empty_dump_without_markers_is_invalid() {
        let runner = ScriptedRunner::new()
            .ok("databases/shop'-*.sql.gz", "/x/shop-1.sql.gz")
            .ok("stat -c %s", "4096")
            .exit("gzip -cd", 1, "0");
        let result = validate_backup(&runner, &weekly(), &creds(&["shop"])).await;
        assert_eq!(result.databases[0].artifact.size_bytes, 4096);
        assert_eq!(result.databases[0].artifact.content_valid, Some(false));
    }

    #[tokio::test]
    async fn one_failed_dump_check_does_not_affect_others() {
        let runner = ScriptedRunner::new()
            .unreachable("databases/shop'")
            .ok("databases/blog'-*.sql.gz", "/x/blog-1.sql.gz")
            .ok("stat -c %s", "2048")
            .ok("gzip -cd", "37");
        let result = validate_backup(&runner, &weekly(), &creds(&["shop", "blog"])).await;
        assert_eq!(result.databases[0].artifact, BackupArtifact::missing());
        assert_eq!(result.databases[1].artifact.content_valid, Some(true));
        assert_eq!(result.databases[1].artifact.size_bytes, 2048);
    }

    #[tokio::test]
    async fn database_name_is_quoted_in_glob() {
        let runner = ScriptedRunner::new();
        validate_backup(&runner, &weekly(), &creds(&["a b;rm"])).await;
        assert_eq!(
            runner.calls_containing("databases/"),
            vec!["ls -1t '/data/main/Acme/weekly/2024-W11/databases/a b;rm'-*.sql.gz 2>/dev/null | head -n 1"]
        );
    }
}
