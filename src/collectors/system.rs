use crate::collectors::{DiskUsage, MemoryStat, ResourceSnapshot, NOT_AVAILABLE};
use crate::config::ResourcesConfig;
use crate::shell::{shell_quote, CommandOutput, CommandRunner};
use sysinfo::{System, SystemExt};
use tracing::{debug, warn};

pub async fn collect_resources<R: CommandRunner + ?Sized>(
    runner: &R,
    cfg: &ResourcesConfig,
) -> ResourceSnapshot {
    let cpu_load = probe(runner, "loadavg", "cat /proc/loadavg")
        .await
        .as_deref()
        .and_then(parse_loadavg)
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    let memory = probe(runner, "memory", "free -m")
        .await
        .as_deref()
        .and_then(parse_free)
        .unwrap_or_default();

    let disk = collect_disk(runner, &cfg.disk_paths).await;

    ResourceSnapshot {
        cpu_load,
        memory,
        disk,
    }
}

pub fn host_name() -> String {
    System::new()
        .host_name()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn collect_disk<R: CommandRunner + ?Sized>(runner: &R, paths: &[String]) -> DiskUsage {
    for path in paths {
        let script = format!("df -hP {}", shell_quote(path));
        if let Some(disk) = probe(runner, "disk", &script)
            .await
            .as_deref()
            .and_then(|out| parse_df(path, out))
        {
            return disk;
        }
        debug!(path = %path, "df не дал результата, пробуем следующий путь");
    }
    DiskUsage::unavailable(paths.first().map(String::as_str).unwrap_or("/"))
}

async fn probe<R: CommandRunner + ?Sized>(runner: &R, name: &str, script: &str) -> Option<String> {
    match runner.run(script).await {
        Ok(out) => stdout_or_warn(name, &out),
        Err(err) => {
            warn!(probe = name, error = %err, "локальная проверка не выполнена");
            None
        }
    }
}

fn stdout_or_warn(name: &str, out: &CommandOutput) -> Option<String> {
    match out.non_empty_stdout() {
        Some(stdout) => Some(stdout.to_string()),
        None => {
            warn!(probe = name, code = out.code, stderr = %out.stderr, "локальная проверка вернула ошибку");
            None
        }
    }
}

/// First three fields of `/proc/loadavg`.
pub fn parse_loadavg(out: &str) -> Option<String> {
    let fields: Vec<&str> = out.split_whitespace().take(3).collect();
    if fields.len() < 3 || fields.iter().any(|f| f.parse::<f64>().is_err()) {
        return None;
    }
    Some(fields.join(" "))
}

/// `Mem:` row of `free -m`: total, used, free, shared, buff/cache, available.
pub fn parse_free(out: &str) -> Option<MemoryStat> {
    let row = out
        .lines()
        .find(|l| l.trim_start().starts_with("Mem:"))?;
    let nums: Vec<u64> = row
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if nums.len() < 6 {
        return None;
    }
    Some(MemoryStat {
        total: nums[0],
        used: nums[1],
        free: nums[2],
        avail: nums[5],
    })
}

/// Second line of `df -hP`: filesystem, size, used, avail, use%, mount.
pub fn parse_df(path: &str, out: &str) -> Option<DiskUsage> {
    let row = out.lines().nth(1)?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 5 || !fields[4].ends_with('%') {
        return None;
    }
    Some(DiskUsage {
        path: path.to_string(),
        size: fields[1].to_string(),
        used: fields[2].to_string(),
        avail: fields[3].to_string(),
        percent_used: fields[4].to_string(),
    })
}
