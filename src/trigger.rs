use crate::config::{expand_tilde, AutomationConfig};
use crate::shell::{shell_quote, CommandRunner, RemoteShell, ShellError, SshAuth, SshTarget};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("не удалось прочитать {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("Server `{0}` not found in servers file")]
    UnknownServer(String),
    #[error("Server not found for IP: {0}")]
    UnknownIp(String),
    #[error("недопустимое действие: {0:?}")]
    InvalidAction(String),
    #[error("SSH error: {0}")]
    Ssh(#[from] ShellError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub ip: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerRegistry {
    #[serde(default)]
    servers: BTreeMap<String, ServerEntry>,
}

impl ServerRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TriggerError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| TriggerError::Read {
            path: path_display.clone(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| TriggerError::Parse {
            path: path_display,
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document parses as null.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Case-insensitive; returns the configured spelling of the name.
    pub fn find_by_name(&self, name: &str) -> Option<(&str, &ServerEntry)> {
        self.servers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn find_by_ip(&self, ip: &str) -> Option<(&str, &ServerEntry)> {
        self.servers
            .iter()
            .find(|(_, entry)| entry.ip == ip)
            .map(|(key, entry)| (key.as_str(), entry))
    }
}

impl ServerEntry {
    pub fn ssh_target(&self, connect_timeout_secs: u64) -> SshTarget {
        let auth = match (&self.password, &self.identity_file) {
            (Some(password), _) if !password.is_empty() => SshAuth::Password(password.clone()),
            (_, Some(path)) if !path.trim().is_empty() => SshAuth::IdentityFile(expand_tilde(path)),
            _ => SshAuth::Agent,
        };
        SshTarget {
            host: self.ip.clone(),
            user: self.user.clone(),
            port: self.port.unwrap_or(22),
            auth,
            connect_timeout_secs,
            strict_host_key_checking: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub server: String,
    pub ip: String,
    pub action: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ActionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Plain-text summary used by the `trigger` command.
    pub fn summary(&self) -> String {
        let output = if self.stdout.is_empty() {
            "No output"
        } else {
            self.stdout.as_str()
        };
        let mut msg = format!(
            "✅ [{}] Executed: {}\nOutput:\n{}",
            self.ip, self.action, output
        );
        if !self.success() {
            msg = format!(
                "❌ [{}] {} exited with code {}\nOutput:\n{}",
                self.ip, self.action, self.exit_code, output
            );
        }
        if !self.stderr.is_empty() {
            msg.push_str(&format!("\n⚠️ Errors:\n{}", self.stderr));
        }
        msg
    }
}

pub fn automation_command(script: &str, action: &str) -> Result<String, TriggerError> {
    let action = action.trim();
    if action.is_empty() || action.chars().any(char::is_control) {
        return Err(TriggerError::InvalidAction(action.to_string()));
    }
    Ok(format!("bash {} {}", shell_quote(script), shell_quote(action)))
}

pub async fn run_action<R: CommandRunner + ?Sized>(
    runner: &R,
    server: &str,
    entry: &ServerEntry,
    cfg: &AutomationConfig,
    action: &str,
) -> Result<ActionOutcome, TriggerError> {
    let command = automation_command(&cfg.script, action)?;
    info!(server, ip = %entry.ip, action, "запуск действия на сервере");
    let out = runner.run(&command).await?;
    info!(server, action, code = out.code, "действие завершено");
    Ok(ActionOutcome {
        server: server.to_string(),
        ip: entry.ip.clone(),
        action: action.trim().to_string(),
        exit_code: out.code,
        stdout: out.stdout,
        stderr: out.stderr,
    })
}

pub fn remote_for(entry: &ServerEntry, cfg: &AutomationConfig) -> RemoteShell {
    RemoteShell::new(
        entry.ssh_target(cfg.connect_timeout_secs),
        Duration::from_secs(cfg.action_timeout_secs),
    )
}

/// Resolves a server by IP and runs the action over a fresh ssh session.
pub async fn trigger_by_ip(
    cfg: &AutomationConfig,
    ip: &str,
    action: &str,
) -> Result<ActionOutcome, TriggerError> {
    let registry = ServerRegistry::load(&cfg.servers_file)?;
    let (name, entry) = registry
        .find_by_ip(ip)
        .ok_or_else(|| TriggerError::UnknownIp(ip.to_string()))?;
    let runner = remote_for(entry, cfg);
    run_action(&runner, name, entry, cfg, action).await
}
