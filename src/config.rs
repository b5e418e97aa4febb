use crate::shell::{SshAuth, SshTarget};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub client_name: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub resources: ResourcesConfig,
    pub backup: BackupConfig,
    /// `name:user:secret` entries; malformed ones are skipped at collection time.
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub mysql: MysqlConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_disk_paths")]
    pub disk_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_identity_file")]
    pub identity_file: Option<String>,
    pub root: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MysqlConfig {
    #[serde(default = "default_mysql_binary")]
    pub binary: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutomationConfig {
    #[serde(default = "default_servers_file")]
    pub servers_file: String,
    #[serde(default = "default_automation_script")]
    pub script: String,
    #[serde(default = "default_action")]
    pub default_action: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_progress_steps")]
    pub progress_steps: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            disk_paths: default_disk_paths(),
        }
    }
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            binary: default_mysql_binary(),
            host: None,
            port: None,
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            servers_file: default_servers_file(),
            script: default_automation_script(),
            default_action: default_action(),
            connect_timeout_secs: default_connect_timeout_secs(),
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            progress_steps: default_progress_steps(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = self.client_name.trim();
        if client.is_empty() {
            return Err(ConfigError::Validation(
                "поле client_name обязательно".to_string(),
            ));
        }
        if client.contains('/') || client == "." || client == ".." {
            return Err(ConfigError::Validation(
                "client_name не может содержать '/' или быть '.'/'..'".to_string(),
            ));
        }
        if self.command_timeout_secs < 1 {
            return Err(ConfigError::Validation(
                "command_timeout_secs должно быть >= 1".to_string(),
            ));
        }
        if self.resources.disk_paths.is_empty() {
            return Err(ConfigError::Validation(
                "resources.disk_paths не должен быть пустым".to_string(),
            ));
        }

        validate_backup(&self.backup)?;
        validate_automation(&self.automation)?;
        validate_telegram(&self.telegram)?;

        if let Some(url) = &self.notify.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Validation(
                    "notify.webhook_url должен начинаться с http:// или https://".to_string(),
                ));
            }
        }
        if self.mysql.binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "mysql.binary не должен быть пустым".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl BackupConfig {
    pub fn ssh_target(&self) -> SshTarget {
        let auth = match &self.identity_file {
            Some(path) if !path.trim().is_empty() => SshAuth::IdentityFile(expand_tilde(path)),
            _ => SshAuth::Agent,
        };
        SshTarget {
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            auth,
            connect_timeout_secs: self.connect_timeout_secs,
            strict_host_key_checking: self.strict_host_key_checking,
        }
    }
}

/// Expands a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn validate_backup(cfg: &BackupConfig) -> Result<(), ConfigError> {
    if cfg.host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "backup.host не должен быть пустым".to_string(),
        ));
    }
    if cfg.user.trim().is_empty() {
        return Err(ConfigError::Validation(
            "backup.user не должен быть пустым".to_string(),
        ));
    }
    if cfg.port == 0 {
        return Err(ConfigError::Validation(
            "backup.port должен быть в диапазоне 1..65535".to_string(),
        ));
    }
    if !cfg.root.starts_with('/') {
        return Err(ConfigError::Validation(
            "backup.root должен быть абсолютным путём".to_string(),
        ));
    }
    if cfg.connect_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "backup.connect_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_automation(cfg: &AutomationConfig) -> Result<(), ConfigError> {
    if cfg.script.trim().is_empty() {
        return Err(ConfigError::Validation(
            "automation.script не должен быть пустым".to_string(),
        ));
    }
    if cfg.default_action.trim().is_empty() {
        return Err(ConfigError::Validation(
            "automation.default_action не должен быть пустым".to_string(),
        ));
    }
    if cfg.connect_timeout_secs < 1 || cfg.action_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "automation.*_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_per_minute должно быть >= 1".to_string(),
        ));
    }
    if cfg.progress_steps > 20 {
        return Err(ConfigError::Validation(
            "telegram.progress_steps должно быть в диапазоне 0..20".to_string(),
        ));
    }
    Ok(())
}

const fn default_command_timeout_secs() -> u64 {
    120
}

fn default_disk_paths() -> Vec<String> {
    vec!["/home".to_string(), "/".to_string()]
}

fn default_ssh_user() -> String {
    "root".to_string()
}

const fn default_ssh_port() -> u16 {
    22
}

fn default_identity_file() -> Option<String> {
    Some("~/.ssh/id_ed25519".to_string())
}

const fn default_connect_timeout_secs() -> u64 {
    25
}

fn default_mysql_binary() -> String {
    "mysql".to_string()
}

fn default_servers_file() -> String {
    "/opt/automation/main_server/servers.yaml".to_string()
}

fn default_automation_script() -> String {
    "/automation.sh".to_string()
}

fn default_action() -> String {
    "monitor".to_string()
}

const fn default_action_timeout_secs() -> u64 {
    600
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

const fn default_progress_steps() -> u32 {
    6
}
