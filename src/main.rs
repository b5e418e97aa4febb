mod collectors;
mod config;
mod notify;
mod report;
mod shell;
mod telegram;
mod trigger;

use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teloxide::Bot;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "clientwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resource, database and backup report for this host.
    Report {
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
        /// Also post the text report to notify.webhook_url.
        #[arg(long)]
        notify: bool,
    },
    /// Run the Telegram command bridge.
    Bot,
    /// Run an automation action on the server with the given IP.
    Trigger {
        #[arg(long)]
        ip: String,
        #[arg(long)]
        action: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Command::Report {
        format: Format::Text,
        notify: false,
    }) {
        Command::Report { format, notify } => run_report(&cfg, format, notify).await,
        Command::Bot => run_bot(cfg).await,
        Command::Trigger { ip, action } => run_trigger(&cfg, &ip, &action).await,
    }
}

async fn run_report(cfg: &Config, format: Format, notify: bool) {
    info!(client = %cfg.client_name, "запуск отчёта");
    let started = Instant::now();
    let report = collectors::run_report(cfg).await;
    let text = report::render_report(&report);

    match format {
        Format::Text => print!("{text}"),
        Format::Json => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => error!(error = %err, "не удалось сериализовать отчёт"),
        },
    }

    if notify {
        match cfg.notify.webhook_url.as_deref() {
            Some(url) => {
                let client = notify::http_client();
                if let Err(err) = notify::post_webhook(&client, url, &text).await {
                    error!(error = %err, "не удалось отправить отчёт в webhook");
                }
            }
            None => warn!("--notify указан, но notify.webhook_url не задан"),
        }
    }

    info!(
        elapsed = %humantime::format_duration(Duration::from_millis(
            started.elapsed().as_millis() as u64
        )),
        "отчёт готов"
    );
}

async fn run_trigger(cfg: &Config, ip: &str, action: &str) {
    match trigger::trigger_by_ip(&cfg.automation, ip, action).await {
        Ok(outcome) => println!("{}", outcome.summary()),
        Err(err) => {
            error!(ip, action, error = %err, "действие не выполнено");
            println!("❌ {err}");
        }
    }
}

async fn run_bot(cfg: Config) {
    let token = match ensure_telegram_settings(&cfg) {
        Ok(token) => token,
        Err(err) => {
            error!(error = %err, "не удалось подготовить настройки Telegram");
            std::process::exit(1);
        }
    };

    info!(
        servers_file = %cfg.automation.servers_file,
        "запуск clientwatch bot"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bot = Bot::new(token);
    let cfg = Arc::new(cfg);
    let telegram_task = tokio::spawn(async move {
        if let Err(err) = telegram::run_bot(bot, cfg, shutdown_rx).await {
            error!(error = %err, "ошибка задачи Telegram");
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    let _ = telegram_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_telegram_token_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    None
}

fn ensure_telegram_settings(cfg: &Config) -> Result<String, String> {
    let env_name = cfg.telegram.bot_token_env.clone();
    let env_token = resolve_telegram_token_from_env(&env_name);
    let cfg_token = cfg
        .telegram
        .bot_token
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if !cfg.telegram.enabled {
        return Err("telegram.enabled = false: включите бота в config".to_string());
    }
    if cfg.telegram.allowed_chat_ids.is_empty() {
        return Err(
            "telegram.allowed_chat_ids пуст: укажите хотя бы один chat id в config".to_string(),
        );
    }

    if let Some(v) = env_token {
        return Ok(v);
    }
    if let Some(v) = cfg_token {
        return Ok(v);
    }

    Err(format!(
        "не найден токен Telegram: задайте '{}' в окружении или telegram.bot_token в config",
        env_name
    ))
}
