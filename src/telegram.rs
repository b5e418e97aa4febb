use crate::collectors;
use crate::config::Config;
use crate::notify;
use crate::report::render_report;
use crate::trigger::{self, ServerRegistry, TriggerError};
use reqwest::Client;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{ChatId, Message, ParseMode};
use teloxide::utils::html;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

const MESSAGE_LIMIT_CHARS: usize = 3500;
const PROGRESS_STEP: Duration = Duration::from_millis(400);

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("ошибка запроса Telegram: {0}")]
    Request(#[from] teloxide::RequestError),
}

#[derive(Clone)]
struct TelegramRuntime {
    cfg: Arc<Config>,
    allowed_chats: HashSet<i64>,
    limiter: Arc<Mutex<RateLimiter>>,
    http: Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Start,
    Help,
    Servers,
    Report,
    Server(ServerRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerRequest {
    server: Option<String>,
    action: String,
}

impl Action {
    fn from_command(text: &str, default_action: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let normalized = first.split('@').next()?.to_lowercase();
        match normalized.as_str() {
            "/start" => Some(Self::Start),
            "/help" => Some(Self::Help),
            "/servers" => Some(Self::Servers),
            "/report" => Some(Self::Report),
            "/server" => {
                let rest = text.trim_start().get(first.len()..).unwrap_or_default();
                let mut args = parse_args(rest);
                Some(Self::Server(ServerRequest {
                    server: args.remove("ip"),
                    action: args
                        .remove("action")
                        .unwrap_or_else(|| default_action.to_string()),
                }))
            }
            _ => None,
        }
    }
}

/// `key=value` pairs separated by whitespace; keys are word characters,
/// matched case-insensitively.
fn parse_args(text: &str) -> HashMap<String, String> {
    text.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .filter(|(k, v)| {
            !k.is_empty() && !v.is_empty() && k.chars().all(|c| c.is_alphanumeric() || c == '_')
        })
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect()
}

pub async fn run_bot(
    bot: Bot,
    cfg: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    let runtime = TelegramRuntime {
        allowed_chats: cfg.telegram.allowed_chat_ids.iter().copied().collect(),
        limiter: Arc::new(Mutex::new(RateLimiter::new(
            cfg.telegram.rate_limit_per_minute,
        ))),
        http: notify::http_client(),
        cfg,
    };

    let me = bot.get_me().await?;
    info!(username = ?me.username, "Telegram-бот запущен");

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("остановка Telegram-бота");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "задача Telegram завершилась с ошибкой");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, runtime: TelegramRuntime) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    if !should_handle_message(msg.chat.is_private(), chat_id, &runtime.allowed_chats) {
        return Ok(());
    }

    if !consume_rate_limit(&runtime, chat_id).await {
        bot.send_message(
            msg.chat.id,
            "Слишком много запросов. Попробуйте чуть позже.",
        )
        .await?;
        return Ok(());
    }

    let text = msg.text().unwrap_or_default();
    let action = Action::from_command(text, &runtime.cfg.automation.default_action)
        .unwrap_or(Action::Help);
    let user = msg
        .from()
        .map(|u| u.username.clone().unwrap_or_else(|| u.full_name()))
        .unwrap_or_else(|| "unknown".to_string());

    match action {
        Action::Start => {
            reply(
                &bot,
                &runtime,
                msg.chat.id,
                "<b>clientwatch</b> запущен. /help - список команд.".to_string(),
            )
            .await;
        }
        Action::Help => reply(&bot, &runtime, msg.chat.id, help_text()).await,
        Action::Servers => {
            let text = match ServerRegistry::load(&runtime.cfg.automation.servers_file) {
                Ok(registry) => format_server_list(registry.names()),
                Err(err) => format!("❌ {}", html::escape(&err.to_string())),
            };
            reply(&bot, &runtime, msg.chat.id, text).await;
        }
        Action::Report => handle_report(&bot, &runtime, msg.chat.id, &user).await,
        Action::Server(request) => {
            handle_server(&bot, &runtime, msg.chat.id, &user, text, request).await
        }
    }
    Ok(())
}

async fn handle_report(bot: &Bot, runtime: &TelegramRuntime, chat_id: ChatId, user: &str) {
    info!(user, "запрошен отчёт через Telegram");
    let started = Instant::now();
    let report = collectors::run_report(&runtime.cfg).await;
    let text = render_report(&report);
    reply(
        bot,
        runtime,
        chat_id,
        format!(
            "<pre>{}</pre>\n🕒 {}",
            html::escape(&truncate_chars(&text, MESSAGE_LIMIT_CHARS)),
            elapsed_human(started)
        ),
    )
    .await;
}

async fn handle_server(
    bot: &Bot,
    runtime: &TelegramRuntime,
    chat_id: ChatId,
    user: &str,
    raw_text: &str,
    request: ServerRequest,
) {
    info!(user, command = raw_text, "получена команда /server");
    reply(
        bot,
        runtime,
        chat_id,
        format!(
            "⚙️ Команда от <b>{}</b>: <code>{}</code>",
            html::escape(user),
            html::escape(raw_text)
        ),
    )
    .await;

    let Some(server) = request.server else {
        reply(
            bot,
            runtime,
            chat_id,
            "❌ Не указан параметр <code>ip=</code>".to_string(),
        )
        .await;
        return;
    };
    let action = request.action;

    reply(
        bot,
        runtime,
        chat_id,
        format!(
            "📡 Подключение к <code>{}</code> для <code>{}</code>...",
            html::escape(&server),
            html::escape(&action)
        ),
    )
    .await;
    show_progress(bot, chat_id, runtime.cfg.telegram.progress_steps).await;

    let started = Instant::now();
    let outcome = run_server_action(runtime, &server, &action).await;
    let text = match outcome {
        Ok(outcome) if outcome.success() => {
            info!(server = %server, action = %action, "действие выполнено успешно");
            format!(
                "✅ Успешно на <code>{}</code> ({})\n<pre>{}</pre>",
                html::escape(&outcome.server),
                elapsed_human(started),
                html::escape(&truncate_chars(&outcome.stdout, MESSAGE_LIMIT_CHARS))
            )
        }
        Ok(outcome) => {
            error!(server = %server, action = %action, code = outcome.exit_code, "действие завершилось с ошибкой");
            let detail = if outcome.stderr.is_empty() {
                outcome.stdout.clone()
            } else {
                outcome.stderr.clone()
            };
            format!(
                "❌ Ошибка <code>{}</code> на <code>{}</code> (код {})\n<pre>{}</pre>",
                html::escape(&action),
                html::escape(&outcome.server),
                outcome.exit_code,
                html::escape(&truncate_chars(&detail, MESSAGE_LIMIT_CHARS))
            )
        }
        Err(err) => {
            error!(server = %server, action = %action, error = %err, "действие не выполнено");
            format!(
                "❌ Ошибка <code>{}</code> на <code>{}</code>\n<pre>{}</pre>",
                html::escape(&action),
                html::escape(&server),
                html::escape(&err.to_string())
            )
        }
    };
    reply(bot, runtime, chat_id, text).await;
}

async fn run_server_action(
    runtime: &TelegramRuntime,
    server: &str,
    action: &str,
) -> Result<trigger::ActionOutcome, TriggerError> {
    let automation = &runtime.cfg.automation;
    let registry = ServerRegistry::load(&automation.servers_file)?;
    let (name, entry) = registry
        .find_by_name(server)
        .ok_or_else(|| TriggerError::UnknownServer(server.to_string()))?;
    let runner = trigger::remote_for(entry, automation);
    trigger::run_action(&runner, name, entry, automation, action).await
}

async fn show_progress(bot: &Bot, chat_id: ChatId, steps: u32) {
    if steps == 0 {
        return;
    }
    let sent = match bot.send_message(chat_id, progress_text(1, steps)).await {
        Ok(m) => m,
        Err(err) => {
            warn!(error = %err, "не удалось отправить индикатор прогресса");
            return;
        }
    };
    for step in 2..=steps {
        tokio::time::sleep(PROGRESS_STEP).await;
        let _ = bot
            .edit_message_text(chat_id, sent.id, progress_text(step, steps))
            .await;
    }
}

fn progress_text(step: u32, steps: u32) -> String {
    let done = step.min(steps) as usize;
    let pct = if steps == 0 { 100 } else { step.min(steps) * 100 / steps };
    format!(
        "Прогресс: {}{} {}%",
        "▰".repeat(done),
        "▱".repeat(steps as usize - done),
        pct
    )
}

/// Sends HTML to the chat; when Telegram refuses, posts the plain text to
/// the configured webhook instead.
async fn reply(bot: &Bot, runtime: &TelegramRuntime, chat_id: ChatId, text: String) {
    let err = match bot
        .send_message(chat_id, text.clone())
        .parse_mode(ParseMode::Html)
        .await
    {
        Ok(_) => return,
        Err(err) => err,
    };
    warn!(chat_id = chat_id.0, error = %err, "не удалось отправить сообщение в Telegram");

    let Some(url) = runtime.cfg.notify.webhook_url.as_deref() else {
        return;
    };
    if let Err(err) = notify::post_webhook(&runtime.http, url, &html_to_plain(&text)).await {
        error!(error = %err, "резервная отправка через webhook не удалась");
    }
}

fn help_text() -> String {
    [
        "<b>Команды</b>",
        "• /server ip=&lt;имя&gt; action=&lt;действие&gt; - запустить действие на сервере",
        "• /servers - список серверов",
        "• /report - отчёт по ресурсам, базам и бэкапам этого хоста",
        "• /help - эта справка",
    ]
    .join("\n")
}

fn format_server_list<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let lines = names
        .map(|n| format!("• <code>{}</code>", html::escape(n)))
        .collect::<Vec<_>>();
    if lines.is_empty() {
        return "🖥 <b>Серверы</b>\n\nн/д".to_string();
    }
    format!("🖥 <b>Серверы</b>\n\n{}", lines.join("\n"))
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("\n…");
    out
}

fn html_to_plain(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn elapsed_human(started: Instant) -> String {
    humantime::format_duration(Duration::from_secs(started.elapsed().as_secs())).to_string()
}

async fn consume_rate_limit(runtime: &TelegramRuntime, chat_id: i64) -> bool {
    let now = now_unix();
    let mut limiter = runtime.limiter.lock().await;
    limiter.allow(chat_id, now)
}

pub fn should_handle_message(is_private: bool, chat_id: i64, allowed: &HashSet<i64>) -> bool {
    is_private && allowed.contains(&chat_id)
}

#[derive(Debug)]
struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_unix - ts >= 60 {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_unix);
        true
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_ignores_non_private_and_not_allowed() {
        let allowed: HashSet<i64> = [100].into_iter().collect();

        assert!(!should_handle_message(false, 100, &allowed));
        assert!(!should_handle_message(true, 101, &allowed));
        assert!(should_handle_message(true, 100, &allowed));
    }

    #[test]
    fn rate_limiter_enforces_limit() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow(1, 10));
        assert!(limiter.allow(1, 20));
        assert!(!limiter.allow(1, 30));
        assert!(limiter.allow(2, 30));
        assert!(limiter.allow(1, 71));
    }

    #[test]
    fn server_command_parses_pairs_and_defaults_action() {
        let action = Action::from_command("/server IP=Web01", "monitor");
        assert_eq!(
            action,
            Some(Action::Server(ServerRequest {
                server: Some("Web01".to_string()),
                action: "monitor".to_string(),
            }))
        );

        let action = Action::from_command("/server@clientwatch_bot action=backup ip=db01", "monitor");
        assert_eq!(
            action,
            Some(Action::Server(ServerRequest {
                server: Some("db01".to_string()),
                action: "backup".to_string(),
            }))
        );
    }

    #[test]
    fn server_command_without_ip_keeps_server_empty() {
        let Some(Action::Server(request)) = Action::from_command("/server action=monitor", "x")
        else {
            panic!("ожидалась команда /server");
        };
        assert_eq!(request.server, None);
    }

    #[test]
    fn other_commands_and_garbage() {
        assert_eq!(Action::from_command("/Report", "m"), Some(Action::Report));
        assert_eq!(Action::from_command("/servers", "m"), Some(Action::Servers));
        assert_eq!(Action::from_command("hello", "m"), None);
        assert_eq!(Action::from_command("", "m"), None);
    }

    #[test]
    fn parse_args_skips_malformed_tokens() {
        let args = parse_args("ip= =x a-b=c Key=v ok=1=2");
        assert_eq!(args.get("key").map(String::as_str), Some("v"));
        assert_eq!(args.get("ok").map(String::as_str), Some("1=2"));
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn progress_bar_fills_up() {
        assert_eq!(progress_text(1, 6), "Прогресс: ▰▱▱▱▱▱ 16%");
        assert_eq!(progress_text(6, 6), "Прогресс: ▰▰▰▰▰▰ 100%");
    }

    #[test]
    fn plain_fallback_strips_markup() {
        assert_eq!(
            html_to_plain("✅ <b>ok</b> <code>a &lt;b&gt; &amp; c</code>"),
            "✅ ok a <b> & c"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("абв", 5), "абв");
        assert_eq!(truncate_chars("абвгд", 2), "аб\n…");
    }
}
