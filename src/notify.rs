use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("ошибка запроса webhook: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook ответил статусом {0}")]
    Status(u16),
    #[error("не удалось сериализовать сообщение: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn webhook_payload(text: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&serde_json::json!({ "text": text }))
}

/// Posts `{"text": ...}` to an incoming-webhook URL.
pub async fn post_webhook(client: &Client, url: &str, text: &str) -> Result<(), NotifyError> {
    let body = webhook_payload(text)?;
    let resp = client
        .post(url)
        .timeout(WEBHOOK_TIMEOUT)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(NotifyError::Status(status.as_u16()));
    }
    debug!(status = status.as_u16(), "сообщение отправлено в webhook");
    Ok(())
}

pub fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!("clientwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_escapes_text() {
        let body = webhook_payload("line \"one\"\nline two").expect("json");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("разбор");
        assert_eq!(value["text"], "line \"one\"\nline two");
    }

    #[tokio::test]
    async fn unreachable_webhook_is_an_error() {
        let client = http_client();
        let err = post_webhook(&client, "http://127.0.0.1:9/hook", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)));
    }
}
