//! Telegram Bot API `sendMessage`.
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::config::TelegramConfig;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

pub fn send_message_url(cfg: &TelegramConfig) -> String {
    let base = cfg
        .api_base
        .as_deref()
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_API_BASE)
        .trim_end_matches('/');
    format!("{}/bot{}/sendMessage", base, cfg.bot_token)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
}

pub async fn send(client: &reqwest::Client, cfg: &TelegramConfig, message: &str) -> Result<()> {
    let body = json!({ "chat_id": cfg.chat_id, "text": message });
    let resp = client
        .post(send_message_url(cfg))
        .json(&body)
        .send()
        .await
        .context("request failed")?;
    let status = resp.status();
    let reply: ApiReply = resp.json().await.unwrap_or_default();
    if !status.is_success() || !reply.ok {
        bail!(
            "HTTP {}: {}",
            status.as_u16(),
            reply.description.unwrap_or_else(|| "no description".to_string())
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_url_with_default_and_custom_base() {
        let mut cfg = TelegramConfig {
            enabled: true,
            bot_token: "123:abc".to_string(),
            chat_id: "42".to_string(),
            api_base: None,
        };
        assert_eq!(
            send_message_url(&cfg),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
        cfg.api_base = Some("http://proxy.local/".to_string());
        assert_eq!(send_message_url(&cfg), "http://proxy.local/bot123:abc/sendMessage");
    }
}
