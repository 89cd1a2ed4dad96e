//! Chat-robot webhooks (DingTalk, WeCom, Feishu) and the generic custom webhook.
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info};
use ring::hmac;
use serde::Deserialize;
use serde_json::json;

use super::NotifyEvent;
use crate::config::{BodyTemplate, DingTalkConfig, FeishuConfig, WebhookConfig, WeComConfig};
use crate::storage::now_millis;

const DINGTALK_URL: &str = "https://oapi.dingtalk.com/robot/send?access_token=";
const WECOM_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=";
const FEISHU_URL: &str = "https://open.feishu.cn/open-apis/bot/v2/hook/";

/// `base64(HMAC-SHA256(secret, "{timestamp}\n{secret}"))`, as DingTalk robots expect.
pub fn dingtalk_sign(timestamp_ms: i64, secret: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let to_sign = format!("{}\n{}", timestamp_ms, secret);
    let tag = hmac::sign(&key, to_sign.as_bytes());
    STANDARD.encode(tag.as_ref())
}

pub fn dingtalk_url(cfg: &DingTalkConfig, timestamp_ms: i64) -> String {
    let mut url = format!("{}{}", DINGTALK_URL, urlencoding::encode(&cfg.access_token));
    if let Some(secret) = cfg.sign_secret.as_deref().filter(|s| !s.is_empty()) {
        let sign = dingtalk_sign(timestamp_ms, secret);
        url.push_str(&format!(
            "&timestamp={}&sign={}",
            timestamp_ms,
            urlencoding::encode(&sign)
        ));
    }
    url
}

/// Robot APIs answer 200 with an `errcode` body on logical failure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RobotReply {
    errcode: i64,
    errmsg: String,
    code: i64,
    msg: String,
}

async fn post_json(client: &reqwest::Client, url: &str, body: &serde_json::Value) -> Result<String> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .context("request failed")?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("HTTP {}: {}", status.as_u16(), text);
    }
    Ok(text)
}

fn check_robot_reply(text: &str) -> Result<()> {
    let reply: RobotReply = serde_json::from_str(text).unwrap_or_default();
    if reply.errcode != 0 {
        bail!("errcode {}: {}", reply.errcode, reply.errmsg);
    }
    if reply.code != 0 {
        bail!("code {}: {}", reply.code, reply.msg);
    }
    Ok(())
}

pub async fn send_dingtalk(client: &reqwest::Client, cfg: &DingTalkConfig, message: &str) -> Result<()> {
    let body = json!({ "msgtype": "text", "text": { "content": message } });
    let text = post_json(client, &dingtalk_url(cfg, now_millis()), &body).await?;
    check_robot_reply(&text)
}

pub async fn send_wecom(client: &reqwest::Client, cfg: &WeComConfig, message: &str) -> Result<()> {
    let url = format!("{}{}", WECOM_URL, urlencoding::encode(&cfg.key));
    let body = json!({ "msgtype": "text", "text": { "content": message } });
    let text = post_json(client, &url, &body).await?;
    check_robot_reply(&text)
}

pub async fn send_feishu(client: &reqwest::Client, cfg: &FeishuConfig, message: &str) -> Result<()> {
    let url = format!("{}{}", FEISHU_URL, urlencoding::encode(&cfg.token));
    let body = json!({ "msg_type": "text", "content": { "text": message } });
    let text = post_json(client, &url, &body).await?;
    check_robot_reply(&text)
}

/// JSON string contents without the surrounding quotes.
fn json_escape(s: &str) -> String {
    let quoted = serde_json::Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Substitute `{{tag}}` placeholders. Values are JSON-escaped; unknown tags
/// and unterminated `{{` are left as written.
pub fn render_custom(template: &str, message: &str, event: &NotifyEvent) -> String {
    let mut out = String::with_capacity(template.len() + message.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let tag = &after[..end];
        let value = match tag.trim() {
            "message" => Some(message.to_string()),
            "from" => Some(event.from.clone()),
            "content" => Some(event.content.clone()),
            "type" => Some(event.kind.to_string()),
            "timestamp" => Some(event.timestamp.to_string()),
            _ => None,
        };
        match value {
            Some(v) => out.push_str(&json_escape(&v)),
            None => {
                out.push_str("{{");
                out.push_str(tag);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn event_fields<'a>(message: &'a str, event: &'a NotifyEvent) -> [(&'static str, String); 5] {
    [
        ("message", message.to_string()),
        ("from", event.from.clone()),
        ("content", event.content.clone()),
        ("type", event.kind.to_string()),
        ("timestamp", event.timestamp.to_string()),
    ]
}

pub async fn send_custom(
    client: &reqwest::Client,
    cfg: &WebhookConfig,
    message: &str,
    event: &NotifyEvent,
) -> Result<()> {
    let method = reqwest::Method::from_bytes(cfg.method.trim().to_uppercase().as_bytes())
        .map_err(|_| anyhow!("unsupported HTTP method '{}'", cfg.method))?;

    let (content_type, body) = match cfg.body_template {
        BodyTemplate::Json => {
            let map: serde_json::Map<String, serde_json::Value> = event_fields(message, event)
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
                .collect();
            ("application/json", serde_json::Value::Object(map).to_string())
        }
        BodyTemplate::Form => {
            let encoded: Vec<String> = event_fields(message, event)
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect();
            ("application/x-www-form-urlencoded", encoded.join("&"))
        }
        BodyTemplate::Custom => {
            let template = cfg
                .custom_body
                .as_deref()
                .ok_or_else(|| anyhow!("custom body template requires custom_body"))?;
            let body = render_custom(template, message, event);
            debug!("Custom webhook body: {}", body);
            ("text/plain", body)
        }
    };

    let mut req = client
        .request(method.clone(), &cfg.url)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(body);
    for (k, v) in &cfg.headers {
        req = req.header(k.as_str(), v.as_str());
    }

    let resp = req.send().await.context("request failed")?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("HTTP {}: {}", status.as_u16(), text);
    }
    info!("Custom webhook {} {} delivered", method, cfg.url);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventKind;

    fn event() -> NotifyEvent {
        NotifyEvent {
            kind: EventKind::Sms,
            from: "10086".to_string(),
            content: "line1\n\"quoted\"".to_string(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn dingtalk_signature_is_stable_base64() {
        let a = dingtalk_sign(1_700_000_000_000, "SECabc");
        let b = dingtalk_sign(1_700_000_000_000, "SECabc");
        assert_eq!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 32);
        assert_ne!(a, dingtalk_sign(1_700_000_000_001, "SECabc"));
    }

    #[test]
    fn dingtalk_url_signs_only_with_secret() {
        let mut cfg = DingTalkConfig {
            enabled: true,
            access_token: "tok".to_string(),
            sign_secret: None,
        };
        assert_eq!(
            dingtalk_url(&cfg, 1),
            "https://oapi.dingtalk.com/robot/send?access_token=tok"
        );
        cfg.sign_secret = Some("SECabc".to_string());
        let url = dingtalk_url(&cfg, 1_700_000_000_000);
        assert!(url.contains("&timestamp=1700000000000&sign="));
        assert!(!url.ends_with("sign="));
        let sign = url.split("&sign=").nth(1).unwrap();
        assert!(!sign.contains('+') && !sign.contains('/') && !sign.contains('='));
    }

    #[test]
    fn custom_template_substitutes_and_escapes() {
        let body = render_custom(
            r#"{"text":"{{message}}","from":"{{from}}","x":"{{unknown}}","kind":"{{ type }}"}"#,
            "hi \"there\"\nbye",
            &event(),
        );
        assert_eq!(
            body,
            r#"{"text":"hi \"there\"\nbye","from":"10086","x":"{{unknown}}","kind":"sms"}"#
        );
    }

    #[test]
    fn custom_template_keeps_unterminated_tag() {
        assert_eq!(render_custom("a {{message", "m", &event()), "a {{message");
    }

    #[test]
    fn robot_reply_errors_are_detected() {
        assert!(check_robot_reply(r#"{"errcode":0,"errmsg":"ok"}"#).is_ok());
        assert!(check_robot_reply(r#"{"errcode":93000,"errmsg":"invalid key"}"#).is_err());
        assert!(check_robot_reply(r#"{"code":19001,"msg":"param invalid"}"#).is_err());
        assert!(check_robot_reply("not json").is_ok());
    }
}
