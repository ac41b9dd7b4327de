// CRM 转发出口：规范化后的文本事件以 JSON 推送给第三方。
use crate::config::ForwardConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardEvent {
    pub bot_wxid: String,
    pub host_id: String,
    pub client_id: i64,
    pub event_id: Option<String>,
    pub event_type: String,
    pub origin_type: Option<String>,
    pub room_wxid: Option<String>,
    pub from_wxid: String,
    pub to_wxid: String,
    pub content: String,
    pub timestamp: f64,
    #[serde(default)]
    pub payload: Value,
}

#[async_trait]
pub trait ForwardSink: Send + Sync {
    async fn forward(&self, event: &ForwardEvent) -> Result<()>;
}

/// 未配置转发地址时使用，事件只落库不外发。
pub struct NoopForwardSink;

#[async_trait]
impl ForwardSink for NoopForwardSink {
    async fn forward(&self, _event: &ForwardEvent) -> Result<()> {
        Ok(())
    }
}

pub struct HttpForwardSink {
    http: Client,
    url: String,
    token: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl HttpForwardSink {
    pub fn from_config(http: Client, config: &ForwardConfig) -> Option<Self> {
        let url = config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?
            .to_string();
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let headers = config
            .headers
            .iter()
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Some(Self {
            http,
            url,
            token,
            headers,
            timeout: Duration::from_secs(config.timeout_s.unwrap_or(10).max(1)),
        })
    }
}

#[async_trait]
impl ForwardSink for HttpForwardSink {
    async fn forward(&self, event: &ForwardEvent) -> Result<()> {
        let mut request = self.http.post(&self.url).timeout(self.timeout).json(event);
        if let Some(token) = self.token.as_ref() {
            request = request.bearer_auth(token);
        }
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("forward request failed: {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("forward sink returned {status}: {body}"));
        }
        Ok(())
    }
}
