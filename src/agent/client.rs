use crate::agent::AgentTarget;
use crate::config_store::ConfigStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_AGENT_TIMEOUT_S: u64 = 15;

/// 远端代理暴露的调用面；管线只依赖这些动作存在，不关心实现。
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn decrypt_image(
        &self,
        target: &AgentTarget,
        src: &str,
        dest: &str,
        size: u64,
    ) -> Result<()>;

    async fn transcribe_voice(&self, target: &AgentTarget, msgid: &str) -> Result<()>;

    /// 刷新好友、群聊与公众号三类通讯录。
    async fn refresh_roster(&self, target: &AgentTarget) -> Result<()>;

    async fn send_text(&self, target: &AgentTarget, to_wxid: &str, content: &str) -> Result<()>;

    async fn send_contact_card(
        &self,
        target: &AgentTarget,
        to_wxid: &str,
        card_wxid: &str,
    ) -> Result<()>;

    async fn respawn_client(&self, target: &AgentTarget) -> Result<()>;

    async fn accept_transfer(
        &self,
        target: &AgentTarget,
        from_wxid: &str,
        transfer_id: &str,
    ) -> Result<()>;
}

pub struct HttpAgentClient {
    http: Client,
    config_store: ConfigStore,
}

impl HttpAgentClient {
    pub fn new(http: Client, config_store: ConfigStore) -> Self {
        Self { http, config_store }
    }

    async fn call(&self, target: &AgentTarget, action: &str, mut body: Value) -> Result<Value> {
        let config = self.config_store.get().await;
        let host = config
            .agent_by_host(&target.host_id)
            .ok_or_else(|| anyhow!("agent host not configured: {}", target.host_id))?;
        let base_url = host.base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("agent host has no base_url: {}", target.host_id));
        }
        if let Value::Object(map) = &mut body {
            map.insert("client_id".to_string(), json!(target.client_id));
        }
        let url = format!("{base_url}/api/{action}");
        let timeout = Duration::from_secs(host.timeout_s.unwrap_or(DEFAULT_AGENT_TIMEOUT_S).max(1));
        debug!("agent call: {action} -> {target}");
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("agent request failed: {action} {target}"))?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("agent {action} returned {status}: {payload}"));
        }
        // 代理约定 code 非 0 表示业务失败。
        if let Some(code) = payload.get("code").and_then(Value::as_i64) {
            if code != 0 {
                let msg = payload.get("msg").and_then(Value::as_str).unwrap_or("");
                return Err(anyhow!("agent {action} failed: code={code} msg={msg}"));
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn decrypt_image(
        &self,
        target: &AgentTarget,
        src: &str,
        dest: &str,
        size: u64,
    ) -> Result<()> {
        self.call(
            target,
            "decrypt_image",
            json!({ "src": src, "dest": dest, "size": size }),
        )
        .await
        .map(|_| ())
    }

    async fn transcribe_voice(&self, target: &AgentTarget, msgid: &str) -> Result<()> {
        self.call(target, "voice_to_text", json!({ "msgid": msgid }))
            .await
            .map(|_| ())
    }

    async fn refresh_roster(&self, target: &AgentTarget) -> Result<()> {
        for action in ["get_friends", "get_rooms", "get_public_accounts"] {
            self.call(target, action, json!({ "refresh": true })).await?;
        }
        Ok(())
    }

    async fn send_text(&self, target: &AgentTarget, to_wxid: &str, content: &str) -> Result<()> {
        self.call(
            target,
            "send_text",
            json!({ "to_wxid": to_wxid, "content": content }),
        )
        .await
        .map(|_| ())
    }

    async fn send_contact_card(
        &self,
        target: &AgentTarget,
        to_wxid: &str,
        card_wxid: &str,
    ) -> Result<()> {
        self.call(
            target,
            "send_card",
            json!({ "to_wxid": to_wxid, "card_wxid": card_wxid }),
        )
        .await
        .map(|_| ())
    }

    async fn respawn_client(&self, target: &AgentTarget) -> Result<()> {
        self.call(target, "respawn_client", json!({})).await.map(|_| ())
    }

    async fn accept_transfer(
        &self,
        target: &AgentTarget,
        from_wxid: &str,
        transfer_id: &str,
    ) -> Result<()> {
        self.call(
            target,
            "accept_transfer",
            json!({ "from_wxid": from_wxid, "transferid": transfer_id }),
        )
        .await
        .map(|_| ())
    }
}
