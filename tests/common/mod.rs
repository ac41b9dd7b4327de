// 集成测试共用的桩实现：记录外呼的代理与收集转发事件的出口。
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wxhub_server::agent::{AgentClient, AgentTarget, ForwardEvent, ForwardSink};
use wxhub_server::config::{AgentHostConfig, Config};
use wxhub_server::pipeline::envelope::Envelope;
use wxhub_server::pipeline::{Pipeline, PipelineOutcome, PipelineServices};
use wxhub_server::storage::{SqliteStorage, StorageBackend};

pub const BOT_WXID: &str = "wxid_bot";
pub const ADMIN_WXID: &str = "wxid_admin";
pub const HOST_TOKEN: &str = "token-pc-1";

#[derive(Default)]
pub struct RecordingAgent {
    calls: Mutex<Vec<String>>,
}

impl RecordingAgent {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn push(&self, call: String) -> Result<()> {
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl AgentClient for RecordingAgent {
    async fn decrypt_image(&self, _: &AgentTarget, src: &str, dest: &str, size: u64) -> Result<()> {
        self.push(format!("decrypt_image {src} {dest} {size}"))
    }

    async fn transcribe_voice(&self, _: &AgentTarget, msgid: &str) -> Result<()> {
        self.push(format!("transcribe_voice {msgid}"))
    }

    async fn refresh_roster(&self, target: &AgentTarget) -> Result<()> {
        self.push(format!("refresh_roster {target}"))
    }

    async fn send_text(&self, _: &AgentTarget, to: &str, content: &str) -> Result<()> {
        self.push(format!("send_text {to} {content}"))
    }

    async fn send_contact_card(&self, _: &AgentTarget, to: &str, card: &str) -> Result<()> {
        self.push(format!("send_contact_card {to} {card}"))
    }

    async fn respawn_client(&self, target: &AgentTarget) -> Result<()> {
        self.push(format!("respawn_client {target}"))
    }

    async fn accept_transfer(&self, _: &AgentTarget, from: &str, id: &str) -> Result<()> {
        self.push(format!("accept_transfer {from} {id}"))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ForwardEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ForwardEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ForwardSink for RecordingSink {
    async fn forward(&self, event: &ForwardEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.agents = vec![AgentHostConfig {
        host_id: "pc-1".to_string(),
        token: HOST_TOKEN.to_string(),
        base_url: "http://127.0.0.1:1".to_string(),
        ..AgentHostConfig::default()
    }];
    config.pipeline.image_decrypt_pacing = false;
    config.pipeline.admin_wxids = vec![ADMIN_WXID.to_string()];
    config.media.public_base_url = "https://media.example.com/wx".to_string();
    config
}

pub struct TestHub {
    pub agent: Arc<RecordingAgent>,
    pub sink: Arc<RecordingSink>,
    pub storage: Arc<dyn StorageBackend>,
    pub services: Arc<PipelineServices>,
    pub pipeline: Pipeline,
    pub config: Config,
    _dir: TempDir,
}

impl TestHub {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("wxhub.db");
        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
        storage.ensure_initialized().expect("init storage");
        let agent = Arc::new(RecordingAgent::default());
        let sink = Arc::new(RecordingSink::default());
        let services = Arc::new(PipelineServices::new(
            storage.clone(),
            agent.clone(),
            sink.clone(),
            &config.pipeline,
        ));
        let pipeline = Pipeline::new(services.clone(), &config.pipeline);
        Self {
            agent,
            sink,
            storage,
            services,
            pipeline,
            config,
            _dir: dir,
        }
    }

    pub fn host(&self) -> AgentHostConfig {
        self.config.agents[0].clone()
    }

    pub async fn send(&self, event_type: &str, client_id: i64, data: Value) -> PipelineOutcome {
        let envelope = Envelope::new(event_type, client_id, data);
        let outcome = self
            .pipeline
            .process(&self.host(), envelope, &self.config)
            .await;
        self.pipeline.drain_outward().await;
        outcome
    }

    /// 在槽位 1 上登录机器人，后续事件才能解析出所属身份。
    pub async fn login(&self) {
        let outcome = self
            .send("login", 1, json!({"wxid": BOT_WXID, "nickname": "Helper"}))
            .await;
        assert_eq!(outcome, PipelineOutcome::Lifecycle);
    }
}
