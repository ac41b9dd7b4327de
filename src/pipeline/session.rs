// 会话状态机：二维码 -> 登录 -> 心跳存活 -> 登出，生命周期事件在这里终结。
use crate::agent::{AgentClient, AgentTarget, OutwardCalls};
use crate::config::PipelineConfig;
use crate::pipeline::envelope::{self, value_as_string, Envelope};
use crate::pipeline::storage_call;
use crate::pipeline::ttl_cache::TtlCache;
use crate::storage::{BotSessionRecord, StorageBackend};
use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    QrIssued,
    LoggedIn,
    Live,
    LoggedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct QrEntry {
    pub host_id: String,
    pub client_id: i64,
    pub payload: Value,
    pub issued_at: f64,
}

/// 最近签发的二维码，按 (主机, 槽位) 只保留一条，总量有上限。
pub struct QrPool {
    capacity: usize,
    entries: Mutex<VecDeque<QrEntry>>,
}

impl QrPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, target: &AgentTarget, payload: Value) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| !Self::matches(entry, target));
        entries.push_back(QrEntry {
            host_id: target.host_id.clone(),
            client_id: target.client_id,
            payload,
            issued_at: now_ts(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn clear(&self, target: &AgentTarget) {
        self.entries
            .lock()
            .retain(|entry| !Self::matches(entry, target));
    }

    pub fn latest(&self, target: &AgentTarget) -> Option<QrEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|entry| Self::matches(entry, target))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(entry: &QrEntry, target: &AgentTarget) -> bool {
        entry.host_id == target.host_id && entry.client_id == target.client_id
    }
}

pub struct SessionManager {
    storage: Arc<dyn StorageBackend>,
    agent: Arc<dyn AgentClient>,
    outward: OutwardCalls,
    qr_pool: QrPool,
    phases: DashMap<AgentTarget, SessionPhase>,
    roster_debounce: TtlCache<String, ()>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        agent: Arc<dyn AgentClient>,
        outward: OutwardCalls,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            storage,
            agent,
            outward,
            qr_pool: QrPool::new(config.qr_pool_capacity),
            phases: DashMap::new(),
            roster_debounce: TtlCache::new(),
        }
    }

    pub fn phase(&self, target: &AgentTarget) -> SessionPhase {
        self.phases
            .get(target)
            .map(|phase| *phase)
            .unwrap_or(SessionPhase::Disconnected)
    }

    pub fn latest_qr(&self, target: &AgentTarget) -> Option<QrEntry> {
        self.qr_pool.latest(target)
    }

    pub async fn resolve_bot(&self, target: &AgentTarget) -> Result<Option<BotSessionRecord>> {
        if !target.has_client() {
            return Ok(None);
        }
        let host_id = target.host_id.clone();
        let client_id = target.client_id;
        storage_call(&self.storage, move |storage| {
            storage.get_bot_session_by_slot(&host_id, client_id)
        })
        .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<BotSessionRecord>> {
        storage_call(&self.storage, |storage| storage.list_bot_sessions()).await
    }

    pub async fn handle(
        &self,
        target: &AgentTarget,
        envelope: &Envelope,
        config: &PipelineConfig,
    ) -> Result<()> {
        match envelope.event_type.as_str() {
            envelope::QRCODE => {
                self.on_qrcode(target, envelope);
                Ok(())
            }
            envelope::LOGIN => self.on_login(target, &envelope.data, config).await,
            envelope::LOGOUT => self.on_logout(target, &envelope.data).await,
            envelope::DISCONNECT => {
                let agent = self.agent.clone();
                let respawn_target = target.clone();
                self.outward
                    .spawn(format!("respawn_client {target}"), async move {
                        agent.respawn_client(&respawn_target).await
                    });
                self.on_logout(target, &envelope.data).await
            }
            envelope::HEARTBEAT | envelope::DATA_OWNER => {
                self.on_heartbeat(target, &envelope.data).await
            }
            other => {
                debug!("not a lifecycle event: {other}");
                Ok(())
            }
        }
    }

    fn on_qrcode(&self, target: &AgentTarget, envelope: &Envelope) {
        if envelope.is_empty_data() {
            // 代理首次启动会发空二维码探测。
            debug!("qrcode probe ignored: {target}");
            return;
        }
        self.qr_pool
            .record(target, Value::Object(envelope.data.clone()));
        self.phases.insert(target.clone(), SessionPhase::QrIssued);
        info!("qrcode issued: {target}");
    }

    async fn on_login(
        &self,
        target: &AgentTarget,
        data: &Map<String, Value>,
        config: &PipelineConfig,
    ) -> Result<()> {
        self.qr_pool.clear(target);
        let wxid = value_as_string(data.get("wxid"));
        if wxid.is_empty() {
            warn!("login event without wxid: {target}");
            return Ok(());
        }
        let nickname = value_as_string(data.get("nickname"));
        let now = now_ts();
        let lookup = wxid.clone();
        let existing =
            storage_call(&self.storage, move |storage| storage.get_bot_session(&lookup)).await?;
        let record = match existing {
            Some(mut record) => {
                if !nickname.is_empty() {
                    record.nickname = nickname;
                }
                record.host_id = target.host_id.clone();
                record.client_slot = Some(target.client_id);
                record.login_at = Some(now);
                record.heartbeat_at = Some(now);
                record.updated_at = now;
                record
            }
            None => {
                info!("new bot session: wxid={wxid}, {target}");
                BotSessionRecord {
                    wxid: wxid.clone(),
                    nickname,
                    host_id: target.host_id.clone(),
                    client_slot: Some(target.client_id),
                    login_at: Some(now),
                    heartbeat_at: Some(now),
                    expires_at: None,
                    created_at: now,
                    updated_at: now,
                }
            }
        };
        storage_call(&self.storage, move |storage| storage.upsert_bot_session(&record)).await?;
        self.phases.insert(target.clone(), SessionPhase::LoggedIn);

        let debounce = Duration::from_secs(config.roster_refresh_debounce_s);
        if self.roster_debounce.insert_if_absent(wxid.clone(), (), debounce) {
            let agent = self.agent.clone();
            let refresh_target = target.clone();
            self.outward
                .spawn(format!("refresh_roster {wxid} {target}"), async move {
                    agent.refresh_roster(&refresh_target).await
                });
        } else {
            debug!("roster refresh debounced: wxid={wxid}");
        }
        Ok(())
    }

    async fn on_logout(&self, target: &AgentTarget, data: &Map<String, Value>) -> Result<()> {
        self.qr_pool.clear(target);
        self.phases.insert(target.clone(), SessionPhase::LoggedOut);
        let Some(record) = self.lookup_for_event(target, data).await? else {
            debug!("logout for unknown session: {target}");
            return Ok(());
        };
        let wxid = record.wxid.clone();
        let now = now_ts();
        storage_call(&self.storage, move |storage| {
            storage.clear_bot_session(&wxid, now)
        })
        .await?;
        info!("bot logged out: wxid={}, {target}", record.wxid);
        Ok(())
    }

    async fn on_heartbeat(&self, target: &AgentTarget, data: &Map<String, Value>) -> Result<()> {
        let Some(mut record) = self.lookup_for_event(target, data).await? else {
            warn!("heartbeat from unknown session dropped: {target}");
            return Ok(());
        };
        let now = now_ts();
        record.host_id = target.host_id.clone();
        record.client_slot = Some(target.client_id);
        record.heartbeat_at = Some(now);
        record.updated_at = now;
        storage_call(&self.storage, move |storage| storage.upsert_bot_session(&record)).await?;
        self.phases.insert(target.clone(), SessionPhase::Live);
        Ok(())
    }

    /// data 带 wxid 时按身份查，否则按当前槽位查。
    async fn lookup_for_event(
        &self,
        target: &AgentTarget,
        data: &Map<String, Value>,
    ) -> Result<Option<BotSessionRecord>> {
        let wxid = value_as_string(data.get("wxid"));
        if wxid.is_empty() {
            return self.resolve_bot(target).await;
        }
        storage_call(&self.storage, move |storage| storage.get_bot_session(&wxid)).await
    }
}

/// 心跳为空或超过阈值都视为失联，由外部巡检任务决定如何处理。
pub fn is_heartbeat_stale(record: &BotSessionRecord, now: f64, stale_s: u64) -> bool {
    match record.heartbeat_at {
        Some(heartbeat_at) => now - heartbeat_at > stale_s as f64,
        None => true,
    }
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
