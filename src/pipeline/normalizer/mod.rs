// 内容规范化链：各类非文本消息改写为统一的文本事件，未认领的类型原样放行。
pub mod file;
pub mod image;
pub mod link;
pub mod misc;
pub mod room_member;
pub mod system;
pub mod voice;

/// 拼接非空片段，片段之间用单个空格分隔。
pub(crate) fn join_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::agent::{AgentClient, AgentTarget, ForwardEvent, ForwardSink};
    use crate::config::{AgentHostConfig, Config};
    use crate::pipeline::context::{BotIdentity, EventContext};
    use crate::pipeline::PipelineServices;
    use crate::storage::{
        BotSessionRecord, CheckInOutcome, ConversationMessageRecord, KeywordResourceRecord,
        PermissionRows, RoomRecord, SqliteStorage, StorageBackend,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct RecordingAgent {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingAgent {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
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
        async fn refresh_roster(&self, _: &AgentTarget) -> Result<()> {
            self.push("refresh_roster".to_string())
        }
        async fn send_text(&self, _: &AgentTarget, to: &str, content: &str) -> Result<()> {
            self.push(format!("send_text {to} {content}"))
        }
        async fn send_contact_card(&self, _: &AgentTarget, to: &str, card: &str) -> Result<()> {
            self.push(format!("send_contact_card {to} {card}"))
        }
        async fn respawn_client(&self, _: &AgentTarget) -> Result<()> {
            self.push("respawn_client".to_string())
        }
        async fn accept_transfer(&self, _: &AgentTarget, from: &str, id: &str) -> Result<()> {
            self.push(format!("accept_transfer {from} {id}"))
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<ForwardEvent>>,
    }

    #[async_trait]
    impl ForwardSink for RecordingSink {
        async fn forward(&self, event: &ForwardEvent) -> Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    /// 权限读取的暂停点：读完行后通知 `loaded`，等到 `release` 再返回。
    pub struct LoadPause {
        pub loaded: mpsc::Sender<()>,
        pub release: mpsc::Receiver<()>,
    }

    /// 包一层 SQLite：可让写操作失败、暂停一次权限读取，并统计关键词查询次数。
    pub struct FaultyStorage {
        inner: SqliteStorage,
        pub fail_writes: AtomicBool,
        pub pause_next_load: Mutex<Option<LoadPause>>,
        pub keyword_reads: AtomicUsize,
    }

    impl FaultyStorage {
        fn new(inner: SqliteStorage) -> Self {
            Self {
                inner,
                fail_writes: AtomicBool::new(false),
                pause_next_load: Mutex::new(None),
                keyword_reads: AtomicUsize::new(0),
            }
        }

        fn check_write(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("storage unavailable"));
            }
            Ok(())
        }
    }

    impl StorageBackend for FaultyStorage {
        fn ensure_initialized(&self) -> Result<()> {
            self.inner.ensure_initialized()
        }
        fn get_bot_session(&self, wxid: &str) -> Result<Option<BotSessionRecord>> {
            self.inner.get_bot_session(wxid)
        }
        fn get_bot_session_by_slot(&self, host_id: &str, slot: i64) -> Result<Option<BotSessionRecord>> {
            self.inner.get_bot_session_by_slot(host_id, slot)
        }
        fn upsert_bot_session(&self, record: &BotSessionRecord) -> Result<()> {
            self.check_write()?;
            self.inner.upsert_bot_session(record)
        }
        fn clear_bot_session(&self, wxid: &str, now: f64) -> Result<usize> {
            self.check_write()?;
            self.inner.clear_bot_session(wxid, now)
        }
        fn list_bot_sessions(&self) -> Result<Vec<BotSessionRecord>> {
            self.inner.list_bot_sessions()
        }
        fn load_permissions(&self, bot_wxid: &str) -> Result<PermissionRows> {
            let rows = self.inner.load_permissions(bot_wxid)?;
            let pause = self.pause_next_load.lock().take();
            if let Some(pause) = pause {
                let _ = pause.loaded.send(());
                let _ = pause.release.recv();
            }
            Ok(rows)
        }
        fn set_feature_global(&self, bot_wxid: &str, feature: &str, enabled: bool) -> Result<()> {
            self.check_write()?;
            self.inner.set_feature_global(bot_wxid, feature, enabled)
        }
        fn set_feature_override(
            &self,
            bot_wxid: &str,
            feature: &str,
            scope_id: &str,
            enabled: Option<bool>,
        ) -> Result<()> {
            self.check_write()?;
            self.inner.set_feature_override(bot_wxid, feature, scope_id, enabled)
        }
        fn ensure_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<bool> {
            self.check_write()?;
            self.inner.ensure_room(bot_wxid, room_wxid)
        }
        fn set_room_display_name(&self, bot_wxid: &str, room_wxid: &str, name: &str) -> Result<()> {
            self.check_write()?;
            self.inner.set_room_display_name(bot_wxid, room_wxid, name)
        }
        fn get_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<Option<RoomRecord>> {
            self.inner.get_room(bot_wxid, room_wxid)
        }
        fn insert_conversation_message(&self, record: &ConversationMessageRecord) -> Result<()> {
            self.check_write()?;
            self.inner.insert_conversation_message(record)
        }
        fn list_conversation_messages(
            &self,
            bot_wxid: &str,
            room_wxid: &str,
            limit: i64,
        ) -> Result<Vec<ConversationMessageRecord>> {
            self.inner.list_conversation_messages(bot_wxid, room_wxid, limit)
        }
        fn delete_conversation_messages_by_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<i64> {
            self.check_write()?;
            self.inner.delete_conversation_messages_by_room(bot_wxid, room_wxid)
        }
        fn get_keyword_resource(&self, keyword: &str) -> Result<Option<KeywordResourceRecord>> {
            self.keyword_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_keyword_resource(keyword)
        }
        fn upsert_keyword_resource(&self, record: &KeywordResourceRecord) -> Result<()> {
            self.check_write()?;
            self.inner.upsert_keyword_resource(record)
        }
        fn add_subscription(&self, bot_wxid: &str, target: &str, keyword: &str) -> Result<bool> {
            self.check_write()?;
            self.inner.add_subscription(bot_wxid, target, keyword)
        }
        fn remove_subscription(&self, bot_wxid: &str, target: &str, keyword: &str) -> Result<bool> {
            self.check_write()?;
            self.inner.remove_subscription(bot_wxid, target, keyword)
        }
        fn list_subscriptions(&self, bot_wxid: &str, target: &str) -> Result<Vec<String>> {
            self.inner.list_subscriptions(bot_wxid, target)
        }
        fn record_check_in(
            &self,
            bot_wxid: &str,
            room_wxid: &str,
            member_wxid: &str,
            day: &str,
        ) -> Result<CheckInOutcome> {
            self.check_write()?;
            self.inner.record_check_in(bot_wxid, room_wxid, member_wxid, day)
        }
    }

    pub struct Harness {
        pub agent: Arc<RecordingAgent>,
        pub sink: Arc<RecordingSink>,
        pub storage: Arc<dyn StorageBackend>,
        pub faults: Arc<FaultyStorage>,
        pub services: PipelineServices,
        pub config: Config,
        pub host: AgentHostConfig,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let db_path = dir.path().join("wxhub.db");
            let faults = Arc::new(FaultyStorage::new(SqliteStorage::new(
                db_path.to_string_lossy().to_string(),
            )));
            faults.ensure_initialized().expect("init storage");
            let storage: Arc<dyn StorageBackend> = faults.clone();
            let agent = Arc::new(RecordingAgent::default());
            let sink = Arc::new(RecordingSink::default());
            let mut config = Config::default();
            config.pipeline.image_decrypt_pacing = false;
            config.pipeline.monitor_target = Some("wxid_monitor".to_string());
            config.media.public_base_url = "https://media.example.com/wx".to_string();
            let services = PipelineServices::new(
                storage.clone(),
                agent.clone(),
                sink.clone(),
                &config.pipeline,
            );
            Self {
                agent,
                sink,
                storage,
                faults,
                services,
                config,
                host: AgentHostConfig {
                    host_id: "pc-1".to_string(),
                    token: "t".to_string(),
                    ..AgentHostConfig::default()
                },
                _dir: dir,
            }
        }

        pub fn env(&self) -> crate::pipeline::HandlerEnv<'_> {
            crate::pipeline::HandlerEnv {
                services: &self.services,
                config: &self.config,
                host: &self.host,
            }
        }

        pub fn ctx(&self, event_type: &str, payload: Value) -> EventContext {
            let payload = match payload {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            EventContext::new(
                BotIdentity {
                    wxid: "wxid_bot".to_string(),
                    nickname: "Helper".to_string(),
                },
                AgentTarget::new("pc-1", 1),
                event_type,
                payload,
            )
        }

        pub async fn settle(&self) {
            self.services.outward.drain().await;
        }
    }
}
