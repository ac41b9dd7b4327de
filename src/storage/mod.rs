// 存储模块：会话、权限、房间、对话记录、关键词资源等持久化读写。

mod sqlite;

use crate::config::StorageConfig;
use anyhow::Result;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

#[derive(Debug, Clone, PartialEq)]
pub struct BotSessionRecord {
    pub wxid: String,
    pub nickname: String,
    pub host_id: String,
    pub client_slot: Option<i64>,
    pub login_at: Option<f64>,
    pub heartbeat_at: Option<f64>,
    pub expires_at: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PermissionRows {
    pub globals: Vec<(String, bool)>,
    pub overrides: Vec<(String, String, bool)>,
}

#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub bot_wxid: String,
    pub room_wxid: String,
    pub display_name: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct ConversationMessageRecord {
    pub bot_wxid: String,
    pub room_wxid: Option<String>,
    pub peer_wxid: String,
    pub sender_wxid: String,
    pub event_id: Option<String>,
    pub origin_type: Option<String>,
    pub content: String,
    pub created_at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordResourceRecord {
    pub keyword: String,
    pub kind: String,
    pub content: String,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInOutcome {
    pub inserted: bool,
    pub rank: i64,
}

pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn get_bot_session(&self, wxid: &str) -> Result<Option<BotSessionRecord>>;
    fn get_bot_session_by_slot(
        &self,
        host_id: &str,
        client_slot: i64,
    ) -> Result<Option<BotSessionRecord>>;
    fn upsert_bot_session(&self, record: &BotSessionRecord) -> Result<()>;
    fn clear_bot_session(&self, wxid: &str, now: f64) -> Result<usize>;
    fn list_bot_sessions(&self) -> Result<Vec<BotSessionRecord>>;

    fn load_permissions(&self, bot_wxid: &str) -> Result<PermissionRows>;
    fn set_feature_global(&self, bot_wxid: &str, feature: &str, enabled: bool) -> Result<()>;
    fn set_feature_override(
        &self,
        bot_wxid: &str,
        feature: &str,
        scope_id: &str,
        enabled: Option<bool>,
    ) -> Result<()>;

    fn ensure_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<bool>;
    fn set_room_display_name(&self, bot_wxid: &str, room_wxid: &str, name: &str) -> Result<()>;
    fn get_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<Option<RoomRecord>>;

    fn insert_conversation_message(&self, record: &ConversationMessageRecord) -> Result<()>;
    fn list_conversation_messages(
        &self,
        bot_wxid: &str,
        room_wxid: &str,
        limit: i64,
    ) -> Result<Vec<ConversationMessageRecord>>;
    fn delete_conversation_messages_by_room(&self, bot_wxid: &str, room_wxid: &str)
        -> Result<i64>;

    fn get_keyword_resource(&self, keyword: &str) -> Result<Option<KeywordResourceRecord>>;
    fn upsert_keyword_resource(&self, record: &KeywordResourceRecord) -> Result<()>;

    fn add_subscription(&self, bot_wxid: &str, target: &str, keyword: &str) -> Result<bool>;
    fn remove_subscription(&self, bot_wxid: &str, target: &str, keyword: &str) -> Result<bool>;
    fn list_subscriptions(&self, bot_wxid: &str, target: &str) -> Result<Vec<String>>;

    fn record_check_in(
        &self,
        bot_wxid: &str,
        room_wxid: &str,
        member_wxid: &str,
        day: &str,
    ) -> Result<CheckInOutcome>;
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage = Arc::new(SqliteStorage::new(config.db_path.trim().to_string()));
    storage.ensure_initialized()?;
    Ok(storage)
}
