// 两层权限：全局开关 + 按会话范围的覆盖值，覆盖存在即胜出。
use crate::config::PipelineConfig;
use crate::pipeline::storage_call;
use crate::storage::{PermissionRows, StorageBackend};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    RoomListen,
    CheckIn,
    KeywordReply,
    AutoAcceptTransfer,
    SystemAlert,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::RoomListen,
        Feature::CheckIn,
        Feature::KeywordReply,
        Feature::AutoAcceptTransfer,
        Feature::SystemAlert,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Feature::RoomListen => "room_listen",
            Feature::CheckIn => "check_in",
            Feature::KeywordReply => "keyword_reply",
            Feature::AutoAcceptTransfer => "auto_accept_transfer",
            Feature::SystemAlert => "system_alert",
        }
    }

    /// 静态默认值表，并非全部为 false。
    pub fn default_enabled(&self) -> bool {
        match self {
            Feature::RoomListen | Feature::CheckIn => false,
            Feature::KeywordReply | Feature::AutoAcceptTransfer | Feature::SystemAlert => true,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|feature| feature.key() == key)
    }

    pub fn keys() -> String {
        Self::ALL
            .iter()
            .map(Feature::key)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// 全局为 true 时按黑名单理解（覆盖 false 即屏蔽），为 false 时按白名单理解；公式相同。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Blacklist,
    Whitelist,
}

impl PermissionMode {
    pub fn for_global(global: bool) -> Self {
        if global {
            PermissionMode::Blacklist
        } else {
            PermissionMode::Whitelist
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PermissionMode::Blacklist => "blacklist",
            PermissionMode::Whitelist => "whitelist",
        }
    }
}

pub fn resolve_layers(global: bool, scope_override: Option<bool>) -> bool {
    scope_override.unwrap_or(global)
}

/// 操作员指令里的取值：Some(None) 表示清除覆盖。
pub fn parse_toggle(value: &str) -> Option<Option<bool>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Some(Some(true)),
        "off" | "0" | "false" => Some(Some(false)),
        "clear" => Some(None),
        _ => None,
    }
}

const ALWAYS_ALLOWED_COMMANDS: &[&str] = &["/config", "/roomid"];

/// 配置类指令必须在群聊闸门之前放行，被静音的群也能重新配置。
pub fn is_always_allowed_command(text: &str) -> bool {
    let text = text.trim();
    ALWAYS_ALLOWED_COMMANDS.iter().any(|prefix| {
        text.strip_prefix(prefix)
            .map(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, Default)]
pub struct BotPermissions {
    globals: HashMap<Feature, bool>,
    overrides: HashMap<Feature, HashMap<String, bool>>,
}

impl BotPermissions {
    pub fn from_rows(rows: PermissionRows) -> Self {
        let mut permissions = BotPermissions::default();
        for (key, enabled) in rows.globals {
            match Feature::from_key(&key) {
                Some(feature) => {
                    permissions.globals.insert(feature, enabled);
                }
                None => warn!("unknown feature in storage ignored: {key}"),
            }
        }
        for (key, scope, enabled) in rows.overrides {
            if let Some(feature) = Feature::from_key(&key) {
                permissions
                    .overrides
                    .entry(feature)
                    .or_default()
                    .insert(scope, enabled);
            }
        }
        permissions
    }

    pub fn global(&self, feature: Feature, config: &PipelineConfig) -> bool {
        if let Some(value) = self.globals.get(&feature) {
            return *value;
        }
        config
            .feature_defaults
            .get(feature.key())
            .copied()
            .unwrap_or_else(|| feature.default_enabled())
    }

    pub fn scope_override(&self, feature: Feature, scope_id: Option<&str>) -> Option<bool> {
        let scope_id = scope_id.map(str::trim).filter(|value| !value.is_empty())?;
        self.overrides.get(&feature)?.get(scope_id).copied()
    }

    pub fn resolve(&self, feature: Feature, scope_id: Option<&str>, config: &PipelineConfig) -> bool {
        resolve_layers(
            self.global(feature, config),
            self.scope_override(feature, scope_id),
        )
    }
}

/// 缓存槽：`generation` 随每次写入递增，读出的行只有在读取期间无写入时才回填。
#[derive(Default)]
struct CacheSlot {
    generation: u64,
    permissions: Option<Arc<BotPermissions>>,
}

/// 存储之上的写穿缓存；读多写少，写入后直接失效对应机器人。
pub struct PermissionResolver {
    storage: Arc<dyn StorageBackend>,
    cache: DashMap<String, CacheSlot>,
}

impl PermissionResolver {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
        }
    }

    pub async fn load(&self, bot_wxid: &str) -> Result<Arc<BotPermissions>> {
        let generation = match self.cache.get(bot_wxid) {
            Some(slot) => {
                if let Some(cached) = &slot.permissions {
                    return Ok(cached.clone());
                }
                slot.generation
            }
            None => 0,
        };
        let bot = bot_wxid.to_string();
        let rows =
            storage_call(&self.storage, move |storage| storage.load_permissions(&bot)).await?;
        let permissions = Arc::new(BotPermissions::from_rows(rows));
        let mut slot = self.cache.entry(bot_wxid.to_string()).or_default();
        if slot.generation == generation {
            slot.permissions = Some(permissions.clone());
        }
        Ok(permissions)
    }

    pub async fn resolve(
        &self,
        bot_wxid: &str,
        feature: Feature,
        scope_id: Option<&str>,
        config: &PipelineConfig,
    ) -> Result<bool> {
        let permissions = self.load(bot_wxid).await?;
        Ok(permissions.resolve(feature, scope_id, config))
    }

    pub async fn set_global(&self, bot_wxid: &str, feature: Feature, enabled: bool) -> Result<()> {
        let bot = bot_wxid.to_string();
        storage_call(&self.storage, move |storage| {
            storage.set_feature_global(&bot, feature.key(), enabled)
        })
        .await?;
        self.invalidate(bot_wxid);
        Ok(())
    }

    pub async fn set_override(
        &self,
        bot_wxid: &str,
        feature: Feature,
        scope_id: &str,
        enabled: Option<bool>,
    ) -> Result<()> {
        let scope_id = scope_id.trim();
        if scope_id.is_empty() {
            return Err(anyhow!("scope id is empty"));
        }
        let bot = bot_wxid.to_string();
        let scope = scope_id.to_string();
        storage_call(&self.storage, move |storage| {
            storage.set_feature_override(&bot, feature.key(), &scope, enabled)
        })
        .await?;
        self.invalidate(bot_wxid);
        Ok(())
    }

    fn invalidate(&self, bot_wxid: &str) {
        let mut slot = self.cache.entry(bot_wxid.to_string()).or_default();
        slot.generation += 1;
        slot.permissions = None;
    }
}
