// 配置读取与覆盖合并：基础 YAML + 覆盖 YAML + 环境变量占位符展开。
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/wxhub.yaml";
pub const DEFAULT_OVERRIDE_PATH: &str = "data/config/wxhub.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub agents: Vec<AgentHostConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: String,
}

/// 一台远端自动化代理主机：回调路径里的 token 决定是哪台主机。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentHostConfig {
    pub host_id: String,
    pub token: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    /// 代理主机上的媒体落盘目录（Windows 路径），解密图片写到这里。
    #[serde(default)]
    pub media_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_reply_guard_ttl_s")]
    pub reply_guard_ttl_s: u64,
    #[serde(default = "default_voice_pending_ttl_s")]
    pub voice_pending_ttl_s: u64,
    #[serde(default = "default_qr_pool_capacity")]
    pub qr_pool_capacity: usize,
    #[serde(default = "default_roster_refresh_debounce_s")]
    pub roster_refresh_debounce_s: u64,
    #[serde(default = "default_true")]
    pub image_decrypt_pacing: bool,
    #[serde(default = "default_heartbeat_stale_s")]
    pub heartbeat_stale_s: u64,
    #[serde(default)]
    pub admin_wxids: Vec<String>,
    #[serde(default)]
    pub monitor_target: Option<String>,
    /// 覆盖静态功能默认值，键为功能名。
    #[serde(default)]
    pub feature_defaults: HashMap<String, bool>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reply_guard_ttl_s: default_reply_guard_ttl_s(),
            voice_pending_ttl_s: default_voice_pending_ttl_s(),
            qr_pool_capacity: default_qr_pool_capacity(),
            roster_refresh_debounce_s: default_roster_refresh_debounce_s(),
            image_decrypt_pacing: true,
            heartbeat_stale_s: default_heartbeat_stale_s(),
            admin_wxids: Vec::new(),
            monitor_target: None,
            feature_defaults: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn is_admin(&self, wxid: &str) -> bool {
        let wxid = wxid.trim();
        !wxid.is_empty() && self.admin_wxids.iter().any(|item| item.trim() == wxid)
    }

    pub fn monitor_target(&self) -> Option<&str> {
        self.monitor_target
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaConfig {
    /// 对外可访问的媒体地址前缀，拼接出消息里的可点击链接。
    #[serde(default)]
    pub public_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForwardConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

fn default_reply_guard_ttl_s() -> u64 {
    30
}

fn default_voice_pending_ttl_s() -> u64 {
    300
}

fn default_qr_pool_capacity() -> usize {
    16
}

fn default_roster_refresh_debounce_s() -> u64 {
    10
}

fn default_heartbeat_stale_s() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

impl Config {
    // 统一归一化 API Key，避免空白字符导致鉴权误判。
    pub fn api_key(&self) -> Option<String> {
        let inline = self
            .security
            .api_key
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty());
        if let Some(value) = inline {
            return Some(value.to_string());
        }
        env::var("WXHUB_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn agent_by_token(&self, token: &str) -> Option<&AgentHostConfig> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        self.agents
            .iter()
            .find(|agent| !agent.token.trim().is_empty() && agent.token.trim() == token)
    }

    pub fn agent_by_host(&self, host_id: &str) -> Option<&AgentHostConfig> {
        let host_id = host_id.trim();
        self.agents.iter().find(|agent| agent.host_id.trim() == host_id)
    }
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn config_path() -> String {
    env::var("WXHUB_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

pub fn override_path() -> String {
    env::var("WXHUB_CONFIG_OVERRIDE_PATH").unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string())
}

pub fn load_config() -> Config {
    load_config_from(&config_path(), &override_path())
}

pub fn load_config_from(base_path: &str, override_path: &str) -> Config {
    let mut merged = read_yaml(base_path);
    if Path::new(override_path).exists() {
        let override_value = read_yaml(override_path);
        // 只对非空字段做递归覆盖，避免误清空已有配置。
        merge_yaml(&mut merged, override_value);
    }

    expand_yaml_env(&mut merged);

    if merged.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，开发环境首次启动不报错。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("解析 YAML 失败: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("WXHUB_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${WXHUB_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        std::env::set_var("WXHUB_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${WXHUB_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );
        std::env::remove_var("WXHUB_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${WXHUB_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn override_file_wins_over_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let overlay = dir.path().join("override.yaml");
        fs::write(
            &base,
            "server:\n  host: 127.0.0.1\n  port: \"9000\"\npipeline:\n  reply_guard_ttl_s: 20\nagents:\n  - host_id: pc-1\n    token: t1\n",
        )
        .unwrap();
        fs::write(&overlay, "pipeline:\n  reply_guard_ttl_s: 45\n").unwrap();
        let config = load_config_from(
            &base.to_string_lossy(),
            &overlay.to_string_lossy(),
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.pipeline.reply_guard_ttl_s, 45);
        assert_eq!(config.pipeline.voice_pending_ttl_s, 300);
        assert_eq!(
            config.agent_by_token("t1").map(|agent| agent.host_id.as_str()),
            Some("pc-1")
        );
        assert!(config.agent_by_token("").is_none());
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let config = load_config_from("/nonexistent/wxhub.yaml", "/nonexistent/override.yaml");
        assert_eq!(config.server.port, 8600);
        assert!(config.pipeline.image_decrypt_pacing);
    }
}
