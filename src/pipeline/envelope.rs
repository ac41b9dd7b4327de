// 回调信封：{type, client_id, data}，以及按类型的分流表。
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

pub const TEXT: &str = "text";
pub const IMAGE: &str = "image";
pub const VOICE: &str = "voice";
pub const VOICE_TRANSCRIPT: &str = "voice_transcript";
pub const FILE: &str = "file";
pub const VIDEO: &str = "video";
pub const LINK: &str = "link";
pub const SYSTEM_NOTICE: &str = "system_notice";
pub const ROOM_MEMBER_ADD: &str = "room_member_add";
pub const ROOM_MEMBER_DEL: &str = "room_member_del";
pub const TRANSFER: &str = "transfer";
pub const LOCATION: &str = "location";
pub const CARD: &str = "card";

pub const QRCODE: &str = "qrcode";
pub const LOGIN: &str = "login";
pub const LOGOUT: &str = "logout";
pub const DISCONNECT: &str = "disconnect";
pub const HEARTBEAT: &str = "heartbeat";
pub const DATA_OWNER: &str = "data_owner";

const NOISE_TYPES: &[&str] = &[
    "inject_notice",
    "debug_log",
    "mini_program",
    "window_focus",
    "unread_change",
    "revoke",
    "image_decrypt_progress",
    "talker_change",
];

const LIFECYCLE_TYPES: &[&str] = &[QRCODE, LOGIN, LOGOUT, DISCONNECT, HEARTBEAT, DATA_OWNER];

/// 这些类型天然没有消息 id，缺失不告警。
const ID_OPTIONAL_TYPES: &[&str] = &[SYSTEM_NOTICE, ROOM_MEMBER_ADD, ROOM_MEMBER_DEL];

pub fn is_noise_type(event_type: &str) -> bool {
    NOISE_TYPES.contains(&event_type)
}

pub fn is_lifecycle_type(event_type: &str) -> bool {
    LIFECYCLE_TYPES.contains(&event_type)
}

pub fn is_id_optional_type(event_type: &str) -> bool {
    ID_OPTIONAL_TYPES.contains(&event_type)
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub event_type: String,
    pub client_id: i64,
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, client_id: i64, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            event_type: event_type.into().trim().to_ascii_lowercase(),
            client_id,
            data,
        }
    }

    /// 代理偶尔把数字写成字符串，data 也可能是 JSON 字符串，这里统一宽松解析。
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(body).map_err(|err| anyhow!("invalid envelope json: {err}"))?;
        let Value::Object(mut root) = value else {
            return Err(anyhow!("envelope must be a json object"));
        };
        let event_type = root
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("envelope missing type"))?
            .to_string();
        let client_id = root.get("client_id").and_then(value_as_i64).unwrap_or(0);
        let data = match root.remove("data") {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                serde_json::from_str::<Value>(&text).unwrap_or(Value::Null)
            }
            Some(value) => value,
            None => Value::Null,
        };
        Ok(Self::new(event_type, client_id, data))
    }

    pub fn is_empty_data(&self) -> bool {
        self.data.is_empty()
    }
}

pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// 字段取字符串，数字转成十进制文本，其余情况为空。
pub fn value_as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    }
}
