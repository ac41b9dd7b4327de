// 单个事件在处理链中的可变上下文。
use crate::agent::AgentTarget;
use crate::pipeline::envelope::{self, value_as_string};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::warn;

pub const FIELD_FROM: &str = "from_wxid";
pub const FIELD_TO: &str = "to_wxid";
pub const FIELD_ROOM: &str = "room_wxid";
pub const FIELD_MSG: &str = "msg";
pub const FIELD_MSGID: &str = "msgid";
pub const FIELD_RAW: &str = "raw_msg";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_ORIGIN_TYPE: &str = "origin_type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub wxid: String,
    pub nickname: String,
}

impl BotIdentity {
    pub fn display_name(&self) -> &str {
        if self.nickname.trim().is_empty() {
            &self.wxid
        } else {
            &self.nickname
        }
    }
}

#[derive(Debug)]
pub struct EventContext {
    pub bot: BotIdentity,
    pub target: AgentTarget,
    pub payload: Map<String, Value>,
    pub metadata: Map<String, Value>,
    event_type: String,
    event_id: Option<String>,
    is_room_scoped: bool,
    is_self_originated: bool,
    is_from_bot: bool,
    terminated_by: Option<&'static str>,
}

impl EventContext {
    pub fn new(
        bot: BotIdentity,
        target: AgentTarget,
        event_type: &str,
        payload: Map<String, Value>,
    ) -> Self {
        let from = value_as_string(payload.get(FIELD_FROM));
        let to = value_as_string(payload.get(FIELD_TO));
        let room = value_as_string(payload.get(FIELD_ROOM));
        let is_room_scoped = !room.is_empty();
        let is_self_originated = !from.is_empty() && from == to;
        let is_from_bot = !from.is_empty() && from == bot.wxid;
        let event_id = resolve_event_id(&bot.wxid, event_type, &payload, &from, &room);
        Self {
            bot,
            target,
            payload,
            metadata: Map::new(),
            event_type: event_type.to_string(),
            event_id,
            is_room_scoped,
            is_self_originated,
            is_from_bot,
            terminated_by: None,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn is_room_scoped(&self) -> bool {
        self.is_room_scoped
    }

    pub fn is_self_originated(&self) -> bool {
        self.is_self_originated
    }

    pub fn is_from_bot(&self) -> bool {
        self.is_from_bot
    }

    pub fn is_terminal(&self) -> bool {
        self.terminated_by.is_some()
    }

    pub fn terminated_by(&self) -> Option<&'static str> {
        self.terminated_by
    }

    /// 同一事件被第二个处理器终结说明链路编排有冲突，只记日志不覆盖。
    pub fn mark_terminal(&mut self, handler: &'static str) {
        if let Some(previous) = self.terminated_by {
            warn!(
                "event already terminal: bot={}, event={:?}, first={previous}, again={handler}",
                self.bot.wxid, self.event_id
            );
            return;
        }
        self.terminated_by = Some(handler);
        self.metadata
            .insert("terminated_by".to_string(), Value::String(handler.to_string()));
    }

    pub fn str_field(&self, key: &str) -> String {
        value_as_string(self.payload.get(key))
    }

    pub fn from_wxid(&self) -> String {
        self.str_field(FIELD_FROM)
    }

    pub fn to_wxid(&self) -> String {
        self.str_field(FIELD_TO)
    }

    pub fn room_wxid(&self) -> Option<String> {
        Some(self.str_field(FIELD_ROOM)).filter(|value| !value.is_empty())
    }

    pub fn msg(&self) -> String {
        self.str_field(FIELD_MSG)
    }

    pub fn raw_msg(&self) -> String {
        let raw = self.str_field(FIELD_RAW);
        if raw.is_empty() {
            self.msg()
        } else {
            raw
        }
    }

    pub fn origin_type(&self) -> Option<String> {
        Some(self.str_field(FIELD_ORIGIN_TYPE)).filter(|value| !value.is_empty())
    }

    /// 原生文本：类型为 text 且没有被规范化过。
    pub fn is_plain_text(&self) -> bool {
        self.event_type == envelope::TEXT && self.origin_type().is_none()
    }

    pub fn timestamp(&self) -> Option<f64> {
        match self.payload.get(FIELD_TIMESTAMP) {
            Some(Value::Number(number)) => number.as_f64(),
            Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// 群聊回群，私聊回对端（非机器人一方）。
    pub fn reply_target(&self) -> String {
        if let Some(room) = self.room_wxid() {
            return room;
        }
        let from = self.from_wxid();
        if from == self.bot.wxid {
            self.to_wxid()
        } else {
            from
        }
    }

    /// 改写为规范文本事件；origin_type 只记录一次，终结后拒绝改写。
    pub fn rewrite_as_text(&mut self, text: impl Into<String>) -> bool {
        if self.is_terminal() {
            warn!(
                "rewrite after terminal ignored: bot={}, type={}",
                self.bot.wxid, self.event_type
            );
            return false;
        }
        if self.event_type != envelope::TEXT && self.origin_type().is_none() {
            self.payload.insert(
                FIELD_ORIGIN_TYPE.to_string(),
                Value::String(self.event_type.clone()),
            );
        }
        self.event_type = envelope::TEXT.to_string();
        self.payload
            .insert(FIELD_MSG.to_string(), Value::String(text.into()));
        true
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.payload
            .insert(key.to_string(), Value::String(value.into()));
        true
    }
}

fn resolve_event_id(
    bot_wxid: &str,
    event_type: &str,
    payload: &Map<String, Value>,
    from: &str,
    room: &str,
) -> Option<String> {
    let msgid = value_as_string(payload.get(FIELD_MSGID));
    if !msgid.is_empty() {
        return Some(msgid);
    }
    if envelope::is_id_optional_type(event_type) {
        return None;
    }
    let timestamp = value_as_string(payload.get(FIELD_TIMESTAMP));
    if timestamp.is_empty() {
        warn!("event without msgid or timestamp: bot={bot_wxid}, type={event_type}");
        return None;
    }
    // 缺 msgid 时用 (bot, sender, room, type, ts) 推导稳定 id，重复投递仍能去重。
    let mut hasher = Sha1::new();
    for part in [bot_wxid, from, room, event_type, timestamp.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    warn!("event without msgid, derived fallback id: bot={bot_wxid}, type={event_type}");
    Some(format!("wxhub:{}", &digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bot() -> BotIdentity {
        BotIdentity {
            wxid: "wxid_bot".to_string(),
            nickname: "Helper".to_string(),
        }
    }

    fn ctx(event_type: &str, payload: Value) -> EventContext {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        EventContext::new(bot(), AgentTarget::new("pc-1", 1), event_type, payload)
    }

    #[test]
    fn derives_flags_once() {
        let ctx = ctx(
            "text",
            json!({"from_wxid": "wxid_bot", "to_wxid": "wxid_bot", "room_wxid": "", "msgid": 7}),
        );
        assert!(!ctx.is_room_scoped());
        assert!(ctx.is_self_originated());
        assert!(ctx.is_from_bot());
        assert_eq!(ctx.event_id(), Some("7"));
    }

    #[test]
    fn reply_target_prefers_room_then_counterpart() {
        let room = ctx(
            "text",
            json!({"from_wxid": "wxid_a", "to_wxid": "wxid_bot", "room_wxid": "123@chatroom"}),
        );
        assert_eq!(room.reply_target(), "123@chatroom");
        let inbound = ctx("text", json!({"from_wxid": "wxid_a", "to_wxid": "wxid_bot"}));
        assert_eq!(inbound.reply_target(), "wxid_a");
        let outbound = ctx("text", json!({"from_wxid": "wxid_bot", "to_wxid": "wxid_a"}));
        assert_eq!(outbound.reply_target(), "wxid_a");
    }

    #[test]
    fn mark_terminal_keeps_first_handler() {
        let mut ctx = ctx("text", json!({"msgid": "m"}));
        ctx.mark_terminal("first");
        ctx.mark_terminal("second");
        assert_eq!(ctx.terminated_by(), Some("first"));
        assert_eq!(ctx.metadata.get("terminated_by"), Some(&json!("first")));
    }

    #[test]
    fn rewrite_records_origin_once_and_stops_after_terminal() {
        let mut ctx = ctx("image", json!({"msgid": "m"}));
        assert!(ctx.rewrite_as_text("[image] a"));
        assert!(ctx.rewrite_as_text("[image] b"));
        assert_eq!(ctx.origin_type().as_deref(), Some("image"));
        assert_eq!(ctx.event_type(), "text");
        ctx.mark_terminal("x");
        assert!(!ctx.rewrite_as_text("[image] c"));
        assert_eq!(ctx.msg(), "[image] b");
    }

    #[test]
    fn fallback_id_is_stable_and_optional_types_skip_it() {
        let a = ctx("text", json!({"from_wxid": "u", "timestamp": 1700000000}));
        let b = ctx("text", json!({"from_wxid": "u", "timestamp": 1700000000}));
        assert!(a.event_id().unwrap_or_default().starts_with("wxhub:"));
        assert_eq!(a.event_id(), b.event_id());
        let notice = ctx("system_notice", json!({"timestamp": 1700000000}));
        assert_eq!(notice.event_id(), None);
        let bare = ctx("text", json!({"from_wxid": "u"}));
        assert_eq!(bare.event_id(), None);
    }
}
