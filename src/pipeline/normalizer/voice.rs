// 语音与转写结果是两次独立事件，靠 (bot, msgid) 在待转写缓存里关联。
use crate::pipeline::context::{EventContext, FIELD_FROM, FIELD_ROOM, FIELD_TO};
use crate::pipeline::envelope;
use crate::pipeline::forward::deliver;
use crate::pipeline::media::public_link;
use crate::pipeline::{EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PendingVoice {
    pub url: String,
    pub from_wxid: String,
    pub to_wxid: String,
    pub room_wxid: Option<String>,
    pub bot_wxid: String,
    pub timestamp: f64,
}

pub struct VoiceNormalizer;

#[async_trait]
impl EventHandler for VoiceNormalizer {
    fn name(&self) -> &'static str {
        "voice"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::VOICE {
            return Ok(());
        }
        let msgid = ctx.str_field("msgid");
        if msgid.is_empty() || !ctx.target.has_client() {
            warn!(
                "voice dropped, cannot request transcription: bot={}, client={}, msgid={msgid:?}",
                ctx.bot.wxid, ctx.target.client_id
            );
            ctx.mark_terminal(self.name());
            return Ok(());
        }
        let path = Some(ctx.str_field("voice"))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| ctx.str_field("file"));
        let pending = PendingVoice {
            url: public_link(&env.config.media.public_base_url, &ctx.target.host_id, &path),
            from_wxid: ctx.from_wxid(),
            to_wxid: ctx.to_wxid(),
            room_wxid: ctx.room_wxid(),
            bot_wxid: ctx.bot.wxid.clone(),
            timestamp: ctx
                .timestamp()
                .unwrap_or_else(|| Utc::now().timestamp_millis() as f64 / 1000.0),
        };
        // 先登记再发起转写，转写结果先到也能找到条目。
        env.services.voice_pending.insert(
            (ctx.bot.wxid.clone(), msgid.clone()),
            pending,
            Duration::from_secs(env.pipeline().voice_pending_ttl_s),
        );
        let agent = env.services.agent.clone();
        let target = ctx.target.clone();
        let call_msgid = msgid.clone();
        env.services.outward.spawn(
            format!("transcribe_voice {} msgid={msgid}", ctx.target),
            async move { agent.transcribe_voice(&target, &call_msgid).await },
        );
        ctx.mark_terminal(self.name());
        Ok(())
    }
}

pub struct VoiceTranscriptNormalizer;

#[async_trait]
impl EventHandler for VoiceTranscriptNormalizer {
    fn name(&self) -> &'static str {
        "voice_transcript"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::VOICE_TRANSCRIPT {
            return Ok(());
        }
        let msgid = ctx.str_field("msgid");
        let Some(pending) = env
            .services
            .voice_pending
            .remove(&(ctx.bot.wxid.clone(), msgid.clone()))
        else {
            debug!(
                "transcript without pending voice: bot={}, msgid={msgid:?}",
                ctx.bot.wxid
            );
            return Ok(());
        };
        let text = Some(ctx.str_field("text"))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| ctx.msg());
        ctx.set_field(FIELD_FROM, pending.from_wxid.clone());
        ctx.set_field(FIELD_TO, pending.to_wxid.clone());
        if let Some(room) = pending.room_wxid.as_ref() {
            ctx.set_field(FIELD_ROOM, room.clone());
        }
        let body = if pending.url.is_empty() {
            format!("[voice] recognized: {text}")
        } else {
            format!("[voice] {} recognized: {text}", pending.url)
        };
        ctx.rewrite_as_text(body);
        deliver(ctx, env).await;
        ctx.metadata
            .insert("forwarded".to_string(), Value::Bool(true));
        ctx.mark_terminal(self.name());
        Ok(())
    }
}
