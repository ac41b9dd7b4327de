// 链尾：未被终结的规范文本事件落库并交给 CRM 转发出口。
use crate::agent::ForwardEvent;
use crate::pipeline::context::EventContext;
use crate::pipeline::{storage_call, EventHandler, HandlerEnv};
use crate::storage::ConversationMessageRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

pub struct ForwardStage;

#[async_trait]
impl EventHandler for ForwardStage {
    fn name(&self) -> &'static str {
        "forward"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() {
            return Ok(());
        }
        if ctx.event_type() != crate::pipeline::envelope::TEXT {
            debug!(
                "non-canonical event not forwarded: bot={}, type={}",
                ctx.bot.wxid,
                ctx.event_type()
            );
            return Ok(());
        }
        if let Some(event_id) = ctx.event_id() {
            let key = (ctx.bot.wxid.clone(), event_id.to_string());
            let ttl = env.services.reply_guard.ttl();
            if !env.services.forwarded.insert_if_absent(key, (), ttl) {
                debug!(
                    "duplicate delivery skipped: bot={}, event={event_id}",
                    ctx.bot.wxid
                );
                ctx.metadata
                    .insert("duplicate".to_string(), Value::Bool(true));
                return Ok(());
            }
        }
        deliver(ctx, env).await;
        ctx.metadata
            .insert("forwarded".to_string(), Value::Bool(true));
        Ok(())
    }
}

/// 写入对话记录后异步推送；落库失败只记日志，转发照常进行。
pub async fn deliver(ctx: &EventContext, env: &HandlerEnv<'_>) {
    let services = env.services;
    let now = Utc::now().timestamp_millis() as f64 / 1000.0;
    let content = ctx.msg();
    let record = ConversationMessageRecord {
        bot_wxid: ctx.bot.wxid.clone(),
        room_wxid: ctx.room_wxid(),
        peer_wxid: ctx.reply_target(),
        sender_wxid: ctx.from_wxid(),
        event_id: ctx.event_id().map(str::to_string),
        origin_type: ctx.origin_type(),
        content: content.clone(),
        created_at: now,
    };
    if let Err(err) = storage_call(&services.storage, move |storage| {
        storage.insert_conversation_message(&record)
    })
    .await
    {
        warn!(
            "persist conversation failed: bot={}, event={:?}, {err:#}",
            ctx.bot.wxid,
            ctx.event_id()
        );
    }

    let event = ForwardEvent {
        bot_wxid: ctx.bot.wxid.clone(),
        host_id: ctx.target.host_id.clone(),
        client_id: ctx.target.client_id,
        event_id: ctx.event_id().map(str::to_string),
        event_type: ctx.event_type().to_string(),
        origin_type: ctx.origin_type(),
        room_wxid: ctx.room_wxid(),
        from_wxid: ctx.from_wxid(),
        to_wxid: ctx.to_wxid(),
        content,
        timestamp: ctx.timestamp().unwrap_or(now),
        payload: Value::Object(ctx.payload.clone()),
    };
    let sink = services.sink.clone();
    let label = format!("forward bot={} event={:?}", event.bot_wxid, event.event_id);
    services
        .outward
        .spawn(label, async move { sink.forward(&event).await });
}
