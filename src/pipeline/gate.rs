// 群聊闸门：room_listen 关闭的群直接丢弃，配置类指令例外；成员变动与改名仍然落库。
use crate::pipeline::context::EventContext;
use crate::pipeline::envelope;
use crate::pipeline::normalizer::{room_member, system};
use crate::pipeline::permission::{is_always_allowed_command, Feature};
use crate::pipeline::{EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

pub struct RoomGate;

#[async_trait]
impl EventHandler for RoomGate {
    fn name(&self) -> &'static str {
        "room_gate"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || !ctx.is_room_scoped() {
            return Ok(());
        }
        if ctx.is_plain_text() && is_always_allowed_command(&ctx.msg()) {
            ctx.metadata
                .insert("gate_bypass".to_string(), Value::Bool(true));
            return Ok(());
        }
        let room = ctx.room_wxid();
        let resolved = env
            .services
            .permissions
            .resolve(
                &ctx.bot.wxid,
                Feature::RoomListen,
                room.as_deref(),
                env.pipeline(),
            )
            .await;
        // 权限读不出来时按拒绝处理。
        let allowed = match resolved {
            Ok(allowed) => allowed,
            Err(err) => {
                ctx.mark_terminal(self.name());
                return Err(err);
            }
        };
        if !allowed {
            debug!(
                "room event gated: bot={}, room={:?}, type={}",
                ctx.bot.wxid,
                room,
                ctx.event_type()
            );
            let roster = match ctx.event_type() {
                envelope::ROOM_MEMBER_ADD | envelope::ROOM_MEMBER_DEL => {
                    room_member::sync_roster(ctx, env).await
                }
                envelope::SYSTEM_NOTICE => system::record_rename(ctx, env).await,
                _ => Ok(()),
            };
            ctx.mark_terminal(self.name());
            return roster;
        }
        Ok(())
    }
}
