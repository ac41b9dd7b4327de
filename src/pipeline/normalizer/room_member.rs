use crate::pipeline::context::{EventContext, FIELD_FROM};
use crate::pipeline::envelope::{self, value_as_string};
use crate::pipeline::{storage_call, EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    wxid: String,
    nickname: String,
}

impl Member {
    fn display(&self) -> &str {
        if self.nickname.is_empty() {
            &self.wxid
        } else {
            &self.nickname
        }
    }
}

/// 兼容 members 数组与单个 member_wxid/member_nickname 两种写法。
fn members(ctx: &EventContext) -> Vec<Member> {
    let mut output = Vec::new();
    if let Some(Value::Array(items)) = ctx.payload.get("members") {
        for item in items {
            let member = Member {
                wxid: value_as_string(item.get("wxid")),
                nickname: value_as_string(item.get("nickname")),
            };
            if !member.wxid.is_empty() || !member.nickname.is_empty() {
                output.push(member);
            }
        }
    }
    if output.is_empty() {
        let member = Member {
            wxid: ctx.str_field("member_wxid"),
            nickname: ctx.str_field("member_nickname"),
        };
        if !member.wxid.is_empty() || !member.nickname.is_empty() {
            output.push(member);
        }
    }
    output
}

/// 成员变动的落库部分：登记群，机器人被移出时清空该群对话记录。群被静音时也要执行。
pub(crate) async fn sync_roster(ctx: &EventContext, env: &HandlerEnv<'_>) -> Result<()> {
    let joined = ctx.event_type() == envelope::ROOM_MEMBER_ADD;
    let bot_wxid = ctx.bot.wxid.clone();
    let Some(room) = ctx.room_wxid() else {
        debug!("room member event without room: bot={bot_wxid}");
        return Ok(());
    };
    let bot = bot_wxid.clone();
    let ensure_room = room.clone();
    storage_call(&env.services.storage, move |storage| {
        storage.ensure_room(&bot, &ensure_room)
    })
    .await?;
    let bot_removed = !joined && members(ctx).iter().any(|member| member.wxid == bot_wxid);
    if bot_removed {
        let bot = bot_wxid.clone();
        let purge_room = room.clone();
        let purged = storage_call(&env.services.storage, move |storage| {
            storage.delete_conversation_messages_by_room(&bot, &purge_room)
        })
        .await?;
        info!("bot removed from room, history purged: bot={bot_wxid}, room={room}, rows={purged}");
    }
    Ok(())
}

pub struct RoomMemberNormalizer;

#[async_trait]
impl EventHandler for RoomMemberNormalizer {
    fn name(&self) -> &'static str {
        "room_member"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() {
            return Ok(());
        }
        let joined = match ctx.event_type() {
            envelope::ROOM_MEMBER_ADD => true,
            envelope::ROOM_MEMBER_DEL => false,
            _ => return Ok(()),
        };
        sync_roster(ctx, env).await?;
        let members = members(ctx);
        let bot_wxid = ctx.bot.wxid.clone();
        let names = members
            .iter()
            .map(|member| {
                if member.wxid == bot_wxid {
                    ctx.bot.display_name().to_string()
                } else {
                    member.display().to_string()
                }
            })
            .collect::<Vec<_>>();
        let names = if names.is_empty() {
            "someone".to_string()
        } else {
            names.join(", ")
        };
        let text = if joined {
            format!("{names} joined the room")
        } else {
            format!("{names} left the room")
        };
        // 以机器人身份发出，下游把它当作群内的系统旁白。
        ctx.set_field(FIELD_FROM, bot_wxid);
        ctx.rewrite_as_text(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalizer::test_support::Harness;
    use crate::storage::ConversationMessageRecord;
    use serde_json::json;

    fn seed_message(harness: &Harness, room: &str) {
        harness
            .storage
            .insert_conversation_message(&ConversationMessageRecord {
                bot_wxid: "wxid_bot".to_string(),
                room_wxid: Some(room.to_string()),
                peer_wxid: room.to_string(),
                sender_wxid: "wxid_a".to_string(),
                event_id: Some("x".to_string()),
                origin_type: None,
                content: "hello".to_string(),
                created_at: 1.0,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn member_join_is_authored_by_bot() {
        let harness = Harness::new();
        let mut ctx = harness.ctx(
            "room_member_add",
            json!({
                "room_wxid": "r1@chatroom",
                "from_wxid": "wxid_owner",
                "members": [{"wxid": "wxid_a", "nickname": "Alice"}, {"wxid": "wxid_b"}]
            }),
        );
        RoomMemberNormalizer
            .handle(&mut ctx, &harness.env())
            .await
            .unwrap();
        assert_eq!(ctx.msg(), "Alice, wxid_b joined the room");
        assert_eq!(ctx.from_wxid(), "wxid_bot");
        assert_eq!(ctx.origin_type().as_deref(), Some("room_member_add"));
        assert!(harness
            .storage
            .get_room("wxid_bot", "r1@chatroom")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn bot_removal_purges_room_history() {
        let harness = Harness::new();
        seed_message(&harness, "r2@chatroom");
        seed_message(&harness, "r3@chatroom");
        let mut ctx = harness.ctx(
            "room_member_del",
            json!({"room_wxid": "r2@chatroom", "member_wxid": "wxid_bot"}),
        );
        RoomMemberNormalizer
            .handle(&mut ctx, &harness.env())
            .await
            .unwrap();
        assert_eq!(ctx.msg(), "Helper left the room");
        assert!(harness
            .storage
            .list_conversation_messages("wxid_bot", "r2@chatroom", 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            harness
                .storage
                .list_conversation_messages("wxid_bot", "r3@chatroom", 10)
                .unwrap()
                .len(),
            1
        );
    }
}
