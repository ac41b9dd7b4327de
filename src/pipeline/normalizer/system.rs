// 系统提示：去掉开头人名的引号，识别几类关键提示做旁路告警，正文一律归为 [system]。
use crate::pipeline::context::EventContext;
use crate::pipeline::envelope;
use crate::pipeline::permission::Feature;
use crate::pipeline::{storage_call, EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

const RENAME_PHRASES: &[&str] = &["changed the group name to", "修改群名为"];
const RED_PACKET_PHRASES: &[&str] = &["received a red packet", "收到红包"];
const VERIFICATION_PENDING_PHRASES: &[&str] = &[
    "has not accepted your friend request",
    "还未通过你的朋友验证",
];
const DELETED_ME_PHRASES: &[&str] = &["enabled friend verification", "开启了朋友验证"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    GroupRenamed(String),
    RedPacket,
    VerificationPending,
    DeletedMe,
}

impl NoticeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NoticeKind::GroupRenamed(_) => "group renamed",
            NoticeKind::RedPacket => "red packet",
            NoticeKind::VerificationPending => "friend verification pending",
            NoticeKind::DeletedMe => "deleted by contact",
        }
    }
}

pub fn detect_notice(text: &str) -> Option<NoticeKind> {
    for phrase in RENAME_PHRASES {
        if let Some((_, rest)) = text.split_once(phrase) {
            return Some(NoticeKind::GroupRenamed(strip_quotes(rest.trim()).to_string()));
        }
    }
    if RED_PACKET_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        return Some(NoticeKind::RedPacket);
    }
    if VERIFICATION_PENDING_PHRASES
        .iter()
        .any(|phrase| text.contains(phrase))
    {
        return Some(NoticeKind::VerificationPending);
    }
    if DELETED_ME_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        return Some(NoticeKind::DeletedMe);
    }
    None
}

fn closing_quote(open: char) -> Option<char> {
    match open {
        '"' => Some('"'),
        '\'' => Some('\''),
        '“' => Some('”'),
        '「' => Some('」'),
        _ => None,
    }
}

fn strip_quotes(text: &str) -> &str {
    let mut chars = text.chars();
    let Some(open) = chars.next() else {
        return text;
    };
    let Some(close) = closing_quote(open) else {
        return text;
    };
    let inner = &text[open.len_utf8()..];
    inner.strip_suffix(close).unwrap_or(inner)
}

/// `"Alice" changed ...` -> `Alice changed ...`，只处理开头被引号包住的人名。
pub fn strip_actor_quotes(text: &str) -> String {
    let text = text.trim();
    let Some(open) = text.chars().next() else {
        return String::new();
    };
    let Some(close) = closing_quote(open) else {
        return text.to_string();
    };
    let rest = &text[open.len_utf8()..];
    match rest.find(close) {
        Some(end) => {
            let actor = &rest[..end];
            let tail = &rest[end + close.len_utf8()..];
            format!("{actor}{tail}")
        }
        None => text.to_string(),
    }
}

async fn store_room_name(ctx: &EventContext, env: &HandlerEnv<'_>, name: &str) -> Result<()> {
    match ctx.room_wxid() {
        Some(room) if !name.is_empty() => {
            let bot = ctx.bot.wxid.clone();
            let name = name.to_string();
            storage_call(&env.services.storage, move |storage| {
                storage.set_room_display_name(&bot, &room, &name)
            })
            .await
        }
        _ => {
            debug!("group rename without room: bot={}", ctx.bot.wxid);
            Ok(())
        }
    }
}

/// 只记录群改名，不告警也不改写正文；静音群里的系统提示走这里。
pub(crate) async fn record_rename(ctx: &EventContext, env: &HandlerEnv<'_>) -> Result<()> {
    let body = strip_actor_quotes(&ctx.raw_msg());
    match detect_notice(&body) {
        Some(NoticeKind::GroupRenamed(name)) => store_room_name(ctx, env, &name).await,
        _ => Ok(()),
    }
}

pub struct SystemNoticeNormalizer;

#[async_trait]
impl EventHandler for SystemNoticeNormalizer {
    fn name(&self) -> &'static str {
        "system_notice"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::SYSTEM_NOTICE {
            return Ok(());
        }
        let body = strip_actor_quotes(&ctx.raw_msg());
        if let Some(kind) = detect_notice(&body) {
            if let NoticeKind::GroupRenamed(name) = &kind {
                store_room_name(ctx, env, name).await?;
            }
            self.alert(ctx, env, &kind, &body).await?;
        }
        ctx.rewrite_as_text(format!("[system] {body}"));
        Ok(())
    }
}

impl SystemNoticeNormalizer {
    async fn alert(
        &self,
        ctx: &EventContext,
        env: &HandlerEnv<'_>,
        kind: &NoticeKind,
        body: &str,
    ) -> Result<()> {
        let Some(monitor) = env.pipeline().monitor_target() else {
            return Ok(());
        };
        let scope = ctx.reply_target();
        let enabled = env
            .services
            .permissions
            .resolve(
                &ctx.bot.wxid,
                Feature::SystemAlert,
                Some(scope.as_str()),
                env.pipeline(),
            )
            .await?;
        if !enabled {
            return Ok(());
        }
        info!(
            "system notice alert: bot={}, kind={}, scope={scope}",
            ctx.bot.wxid,
            kind.label()
        );
        let agent = env.services.agent.clone();
        let target = ctx.target.clone();
        let monitor = monitor.to_string();
        let content = format!("[alert] {}: {body} ({scope})", kind.label());
        env.services
            .outward
            .spawn(format!("system_alert {}", ctx.target), async move {
                agent.send_text(&target, &monitor, &content).await
            });
        Ok(())
    }
}
