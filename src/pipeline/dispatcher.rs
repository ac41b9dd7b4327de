// 指令与关键词回复：每个事件至多走一条回复分支，发送前先占回复幂等标记。
use crate::pipeline::context::EventContext;
use crate::pipeline::permission::{
    is_always_allowed_command, parse_toggle, Feature, PermissionMode,
};
use crate::pipeline::{storage_call, EventHandler, HandlerEnv};
use crate::storage::{KeywordResourceRecord, StorageBackend};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const HELP_TEXT: &str = "commands:\n\
/help - show this help\n\
/whoami - show your id\n\
/online - show bot status\n\
/checkin - daily check-in (rooms)\n\
/sub <keyword> - subscribe, /sub alone lists\n\
/unsub <keyword> - unsubscribe\n\
/roomid - show current room id (operators)\n\
/config [global] <feature> <on|off|clear> (operators)";

pub const RESOURCE_KIND_TEXT: &str = "text";
pub const RESOURCE_KIND_CARD: &str = "card";

/// 关键词资源缓存，命中与未命中都缓存到本地次日零点；跨过零点后首次查询清掉过期条目。
pub struct KeywordCache {
    storage: Arc<dyn StorageBackend>,
    entries: DashMap<String, (Option<KeywordResourceRecord>, DateTime<Local>)>,
    next_sweep: Mutex<DateTime<Local>>,
}

impl KeywordCache {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            next_sweep: Mutex::new(next_local_midnight(Local::now())),
        }
    }

    pub async fn lookup(&self, keyword: &str) -> Result<Option<KeywordResourceRecord>> {
        self.lookup_at(keyword, Local::now()).await
    }

    async fn lookup_at(
        &self,
        keyword: &str,
        now: DateTime<Local>,
    ) -> Result<Option<KeywordResourceRecord>> {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() {
            return Ok(None);
        }
        self.sweep(now);
        if let Some(entry) = self.entries.get(&keyword) {
            if entry.1 > now {
                return Ok(entry.0.clone());
            }
        }
        let lookup = keyword.clone();
        let record = storage_call(&self.storage, move |storage| {
            storage.get_keyword_resource(&lookup)
        })
        .await?;
        self.entries
            .insert(keyword, (record.clone(), next_local_midnight(now)));
        Ok(record)
    }

    fn sweep(&self, now: DateTime<Local>) {
        let mut next_sweep = self.next_sweep.lock();
        if now < *next_sweep {
            return;
        }
        *next_sweep = next_local_midnight(now);
        drop(next_sweep);
        self.entries.retain(|_, entry| entry.1 > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .unwrap_or_else(|| now + ChronoDuration::hours(24))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Text(String),
    Card(String),
}

pub struct CommandDispatcher;

#[async_trait]
impl EventHandler for CommandDispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || !ctx.is_plain_text() {
            return Ok(());
        }
        let text = ctx.msg();
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        if is_always_allowed_command(text) {
            if !is_operator(ctx, env) {
                debug!(
                    "operator command from non-operator dropped: bot={}, from={}",
                    ctx.bot.wxid,
                    ctx.from_wxid()
                );
                ctx.mark_terminal(self.name());
                return Ok(());
            }
            if !self.claim(ctx, env) {
                return Ok(());
            }
            let reply = operator_command(ctx, env, text).await;
            let reply = self.settle_claimed(ctx, reply)?;
            self.send(ctx, env, "config", Reply::Text(reply));
            return Ok(());
        }

        // 机器人自己发出的消息不触发内置指令与关键词。
        if ctx.is_from_bot() {
            return Ok(());
        }

        let (command, rest) = split_command(text);
        match command {
            "/help" | "/whoami" | "/online" => {
                if !self.claim(ctx, env) {
                    return Ok(());
                }
                let reply = match command {
                    "/help" => HELP_TEXT.to_string(),
                    "/whoami" => whoami(ctx, env),
                    _ => {
                        let reply = online(ctx, env).await;
                        self.settle_claimed(ctx, reply)?
                    }
                };
                self.send(ctx, env, "builtin", Reply::Text(reply));
                return Ok(());
            }
            "/checkin" => {
                if let Some(room) = ctx.room_wxid() {
                    let enabled = env
                        .services
                        .permissions
                        .resolve(&ctx.bot.wxid, Feature::CheckIn, Some(&room), env.pipeline())
                        .await?;
                    if enabled {
                        if !self.claim(ctx, env) {
                            return Ok(());
                        }
                        let reply = check_in(ctx, env, room).await;
                        let reply = self.settle_claimed(ctx, reply)?;
                        self.send(ctx, env, "builtin", Reply::Text(reply));
                        return Ok(());
                    }
                }
            }
            "/sub" | "/unsub" => {
                if !self.claim(ctx, env) {
                    return Ok(());
                }
                let reply = subscription(ctx, env, command == "/sub", rest).await;
                let reply = self.settle_claimed(ctx, reply)?;
                self.send(ctx, env, "subscription", Reply::Text(reply));
                return Ok(());
            }
            _ => {}
        }

        let scope = ctx.reply_target();
        let keyword_enabled = env
            .services
            .permissions
            .resolve(
                &ctx.bot.wxid,
                Feature::KeywordReply,
                Some(scope.as_str()),
                env.pipeline(),
            )
            .await?;
        if !keyword_enabled {
            return Ok(());
        }
        if let Some(resource) = env.services.keywords.lookup(text).await? {
            if !self.claim(ctx, env) {
                return Ok(());
            }
            let reply = if resource.kind == RESOURCE_KIND_CARD {
                Reply::Card(resource.content)
            } else {
                Reply::Text(resource.content)
            };
            self.send(ctx, env, "keyword", reply);
        }
        Ok(())
    }
}

impl CommandDispatcher {
    /// 占用回复标记；已被占用说明是重复投递，静默终结。
    fn claim(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> bool {
        let Some(event_id) = ctx.event_id() else {
            return true;
        };
        if env.services.reply_guard.claim(&ctx.bot.wxid, event_id) {
            return true;
        }
        debug!(
            "duplicate reply suppressed: bot={}, event={event_id}",
            ctx.bot.wxid
        );
        ctx.mark_terminal(self.name());
        false
    }

    /// 已占回复标记的分支出错时同样终结，指令原文不再流向转发。
    fn settle_claimed<T>(&self, ctx: &mut EventContext, result: Result<T>) -> Result<T> {
        if result.is_err() {
            ctx.mark_terminal(self.name());
        }
        result
    }

    fn send(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>, path: &str, reply: Reply) {
        let to = ctx.reply_target();
        let agent = env.services.agent.clone();
        let target = ctx.target.clone();
        let label = format!("reply {path} {} to={to}", ctx.target);
        match reply {
            Reply::Text(content) => env.services.outward.spawn(label, async move {
                agent.send_text(&target, &to, &content).await
            }),
            Reply::Card(card) => env.services.outward.spawn(label, async move {
                agent.send_contact_card(&target, &to, &card).await
            }),
        }
        ctx.metadata
            .insert("reply_path".to_string(), Value::String(path.to_string()));
        ctx.mark_terminal(self.name());
    }
}

fn split_command(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (text, ""),
    }
}

fn is_operator(ctx: &EventContext, env: &HandlerEnv<'_>) -> bool {
    ctx.is_from_bot() || env.pipeline().is_admin(&ctx.from_wxid())
}

async fn operator_command(
    ctx: &EventContext,
    env: &HandlerEnv<'_>,
    text: &str,
) -> Result<String> {
    let scope = ctx.reply_target();
    let (command, rest) = split_command(text);
    if command == "/roomid" {
        return Ok(match ctx.room_wxid() {
            Some(room) => format!("room id: {room}"),
            None => format!("not in a room, peer id: {scope}"),
        });
    }

    let args = rest.split_whitespace().collect::<Vec<_>>();
    let permissions = &env.services.permissions;
    match args.as_slice() {
        [] | ["help"] => {
            let loaded = permissions.load(&ctx.bot.wxid).await?;
            let lines = Feature::ALL
                .iter()
                .map(|feature| {
                    let global = loaded.global(*feature, env.pipeline());
                    let scope_override = loaded.scope_override(*feature, Some(scope.as_str()));
                    format!(
                        "{feature}: {} (global {}, {}{})",
                        on_off(loaded.resolve(*feature, Some(scope.as_str()), env.pipeline())),
                        on_off(global),
                        PermissionMode::for_global(global).label(),
                        scope_override
                            .map(|value| format!(", override {}", on_off(value)))
                            .unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>();
            Ok(format!("scope {scope}\n{}", lines.join("\n")))
        }
        ["global", feature, value] => {
            let Some(feature) = Feature::from_key(feature) else {
                return Ok(unknown_feature(feature));
            };
            let Some(Some(enabled)) = parse_toggle(value) else {
                return Ok("usage: /config global <feature> <on|off>".to_string());
            };
            permissions
                .set_global(&ctx.bot.wxid, feature, enabled)
                .await?;
            info!(
                "feature global changed: bot={}, feature={feature}, enabled={enabled}, by={}",
                ctx.bot.wxid,
                ctx.from_wxid()
            );
            Ok(format!("{feature} global: {}", on_off(enabled)))
        }
        [feature, value] => {
            let Some(feature) = Feature::from_key(feature) else {
                return Ok(unknown_feature(feature));
            };
            let Some(enabled) = parse_toggle(value) else {
                return Ok("usage: /config <feature> <on|off|clear>".to_string());
            };
            permissions
                .set_override(&ctx.bot.wxid, feature, &scope, enabled)
                .await?;
            info!(
                "feature override changed: bot={}, feature={feature}, scope={scope}, value={enabled:?}, by={}",
                ctx.bot.wxid,
                ctx.from_wxid()
            );
            Ok(match enabled {
                Some(enabled) => format!("{feature} for {scope}: {}", on_off(enabled)),
                None => format!("{feature} for {scope}: cleared, inherits global"),
            })
        }
        _ => Ok("usage: /config [global] <feature> <on|off|clear>".to_string()),
    }
}

fn unknown_feature(key: &str) -> String {
    format!("unknown feature: {key}. valid: {}", Feature::keys())
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

fn whoami(ctx: &EventContext, env: &HandlerEnv<'_>) -> String {
    let from = ctx.from_wxid();
    let mut lines = vec![format!("wxid: {from}")];
    if let Some(room) = ctx.room_wxid() {
        lines.push(format!("room: {room}"));
    }
    if env.pipeline().is_admin(&from) {
        lines.push("operator: yes".to_string());
    }
    lines.join("\n")
}

async fn online(ctx: &EventContext, env: &HandlerEnv<'_>) -> Result<String> {
    let wxid = ctx.bot.wxid.clone();
    let session = storage_call(&env.services.storage, move |storage| {
        storage.get_bot_session(&wxid)
    })
    .await?;
    let since = session
        .and_then(|session| session.login_at)
        .and_then(|login_at| Local.timestamp_opt(login_at as i64, 0).single())
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Ok(format!(
        "{} online on {} (since {since})",
        ctx.bot.display_name(),
        ctx.target
    ))
}

async fn check_in(ctx: &EventContext, env: &HandlerEnv<'_>, room: String) -> Result<String> {
    let bot = ctx.bot.wxid.clone();
    let member = ctx.from_wxid();
    let day = Local::now().format("%Y-%m-%d").to_string();
    let outcome = storage_call(&env.services.storage, move |storage| {
        storage.record_check_in(&bot, &room, &member, &day)
    })
    .await?;
    let who = ctx.from_wxid();
    Ok(if outcome.inserted {
        format!("{who} checked in, #{} today", outcome.rank)
    } else {
        format!("{who} already checked in today (#{})", outcome.rank)
    })
}

async fn subscription(
    ctx: &EventContext,
    env: &HandlerEnv<'_>,
    subscribe: bool,
    keyword: &str,
) -> Result<String> {
    let bot = ctx.bot.wxid.clone();
    let target = ctx.reply_target();
    let keyword = keyword.trim().to_string();
    if keyword.is_empty() {
        if !subscribe {
            return Ok("usage: /unsub <keyword>".to_string());
        }
        let keywords = storage_call(&env.services.storage, move |storage| {
            storage.list_subscriptions(&bot, &target)
        })
        .await?;
        return Ok(if keywords.is_empty() {
            "no subscriptions".to_string()
        } else {
            format!("subscriptions: {}", keywords.join(", "))
        });
    }
    let stored = keyword.clone();
    let changed = storage_call(&env.services.storage, move |storage| {
        if subscribe {
            storage.add_subscription(&bot, &target, &stored)
        } else {
            storage.remove_subscription(&bot, &target, &stored)
        }
    })
    .await?;
    Ok(match (subscribe, changed) {
        (true, true) => format!("subscribed to {keyword}"),
        (true, false) => format!("already subscribed to {keyword}"),
        (false, true) => format!("unsubscribed from {keyword}"),
        (false, false) => format!("not subscribed to {keyword}"),
    })
}
