// 转账、位置与名片三类结构化消息。
use crate::pipeline::context::EventContext;
use crate::pipeline::envelope;
use crate::pipeline::normalizer::join_parts;
use crate::pipeline::permission::Feature;
use crate::pipeline::xml::parse_lenient;
use crate::pipeline::{EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// 收款方待确认的转账子类型。
const PAY_SUBTYPE_PENDING: &str = "1";

pub struct TransferNormalizer;

#[async_trait]
impl EventHandler for TransferNormalizer {
    fn name(&self) -> &'static str {
        "transfer"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::TRANSFER {
            return Ok(());
        }
        let xml = parse_lenient(&ctx.raw_msg());
        let amount = xml.text("feedesc").unwrap_or("unknown").to_string();
        let memo = xml.text("pay_memo").unwrap_or("").to_string();
        let transfer_id = xml
            .text("transferid")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.str_field("transferid"));
        let subtype = xml.text("paysubtype").unwrap_or(PAY_SUBTYPE_PENDING);

        let bot_is_receiver = !ctx.is_from_bot() && ctx.to_wxid() == ctx.bot.wxid;
        if bot_is_receiver && subtype == PAY_SUBTYPE_PENDING && !transfer_id.is_empty() {
            let scope = ctx.reply_target();
            let accept = env
                .services
                .permissions
                .resolve(
                    &ctx.bot.wxid,
                    Feature::AutoAcceptTransfer,
                    Some(scope.as_str()),
                    env.pipeline(),
                )
                .await?;
            if accept {
                let agent = env.services.agent.clone();
                let target = ctx.target.clone();
                let from = ctx.from_wxid();
                let id = transfer_id.clone();
                env.services.outward.spawn(
                    format!("accept_transfer {} id={transfer_id}", ctx.target),
                    async move { agent.accept_transfer(&target, &from, &id).await },
                );
            } else {
                debug!("transfer auto-accept disabled: bot={}, scope={scope}", ctx.bot.wxid);
            }
        }
        ctx.rewrite_as_text(join_parts(["[transfer]", amount.as_str(), memo.as_str()]));
        Ok(())
    }
}

pub struct LocationNormalizer;

#[async_trait]
impl EventHandler for LocationNormalizer {
    fn name(&self) -> &'static str {
        "location"
    }

    async fn handle(&self, ctx: &mut EventContext, _env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::LOCATION {
            return Ok(());
        }
        let xml = parse_lenient(&ctx.raw_msg());
        let poiname = xml.attr("location.poiname").unwrap_or("");
        let label = xml.attr("location.label").unwrap_or("");
        let coords = match (xml.attr("location.x"), xml.attr("location.y")) {
            (Some(x), Some(y)) => format!("({x}, {y})"),
            _ => String::new(),
        };
        let mut text = join_parts(["[location]", poiname, label, coords.as_str()]);
        if text == "[location]" {
            text.push_str(" unknown");
        }
        ctx.rewrite_as_text(text);
        Ok(())
    }
}

pub struct CardNormalizer;

#[async_trait]
impl EventHandler for CardNormalizer {
    fn name(&self) -> &'static str {
        "card"
    }

    async fn handle(&self, ctx: &mut EventContext, _env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::CARD {
            return Ok(());
        }
        let xml = parse_lenient(&ctx.raw_msg());
        let nickname = xml.attr("msg.nickname").unwrap_or("unknown");
        let text = match xml.attr("msg.username") {
            Some(username) => format!("[card] {nickname} ({username})"),
            None => format!("[card] {nickname}"),
        };
        ctx.rewrite_as_text(text);
        Ok(())
    }
}
