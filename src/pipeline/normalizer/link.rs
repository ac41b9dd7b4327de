use crate::pipeline::context::EventContext;
use crate::pipeline::envelope;
use crate::pipeline::normalizer::join_parts;
use crate::pipeline::xml::parse_lenient;
use crate::pipeline::{EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

const OFFICIAL_ACCOUNT_PREFIX: &str = "gh_";

pub struct LinkNormalizer;

#[async_trait]
impl EventHandler for LinkNormalizer {
    fn name(&self) -> &'static str {
        "link"
    }

    async fn handle(&self, ctx: &mut EventContext, _env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::LINK {
            return Ok(());
        }
        let xml = parse_lenient(&ctx.raw_msg());
        let title = xml.text("title").unwrap_or("unknown");
        let url = xml.text("url").unwrap_or("");
        let source_user = xml.text("sourceusername").unwrap_or("");
        let text = if is_article(&ctx.from_wxid(), source_user, url) {
            let source = xml
                .text("sourcedisplayname")
                .map(|name| format!("- {name}"))
                .unwrap_or_default();
            join_parts(["[article]", title, source.as_str(), url])
        } else {
            let description = xml
                .text("des")
                .map(|des| format!("- {des}"))
                .unwrap_or_default();
            join_parts(["[link]", title, description.as_str(), url])
        };
        ctx.rewrite_as_text(text);
        Ok(())
    }
}

fn article_url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^https?://mp\.weixin\.qq\.com/s").ok())
        .as_ref()
}

/// 公众号文章：发送方或来源是 gh_ 开头的账号，或链接指向公众号文章域名。
pub(crate) fn is_article(from_wxid: &str, source_user: &str, url: &str) -> bool {
    if from_wxid.starts_with(OFFICIAL_ACCOUNT_PREFIX)
        || source_user.starts_with(OFFICIAL_ACCOUNT_PREFIX)
    {
        return true;
    }
    article_url_regex()
        .map(|re| re.is_match(url.trim()))
        .unwrap_or(false)
}
