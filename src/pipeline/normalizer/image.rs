use crate::pipeline::context::EventContext;
use crate::pipeline::envelope;
use crate::pipeline::media::{decrypt_delay, decrypted_image_path, human_size, public_link};
use crate::pipeline::xml::parse_lenient;
use crate::pipeline::{EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

pub struct ImageNormalizer;

#[async_trait]
impl EventHandler for ImageNormalizer {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() || ctx.event_type() != envelope::IMAGE {
            return Ok(());
        }
        let src = ctx.str_field("image");
        let xml = parse_lenient(&ctx.raw_msg());
        let width = xml
            .attr_u64("hdwidth")
            .or_else(|| xml.attr_u64("cdnthumbwidth"));
        let height = xml
            .attr_u64("hdheight")
            .or_else(|| xml.attr_u64("cdnthumbheight"));
        let size = xml
            .attr_u64("hdlength")
            .or_else(|| xml.attr_u64("length"))
            .unwrap_or(0);

        let mut link = String::new();
        if !src.is_empty() {
            let dest = decrypted_image_path(&src, env.host.media_dir.as_deref());
            if ctx.target.has_client() {
                let agent = env.services.agent.clone();
                let target = ctx.target.clone();
                let (src_path, dest_path) = (src.clone(), dest.clone());
                env.services.outward.spawn(
                    format!("decrypt_image {}", ctx.target),
                    async move { agent.decrypt_image(&target, &src_path, &dest_path, size).await },
                );
                if env.pipeline().image_decrypt_pacing {
                    // 给远端解密留出时间，避免连续大图压垮代理。
                    let delay = decrypt_delay(size);
                    ctx.metadata
                        .insert("decrypt_delay_s".to_string(), json!(delay.as_secs()));
                    tokio::time::sleep(delay).await;
                }
            } else {
                debug!("image without client slot, skip decrypt: bot={}", ctx.bot.wxid);
            }
            link = public_link(&env.config.media.public_base_url, &ctx.target.host_id, &dest);
        }

        ctx.rewrite_as_text(image_text(&link, width, height, size));
        Ok(())
    }
}

pub(crate) fn image_text(
    link: &str,
    width: Option<u64>,
    height: Option<u64>,
    size: u64,
) -> String {
    let mut text = "[image]".to_string();
    if !link.is_empty() {
        text.push(' ');
        text.push_str(link);
    }
    if let (Some(width), Some(height)) = (width, height) {
        text.push_str(&format!(" ({width}x{height})"));
    }
    if size > 0 {
        text.push(' ');
        text.push_str(&human_size(size));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalizer::test_support::Harness;

    #[tokio::test]
    async fn image_becomes_text_with_link_and_dimensions() {
        let harness = Harness::new();
        let mut ctx = harness.ctx(
            "image",
            json!({
                "from_wxid": "wxid_a",
                "to_wxid": "wxid_bot",
                "msgid": "img-1",
                "image": "C:\\path\\img.dat",
                "raw_msg": "<img md5=\"abc\" hdwidth=\"100\" hdheight=\"200\" hdlength=\"2097152\"/>"
            }),
        );
        ImageNormalizer.handle(&mut ctx, &harness.env()).await.unwrap();
        harness.settle().await;

        assert_eq!(ctx.event_type(), "text");
        assert_eq!(ctx.origin_type().as_deref(), Some("image"));
        let text = ctx.msg();
        assert!(text.starts_with("[image] https://media.example.com/wx/pc-1/img.jpg"));
        assert!(text.ends_with(" (100x200) 2M"));
        assert_eq!(
            harness.agent.calls(),
            vec!["decrypt_image C:\\path\\img.dat C:\\path\\img.jpg 2097152".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_attributes_degrade() {
        let harness = Harness::new();
        let mut ctx = harness.ctx("image", json!({"msgid": "img-2", "raw_msg": "<img"}));
        ImageNormalizer.handle(&mut ctx, &harness.env()).await.unwrap();
        assert_eq!(ctx.msg(), "[image]");
        assert!(harness.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn other_types_pass_through() {
        let harness = Harness::new();
        let mut ctx = harness.ctx("text", json!({"msg": "hello", "msgid": "t1"}));
        ImageNormalizer.handle(&mut ctx, &harness.env()).await.unwrap();
        assert_eq!(ctx.msg(), "hello");
        assert!(ctx.origin_type().is_none());
    }

    #[test]
    fn text_falls_back_when_parts_missing() {
        assert_eq!(image_text("", Some(1), None, 0), "[image]");
        assert_eq!(image_text("l", None, None, 2048), "[image] l 2K");
    }
}
