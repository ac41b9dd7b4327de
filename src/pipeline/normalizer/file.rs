use crate::pipeline::context::EventContext;
use crate::pipeline::envelope;
use crate::pipeline::media::{extension, file_name, human_size, public_link, FileCategory};
use crate::pipeline::normalizer::join_parts;
use crate::pipeline::xml::parse_lenient;
use crate::pipeline::{EventHandler, HandlerEnv};
use anyhow::Result;
use async_trait::async_trait;

pub struct FileNormalizer;

#[async_trait]
impl EventHandler for FileNormalizer {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()> {
        if ctx.is_terminal() {
            return Ok(());
        }
        let label = match ctx.event_type() {
            envelope::FILE => "[file]",
            envelope::VIDEO => "[video]",
            _ => return Ok(()),
        };
        let path = Some(ctx.str_field("video"))
            .filter(|value| !value.is_empty() && label == "[video]")
            .unwrap_or_else(|| ctx.str_field("file"));
        let xml = parse_lenient(&ctx.raw_msg());

        let name = xml
            .text("title")
            .map(str::to_string)
            .or_else(|| Some(file_name(&path).to_string()).filter(|value| !value.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        let ext = xml
            .text("fileext")
            .map(str::to_string)
            .unwrap_or_else(|| {
                let from_name = extension(&name);
                if from_name.is_empty() {
                    extension(&path).to_string()
                } else {
                    from_name.to_string()
                }
            });
        let category = if label == "[video]" && ext.is_empty() {
            FileCategory::Video
        } else {
            FileCategory::from_extension(&ext)
        };
        // 文件消息的大小在 totallen，视频在 length；属性与元素两种写法都有。
        let size = xml
            .first(&["totallen", "length"])
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or_else(|| ctx.str_field("size").parse::<u64>().ok())
            .unwrap_or(0);
        let link = public_link(&env.config.media.public_base_url, &ctx.target.host_id, &path);

        let size_text = if size > 0 {
            human_size(size)
        } else {
            String::new()
        };
        let category_text = format!("({})", category.label());
        let text = join_parts([
            label,
            name.as_str(),
            category_text.as_str(),
            link.as_str(),
            size_text.as_str(),
        ]);
        ctx.rewrite_as_text(text);
        Ok(())
    }
}
