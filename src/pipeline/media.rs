// 媒体辅助：大小格式化、扩展名归类、解密目标路径与对外链接。
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Video,
    Audio,
    Image,
    Document,
    Spreadsheet,
    Presentation,
    Archive,
    Code,
    Unknown,
}

impl FileCategory {
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "mov" | "avi" | "mkv" | "wmv" | "flv" | "webm" | "m4v" => Self::Video,
            "mp3" | "wav" | "aac" | "flac" | "ogg" | "m4a" | "amr" | "silk" | "wma" => Self::Audio,
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "heic" | "tif" | "tiff" | "svg" => {
                Self::Image
            }
            "pdf" | "doc" | "docx" | "txt" | "md" | "rtf" | "odt" | "wps" => Self::Document,
            "xls" | "xlsx" | "csv" | "ods" | "et" => Self::Spreadsheet,
            "ppt" | "pptx" | "odp" | "key" | "dps" => Self::Presentation,
            "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "xz" => Self::Archive,
            "rs" | "py" | "js" | "ts" | "java" | "c" | "cpp" | "h" | "go" | "json" | "xml"
            | "yaml" | "yml" | "sql" | "sh" | "html" | "css" => Self::Code,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Document => "document",
            Self::Spreadsheet => "spreadsheet",
            Self::Presentation => "presentation",
            Self::Archive => "archive",
            Self::Code => "code",
            Self::Unknown => "unknown",
        }
    }
}

/// 2097152 -> "2M"，1572864 -> "1.5M"，524288 -> "512K"。
pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let value = bytes as f64;
    if value >= MB {
        return format!("{}M", trim_decimal(value / MB));
    }
    if value >= KB {
        return format!("{}K", trim_decimal(value / KB));
    }
    format!("{bytes}B")
}

fn trim_decimal(value: f64) -> String {
    let text = format!("{value:.1}");
    text.strip_suffix(".0").map(str::to_string).unwrap_or(text)
}

/// 远端解密按体积节流：ceil(bytes/1e6)+1 秒。
pub fn decrypt_delay(bytes: u64) -> Duration {
    let secs = (bytes as f64 / 1_000_000.0).ceil() as u64 + 1;
    Duration::from_secs(secs)
}

/// 路径末段文件名，同时兼容 Windows 与 Unix 分隔符。
pub fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path).trim()
}

pub fn extension(name: &str) -> &str {
    let name = file_name(name);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

/// 解密后的图片路径：有媒体目录时落到目录下，否则与源文件同目录改后缀。
pub fn decrypted_image_path(src: &str, media_dir: Option<&str>) -> String {
    let src = src.trim();
    let name = file_name(src);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let target_name = format!("{stem}.jpg");
    match media_dir.map(str::trim).filter(|value| !value.is_empty()) {
        Some(dir) => {
            let separator = if dir.contains('\\') { '\\' } else { '/' };
            format!("{}{separator}{target_name}", dir.trim_end_matches(['\\', '/']))
        }
        None => {
            let prefix = &src[..src.len() - name.len()];
            format!("{prefix}{target_name}")
        }
    }
}

/// 对外可点击链接；未配置公开地址时退回原始路径。
pub fn public_link(public_base_url: &str, host_id: &str, path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return String::new();
    }
    let base = public_base_url.trim();
    if base.is_empty() {
        return path.to_string();
    }
    let mut url = match Url::parse(base) {
        Ok(url) => url,
        Err(_) => return path.to_string(),
    };
    let name = file_name(path);
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().push(host_id).push(name);
        }
        Err(_) => return path.to_string(),
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes() {
        assert_eq!(human_size(2_097_152), "2M");
        assert_eq!(human_size(1_572_864), "1.5M");
        assert_eq!(human_size(524_288), "512K");
        assert_eq!(human_size(300), "300B");
    }

    #[test]
    fn delay_scales_with_size() {
        assert_eq!(decrypt_delay(0), Duration::from_secs(1));
        assert_eq!(decrypt_delay(1_000_000), Duration::from_secs(2));
        assert_eq!(decrypt_delay(2_097_152), Duration::from_secs(4));
    }

    #[test]
    fn categories_by_extension() {
        assert_eq!(FileCategory::from_extension("MP4"), FileCategory::Video);
        assert_eq!(FileCategory::from_extension(".xlsx"), FileCategory::Spreadsheet);
        assert_eq!(FileCategory::from_extension("pptx").label(), "presentation");
        assert_eq!(FileCategory::from_extension("rs"), FileCategory::Code);
        assert_eq!(FileCategory::from_extension(""), FileCategory::Unknown);
    }

    #[test]
    fn paths_and_links() {
        assert_eq!(file_name("C:\\wx\\img\\a.dat"), "a.dat");
        assert_eq!(extension("C:\\wx\\report.final.PDF"), "PDF");
        assert_eq!(extension(".bashrc"), "");
        assert_eq!(
            decrypted_image_path("C:\\wx\\img\\a.dat", None),
            "C:\\wx\\img\\a.jpg"
        );
        assert_eq!(
            decrypted_image_path("C:\\wx\\img\\a.dat", Some("D:\\media\\")),
            "D:\\media\\a.jpg"
        );
        assert_eq!(
            public_link("https://cdn.example.com/media", "pc 1", "D:\\media\\a b.jpg"),
            "https://cdn.example.com/media/pc%201/a%20b.jpg"
        );
        assert_eq!(public_link("", "pc1", "D:\\media\\a.jpg"), "D:\\media\\a.jpg");
        assert_eq!(public_link("https://cdn.example.com", "pc1", ""), "");
    }
}
