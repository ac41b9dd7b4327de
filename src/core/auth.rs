// 鉴权辅助：管理端路径保护与 API Key 解析。
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

pub fn is_admin_path(path: &str) -> bool {
    path.starts_with("/wxhub/admin")
}

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    // 兼容 X-API-Key 与 Authorization: Bearer 的两种格式。
    if let Some(value) = headers.get("x-api-key") {
        if let Ok(text) = value.to_str() {
            let cleaned = text.trim();
            if !cleaned.is_empty() {
                return Some(cleaned.to_string());
            }
        }
    }
    let value = headers.get(AUTHORIZATION)?;
    let text = value.to_str().ok()?.trim();
    let prefix = text.get(..7)?;
    if !prefix.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    text.get(7..)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
