// 代理回调入口：按 token 找到主机配置，事件交给处理管线，应答恒为 ok。
use crate::api::errors::error_response_with_detail;
use crate::pipeline::envelope::Envelope;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/wxhub/agent/{token}/callback", post(agent_callback))
}

async fn agent_callback(
    State(state): State<Arc<AppState>>,
    AxumPath(token): AxumPath<String>,
    body: Bytes,
) -> Response {
    let config = state.config_store.get().await;
    let Some(host) = config.agent_by_token(&token).cloned() else {
        warn!("callback with unknown agent token rejected");
        return error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("AUTH_REQUIRED"),
            "unknown agent token",
            None,
            None,
        );
    };
    let envelope = match Envelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                "malformed callback body acknowledged: host={}, bytes={}, {err:#}",
                host.host_id,
                body.len()
            );
            return ack();
        }
    };
    let event_type = envelope.event_type.clone();
    let client_id = envelope.client_id;
    let outcome = state.pipeline.process(&host, envelope, &config).await;
    debug!(
        "callback processed: host={}, client={client_id}, type={event_type}, outcome={outcome:?}",
        host.host_id
    );
    ack()
}

fn ack() -> Response {
    Json(json!({ "code": 0, "msg": "ok" })).into_response()
}
