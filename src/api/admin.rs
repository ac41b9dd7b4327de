// 管理端 API：会话与存活状态、最新二维码、配置热加载。
use crate::agent::AgentTarget;
use crate::api::errors::{error_response, error_response_with_detail};
use crate::pipeline::session::is_heartbeat_stale;
use crate::state::AppState;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/wxhub/admin/sessions", get(admin_sessions))
        .route(
            "/wxhub/admin/qrcode/{host_id}/{client_id}",
            get(admin_qrcode),
        )
        .route("/wxhub/admin/config/reload", post(admin_config_reload))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn admin_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Response> {
    let config = state.config_store.get().await;
    let sessions = state
        .pipeline
        .sessions()
        .list_sessions()
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    let now = Utc::now().timestamp_millis() as f64 / 1000.0;
    let items = sessions
        .iter()
        .map(|session| {
            let phase = session.client_slot.map(|slot| {
                state
                    .pipeline
                    .sessions()
                    .phase(&AgentTarget::new(session.host_id.clone(), slot))
            });
            json!({
                "wxid": session.wxid,
                "nickname": session.nickname,
                "host_id": session.host_id,
                "client_id": session.client_slot,
                "phase": phase,
                "login_at": session.login_at,
                "heartbeat_at": session.heartbeat_at,
                "stale": is_heartbeat_stale(session, now, config.pipeline.heartbeat_stale_s),
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "sessions": items })))
}

async fn admin_qrcode(
    State(state): State<Arc<AppState>>,
    AxumPath((host_id, client_id)): AxumPath<(String, i64)>,
) -> Result<Json<Value>, Response> {
    let target = AgentTarget::new(host_id, client_id);
    let entry = state.pipeline.sessions().latest_qr(&target).ok_or_else(|| {
        error_response_with_detail(
            StatusCode::NOT_FOUND,
            Some("QRCODE_NOT_FOUND"),
            format!("no qrcode issued for {target}"),
            Some("Wait for the agent to push a qrcode event."),
            None,
        )
    })?;
    Ok(Json(json!({
        "phase": state.pipeline.sessions().phase(&target),
        "qrcode": entry,
    })))
}

async fn admin_config_reload(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config_store.reload().await;
    let version = state.config_store.version();
    info!(
        "config reloaded: version={version}, agents={}",
        config.agents.len()
    );
    Json(json!({ "ok": true, "version": version, "agents": config.agents.len() }))
}
