// API 路由汇总入口：代理回调与管理端分开挂载。
pub mod admin;
pub mod callback;
pub mod errors;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(callback::router())
        .merge(admin::router())
        .with_state(state)
}
