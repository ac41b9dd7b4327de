// 基础设施：配置、鉴权、全局状态与停机信号。
pub mod auth;
pub mod config;
pub mod config_store;
pub mod shutdown;
pub mod state;
