// Library entrypoint for integration tests and internal reuse.
pub mod agent;
mod api;
mod core;
pub mod pipeline;
pub mod storage;

pub use self::core::{auth, config, config_store, shutdown, state};
pub use api::build_router;
