// 全局应用状态：集中初始化存储、代理客户端与处理管线。

use crate::agent::{ForwardSink, HttpAgentClient, HttpForwardSink, NoopForwardSink};
use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::pipeline::{Pipeline, PipelineServices};
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config_store: ConfigStore,
    pub storage: Arc<dyn StorageBackend>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config_store: ConfigStore, config: &Config) -> Result<Self> {
        let storage = build_storage(&config.storage).context("初始化存储失败")?;
        let http = reqwest::Client::builder()
            .build()
            .context("初始化 HTTP 客户端失败")?;
        let agent = Arc::new(HttpAgentClient::new(http.clone(), config_store.clone()));
        let sink: Arc<dyn ForwardSink> = match HttpForwardSink::from_config(http, &config.forward)
        {
            Some(sink) => Arc::new(sink),
            None => {
                info!("forward.url 未配置，事件只落库不外发");
                Arc::new(NoopForwardSink)
            }
        };
        let services = Arc::new(PipelineServices::new(
            storage.clone(),
            agent,
            sink,
            &config.pipeline,
        ));
        Ok(Self::with_services(config_store, services, &config.pipeline))
    }

    /// 由调用方提供依赖组装，嵌入与测试场景使用。
    pub fn with_services(
        config_store: ConfigStore,
        services: Arc<PipelineServices>,
        config: &crate::config::PipelineConfig,
    ) -> Self {
        let storage = services.storage.clone();
        let pipeline = Arc::new(Pipeline::new(services, config));
        Self {
            config_store,
            storage,
            pipeline,
        }
    }
}
