// 配置存储：启动时加载，管理端可触发重新读取。
use crate::config::{load_config_from, Config};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
    base_path: String,
    override_path: String,
    version: Arc<AtomicU64>,
}

impl ConfigStore {
    pub fn new(base_path: String, override_path: String) -> Self {
        let config = load_config_from(&base_path, &override_path);
        Self {
            inner: Arc::new(RwLock::new(config)),
            base_path,
            override_path,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 直接使用内存中的配置，测试与嵌入场景使用。
    pub fn from_config(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            base_path: String::new(),
            override_path: String::new(),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn reload(&self) -> Config {
        if self.base_path.is_empty() {
            return self.get().await;
        }
        let config = load_config_from(&self.base_path, &self.override_path);
        let mut guard = self.inner.write().await;
        *guard = config.clone();
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
        config
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
