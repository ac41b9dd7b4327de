// 入站事件处理管线：噪声过滤 -> 会话状态机 -> 群聊闸门 -> 规范化 -> 指令分发 -> 转发。
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod forward;
pub mod gate;
pub mod guard;
pub mod media;
pub mod normalizer;
pub mod permission;
pub mod session;
pub mod ttl_cache;
pub mod xml;

use crate::agent::{AgentClient, AgentTarget, ForwardSink, OutwardCalls};
use crate::config::{AgentHostConfig, Config, PipelineConfig};
use crate::storage::StorageBackend;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use context::{BotIdentity, EventContext};
use dispatcher::{CommandDispatcher, KeywordCache};
use envelope::Envelope;
use forward::ForwardStage;
use gate::RoomGate;
use guard::ReplyGuard;
use normalizer::voice::PendingVoice;
use permission::PermissionResolver;
use serde_json::Value;
use session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use ttl_cache::TtlCache;

/// 处理器运行时可见的共享依赖与本次事件的配置快照。
pub struct HandlerEnv<'a> {
    pub services: &'a PipelineServices,
    pub config: &'a Config,
    pub host: &'a AgentHostConfig,
}

impl HandlerEnv<'_> {
    pub fn pipeline(&self) -> &PipelineConfig {
        &self.config.pipeline
    }
}

/// 处理链上的一环。每个实现自行检查 `ctx.is_terminal()`，不依赖返回值短路。
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut EventContext, env: &HandlerEnv<'_>) -> Result<()>;
}

pub struct PipelineServices {
    pub storage: Arc<dyn StorageBackend>,
    pub agent: Arc<dyn AgentClient>,
    pub sink: Arc<dyn ForwardSink>,
    pub outward: OutwardCalls,
    pub permissions: PermissionResolver,
    pub reply_guard: ReplyGuard,
    pub voice_pending: TtlCache<(String, String), PendingVoice>,
    pub forwarded: TtlCache<(String, String), ()>,
    pub keywords: KeywordCache,
}

impl PipelineServices {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        agent: Arc<dyn AgentClient>,
        sink: Arc<dyn ForwardSink>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            permissions: PermissionResolver::new(storage.clone()),
            keywords: KeywordCache::new(storage.clone()),
            storage,
            agent,
            sink,
            outward: OutwardCalls::new(),
            reply_guard: ReplyGuard::new(Duration::from_secs(config.reply_guard_ttl_s)),
            voice_pending: TtlCache::new(),
            forwarded: TtlCache::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Noise,
    Lifecycle,
    UnknownBot,
    Terminal(&'static str),
    Forwarded,
    PassedThrough,
}

pub struct Pipeline {
    services: Arc<PipelineServices>,
    sessions: SessionManager,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Pipeline {
    pub fn new(services: Arc<PipelineServices>, config: &PipelineConfig) -> Self {
        let sessions = SessionManager::new(
            services.storage.clone(),
            services.agent.clone(),
            services.outward.clone(),
            config,
        );
        Self {
            services,
            sessions,
            handlers: default_handlers(),
        }
    }

    pub fn services(&self) -> &Arc<PipelineServices> {
        &self.services
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// 等待本管线发起的外呼结束，停机与测试使用。
    pub async fn drain_outward(&self) {
        self.services.outward.drain().await;
    }

    pub async fn process(
        &self,
        host: &AgentHostConfig,
        envelope: Envelope,
        config: &Config,
    ) -> PipelineOutcome {
        let event_type = envelope.event_type.clone();
        if envelope::is_noise_type(&event_type) {
            debug!("noise event dropped: type={event_type}");
            return PipelineOutcome::Noise;
        }
        let target = AgentTarget::new(host.host_id.clone(), envelope.client_id);
        if envelope::is_lifecycle_type(&event_type) {
            if let Err(err) = self
                .sessions
                .handle(&target, &envelope, &config.pipeline)
                .await
            {
                warn!("lifecycle event failed: type={event_type}, {target}, {err:#}");
            }
            return PipelineOutcome::Lifecycle;
        }

        let session = match self.sessions.resolve_bot(&target).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!("event for unknown session dropped: type={event_type}, {target}");
                return PipelineOutcome::UnknownBot;
            }
            Err(err) => {
                warn!("resolve session failed: type={event_type}, {target}, {err:#}");
                return PipelineOutcome::UnknownBot;
            }
        };
        let bot = BotIdentity {
            wxid: session.wxid,
            nickname: session.nickname,
        };
        let mut ctx = EventContext::new(bot, target, &event_type, envelope.data);
        let env = HandlerEnv {
            services: &self.services,
            config,
            host,
        };
        for handler in &self.handlers {
            if let Err(err) = handler.handle(&mut ctx, &env).await {
                warn!(
                    "handler failed: handler={}, bot={}, event={:?}, {err:#}",
                    handler.name(),
                    ctx.bot.wxid,
                    ctx.event_id()
                );
            }
        }

        if let Some(handler) = ctx.terminated_by() {
            return PipelineOutcome::Terminal(handler);
        }
        if ctx.metadata.get("forwarded") == Some(&Value::Bool(true)) {
            return PipelineOutcome::Forwarded;
        }
        PipelineOutcome::PassedThrough
    }
}

fn default_handlers() -> Vec<Arc<dyn EventHandler>> {
    vec![
        Arc::new(RoomGate),
        Arc::new(normalizer::image::ImageNormalizer),
        Arc::new(normalizer::voice::VoiceNormalizer),
        Arc::new(normalizer::voice::VoiceTranscriptNormalizer),
        Arc::new(normalizer::file::FileNormalizer),
        Arc::new(normalizer::link::LinkNormalizer),
        Arc::new(normalizer::system::SystemNoticeNormalizer),
        Arc::new(normalizer::room_member::RoomMemberNormalizer),
        Arc::new(normalizer::misc::TransferNormalizer),
        Arc::new(normalizer::misc::LocationNormalizer),
        Arc::new(normalizer::misc::CardNormalizer),
        Arc::new(CommandDispatcher),
        Arc::new(ForwardStage),
    ]
}

/// SQLite 调用放到阻塞线程池执行。
pub(crate) async fn storage_call<T, F>(storage: &Arc<dyn StorageBackend>, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn StorageBackend) -> Result<T> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || task(storage.as_ref()))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err)))
}
