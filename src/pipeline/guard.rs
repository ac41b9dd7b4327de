// 回复幂等标记：(bot, event id) 在 TTL 内只允许产生一次回复。
use crate::pipeline::ttl_cache::TtlCache;
use std::time::Duration;

pub struct ReplyGuard {
    markers: TtlCache<(String, String), ()>,
    ttl: Duration,
}

impl ReplyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            markers: TtlCache::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 原子地检查并占位：返回 true 表示本次调用获得回复权。
    pub fn claim(&self, bot_wxid: &str, event_id: &str) -> bool {
        self.markers
            .insert_if_absent(Self::key(bot_wxid, event_id), (), self.ttl)
    }

    pub fn has_replied(&self, bot_wxid: &str, event_id: &str) -> bool {
        self.markers.contains(&Self::key(bot_wxid, event_id))
    }

    pub fn mark_replied(&self, bot_wxid: &str, event_id: &str, ttl: Duration) {
        self.markers.insert(Self::key(bot_wxid, event_id), (), ttl);
    }

    fn key(bot_wxid: &str, event_id: &str) -> (String, String) {
        (bot_wxid.to_string(), event_id.to_string())
    }
}
