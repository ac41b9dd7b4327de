// 带过期时间的内存缓存；所有读写在同一把锁内完成，检查与写入不会被拆开。
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

const GC_INTERVAL: Duration = Duration::from_secs(30);

struct CacheState<K, V> {
    entries: HashMap<K, (V, Instant)>,
    last_gc: Instant,
}

pub struct TtlCache<K, V> {
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                last_gc: Instant::now(),
            }),
        }
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::maybe_gc(&mut state, now);
        state.entries.insert(key, (value, now + ttl));
    }

    /// 键不存在或已过期时写入并返回 true；仍有效则保持原值返回 false。
    pub fn insert_if_absent(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::maybe_gc(&mut state, now);
        match state.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().1 > now {
                    return false;
                }
                entry.insert((value, now + ttl));
                true
            }
            Entry::Vacant(entry) => {
                entry.insert((value, now + ttl));
                true
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .map(|(_, expires_at)| *expires_at > now)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    /// 取出并删除；过期条目视为不存在。
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (value, expires_at) = state.entries.remove(key)?;
        if expires_at > now {
            Some(value)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_gc(state: &mut CacheState<K, V>, now: Instant) {
        if now.duration_since(state.last_gc) < GC_INTERVAL {
            return;
        }
        state.last_gc = now;
        state.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}
