// 外呼任务：管线只负责发起，不等待结果；失败写日志，不回传给事件来源。
use std::future::Future;
use tokio_util::task::TaskTracker;
use tracing::warn;

#[derive(Clone, Default)]
pub struct OutwardCalls {
    tracker: TaskTracker,
}

impl OutwardCalls {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    pub fn spawn<F>(&self, label: impl Into<String>, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        self.tracker.spawn(async move {
            if let Err(err) = future.await {
                warn!("outward call failed: {label}: {err:#}");
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// 等待已发起的外呼全部结束；之后仍可继续发起新任务。
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn drain_waits_for_spawned_calls() {
        let outward = OutwardCalls::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            outward.spawn("count", async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        outward.spawn("fail", async { Err(anyhow::anyhow!("boom")) });
        outward.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(outward.pending(), 0);

        let counter_after = counter.clone();
        outward.spawn("after", async move {
            counter_after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        outward.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
