//! 定时同步调度器
//!
//! 每个实例拥有自己的后台任务与重入标志：
//! - 定时批次与手动触发共享同一个 `AtomicBool`，重叠的尝试直接跳过
//! - `stop()` 通过 `CancellationToken` 结束循环，并等待正在进行的批次完成

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SheetReconciler;
use crate::models::SyncRunResult;

struct SchedulerInner {
    reconciler: Arc<SheetReconciler>,
    interval: Duration,
    batch_size: usize,
    in_progress: AtomicBool,
}

/// 批次结束（包括被取消）时复位标志
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SchedulerInner {
    async fn run_guarded(&self) -> Option<SyncRunResult> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[SyncScheduler] previous pass still running, skipping");
            return None;
        }
        let _guard = InProgressGuard(&self.in_progress);
        Some(self.reconciler.run_batch(self.batch_size).await)
    }
}

/// 定时同步调度器
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<SheetReconciler>, interval: Duration, batch_size: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                reconciler,
                interval: interval.max(Duration::from_millis(10)),
                batch_size,
                in_progress: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// 启动后台任务（需在 tokio 运行时内调用）
    ///
    /// 已在运行时返回 `false`。首个批次立即执行。
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                return false;
            }
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.run_guarded().await;
                    }
                }
            }
            debug!("[SyncScheduler] loop exited");
        });

        info!(
            "[SyncScheduler] started, interval={:?} batch_size={}",
            self.inner.interval, self.inner.batch_size
        );
        *task = Some((token, handle));
        true
    }

    /// 停止后台任务并等待其退出
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("[SyncScheduler] task ended abnormally: {}", e);
            }
            info!("[SyncScheduler] stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |(_, handle)| !handle.is_finished())
    }

    /// 是否有批次正在执行
    pub fn is_syncing(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// 立即执行一次批次；已有批次在执行时返回 `None`
    pub async fn trigger_now(&self) -> Option<SyncRunResult> {
        self.inner.run_guarded().await
    }
}
