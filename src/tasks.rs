//! 后台循环任务
//!
//! 每个循环持有自己的关闭通道，由启动它的组件负责停止。

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 交给循环体的接收端
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// 睡眠 `period`；期间收到关闭信号返回 false
    pub async fn sleep(&mut self, period: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.is_triggered(),
            _ = self.rx.changed() => false,
        }
    }
}

#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(body(Shutdown { rx }));
        tracing::debug!(task = name, "background task started");
        Self { name, tx, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 发出关闭信号并等待循环退出
    pub async fn stop(self) {
        let _ = self.tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, "background task ended abnormally: {e}");
        }
        tracing::debug!(task = self.name, "background task stopped");
    }
}

/// 每隔 `period` 执行一次 `tick`，直到关闭
pub fn periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> BackgroundTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    BackgroundTask::spawn(name, move |mut shutdown| async move {
        loop {
            tick().await;
            if !shutdown.sleep(period).await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn periodic_task_stops_promptly() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = periodic("test", Duration::from_secs(3600), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("stop should not wait for the full period");
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
