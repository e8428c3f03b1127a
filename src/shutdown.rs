use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

struct Inner {
    signal: broadcast::Sender<()>,
    fired: AtomicBool,
    /// 尚未退出的组件
    running: Mutex<Vec<String>>,
    drained: Notify,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, Vec<String>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 关闭协调器
///
/// 向调度服务、进程内 Worker 等组件广播关闭信号，并等待每个组件释放
/// 自己的 [`DrainGuard`]。超时后调用方可以知道是哪些组件没有退出。
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<Inner>,
}

/// 组件运行期间持有，释放即表示该组件已退出
pub struct DrainGuard {
    inner: Arc<Inner>,
    component: String,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut running = self.inner.running();
        if let Some(index) = running.iter().position(|name| *name == self.component) {
            running.remove(index);
        }
        debug!("{} 已退出，剩余 {} 个组件", self.component, running.len());
        if running.is_empty() {
            self.inner.drained.notify_waiters();
        }
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                signal,
                fired: AtomicBool::new(false),
                running: Mutex::new(Vec::new()),
                drained: Notify::new(),
            }),
        }
    }

    /// 只接收关闭信号，不参与退出等待
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        let receiver = self.inner.signal.subscribe();
        if !self.inner.fired.load(Ordering::SeqCst) {
            return receiver;
        }
        let (tx, rx) = broadcast::channel(1);
        let _ = tx.send(());
        rx
    }

    /// 登记一个需要等待其退出的组件
    pub fn register(&self, component: impl Into<String>) -> (broadcast::Receiver<()>, DrainGuard) {
        let component = component.into();
        self.inner.running().push(component.clone());
        let guard = DrainGuard {
            inner: Arc::clone(&self.inner),
            component,
        };
        (self.subscribe(), guard)
    }

    /// 广播关闭信号，返回本次调用是否真正触发了关闭
    pub fn shutdown(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let pending = self.pending();
        info!("开始关闭，等待组件退出: {:?}", pending);
        let _ = self.inner.signal.send(());
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> Vec<String> {
        self.inner.running().clone()
    }

    /// 等待所有已登记组件退出；超时返回仍在运行的组件
    pub async fn wait_drained(&self, timeout: Duration) -> Result<(), Vec<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.running().is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let pending = self.pending();
                    return if pending.is_empty() { Ok(()) } else { Err(pending) };
                }
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
