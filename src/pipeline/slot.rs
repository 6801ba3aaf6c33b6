//! 单槽交接 (Latest-wins hand-off)
//!
//! 新数据总是覆盖尚未被取走的旧数据, 被覆盖的条数计入单调丢弃计数。
//! 用于 采集→推理 与 推理→控制 两处, 替代无界队列。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 带超时的取值结果
#[derive(Debug, PartialEq, Eq)]
pub enum SlotRecv<T> {
    Item(T),
    Timeout,
    Closed,
}

struct SlotInner<T> {
    value: Option<T>,
    closed: bool,
}

pub struct LatestSlot<T> {
    inner: Mutex<SlotInner<T>>,
    ready: Condvar,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                value: None,
                closed: false,
            }),
            ready: Condvar::new(),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    // 临界区内只做指针交换, 持锁线程 panic 后数据依然一致
    fn lock(&self) -> MutexGuard<'_, SlotInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 写入新值, 覆盖未被消费的旧值。返回 false 表示槽已关闭。
    pub fn put(&self, value: T) -> bool {
        let replaced = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.value.replace(value).is_some()
        };
        self.written.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        true
    }

    /// 非阻塞取值
    pub fn try_take(&self) -> Option<T> {
        self.lock().value.take()
    }

    /// 阻塞等待新值, 最多等待 `timeout`
    pub fn take_timeout(&self, timeout: Duration) -> SlotRecv<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(value) = inner.value.take() {
                return SlotRecv::Item(value);
            }
            if inner.closed {
                return SlotRecv::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return SlotRecv::Timeout;
            }
            inner = match self.ready.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// 关闭槽: 唤醒所有等待者, 之后的写入被拒绝。已写入的最后一个值仍可取走。
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 累计写入条数
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// 被覆盖 (未消费即丢弃) 的条数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
