//! 采集阶段 (FrameSource)
//!
//! 采集线程持续读取摄像头, 新帧覆盖未被推理取走的旧帧。
//! 丢帧不是错误, 只计入单调丢帧计数。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::{Camera, Frame};
use crate::error::{panic_message, CameraError};
use crate::pipeline::slot::{LatestSlot, SlotRecv};

/// 采集线程单次读帧的等待上限
const CAPTURE_POLL: Duration = Duration::from_millis(100);

pub struct FrameSource {
    slot: Arc<LatestSlot<Frame>>,
    failure: Arc<Mutex<Option<String>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// 启动采集线程
    pub fn spawn<C: Camera + 'static>(mut camera: C) -> std::io::Result<Self> {
        let slot = Arc::new(LatestSlot::new());
        let failure = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let slot = Arc::clone(&slot);
            let failure = Arc::clone(&failure);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    info!("📷 采集线程启动: {}", camera.describe());
                    let mut count = 0u64;
                    let mut last = Instant::now();

                    while !stop.load(Ordering::Relaxed) {
                        // 驱动 panic 视同断开
                        let read = panic::catch_unwind(AssertUnwindSafe(|| {
                            camera.next_frame(CAPTURE_POLL)
                        }))
                        .unwrap_or_else(|payload| {
                            Err(CameraError::Disconnected(format!(
                                "驱动 panic: {}",
                                panic_message(&*payload)
                            )))
                        });
                        match read {
                            Ok(frame) => {
                                if !slot.put(frame) {
                                    break;
                                }
                                count += 1;
                            }
                            Err(CameraError::Timeout) => {
                                debug!("⏳ 摄像头读帧超时, 重试");
                            }
                            Err(CameraError::Disconnected(msg)) => {
                                error!("❌ 摄像头断开: {}", msg);
                                *failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(msg);
                                break;
                            }
                        }

                        if last.elapsed() >= Duration::from_secs(1) {
                            let elapsed = last.elapsed().as_secs_f64();
                            info!(
                                "📺 采集统计: {:.1}fps | 总帧{} | 丢弃{}",
                                count as f64 / elapsed,
                                slot.written(),
                                slot.dropped()
                            );
                            count = 0;
                            last = Instant::now();
                        }
                    }

                    slot.close();
                    info!("📷 采集线程退出");
                })?
        };

        Ok(Self {
            slot,
            failure,
            stop,
            handle: Some(handle),
        })
    }

    /// 取最新帧, 最多等待 `timeout`
    ///
    /// 采集线程因摄像头断开退出后返回 `Disconnected`, 由调用方升级为 SensorFailure。
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame, CameraError> {
        match self.slot.take_timeout(timeout) {
            SlotRecv::Item(frame) => Ok(frame),
            SlotRecv::Timeout => Err(CameraError::Timeout),
            SlotRecv::Closed => {
                let reason = self
                    .failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| String::from("采集已停止"));
                Err(CameraError::Disconnected(reason))
            }
        }
    }

    /// 未被消费即被覆盖的帧数
    pub fn dropped_frames(&self) -> u64 {
        self.slot.dropped()
    }

    pub fn captured_frames(&self) -> u64 {
        self.slot.written()
    }

    /// 停止采集线程 (关机序列最后一步)
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.slot.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("❌ 采集线程 panic");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
