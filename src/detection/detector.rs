//! 检测器 (Detector)
//! 职责: Frame → 推理工作线程 → 按延迟预算取回结果 → 只保留人体检测
//!
//! 推理引擎在独立线程运行, 超出预算的调用立即返回 Timeout, 迟到的结果按帧号丢弃。
//! 工作线程忙于被放弃的帧时, 新调用返回 Busy 而不排队。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::types::{Detection, RawDetection};
use crate::camera::Frame;
use crate::config::DetectionConfig;
use crate::error::DetectError;

/// 推理引擎能力接口: infer(Frame) -> [(bbox, confidence, classLabel)]
pub trait InferenceEngine: Send {
    fn infer(&mut self, frame: &Frame) -> anyhow::Result<Vec<RawDetection>>;

    fn name(&self) -> String {
        String::from("engine")
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn infer(&mut self, frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
        (**self).infer(frame)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

type EngineReply = (u64, anyhow::Result<Vec<RawDetection>>);

pub struct Detector {
    job_tx: Option<Sender<Frame>>,
    reply_rx: Receiver<EngineReply>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,

    budget: Duration,
    confidence_threshold: f32,
    person_label: String,

    // 统计
    timeouts: u64,
    late_discarded: u64,
}

impl Detector {
    /// 启动推理工作线程
    pub fn spawn<E: InferenceEngine + 'static>(
        mut engine: E,
        config: &DetectionConfig,
    ) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<Frame>(1);
        let (reply_tx, reply_rx) = bounded::<EngineReply>(1);
        let busy = Arc::new(AtomicBool::new(false));

        let handle = {
            let busy = Arc::clone(&busy);
            thread::Builder::new()
                .name("inference-engine".into())
                .spawn(move || {
                    info!("🔍 推理引擎启动: {}", engine.name());
                    for frame in job_rx.iter() {
                        let result = engine.infer(&frame);
                        // 先清忙标志, 调用方收到结果后可立即提交下一帧
                        busy.store(false, Ordering::Release);
                        // 结果槽满说明上一个迟到结果无人取走, 丢掉即可
                        let _ = reply_tx.try_send((frame.id, result));
                    }
                    info!("🔍 推理引擎退出");
                })?
        };

        Ok(Self {
            job_tx: Some(job_tx),
            reply_rx,
            busy,
            handle: Some(handle),
            budget: config.max_latency(),
            confidence_threshold: config.confidence_threshold,
            person_label: config.person_label.clone(),
            timeouts: 0,
            late_discarded: 0,
        })
    }

    /// 限时推理, 返回过滤后的人体检测
    pub fn infer(&mut self, frame: Frame) -> Result<Vec<Detection>, DetectError> {
        let job_tx = self.job_tx.as_ref().ok_or(DetectError::WorkerLost)?;

        // 清掉之前被放弃的迟到结果
        while let Ok((id, _)) = self.reply_rx.try_recv() {
            self.late_discarded += 1;
            debug!("🗑️ 丢弃迟到的推理结果 (帧 #{})", id);
        }

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.timeouts += 1;
            return Err(DetectError::Busy);
        }

        let (frame_id, width, height) = (frame.id, frame.width, frame.height);
        match job_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::Release);
                self.timeouts += 1;
                return Err(DetectError::Busy);
            }
            Err(TrySendError::Disconnected(_)) => return Err(DetectError::WorkerLost),
        }

        let deadline = Instant::now() + self.budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reply_rx.recv_timeout(remaining) {
                Ok((id, result)) if id == frame_id => {
                    let raw = result.map_err(|e| DetectError::Engine(e.to_string()))?;
                    return Ok(filter_detections(
                        raw,
                        self.confidence_threshold,
                        &self.person_label,
                        width,
                        height,
                    ));
                }
                Ok((id, _)) => {
                    self.late_discarded += 1;
                    debug!("🗑️ 丢弃迟到的推理结果 (帧 #{})", id);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.timeouts += 1;
                    return Err(DetectError::Timeout(self.budget));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DetectError::WorkerLost),
            }
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// 超时 + 忙 的累计次数
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn late_discarded(&self) -> u64 {
        self.late_discarded
    }

    /// 停止工作线程。正在进行的推理不取消: 空闲时等待退出, 否则放弃等待。
    pub fn stop(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            if self.busy.load(Ordering::Acquire) {
                warn!("⚠️ 推理引擎仍在处理, 放弃等待");
            } else if handle.join().is_err() {
                warn!("⚠️ 推理引擎线程 panic");
            }
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Detector 边界过滤: 类别 == person_label, 置信度 >= 阈值, 框有效并裁剪到帧内
pub fn filter_detections(
    raw: Vec<RawDetection>,
    confidence_threshold: f32,
    person_label: &str,
    width: u32,
    height: u32,
) -> Vec<Detection> {
    raw.into_iter()
        .filter(|d| d.label == person_label)
        .filter(|d| d.confidence.is_finite() && d.confidence >= confidence_threshold)
        .filter_map(|d| {
            if !d.bbox.is_valid() {
                return None;
            }
            let bbox = d.bbox.clip(width as f32, height as f32);
            bbox.is_valid()
                .then(|| Detection::new(bbox, d.confidence, d.label))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::BBox;

    struct FixedEngine {
        delay: Duration,
        output: Vec<RawDetection>,
    }

    impl InferenceEngine for FixedEngine {
        fn infer(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            thread::sleep(self.delay);
            Ok(self.output.clone())
        }
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn infer(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            anyhow::bail!("模型输出形状错误")
        }
    }

    struct PanickingEngine;

    impl InferenceEngine for PanickingEngine {
        fn infer(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            panic!("engine crashed")
        }
    }

    fn config(max_latency_ms: u64) -> DetectionConfig {
        DetectionConfig {
            max_latency_ms,
            ..DetectionConfig::default()
        }
    }

    fn person(conf: f32) -> RawDetection {
        RawDetection::new(BBox::new(100.0, 100.0, 200.0, 300.0), conf, "person")
    }

    #[test]
    fn test_filter_keeps_only_confident_persons() {
        let raw = vec![
            person(0.9),
            person(0.3),
            RawDetection::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.99, "dog"),
            RawDetection::new(BBox::new(50.0, 50.0, 50.0, 80.0), 0.9, "person"),
            RawDetection::new(BBox::new(600.0, 400.0, 700.0, 520.0), 0.8, "person"),
        ];
        let kept = filter_detections(raw, 0.5, "person", 640, 480);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].bbox, BBox::new(600.0, 400.0, 640.0, 480.0));
    }

    #[test]
    fn test_box_entirely_outside_frame_dropped() {
        let raw = vec![RawDetection::new(
            BBox::new(700.0, 10.0, 800.0, 100.0),
            0.9,
            "person",
        )];
        assert!(filter_detections(raw, 0.5, "person", 640, 480).is_empty());
    }

    #[test]
    fn test_fast_engine_returns_detections() {
        let engine = FixedEngine {
            delay: Duration::from_millis(1),
            output: vec![person(0.8), person(0.1)],
        };
        let mut detector = Detector::spawn(engine, &config(500)).unwrap();

        let dets = detector.infer(Frame::blank(1, 640, 480)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(detector.timeouts(), 0);
    }

    #[test]
    fn test_slow_engine_times_out_then_late_result_discarded() {
        let engine = FixedEngine {
            delay: Duration::from_millis(80),
            output: vec![person(0.8)],
        };
        let mut detector = Detector::spawn(engine, &config(10)).unwrap();

        let start = Instant::now();
        assert!(matches!(
            detector.infer(Frame::blank(1, 640, 480)),
            Err(DetectError::Timeout(_))
        ));
        assert!(start.elapsed() < Duration::from_millis(60));

        // 工作线程仍在处理帧 #1
        assert!(matches!(
            detector.infer(Frame::blank(2, 640, 480)),
            Err(DetectError::Busy)
        ));

        // 等帧 #1 的结果迟到, 下一次调用将其丢弃
        thread::sleep(Duration::from_millis(150));
        let _ = detector.infer(Frame::blank(3, 640, 480));
        assert!(detector.late_discarded() >= 1);
        assert!(detector.timeouts() >= 2);
    }

    #[test]
    fn test_engine_error_is_recoverable() {
        let mut detector = Detector::spawn(FailingEngine, &config(500)).unwrap();
        let err = detector.infer(Frame::blank(1, 64, 64)).unwrap_err();
        assert!(matches!(err, DetectError::Engine(_)));
        assert!(err.into_fatal().is_none());
    }

    #[test]
    fn test_dead_worker_is_fatal() {
        let mut detector = Detector::spawn(PanickingEngine, &config(500)).unwrap();
        let err = detector.infer(Frame::blank(1, 64, 64)).unwrap_err();
        assert!(matches!(err, DetectError::WorkerLost));
        assert!(err.into_fatal().is_some());
    }
}
