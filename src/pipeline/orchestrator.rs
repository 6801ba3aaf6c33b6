//! 编排器 (Orchestrator)
//!
//! 线程:
//! - capture:        FrameSource 采集线程
//! - inference:      取最新帧 → Detector → TargetTracker → 快照单槽
//! - control:        固定频率节拍, 从不等待推理
//! - safety-monitor: 独立看门狗巡检
//!
//! 关机顺序: (1) 锁存激光关闭 (2) 停止下发舵机指令, 之后可选回中停车
//! (3) 停止推理 (4) 停止采集。
//! 任一阶段的致命错误 (含线程 panic) 先强制关激光, 再经通道上报, 然后执行同一关机序列。
//! 外部停止请求 (`StopHandle`) 先按下急停, 再触发同一关机序列。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::slot::LatestSlot;
use crate::actuator::{ActuatorDriver, Axis, Servo};
use crate::camera::{Camera, FrameSource};
use crate::config::TurretConfig;
use crate::control::{ControlLoop, TickReport};
use crate::detection::{Detector, InferenceEngine};
use crate::error::{panic_message, CameraError, DetectError, TurretError};
use crate::safety::{Laser, OverrideSwitch, SafetyInterlock, SafetyState};
use crate::tracking::{LockState, TargetSnapshot, TargetTracker};

/// 四个能力接口的具体实现 (真实硬件或仿真)
pub struct Hardware {
    pub camera: Box<dyn Camera>,
    pub engine: Box<dyn InferenceEngine>,
    pub servo: Box<dyn Servo>,
    pub laser: Box<dyn Laser>,
    pub override_switch: OverrideSwitch,
}

/// 运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub ticks: u64,
    pub laser_on_ticks: u64,
    /// 激光亮而锁定状态不是 TRACKING 的节拍数, 正常恒为 0
    pub interlock_violations: u64,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub inferences: u64,
    pub inference_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    laser_on_ticks: AtomicU64,
    interlock_violations: AtomicU64,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    inferences: AtomicU64,
    inference_timeouts: AtomicU64,
}

impl Counters {
    fn report(&self) -> RunReport {
        RunReport {
            ticks: self.ticks.load(Ordering::Relaxed),
            laser_on_ticks: self.laser_on_ticks.load(Ordering::Relaxed),
            interlock_violations: self.interlock_violations.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            inferences: self.inferences.load(Ordering::Relaxed),
            inference_timeouts: self.inference_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// 致命错误: 先关激光再上报
fn report_fatal(safety: &SafetyInterlock, fatal_tx: &Sender<TurretError>, err: TurretError) {
    error!("💥 致命错误: {}", err);
    if let Err(e) = safety.force_off() {
        error!("❌ 强制关闭激光失败: {}", e);
    }
    let _ = fatal_tx.send(err);
}

/// 阶段线程主体: panic 按致命错误上报
fn guarded<T>(
    stage: &'static str,
    safety: &SafetyInterlock,
    fatal_tx: &Sender<TurretError>,
    body: impl FnOnce() -> T,
) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = panic_message(&*payload);
            report_fatal(safety, fatal_tx, TurretError::StagePanicked { stage, message });
            None
        }
    }
}

// ========== 状态遥测 ==========

/// 控制阶段每节拍发布的跟踪与云台状态
#[derive(Debug, Clone, Copy)]
struct ControlStatus {
    lock_state: LockState,
    target_id: Option<u32>,
    target_confidence: Option<f32>,
    target_centroid: Option<(f32, f32)>,
    pan_deg: f32,
    tilt_deg: f32,
}

/// 对外状态快照, 可序列化为 JSON
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurretStatus {
    pub uptime_s: f64,
    pub lock_state: LockState,
    pub target_id: Option<u32>,
    pub target_confidence: Option<f32>,
    pub target_centroid: Option<(f32, f32)>,
    pub pan_deg: f32,
    pub tilt_deg: f32,
    pub laser_on: bool,
    pub override_active: bool,
    pub cooling_down: bool,
    pub shutdown: bool,
    pub report: RunReport,
}

impl TurretStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// 任意线程读取运行状态的句柄
#[derive(Clone)]
pub struct StatusHandle {
    board: Arc<Mutex<ControlStatus>>,
    safety: Arc<SafetyInterlock>,
    counters: Arc<Counters>,
    started: Instant,
}

impl StatusHandle {
    pub fn status(&self) -> TurretStatus {
        let control = *self.board.lock().unwrap_or_else(|e| e.into_inner());
        let safety = self.safety.state();
        let now = Instant::now();
        TurretStatus {
            uptime_s: now.saturating_duration_since(self.started).as_secs_f64(),
            lock_state: control.lock_state,
            target_id: control.target_id,
            target_confidence: control.target_confidence,
            target_centroid: control.target_centroid,
            pan_deg: control.pan_deg,
            tilt_deg: control.tilt_deg,
            laser_on: safety.laser_enabled,
            override_active: safety.override_active,
            cooling_down: safety.cooldown_until.is_some_and(|t| now < t),
            shutdown: safety.shutdown,
            report: self.counters.report(),
        }
    }
}

// ========== 外部停止 ==========

/// 外部停止请求 (信号处理等), 可克隆, 任意线程可调用
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<()>,
    safety: Arc<SafetyInterlock>,
}

impl StopHandle {
    /// 按下急停并立即关激光, 再通知 `run_for` 返回执行关机序列
    pub fn request_stop(&self) {
        self.safety.override_switch().engage();
        if let Err(e) = self.safety.force_off() {
            error!("❌ 停止请求关闭激光失败: {}", e);
        }
        let _ = self.tx.try_send(());
    }
}

pub struct Orchestrator;

impl Orchestrator {
    /// 校验配置, 回中云台, 启动全部阶段
    pub fn start(
        config: Arc<TurretConfig>,
        hardware: Hardware,
    ) -> Result<RunningTurret, TurretError> {
        config.validate()?;
        config.log_summary();

        let Hardware {
            camera,
            engine,
            servo,
            laser,
            override_switch,
        } = hardware;

        // 激光在任何阶段启动前就已关闭
        let safety = Arc::new(SafetyInterlock::new(
            laser,
            &config.safety,
            override_switch,
        )?);

        let mut driver = ActuatorDriver::new(servo, &config.actuator);
        driver
            .home()
            .map_err(|(axis, source)| TurretError::ActuatorFault { axis, source })?;

        let (fatal_tx, fatal_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (control_stop_tx, control_stop_rx) = bounded::<()>(0);
        let (monitor_stop_tx, monitor_stop_rx) = bounded::<()>(0);
        let counters = Arc::new(Counters::default());
        let snapshots = Arc::new(LatestSlot::new());
        let inference_stop = Arc::new(AtomicBool::new(false));
        let board = Arc::new(Mutex::new(ControlStatus {
            lock_state: LockState::Searching,
            target_id: None,
            target_confidence: None,
            target_centroid: None,
            pan_deg: driver.angle(Axis::Pan),
            tilt_deg: driver.angle(Axis::Tilt),
        }));

        let mut turret = RunningTurret {
            safety: Arc::clone(&safety),
            counters: Arc::clone(&counters),
            board: Arc::clone(&board),
            fatal_rx,
            stop_tx,
            stop_rx,
            park_on_shutdown: config.actuator.park_on_shutdown,
            inference_stop: Arc::clone(&inference_stop),
            control_stop: Some(control_stop_tx),
            monitor_stop: Some(monitor_stop_tx),
            control: None,
            inference: None,
            monitor: None,
            started: Instant::now(),
            shut_down: false,
        };

        // 巡检最先启动, 最后停止
        turret.monitor = Some({
            let safety = Arc::clone(&safety);
            let fatal_tx = fatal_tx.clone();
            let period = config.safety.monitor_period();
            thread::Builder::new()
                .name("safety-monitor".into())
                .spawn(move || {
                    guarded("safety-monitor", &safety, &fatal_tx, || {
                        safety_monitor(&safety, period, monitor_stop_rx, &fatal_tx)
                    });
                })?
        });

        let source = FrameSource::spawn(camera)?;
        let detector = Detector::spawn(engine, &config.detection)?;
        turret.inference = Some({
            let config = Arc::clone(&config);
            let snapshots = Arc::clone(&snapshots);
            let safety = Arc::clone(&safety);
            let counters = Arc::clone(&counters);
            let fatal_tx = fatal_tx.clone();
            thread::Builder::new()
                .name("inference".into())
                .spawn(move || {
                    guarded("inference", &safety, &fatal_tx, || {
                        inference_stage(
                            &config,
                            source,
                            detector,
                            &snapshots,
                            &safety,
                            &counters,
                            &inference_stop,
                            &fatal_tx,
                        )
                    });
                })?
        });

        turret.control = Some({
            let control = ControlLoop::new(&config, driver, Arc::clone(&safety));
            let period = config.control.tick_period();
            thread::Builder::new()
                .name("control".into())
                .spawn(move || {
                    guarded("control", &safety, &fatal_tx, || {
                        control_stage(
                            control,
                            &snapshots,
                            &safety,
                            &counters,
                            &board,
                            period,
                            control_stop_rx,
                            &fatal_tx,
                        )
                    })
                })?
        });

        info!("🚀 炮塔已启动");
        Ok(turret)
    }
}

// ========== 阶段线程 ==========

#[allow(clippy::too_many_arguments)]
fn inference_stage(
    config: &TurretConfig,
    mut source: FrameSource,
    mut detector: Detector,
    snapshots: &LatestSlot<TargetSnapshot>,
    safety: &SafetyInterlock,
    counters: &Counters,
    stop: &AtomicBool,
    fatal_tx: &Sender<TurretError>,
) {
    let camera = &config.camera;
    let mut tracker = TargetTracker::new(&config.tracking, camera.width, camera.height);
    let mut heartbeat: Option<Instant> = None;
    let frame_timeout = camera.frame_timeout();

    let mut count = 0u64;
    let mut last = Instant::now();
    info!("🔍 推理阶段启动 (预算 {:?})", detector.budget());

    while !stop.load(Ordering::Relaxed) {
        let frame = match source.next_frame(frame_timeout) {
            Ok(frame) => frame,
            Err(CameraError::Timeout) => {
                debug!("⏳ 等待帧超时");
                continue;
            }
            Err(CameraError::Disconnected(msg)) => {
                if !stop.load(Ordering::Relaxed) {
                    report_fatal(safety, fatal_tx, TurretError::SensorFailure(msg));
                }
                break;
            }
        };

        tracker.set_frame_size(frame.width, frame.height);
        let captured_at = frame.captured_at;

        match detector.infer(frame) {
            Ok(detections) => {
                heartbeat = Some(Instant::now());
                counters.inferences.fetch_add(1, Ordering::Relaxed);
                tracker.update(&detections, captured_at);
            }
            Err(e) => {
                if let DetectError::Engine(msg) = &e {
                    warn!("⚠️ 推理失败: {}", msg);
                }
                if let Some(fatal) = e.into_fatal() {
                    report_fatal(safety, fatal_tx, fatal);
                    break;
                }
                // 本周期无检测, 跟踪器外推
                let timeout = TurretError::InferenceTimeout {
                    budget: detector.budget(),
                };
                debug!("⏱️ {}", timeout);
                counters.inference_timeouts.fetch_add(1, Ordering::Relaxed);
                tracker.coast_without_detections(captured_at);
            }
        }

        snapshots.put(tracker.snapshot(heartbeat));
        counters
            .frames_captured
            .store(source.captured_frames(), Ordering::Relaxed);
        counters
            .frames_dropped
            .store(source.dropped_frames(), Ordering::Relaxed);
        count += 1;

        if last.elapsed() >= Duration::from_secs(1) {
            let elapsed = last.elapsed().as_secs_f64();
            info!(
                "🔍 推理统计: {:.1}fps | {:?} | 超时 {} | 丢帧 {}",
                count as f64 / elapsed,
                tracker.lock_state(),
                detector.timeouts(),
                source.dropped_frames()
            );
            count = 0;
            last = Instant::now();
        }
    }

    info!("🔍 停止推理阶段");
    detector.stop();
    info!("📷 停止采集阶段");
    source.stop();
    counters
        .frames_captured
        .store(source.captured_frames(), Ordering::Relaxed);
    counters
        .frames_dropped
        .store(source.dropped_frames(), Ordering::Relaxed);
    snapshots.close();
}

fn publish(board: &Mutex<ControlStatus>, control: &ControlLoop, report: &TickReport) {
    let target = control.snapshot().target.as_ref();
    let mut status = board.lock().unwrap_or_else(|e| e.into_inner());
    *status = ControlStatus {
        lock_state: report.lock_state,
        target_id: target.map(|t| t.id),
        target_confidence: target.map(|t| t.confidence),
        target_centroid: target.map(|t| t.centroid),
        pan_deg: control.driver().angle(Axis::Pan),
        tilt_deg: control.driver().angle(Axis::Tilt),
    };
}

/// 控制阶段; 退出时交还 ControlLoop, 由关机序列在激光锁存后回中
#[allow(clippy::too_many_arguments)]
fn control_stage(
    mut control: ControlLoop,
    snapshots: &LatestSlot<TargetSnapshot>,
    safety: &SafetyInterlock,
    counters: &Counters,
    board: &Mutex<ControlStatus>,
    period: Duration,
    stop_rx: Receiver<()>,
    fatal_tx: &Sender<TurretError>,
) -> ControlLoop {
    let ticker = tick(period);
    let mut count = 0u64;
    let mut last = Instant::now();
    info!("🎮 控制阶段启动: 周期 {:?}", period);

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                match control.tick(Instant::now(), snapshots.try_take()) {
                    Ok(report) => {
                        publish(board, &control, &report);
                        counters.ticks.fetch_add(1, Ordering::Relaxed);
                        if report.laser_on {
                            counters.laser_on_ticks.fetch_add(1, Ordering::Relaxed);
                            if report.lock_state != LockState::Tracking {
                                error!("❌ 激光亮但锁定状态为 {:?}", report.lock_state);
                                counters.interlock_violations.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        report_fatal(safety, fatal_tx, e);
                        break;
                    }
                    Err(e) => warn!("⚠️ 控制节拍异常: {}", e),
                }
                count += 1;

                if last.elapsed() >= Duration::from_secs(1) {
                    let elapsed = last.elapsed().as_secs_f64();
                    let state = control.state();
                    info!(
                        "🎮 控制统计: {:.1}Hz | {:?} | 激光 {} | pan {:.1}° tilt {:.1}°",
                        count as f64 / elapsed,
                        control.snapshot().lock_state,
                        if safety.laser_enabled() { "开" } else { "关" },
                        state.pan_command,
                        state.tilt_command
                    );
                    count = 0;
                    last = Instant::now();
                }
            }
        }
    }

    control.stop_commands();
    info!(
        "🎮 控制阶段停止: pan {:.1}° tilt {:.1}°",
        control.driver().angle(Axis::Pan),
        control.driver().angle(Axis::Tilt)
    );
    control
}

fn safety_monitor(
    safety: &SafetyInterlock,
    period: Duration,
    stop_rx: Receiver<()>,
    fatal_tx: &Sender<TurretError>,
) {
    let ticker = tick(period);
    info!("🐕 看门狗巡检启动: 周期 {:?}", period);
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                if let Err(e) = safety.check_watchdog(Instant::now()) {
                    report_fatal(safety, fatal_tx, e);
                    break;
                }
            }
        }
    }
    info!("🐕 看门狗巡检停止");
}

// ========== 运行句柄 ==========

pub struct RunningTurret {
    safety: Arc<SafetyInterlock>,
    counters: Arc<Counters>,
    board: Arc<Mutex<ControlStatus>>,
    fatal_rx: Receiver<TurretError>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    park_on_shutdown: bool,
    inference_stop: Arc<AtomicBool>,
    control_stop: Option<Sender<()>>,
    monitor_stop: Option<Sender<()>>,
    control: Option<JoinHandle<Option<ControlLoop>>>,
    inference: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    started: Instant,
    shut_down: bool,
}

impl std::fmt::Debug for RunningTurret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTurret")
            .field("started", &self.started)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl RunningTurret {
    /// 运行到致命错误、停止请求或到时 (`None` = 不限时), 然后执行关机序列
    pub fn run_for(mut self, duration: Option<Duration>) -> Result<RunReport, TurretError> {
        let fatal = match duration {
            Some(d) => select! {
                recv(self.fatal_rx) -> e => e.ok(),
                recv(self.stop_rx) -> _ => {
                    info!("🛑 收到停止请求");
                    None
                }
                default(d) => None,
            },
            None => select! {
                recv(self.fatal_rx) -> e => e.ok(),
                recv(self.stop_rx) -> _ => {
                    info!("🛑 收到停止请求");
                    None
                }
            },
        };

        let shutdown = self.shutdown();
        let report = self.report();
        info!(
            "📊 运行 {:.1}s: 节拍 {} | 激光节拍 {} | 帧 {} (丢弃 {}) | 推理 {} (超时 {})",
            self.started.elapsed().as_secs_f64(),
            report.ticks,
            report.laser_on_ticks,
            report.frames_captured,
            report.frames_dropped,
            report.inferences,
            report.inference_timeouts
        );

        match fatal {
            Some(e) => Err(e),
            None => shutdown.map(|_| report),
        }
    }

    /// 关机序列, 可重复调用
    pub fn shutdown(&mut self) -> Result<(), TurretError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        info!("🛑 开始关机");

        // 1. 激光
        let latched = self.safety.shutdown();
        if let Err(e) = &latched {
            error!("❌ 激光锁存失败: {}", e);
        }

        // 2. 舵机指令; 激光已锁存, 可安全回中
        self.control_stop.take();
        if let Some(mut control) = join("control", self.control.take()).flatten() {
            if self.park_on_shutdown {
                match control.park() {
                    Ok(()) => info!("🅿️ 云台已回中"),
                    Err(e) => warn!("⚠️ 关机回中失败: {}", e),
                }
                let mut status = self.board.lock().unwrap_or_else(|e| e.into_inner());
                status.pan_deg = control.driver().angle(Axis::Pan);
                status.tilt_deg = control.driver().angle(Axis::Tilt);
            }
        }

        // 3. 推理 4. 采集 (推理线程退出时依次停止)
        self.inference_stop.store(true, Ordering::Relaxed);
        join("inference", self.inference.take());

        self.monitor_stop.take();
        join("safety-monitor", self.monitor.take());

        info!("✅ 关机完成");
        latched
    }

    pub fn report(&self) -> RunReport {
        self.counters.report()
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety.state()
    }

    pub fn override_switch(&self) -> OverrideSwitch {
        self.safety.override_switch()
    }

    pub fn status(&self) -> TurretStatus {
        self.status_handle().status()
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            board: Arc::clone(&self.board),
            safety: Arc::clone(&self.safety),
            counters: Arc::clone(&self.counters),
            started: self.started,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
            safety: Arc::clone(&self.safety),
        }
    }
}

fn join<T>(name: &str, handle: Option<JoinHandle<T>>) -> Option<T> {
    match handle?.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!("❌ {} 线程 panic", name);
            None
        }
    }
}

impl Drop for RunningTurret {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("❌ 关机失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPerson, SimRig};

    #[test]
    fn test_invalid_config_refuses_to_start() {
        let mut config = TurretConfig::default();
        config.camera.hfov_deg = -1.0;
        let rig = SimRig::new(&config, vec![]);
        let hardware = rig.hardware(rig.camera(), rig.engine());

        let err = Orchestrator::start(Arc::new(config), hardware).unwrap_err();
        assert!(matches!(err, TurretError::ConfigInvalid(_)));
        assert!(rig.laser.history().is_empty());
    }

    #[test]
    fn test_homing_fault_refuses_to_start() {
        let config = TurretConfig::default();
        let rig = SimRig::new(&config, vec![]);
        rig.servo.fail_next(1);
        let hardware = rig.hardware(rig.camera(), rig.engine());

        let err = Orchestrator::start(Arc::new(config), hardware).unwrap_err();
        assert!(matches!(err, TurretError::ActuatorFault { axis: Axis::Pan, .. }));
        assert!(!rig.laser.is_on());
    }

    #[test]
    fn test_empty_scene_never_fires() {
        let config = TurretConfig::default();
        let rig = SimRig::new(&config, vec![]);
        let hardware = rig.hardware(rig.camera(), rig.engine());

        let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();
        let report = turret.run_for(Some(Duration::from_millis(400))).unwrap();

        assert!(report.ticks > 0);
        assert_eq!(report.laser_on_ticks, 0);
        assert!(rig.laser.history().iter().all(|on| !on));
    }

    #[test]
    fn test_override_keeps_laser_off() {
        let config = TurretConfig::default();
        let rig = SimRig::new(&config, vec![SimPerson::standing(320.0, 240.0)]);
        rig.override_switch.engage();
        let hardware = rig.hardware(rig.camera(), rig.engine());

        let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();
        let report = turret.run_for(Some(Duration::from_millis(600))).unwrap();

        assert!(report.inferences > 0);
        assert_eq!(report.laser_on_ticks, 0);
    }

    #[test]
    fn test_stop_request_ends_open_ended_run() {
        let config = TurretConfig::default();
        let rig = SimRig::new(&config, vec![SimPerson::standing(420.0, 240.0)]);
        let hardware = rig.hardware(rig.camera(), rig.engine());

        let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();
        let stop = turret.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            stop.request_stop();
        });

        let report = turret.run_for(None).unwrap();
        stopper.join().unwrap();

        assert!(report.ticks > 0);
        assert!(rig.override_switch.is_engaged());
        assert_eq!(rig.laser.history().last(), Some(&false));
        assert!(!rig.laser.is_on());
    }

    /// 第 `after` 条指令之后 panic
    struct PanickingServo {
        inner: Box<dyn Servo>,
        after: usize,
    }

    impl Servo for PanickingServo {
        fn set_angle(
            &mut self,
            axis: Axis,
            degrees: f32,
        ) -> Result<(), crate::error::ActuatorError> {
            if self.after == 0 {
                panic!("舵机驱动崩溃");
            }
            self.after -= 1;
            self.inner.set_angle(axis, degrees)
        }

        fn reset(&mut self, axis: Axis) -> Result<(), crate::error::ActuatorError> {
            self.inner.reset(axis)
        }
    }

    #[test]
    fn test_stage_panic_is_fatal_and_laser_off() {
        let config = TurretConfig::default();
        let rig = SimRig::new(&config, vec![SimPerson::standing(420.0, 240.0)]);
        let mut hardware = rig.hardware(rig.camera(), rig.engine());
        // 回中两条, 再跟踪若干拍
        hardware.servo = Box::new(PanickingServo {
            inner: hardware.servo,
            after: 12,
        });

        let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();
        let err = turret.run_for(Some(Duration::from_secs(5))).unwrap_err();

        assert!(err.is_fatal());
        match err {
            TurretError::StagePanicked { stage, message } => {
                assert_eq!(stage, "control");
                assert!(message.contains("舵机驱动崩溃"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!rig.laser.is_on());
        assert_eq!(rig.laser.history().last(), Some(&false));
    }

    #[test]
    fn test_status_reports_tracking_and_serializes() {
        let config = TurretConfig::default();
        let rig = SimRig::new(&config, vec![SimPerson::standing(420.0, 240.0)]);
        let hardware = rig.hardware(rig.camera(), rig.engine());

        let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();
        let status = turret.status_handle();
        let idle = status.status();
        assert!(!idle.laser_on);
        assert!(!idle.shutdown);

        thread::sleep(Duration::from_millis(800));
        let busy = status.status();
        assert_eq!(busy.lock_state, LockState::Tracking);
        assert!(busy.target_id.is_some());
        assert!(busy.pan_deg > 0.0);
        assert!(busy.report.ticks > 0);

        let json = busy.to_json();
        assert!(json.contains("\"lock_state\":\"TRACKING\""));
        assert!(json.contains("\"pan_deg\""));

        turret.run_for(Some(Duration::ZERO)).unwrap();
        let done = status.status();
        assert!(done.shutdown);
        assert!(!done.laser_on);
        assert_eq!(done.pan_deg, 0.0);
    }
}
