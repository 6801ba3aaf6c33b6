//! 控制节拍 (ControlLoop)
//!
//! 每节拍: 读取最新快照 → 外推瞄准点 → 角度误差 → PID → 舵机 → 安全联锁。
//! 从不等待推理; 快照可能已落后数个推理周期, 由外推弥补。
//! 时间由调用方注入, 便于在测试中按虚拟时钟推进。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use super::mapper::CoordinateMapper;
use super::pid::PidController;
use crate::actuator::{ActuatorDriver, AppliedCommand, Axis};
use crate::config::TurretConfig;
use crate::error::TurretError;
use crate::safety::SafetyInterlock;
use crate::tracking::{LockState, TargetSnapshot};

/// 控制阶段私有状态 (不跨线程共享)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlState {
    pub pan_command: f32,
    pub tilt_command: f32,
    pub pan_integral: f32,
    pub tilt_integral: f32,
    pub pan_prev_error: Option<f32>,
    pub tilt_prev_error: Option<f32>,
    pub last_tick: Option<Instant>,
}

/// 单节拍结果
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub lock_state: LockState,
    pub laser_on: bool,
    /// (pan, tilt) 角度误差; SEARCHING 时为 0
    pub error: (f32, f32),
    pub pan: Option<AppliedCommand>,
    pub tilt: Option<AppliedCommand>,
    /// 本节拍是否收到新快照
    pub fresh: bool,
    pub watchdog_refreshed: bool,
    /// 本节拍复位成功的舵机故障数
    pub recovered_faults: u32,
}

pub struct ControlLoop {
    mapper: CoordinateMapper,
    pan_pid: PidController,
    tilt_pid: PidController,
    driver: ActuatorDriver,
    safety: Arc<SafetyInterlock>,
    max_lead: Duration,

    snapshot: TargetSnapshot,
    last_tick: Option<Instant>,
    last_heartbeat: Option<Instant>,
    stopped: bool,
}

impl ControlLoop {
    pub fn new(config: &TurretConfig, driver: ActuatorDriver, safety: Arc<SafetyInterlock>) -> Self {
        let control = &config.control;
        Self {
            mapper: CoordinateMapper::new(&config.camera),
            pan_pid: PidController::new(
                control.pan,
                control.integral_clamp,
                control.derivative_tau_s,
            ),
            tilt_pid: PidController::new(
                control.tilt,
                control.integral_clamp,
                control.derivative_tau_s,
            ),
            driver,
            safety,
            max_lead: Duration::from_secs_f32(control.max_lead_s.max(0.0)),
            snapshot: TargetSnapshot::searching(config.camera.width, config.camera.height),
            last_tick: None,
            last_heartbeat: None,
            stopped: false,
        }
    }

    /// 执行一个控制节拍
    pub fn tick(
        &mut self,
        now: Instant,
        fresh: Option<TargetSnapshot>,
    ) -> Result<TickReport, TurretError> {
        let got_fresh = match fresh {
            Some(s) if s.seq > self.snapshot.seq => {
                self.snapshot = s;
                true
            }
            _ => false,
        };

        let dt = self
            .last_tick
            .map(|t| now.saturating_duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        let lock_state = self.snapshot.lock_state;
        let mut report = TickReport {
            lock_state,
            laser_on: false,
            error: (0.0, 0.0),
            pan: None,
            tilt: None,
            fresh: got_fresh,
            watchdog_refreshed: false,
            recovered_faults: 0,
        };

        let mut faulted = false;
        match (lock_state, self.snapshot.aim_point(now, self.max_lead)) {
            (LockState::Acquired | LockState::Tracking, Some(aim)) if !self.stopped => {
                let (pan_err, tilt_err) = self.mapper.map_to_angles(
                    aim,
                    self.snapshot.frame_width,
                    self.snapshot.frame_height,
                );
                report.error = (pan_err, tilt_err);

                for (axis, err) in [(Axis::Pan, pan_err), (Axis::Tilt, tilt_err)] {
                    let pid = match axis {
                        Axis::Pan => &mut self.pan_pid,
                        Axis::Tilt => &mut self.tilt_pid,
                    };
                    let delta = pid.step(err, dt);
                    let (cmd, recovered) = self.apply_with_recovery(axis, delta)?;
                    if cmd.saturated {
                        match axis {
                            Axis::Pan => self.pan_pid.unwind(),
                            Axis::Tilt => self.tilt_pid.unwind(),
                        }
                    }
                    if recovered {
                        faulted = true;
                        report.recovered_faults += 1;
                    }
                    match axis {
                        Axis::Pan => report.pan = Some(cmd),
                        Axis::Tilt => report.tilt = Some(cmd),
                    }
                }
            }
            _ => {
                // SEARCHING: 保持当前位置, 新目标不继承积分
                self.pan_pid.reset();
                self.tilt_pid.reset();
            }
        }

        if faulted {
            // 本节拍已强制关闭激光, 不刷新看门狗
            report.laser_on = self.safety.laser_enabled();
            return Ok(report);
        }

        if self.snapshot.heartbeat.is_some() && self.snapshot.heartbeat > self.last_heartbeat {
            self.safety.refresh_watchdog(now);
            self.last_heartbeat = self.snapshot.heartbeat;
            report.watchdog_refreshed = true;
        }

        report.laser_on = self.safety.evaluate(lock_state, now)?;
        Ok(report)
    }

    /// 故障: 先关激光, 复位一次并重试; 仍失败则升级为致命
    fn apply_with_recovery(
        &mut self,
        axis: Axis,
        delta: f32,
    ) -> Result<(AppliedCommand, bool), TurretError> {
        let first = match self.driver.apply(axis, delta) {
            Ok(cmd) => return Ok((cmd, false)),
            Err(e) => e,
        };

        warn!("⚠️ {:?} 舵机故障: {}, 关闭激光并复位", axis, first);
        self.safety.force_off()?;

        let retry = self
            .driver
            .reset(axis)
            .and_then(|_| self.driver.apply(axis, delta));
        match retry {
            Ok(cmd) => {
                warn!("🔧 {:?} 舵机复位成功", axis);
                Ok((cmd, true))
            }
            Err(source) => {
                error!("❌ {:?} 舵机复位失败: {}", axis, source);
                Err(TurretError::ActuatorFault { axis, source })
            }
        }
    }

    /// 关机序列第 2 步: 停止下发舵机指令
    pub fn stop_commands(&mut self) {
        self.stopped = true;
    }

    /// 关机停车: 激光锁存之后回中, 此后不再跟踪
    pub fn park(&mut self) -> Result<(), TurretError> {
        self.stopped = true;
        self.pan_pid.reset();
        self.tilt_pid.reset();
        self.driver
            .home()
            .map_err(|(axis, source)| TurretError::ActuatorFault { axis, source })
    }

    pub fn state(&self) -> ControlState {
        ControlState {
            pan_command: self.driver.angle(Axis::Pan),
            tilt_command: self.driver.angle(Axis::Tilt),
            pan_integral: self.pan_pid.integral(),
            tilt_integral: self.tilt_pid.integral(),
            pan_prev_error: self.pan_pid.prev_error(),
            tilt_prev_error: self.tilt_pid.prev_error(),
            last_tick: self.last_tick,
        }
    }

    pub fn snapshot(&self) -> &TargetSnapshot {
        &self.snapshot
    }

    pub fn driver(&self) -> &ActuatorDriver {
        &self.driver
    }
}
