//! 仿真舵机: 一阶惯性环节 + 机械范围检查 + 故障注入

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::{SimEvent, SimEventLog};
use crate::actuator::{Axis, Servo};
use crate::config::{ActuatorConfig, AxisLimits};
use crate::error::ActuatorError;

/// 一阶惯性: p += (cmd - p)·(1 - e^(-dt/τ))
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FirstOrderPlant {
    tau: f32,
    position: f32,
    command: f32,
}

impl FirstOrderPlant {
    pub fn new(tau: f32, position: f32) -> Self {
        Self {
            tau,
            position,
            command: position,
        }
    }

    pub fn command(&mut self, angle: f32) {
        self.command = angle;
    }

    pub fn advance(&mut self, dt: f32) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }
        if self.tau <= 0.0 {
            self.position = self.command;
        } else {
            self.position += (self.command - self.position) * (1.0 - (-dt / self.tau).exp());
        }
    }

    pub fn position(&self) -> f32 {
        self.position
    }

    pub fn commanded(&self) -> f32 {
        self.command
    }
}

struct ServoState {
    plants: [FirstOrderPlant; 2],
    limits: [AxisLimits; 2],
    updated: Instant,
    fail_next: u32,
    reset_fails: bool,
}

impl ServoState {
    fn advance_to(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.updated).as_secs_f32();
        for plant in &mut self.plants {
            plant.advance(dt);
        }
        self.updated = now;
    }
}

/// 可克隆句柄, 克隆之间共享同一台仿真云台
#[derive(Clone)]
pub struct SimServo {
    state: Arc<Mutex<ServoState>>,
    events: SimEventLog,
}

impl SimServo {
    pub fn new(config: &ActuatorConfig, tau: f32, events: SimEventLog) -> Self {
        let state = ServoState {
            plants: [
                FirstOrderPlant::new(tau, config.home_pan),
                FirstOrderPlant::new(tau, config.home_tilt),
            ],
            limits: [config.pan_limits, config.tilt_limits],
            updated: Instant::now(),
            fail_next: 0,
            reset_fails: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前实际位置 (按真实时间推进惯性环节)
    pub fn position(&self, axis: Axis) -> f32 {
        let mut state = self.lock();
        state.advance_to(Instant::now());
        state.plants[axis.index()].position()
    }

    pub fn commanded(&self, axis: Axis) -> f32 {
        self.lock().plants[axis.index()].commanded()
    }

    /// 之后的 `n` 条指令上报故障
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// 复位是否失败
    pub fn set_reset_fails(&self, fails: bool) {
        self.lock().reset_fails = fails;
    }
}

impl Servo for SimServo {
    fn set_angle(&mut self, axis: Axis, degrees: f32) -> Result<(), ActuatorError> {
        let mut state = self.lock();
        let limits = state.limits[axis.index()];
        if !degrees.is_finite() || !limits.contains(degrees) {
            return Err(ActuatorError::OutOfRange {
                angle: degrees,
                min: limits.min,
                max: limits.max,
            });
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ActuatorError::Fault(format!("{:?} 仿真过流", axis)));
        }

        state.advance_to(Instant::now());
        state.plants[axis.index()].command(degrees);
        drop(state);

        self.events.push(SimEvent::ServoCommand {
            axis,
            angle: degrees,
        });
        Ok(())
    }

    fn reset(&mut self, axis: Axis) -> Result<(), ActuatorError> {
        let fails = self.lock().reset_fails;
        self.events.push(SimEvent::ServoReset(axis));
        if fails {
            Err(ActuatorError::NoAck(format!("{:?} 复位无应答", axis)))
        } else {
            Ok(())
        }
    }
}
