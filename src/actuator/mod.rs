/// 执行机构 (Actuator)
///
/// - Servo:         舵机能力接口 setAngle(pan|tilt, 度)
/// - ActuatorDriver: 增量积分 + 机械限位 + 每节拍限速
/// - PwmServo:      Linux sysfs PWM 舵机
use tracing::{info, warn};

use crate::config::{ActuatorConfig, AxisLimits};
use crate::error::ActuatorError;

pub mod pwm;

pub use pwm::PwmServo;

/// 云台轴
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Pan,
    Tilt,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Pan, Axis::Tilt];

    pub fn index(self) -> usize {
        match self {
            Axis::Pan => 0,
            Axis::Tilt => 1,
        }
    }
}

/// 舵机能力接口, 只接受机械范围内的角度
pub trait Servo: Send {
    fn set_angle(&mut self, axis: Axis, degrees: f32) -> Result<(), ActuatorError>;

    /// 重新初始化该轴 (故障后复位)
    fn reset(&mut self, axis: Axis) -> Result<(), ActuatorError>;
}

impl<S: Servo + ?Sized> Servo for Box<S> {
    fn set_angle(&mut self, axis: Axis, degrees: f32) -> Result<(), ActuatorError> {
        (**self).set_angle(axis, degrees)
    }

    fn reset(&mut self, axis: Axis) -> Result<(), ActuatorError> {
        (**self).reset(axis)
    }
}

/// 实际下发的指令
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedCommand {
    /// 限位和限速之后实际下发的角度
    pub angle: f32,
    /// 上一角度 + delta
    pub requested: f32,
    /// 是否被限位或限速截断
    pub saturated: bool,
}

const SATURATION_EPS: f32 = 1e-4;

pub struct ActuatorDriver {
    servo: Box<dyn Servo>,
    limits: [AxisLimits; 2],
    home: [f32; 2],
    max_slew: f32,
    angles: [f32; 2],
}

impl ActuatorDriver {
    pub fn new(servo: Box<dyn Servo>, config: &ActuatorConfig) -> Self {
        let home = [config.home_pan, config.home_tilt];
        Self {
            servo,
            limits: [config.pan_limits, config.tilt_limits],
            home,
            max_slew: config.max_slew_deg_per_tick,
            angles: home,
        }
    }

    /// 回中: 启动时和关机停车时调用, 不受限速约束
    pub fn home(&mut self) -> Result<(), (Axis, ActuatorError)> {
        for axis in Axis::ALL {
            let angle = self.limits(axis).clamp(self.home[axis.index()]);
            self.servo.set_angle(axis, angle).map_err(|e| (axis, e))?;
            self.angles[axis.index()] = angle;
        }
        info!(
            "🎯 云台回中: pan={:.1}° tilt={:.1}°",
            self.angles[0], self.angles[1]
        );
        Ok(())
    }

    /// 在上一指令角度上叠加 delta, 先限位再限速, 返回实际下发的角度
    pub fn apply(&mut self, axis: Axis, delta: f32) -> Result<AppliedCommand, ActuatorError> {
        let delta = if delta.is_finite() {
            delta
        } else {
            warn!("⚠️ {:?} 指令增量非法 ({}), 按 0 处理", axis, delta);
            0.0
        };

        let current = self.angle(axis);
        let requested = current + delta;
        let limited = self.limits(axis).clamp(requested);
        let angle = limited.clamp(current - self.max_slew, current + self.max_slew);

        self.servo.set_angle(axis, angle)?;
        self.angles[axis.index()] = angle;

        Ok(AppliedCommand {
            angle,
            requested,
            saturated: (angle - requested).abs() > SATURATION_EPS,
        })
    }

    /// 复位舵机并重发上一角度
    pub fn reset(&mut self, axis: Axis) -> Result<(), ActuatorError> {
        warn!("🔧 {:?} 舵机复位", axis);
        self.servo.reset(axis)?;
        self.servo.set_angle(axis, self.angle(axis))
    }

    /// 上一次成功下发的角度
    pub fn angle(&self, axis: Axis) -> f32 {
        self.angles[axis.index()]
    }

    pub fn limits(&self, axis: Axis) -> AxisLimits {
        self.limits[axis.index()]
    }
}
