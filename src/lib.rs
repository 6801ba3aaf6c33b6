// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod actuator; // 舵机与限位限速
pub mod camera; // 视频输入系统
pub mod config; // 系统配置
pub mod control; // 坐标映射 + PID + 控制节拍
pub mod detection; // 人体检测
pub mod error; // 错误类型
pub mod pipeline; // 线程编排
pub mod safety; // 激光安全联锁
pub mod sim; // 确定性仿真
pub mod tracking; // 单目标锁定状态机

pub use crate::actuator::{ActuatorDriver, AppliedCommand, Axis, Servo};
pub use crate::camera::{Camera, Frame, FrameSource};
pub use crate::config::TurretConfig;
pub use crate::control::{ControlLoop, CoordinateMapper, PidController};
pub use crate::detection::{Detection, Detector, InferenceEngine, RawDetection};
pub use crate::error::{ActuatorError, CameraError, DetectError, LaserError, TurretError};
pub use crate::pipeline::{Hardware, Orchestrator, RunReport, RunningTurret, StopHandle, TurretStatus};
pub use crate::safety::{Laser, OverrideSwitch, SafetyInterlock};
pub use crate::tracking::{LockState, Target, TargetSnapshot, TargetTracker};
