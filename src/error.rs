//! 错误类型 (Error kinds)
//!
//! | 类型 | 处理策略 |
//! |---|---|
//! | SensorFailure | 致命: 执行关机序列 |
//! | InferenceTimeout | 可恢复: 跳过本周期检测, 跟踪器外推 |
//! | TargetLost | 可恢复: 状态机回到 SEARCHING, 激光自动关闭 |
//! | ActuatorFault | 先关激光, 尝试复位一次, 失败则致命 |
//! | ConfigInvalid | 致命: 拒绝启动 |

use std::time::Duration;

use thiserror::Error;

use crate::actuator::Axis;

/// 流水线级错误
#[derive(Debug, Error)]
pub enum TurretError {
    #[error("摄像头失效: {0}")]
    SensorFailure(String),

    #[error("推理超时 (预算 {budget:?})")]
    InferenceTimeout { budget: Duration },

    #[error("目标丢失 (连续 {frames} 帧无检测)")]
    TargetLost { frames: u32 },

    #[error("{axis:?} 舵机故障: {source}")]
    ActuatorFault {
        axis: Axis,
        #[source]
        source: ActuatorError,
    },

    #[error("配置无效: {0}")]
    ConfigInvalid(String),

    #[error("推理工作线程已退出")]
    InferenceWorkerLost,

    #[error("激光控制失败: {0}")]
    Laser(#[from] LaserError),

    #[error("线程启动失败: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{stage} 线程 panic: {message}")]
    StagePanicked { stage: &'static str, message: String },
}

impl TurretError {
    /// 是否需要执行关机序列
    pub fn is_fatal(&self) -> bool {
        match self {
            TurretError::InferenceTimeout { .. } | TurretError::TargetLost { .. } => false,
            // 控制环只在复位重试失败后才上抛舵机故障
            TurretError::ActuatorFault { .. }
            | TurretError::SensorFailure(_)
            | TurretError::ConfigInvalid(_)
            | TurretError::InferenceWorkerLost
            | TurretError::Laser(_)
            | TurretError::Spawn(_)
            | TurretError::StagePanicked { .. } => true,
        }
    }
}

/// 摄像头边界错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("等待帧超时")]
    Timeout,

    #[error("摄像头断开: {0}")]
    Disconnected(String),
}

/// 舵机边界错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActuatorError {
    #[error("舵机无应答: {0}")]
    NoAck(String),

    #[error("舵机上报故障: {0}")]
    Fault(String),

    #[error("角度 {angle:.2}° 超出机械范围 [{min:.1}, {max:.1}]")]
    OutOfRange { angle: f32, min: f32, max: f32 },
}

/// 激光边界错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaserError {
    #[error("激光使能写入失败: {0}")]
    Io(String),

    #[error("功率 {0}% 超出 0-100")]
    InvalidPower(u8),
}

/// 检测器错误 (除 WorkerLost 外都视为本周期"无更新")
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("推理超时 (预算 {0:?})")]
    Timeout(Duration),

    #[error("推理线程仍在处理上一帧")]
    Busy,

    #[error("推理引擎错误: {0}")]
    Engine(String),

    #[error("推理工作线程已退出")]
    WorkerLost,
}

impl DetectError {
    /// 仅工作线程退出需要升级为致命错误
    pub fn into_fatal(self) -> Option<TurretError> {
        match self {
            DetectError::WorkerLost => Some(TurretError::InferenceWorkerLost),
            _ => None,
        }
    }
}

/// 取出 panic 载荷中的消息文本
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("未知 panic")
    }
}
