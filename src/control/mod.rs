//! 控制阶段: 坐标映射 + 双轴 PID + 控制节拍
//! Control stage: coordinate mapping, per-axis PID and the fixed-rate tick

pub mod control_loop;
pub mod mapper;
pub mod pid;

pub use control_loop::{ControlLoop, ControlState, TickReport};
pub use mapper::CoordinateMapper;
pub use pid::PidController;
