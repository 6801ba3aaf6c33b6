/// 实时流水线 (Realtime pipeline)
///
/// 三个阶段各自推进, 阶段之间只用单槽交接 (新数据覆盖未消费的旧数据):
/// - Capture:   摄像头 → LatestSlot<Frame>
/// - Inference: Detector + TargetTracker → LatestSlot<TargetSnapshot>
/// - Control:   固定频率节拍 → PID → 舵机 → 安全联锁
pub mod orchestrator;
pub mod slot;

pub use orchestrator::{
    Hardware, Orchestrator, RunReport, RunningTurret, StatusHandle, StopHandle, TurretStatus,
};
pub use slot::{LatestSlot, SlotRecv};
