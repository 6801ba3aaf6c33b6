//! 单目标跟踪公共组件
//! Common components for single-target tracking

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::detection::BBox;

pub mod tracker;

pub use tracker::{TargetTracker, TrackPhase, Transition};

// ========== 锁定状态 ==========

/// 锁定状态 (LOST 是 TRACKING 的子状态, 见 `TrackPhase::Tracking::frames_lost`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Searching,
    Acquired,
    Tracking,
}

// ========== 目标 ==========

/// 当前唯一目标
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// 身份号, 每次从 SEARCHING 创建递增
    pub id: u32,

    /// 平滑后的中心点 (像素)
    pub centroid: (f32, f32),

    /// 平滑后的边界框
    pub bbox: BBox,

    /// 中心点速度 (像素/秒)
    pub velocity: (f32, f32),

    /// 最近一次关联检测的置信度
    pub confidence: f32,

    /// 最近一次真实检测的帧时间
    pub last_seen: Instant,

    /// 状态最近一次推进的帧时间 (含外推)
    pub updated_at: Instant,
}

impl Target {
    /// 按速度外推到 `at` 时刻 (不早于 updated_at)
    pub fn predict(&self, at: Instant) -> (f32, f32) {
        let dt = at.saturating_duration_since(self.updated_at).as_secs_f32();
        (
            self.centroid.0 + self.velocity.0 * dt,
            self.centroid.1 + self.velocity.1 * dt,
        )
    }
}

// ========== 跨阶段快照 ==========

/// 推理阶段 → 控制阶段 的只读快照
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    /// 单调递增序号
    pub seq: u64,
    pub lock_state: LockState,
    pub target: Option<Target>,
    pub frame_width: u32,
    pub frame_height: u32,
    /// 最近一次成功推理的时间, 从未成功为 None
    pub heartbeat: Option<Instant>,
}

impl TargetSnapshot {
    /// 初始快照: SEARCHING, 无心跳
    pub fn searching(frame_width: u32, frame_height: u32) -> Self {
        Self {
            seq: 0,
            lock_state: LockState::Searching,
            target: None,
            frame_width,
            frame_height,
            heartbeat: None,
        }
    }

    /// 控制阶段使用的瞄准点: 按快照年龄外推, 超前量上限 `max_lead`, 限制在帧内
    pub fn aim_point(&self, now: Instant, max_lead: Duration) -> Option<(f32, f32)> {
        let target = self.target.as_ref()?;
        let age = now.saturating_duration_since(target.updated_at).min(max_lead);
        let (x, y) = target.predict(target.updated_at + age);
        Some((
            x.clamp(0.0, self.frame_width as f32),
            y.clamp(0.0, self.frame_height as f32),
        ))
    }
}
