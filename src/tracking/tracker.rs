//! 单目标锁定状态机 (TargetTracker)
//!
//! SEARCHING → ACQUIRED → TRACKING (含 LOST 子状态) → SEARCHING
//!
//! 关联策略: 以预测中心为圆心、关联半径内的最近检测胜出, 距离相同取高置信度。
//! 连续性优先于置信度, 避免激光在不同人之间跳变。

use std::time::Instant;

use tracing::{debug, info, warn};

use super::{LockState, Target, TargetSnapshot};
use crate::config::TrackingConfig;
use crate::detection::{BBox, Detection};
use crate::error::TurretError;

/// 带标签的状态, 目标只存在于 ACQUIRED / TRACKING 中
#[derive(Debug, Clone, PartialEq)]
pub enum TrackPhase {
    Searching,
    Acquired { target: Target, confirmations: u32 },
    Tracking { target: Target, frames_lost: u32 },
}

impl TrackPhase {
    pub fn lock_state(&self) -> LockState {
        match self {
            TrackPhase::Searching => LockState::Searching,
            TrackPhase::Acquired { .. } => LockState::Acquired,
            TrackPhase::Tracking { .. } => LockState::Tracking,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            TrackPhase::Searching => None,
            TrackPhase::Acquired { target, .. } | TrackPhase::Tracking { target, .. } => {
                Some(target)
            }
        }
    }
}

/// 每次 update 实际走过的转移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// SEARCHING 且无检测
    Idle,
    /// SEARCHING → ACQUIRED
    Acquire,
    /// ACQUIRED 再次确认, 尚未达到去抖帧数
    Debounce,
    /// ACQUIRED → TRACKING
    Confirm,
    /// ACQUIRED 无匹配 → SEARCHING
    Reject,
    /// TRACKING 正常关联
    Follow,
    /// TRACKING 无匹配, 外推
    Coast,
    /// LOST 子状态中重新关联
    Reassociate,
    /// 丢失超时 → SEARCHING
    Lose,
}

pub struct TargetTracker {
    phase: TrackPhase,
    config: TrackingConfig,
    frame_size: (u32, u32),
    next_id: u32,
    seq: u64,
}

impl TargetTracker {
    pub fn new(config: &TrackingConfig, frame_width: u32, frame_height: u32) -> Self {
        Self {
            phase: TrackPhase::Searching,
            config: config.clone(),
            frame_size: (frame_width, frame_height),
            next_id: 1,
            seq: 0,
        }
    }

    /// 帧尺寸变化时更新 (外推位置按帧裁剪)
    pub fn set_frame_size(&mut self, width: u32, height: u32) {
        self.frame_size = (width, height);
    }

    pub fn phase(&self) -> &TrackPhase {
        &self.phase
    }

    pub fn lock_state(&self) -> LockState {
        self.phase.lock_state()
    }

    pub fn target(&self) -> Option<&Target> {
        self.phase.target()
    }

    /// 连续无真实检测的帧数 (仅 TRACKING)
    pub fn frames_lost(&self) -> u32 {
        match self.phase {
            TrackPhase::Tracking { frames_lost, .. } => frames_lost,
            _ => 0,
        }
    }

    /// 用一帧的检测推进状态机
    pub fn update(&mut self, detections: &[Detection], timestamp: Instant) -> Transition {
        let phase = std::mem::replace(&mut self.phase, TrackPhase::Searching);
        let (next, transition) = match phase {
            TrackPhase::Searching => match select_initial(detections) {
                None => (TrackPhase::Searching, Transition::Idle),
                Some(det) => {
                    let target = self.create_target(det, timestamp);
                    info!(
                        "🎯 发现目标 #{} ({:.0},{:.0}) conf={:.2}",
                        target.id, target.centroid.0, target.centroid.1, target.confidence
                    );
                    self.after_confirmation(target, 1, Transition::Acquire)
                }
            },

            TrackPhase::Acquired {
                mut target,
                confirmations,
            } => match self.associate(&target, detections, timestamp) {
                Some(det) => {
                    self.correct(&mut target, det, timestamp);
                    self.after_confirmation(target, confirmations + 1, Transition::Debounce)
                }
                None => {
                    info!(
                        "❎ 候选目标 #{} 未确认 ({}/{}), 重新搜索",
                        target.id, confirmations, self.config.acquire_frames
                    );
                    (TrackPhase::Searching, Transition::Reject)
                }
            },

            TrackPhase::Tracking {
                mut target,
                frames_lost,
            } => match self.associate(&target, detections, timestamp) {
                Some(det) => {
                    self.correct(&mut target, det, timestamp);
                    let transition = if frames_lost > 0 {
                        info!("🔁 目标 #{} 重新关联 (丢失 {} 帧)", target.id, frames_lost);
                        Transition::Reassociate
                    } else {
                        Transition::Follow
                    };
                    (
                        TrackPhase::Tracking {
                            target,
                            frames_lost: 0,
                        },
                        transition,
                    )
                }
                None => {
                    let frames_lost = frames_lost + 1;
                    if frames_lost > self.config.loss_timeout_frames {
                        warn!(
                            "⚠️ 目标 #{}: {}",
                            target.id,
                            TurretError::TargetLost {
                                frames: frames_lost
                            }
                        );
                        (TrackPhase::Searching, Transition::Lose)
                    } else {
                        self.coast(&mut target, timestamp);
                        if frames_lost == 1 {
                            debug!("👻 目标 #{} 遮挡, 开始外推", target.id);
                        }
                        (
                            TrackPhase::Tracking {
                                target,
                                frames_lost,
                            },
                            Transition::Coast,
                        )
                    }
                }
            },
        };
        self.phase = next;
        transition
    }

    /// 推理超时的周期: 按无检测处理
    pub fn coast_without_detections(&mut self, timestamp: Instant) -> Transition {
        self.update(&[], timestamp)
    }

    /// 生成跨阶段快照
    pub fn snapshot(&mut self, heartbeat: Option<Instant>) -> TargetSnapshot {
        self.seq += 1;
        TargetSnapshot {
            seq: self.seq,
            lock_state: self.lock_state(),
            target: self.target().cloned(),
            frame_width: self.frame_size.0,
            frame_height: self.frame_size.1,
            heartbeat,
        }
    }

    // ========== 内部 ==========

    fn after_confirmation(
        &self,
        target: Target,
        confirmations: u32,
        pending: Transition,
    ) -> (TrackPhase, Transition) {
        if confirmations >= self.config.acquire_frames {
            info!("🔒 锁定目标 #{} ({} 帧确认)", target.id, confirmations);
            (
                TrackPhase::Tracking {
                    target,
                    frames_lost: 0,
                },
                Transition::Confirm,
            )
        } else {
            (
                TrackPhase::Acquired {
                    target,
                    confirmations,
                },
                pending,
            )
        }
    }

    fn create_target(&mut self, det: &Detection, timestamp: Instant) -> Target {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        Target {
            id,
            centroid: det.center(),
            bbox: det.bbox,
            velocity: (0.0, 0.0),
            confidence: det.confidence,
            last_seen: timestamp,
            updated_at: timestamp,
        }
    }

    /// 关联半径内离预测中心最近的检测, 距离相同取高置信度
    fn associate<'a>(
        &self,
        target: &Target,
        detections: &'a [Detection],
        timestamp: Instant,
    ) -> Option<&'a Detection> {
        let (px, py) = target.predict(timestamp);
        let radius = self.config.association_radius_px;

        detections
            .iter()
            .map(|d| {
                let (cx, cy) = d.center();
                (((cx - px).powi(2) + (cy - py).powi(2)).sqrt(), d)
            })
            .filter(|(dist, _)| *dist <= radius)
            .min_by(|(da, a), (db, b)| {
                da.total_cmp(db)
                    .then_with(|| b.confidence.total_cmp(&a.confidence))
            })
            .map(|(_, d)| d)
    }

    /// 指数平滑: 位置/尺寸用 α_pos, 速度用 α_vel (像素/秒)
    fn correct(&self, target: &mut Target, det: &Detection, timestamp: Instant) {
        let alpha = self.config.position_alpha;
        let beta = self.config.velocity_alpha;
        let dt = timestamp
            .saturating_duration_since(target.updated_at)
            .as_secs_f32();

        let (mx, my) = det.center();
        let (px, py) = target.predict(timestamp);
        let (ox, oy) = target.centroid;

        let cx = px + alpha * (mx - px);
        let cy = py + alpha * (my - py);
        let w = target.bbox.width() + alpha * (det.bbox.width() - target.bbox.width());
        let h = target.bbox.height() + alpha * (det.bbox.height() - target.bbox.height());

        if dt > 0.0 {
            let (vx, vy) = ((mx - ox) / dt, (my - oy) / dt);
            target.velocity.0 += beta * (vx - target.velocity.0);
            target.velocity.1 += beta * (vy - target.velocity.1);
        }

        target.centroid = (cx, cy);
        target.bbox = BBox::from_center(cx, cy, w, h);
        target.confidence = det.confidence;
        target.last_seen = timestamp;
        target.updated_at = timestamp;
    }

    /// 无观测: 位置按速度外推并裁剪到帧内
    fn coast(&self, target: &mut Target, timestamp: Instant) {
        let (px, py) = target.predict(timestamp);
        let cx = px.clamp(0.0, self.frame_size.0 as f32);
        let cy = py.clamp(0.0, self.frame_size.1 as f32);
        target.bbox = BBox::from_center(cx, cy, target.bbox.width(), target.bbox.height());
        target.centroid = (cx, cy);
        target.updated_at = timestamp;
    }
}

/// SEARCHING 选择: 最高置信度, 相同则取面积更大者
fn select_initial(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().max_by(|a, b| {
        a.confidence
            .total_cmp(&b.confidence)
            .then_with(|| a.bbox.area().total_cmp(&b.bbox.area()))
    })
}
