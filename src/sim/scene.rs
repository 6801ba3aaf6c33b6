//! 仿真场景: 人体轨迹是帧号的纯函数, 摄像头装在仿真云台上
//!
//! 场景坐标为云台在 0°/0° 时的像素; 云台转动后按线性视场换算平移。

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::servo::SimServo;
use super::{SimEvent, SimEventLog};
use crate::actuator::Axis;
use crate::camera::{Camera, Frame};
use crate::config::CameraConfig;
use crate::detection::{BBox, InferenceEngine, RawDetection};
use crate::error::CameraError;

/// 已采集帧的检测记录上限
const CAPTURE_HISTORY: usize = 64;

/// 场景中的一个对象 (默认是人)
#[derive(Debug, Clone, PartialEq)]
pub struct SimPerson {
    pub start: (f32, f32),    // 第 0 帧中心
    pub velocity: (f32, f32), // 像素/帧
    pub size: (f32, f32),
    pub confidence: f32,
    pub label: String,
    pub appears_at: u64,
    occlusions: Vec<Range<u64>>,
}

impl SimPerson {
    pub fn standing(x: f32, y: f32) -> Self {
        Self {
            start: (x, y),
            velocity: (0.0, 0.0),
            size: (60.0, 160.0),
            confidence: 0.9,
            label: String::from("person"),
            appears_at: 0,
            occlusions: Vec::new(),
        }
    }

    pub fn walking(mut self, vx: f32, vy: f32) -> Self {
        self.velocity = (vx, vy);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_size(mut self, w: f32, h: f32) -> Self {
        self.size = (w, h);
        self
    }

    pub fn appearing_at(mut self, frame: u64) -> Self {
        self.appears_at = frame;
        self
    }

    /// 在这些帧内被遮挡
    pub fn occluded(mut self, frames: Range<u64>) -> Self {
        self.occlusions.push(frames);
        self
    }

    pub fn center_at(&self, frame_id: u64) -> (f32, f32) {
        let k = frame_id as f32;
        (
            self.start.0 + self.velocity.0 * k,
            self.start.1 + self.velocity.1 * k,
        )
    }

    pub fn visible_at(&self, frame_id: u64) -> bool {
        frame_id >= self.appears_at && !self.occlusions.iter().any(|r| r.contains(&frame_id))
    }
}

pub struct SimScene {
    width: u32,
    height: u32,
    px_per_deg: (f32, f32),
    people: Vec<SimPerson>,
    mount: Option<SimServo>,
    captured: Mutex<VecDeque<(u64, Vec<RawDetection>)>>,
}

impl SimScene {
    pub fn new(camera: &CameraConfig) -> Self {
        Self {
            width: camera.width,
            height: camera.height,
            px_per_deg: (
                camera.width as f32 / camera.hfov_deg,
                camera.height as f32 / camera.vfov_deg,
            ),
            people: Vec::new(),
            mount: None,
            captured: Mutex::new(VecDeque::with_capacity(CAPTURE_HISTORY)),
        }
    }

    pub fn with_person(mut self, person: SimPerson) -> Self {
        self.people.push(person);
        self
    }

    /// 摄像头随云台转动
    pub fn mounted_on(mut self, servo: SimServo) -> Self {
        self.mount = Some(servo);
        self
    }

    pub fn people(&self) -> &[SimPerson] {
        &self.people
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// 给定云台姿态 (pan, tilt) 下的检测
    pub fn detections_at(&self, frame_id: u64, pose: (f32, f32)) -> Vec<RawDetection> {
        // 云台右转 → 画面内容左移; 云台上仰 → 画面内容下移
        let shift = (-pose.0 * self.px_per_deg.0, pose.1 * self.px_per_deg.1);
        self.people
            .iter()
            .filter(|p| p.visible_at(frame_id))
            .filter_map(|p| {
                let (cx, cy) = p.center_at(frame_id);
                let (cx, cy) = (cx + shift.0, cy + shift.1);
                let bbox = BBox::from_center(cx, cy, p.size.0, p.size.1);
                let on_screen = bbox.x2 > 0.0
                    && bbox.y2 > 0.0
                    && bbox.x1 < self.width as f32
                    && bbox.y1 < self.height as f32;
                on_screen.then(|| RawDetection::new(bbox, p.confidence, &p.label))
            })
            .collect()
    }

    fn pose(&self) -> (f32, f32) {
        match &self.mount {
            Some(servo) => (servo.position(Axis::Pan), servo.position(Axis::Tilt)),
            None => (0.0, 0.0),
        }
    }

    /// 采集时刻记录该帧的检测
    pub fn capture(&self, frame_id: u64) {
        let detections = self.detections_at(frame_id, self.pose());
        let mut captured = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        if captured.len() >= CAPTURE_HISTORY {
            captured.pop_front();
        }
        captured.push_back((frame_id, detections));
    }

    /// 该帧采集时的检测; 未经仿真摄像头采集的帧按 0°/0° 计算
    pub fn detections_for(&self, frame_id: u64) -> Vec<RawDetection> {
        let captured = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        match captured.iter().rev().find(|(id, _)| *id == frame_id) {
            Some((_, dets)) => dets.clone(),
            None => {
                drop(captured);
                self.detections_at(frame_id, (0.0, 0.0))
            }
        }
    }
}

// ========== 仿真摄像头 ==========

pub struct SimCamera {
    scene: Arc<SimScene>,
    period: Duration,
    next_id: u64,
    next_due: Option<Instant>,
    disconnect_after: Option<u64>,
    events: Option<SimEventLog>,
}

impl SimCamera {
    pub fn new(scene: Arc<SimScene>, fps: f32) -> Self {
        Self {
            scene,
            period: Duration::from_secs_f32(1.0 / fps.max(1.0)),
            next_id: 0,
            next_due: None,
            disconnect_after: None,
            events: None,
        }
    }

    /// 每采集一帧记录一条事件
    pub fn with_events(mut self, events: SimEventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// 输出 `frames` 帧后断开
    pub fn disconnect_after(mut self, frames: u64) -> Self {
        self.disconnect_after = Some(frames);
        self
    }
}

impl Camera for SimCamera {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        if let Some(limit) = self.disconnect_after {
            if self.next_id >= limit {
                return Err(CameraError::Disconnected(format!(
                    "仿真摄像头在第 {} 帧后断开",
                    limit
                )));
            }
        }

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            thread::sleep(timeout);
            return Err(CameraError::Timeout);
        }
        thread::sleep(wait);
        self.next_due = Some(due.max(Instant::now()) + self.period);

        let id = self.next_id;
        self.next_id += 1;
        self.scene.capture(id);
        if let Some(events) = &self.events {
            events.push(SimEvent::Frame(id));
        }
        let (w, h) = self.scene.size();
        Ok(Frame::blank(id, w, h))
    }

    fn describe(&self) -> String {
        format!("sim camera {:.0}fps", 1.0 / self.period.as_secs_f32())
    }
}

// ========== 脚本化推理引擎 ==========

pub struct ScriptedEngine {
    scene: Arc<SimScene>,
    delay: Duration,
    stall_from: Option<u64>,
    stall: Duration,
}

impl ScriptedEngine {
    pub fn new(scene: Arc<SimScene>) -> Self {
        Self {
            scene,
            delay: Duration::ZERO,
            stall_from: None,
            stall: Duration::ZERO,
        }
    }

    /// 每次推理固定耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 从第 `frame` 帧起每次推理耗时 `per_call`
    pub fn stalling_from(mut self, frame: u64, per_call: Duration) -> Self {
        self.stall_from = Some(frame);
        self.stall = per_call;
        self
    }
}

impl InferenceEngine for ScriptedEngine {
    fn infer(&mut self, frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
        let stalled = self.stall_from.is_some_and(|n| frame.id >= n);
        let cost = if stalled { self.stall } else { self.delay };
        if !cost.is_zero() {
            thread::sleep(cost);
        }
        Ok(self.scene.detections_for(frame.id))
    }

    fn name(&self) -> String {
        String::from("scripted")
    }
}
