//! 确定性仿真 (无硬件运行与测试)
//!
//! - SimScene / SimCamera / ScriptedEngine: 场景、摄像头、推理
//! - SimServo: 一阶惯性云台
//! - SimLaser: 记录每次使能写入
//! - SimEventLog: 舵机与激光共用的事件时间线, 用于核对关机顺序

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::actuator::Axis;
use crate::config::TurretConfig;
use crate::error::LaserError;
use crate::pipeline::Hardware;
use crate::safety::{Laser, OverrideSwitch};

pub mod scene;
pub mod servo;

pub use scene::{ScriptedEngine, SimCamera, SimPerson, SimScene};
pub use servo::{FirstOrderPlant, SimServo};

/// 仿真云台默认时间常数 (秒)
pub const DEFAULT_SERVO_TAU: f32 = 0.08;

const MAX_EVENTS: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimEvent {
    Frame(u64),
    ServoCommand { axis: Axis, angle: f32 },
    ServoReset(Axis),
    Laser(bool),
    LaserPower(u8),
}

#[derive(Clone, Default)]
pub struct SimEventLog(Arc<Mutex<VecDeque<(Instant, SimEvent)>>>);

impl SimEventLog {
    pub fn push(&self, event: SimEvent) {
        let mut log = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if log.len() >= MAX_EVENTS {
            log.pop_front();
        }
        log.push_back((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.timeline().into_iter().map(|(_, e)| e).collect()
    }

    pub fn timeline(&self) -> Vec<(Instant, SimEvent)> {
        let log = self.0.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().copied().collect()
    }
}

// ========== 仿真激光 ==========

#[derive(Clone)]
pub struct SimLaser {
    events: SimEventLog,
    on: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
}

impl SimLaser {
    pub fn new(events: SimEventLog) -> Self {
        Self {
            events,
            on: Arc::new(AtomicBool::new(false)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// 之后的开启写入失败
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// 所有 set_enabled 调用
    pub fn history(&self) -> Vec<bool> {
        self.events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Laser(on) => Some(on),
                _ => None,
            })
            .collect()
    }
}

impl Laser for SimLaser {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), LaserError> {
        if enabled && self.fail.load(Ordering::SeqCst) {
            return Err(LaserError::Io(String::from("仿真写入失败")));
        }
        self.on.store(enabled, Ordering::SeqCst);
        self.events.push(SimEvent::Laser(enabled));
        Ok(())
    }

    fn set_power(&mut self, percent: u8) -> Result<(), LaserError> {
        self.events.push(SimEvent::LaserPower(percent));
        Ok(())
    }
}

// ========== 整机 ==========

/// 一整套仿真硬件及其检查句柄
pub struct SimRig {
    pub scene: Arc<SimScene>,
    pub servo: SimServo,
    pub laser: SimLaser,
    pub events: SimEventLog,
    pub override_switch: OverrideSwitch,
    fps: f32,
}

impl SimRig {
    pub fn new(config: &TurretConfig, people: Vec<SimPerson>) -> Self {
        let events = SimEventLog::default();
        let servo = SimServo::new(&config.actuator, DEFAULT_SERVO_TAU, events.clone());
        let scene = people
            .into_iter()
            .fold(SimScene::new(&config.camera), SimScene::with_person)
            .mounted_on(servo.clone());
        Self {
            scene: Arc::new(scene),
            servo,
            laser: SimLaser::new(events.clone()),
            events,
            override_switch: OverrideSwitch::new(),
            fps: config.camera.fps as f32,
        }
    }

    pub fn camera(&self) -> SimCamera {
        SimCamera::new(Arc::clone(&self.scene), self.fps).with_events(self.events.clone())
    }

    pub fn engine(&self) -> ScriptedEngine {
        ScriptedEngine::new(Arc::clone(&self.scene)).with_delay(Duration::from_millis(5))
    }

    pub fn hardware(&self, camera: SimCamera, engine: ScriptedEngine) -> Hardware {
        Hardware {
            camera: Box::new(camera),
            engine: Box::new(engine),
            servo: Box::new(self.servo.clone()),
            laser: Box::new(self.laser.clone()),
            override_switch: self.override_switch.clone(),
        }
    }
}
