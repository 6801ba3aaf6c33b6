/// 安全联锁 (Safety interlock)
///
/// 激光使能的唯一出口。激光亮 当且仅当:
///   锁定状态 == TRACKING ∧ 看门狗未超时 ∧ 未按下手动急停 ∧ 未进入关机
///   ∧ 不在连续开启超限后的冷却期内
///
/// 控制线程每节拍调用 `evaluate`; 独立巡检线程调用 `check_watchdog`,
/// 控制线程卡死时同样能关掉激光。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{error, info, warn};

use crate::config::SafetyConfig;
use crate::error::{LaserError, TurretError};
use crate::tracking::LockState;

#[cfg(target_os = "linux")]
pub mod gpio;

#[cfg(target_os = "linux")]
pub use gpio::{GpioLaser, GpioOverride};

/// 激光能力接口
pub trait Laser: Send {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), LaserError>;

    /// 功率 0-100, 不支持调功率的激光忽略
    fn set_power(&mut self, _percent: u8) -> Result<(), LaserError> {
        Ok(())
    }
}

impl<L: Laser + ?Sized> Laser for Box<L> {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), LaserError> {
        (**self).set_enabled(enabled)
    }

    fn set_power(&mut self, percent: u8) -> Result<(), LaserError> {
        (**self).set_power(percent)
    }
}

/// 手动/物理急停开关句柄 (可克隆, 任意线程可操作)
#[derive(Clone, Default, Debug)]
pub struct OverrideSwitch(Arc<AtomicBool>);

impl OverrideSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ========== 急停输入 ==========

/// 急停输入 (物理按钮等)
pub trait OverrideInput: Send {
    /// 当前是否按下
    fn is_pressed(&mut self) -> std::io::Result<bool>;
}

/// 按固定周期轮询急停输入, 电平变化时同步到 `OverrideSwitch`
///
/// 读取失败按"按下"处理。首次读到未按下时不释放开关,
/// 其他来源 (如退出信号) 已按下的急停保持有效。
pub struct OverrideWatcher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl OverrideWatcher {
    pub fn spawn<I: OverrideInput + 'static>(
        mut input: I,
        switch: OverrideSwitch,
        period: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("override-input".into())
            .spawn(move || {
                let ticker = tick(period);
                let mut last: Option<bool> = None;
                info!("🔘 急停输入轮询启动: 周期 {:?}", period);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let pressed = input.is_pressed().unwrap_or_else(|e| {
                                error!("❌ 急停输入读取失败: {}, 按按下处理", e);
                                true
                            });
                            if last == Some(pressed) {
                                continue;
                            }
                            if pressed {
                                warn!("🛑 急停按下");
                                switch.engage();
                            } else if last.is_some() {
                                info!("✅ 急停释放");
                                switch.release();
                            }
                            last = Some(pressed);
                        }
                    }
                }
                info!("🔘 急停输入轮询停止");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("❌ 急停输入线程 panic");
            }
        }
    }
}

impl Drop for OverrideWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 看门狗: 截止时间之前必须被健康的流水线节拍刷新。初始即为超时状态。
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    period: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |d| now >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// 安全状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyState {
    pub laser_enabled: bool,
    pub override_active: bool,
    pub watchdog_deadline: Option<Instant>,
    pub shutdown: bool,
    /// 本次连续开启的起点
    pub laser_on_since: Option<Instant>,
    /// 连续开启超限后的冷却截止
    pub cooldown_until: Option<Instant>,
}

struct Inner {
    laser: Box<dyn Laser>,
    watchdog: Watchdog,
    laser_enabled: bool,
    shutdown: bool,
    power: u8,
    max_on: Duration,
    cooldown: Duration,
    on_since: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl Inner {
    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|t| now < t)
    }

    /// 连续开启超限则进入冷却, 返回是否超限
    fn trip_max_on(&mut self, now: Instant) -> bool {
        let exceeded = self
            .on_since
            .is_some_and(|t| now.saturating_duration_since(t) >= self.max_on);
        if exceeded {
            warn!(
                "⏲️ 激光连续开启达到 {:?}, 冷却 {:?}",
                self.max_on, self.cooldown
            );
            self.cooldown_until = Some(now + self.cooldown);
        }
        exceeded
    }

    fn write(&mut self, enabled: bool) -> Result<(), TurretError> {
        let result = if enabled {
            let power = self.power;
            self.laser
                .set_power(power)
                .and_then(|_| self.laser.set_enabled(true))
        } else {
            self.laser.set_enabled(false)
        };

        match result {
            Ok(()) => {
                self.laser_enabled = enabled;
                if !enabled {
                    self.on_since = None;
                }
                Ok(())
            }
            Err(e) => {
                // 状态未知: 尽力关闭并按关闭记账
                error!("❌ 激光写入失败: {}", e);
                let _ = self.laser.set_enabled(false);
                self.laser_enabled = false;
                self.on_since = None;
                Err(TurretError::Laser(e))
            }
        }
    }
}

pub struct SafetyInterlock {
    inner: Mutex<Inner>,
    override_switch: OverrideSwitch,
}

impl SafetyInterlock {
    pub fn new(
        laser: Box<dyn Laser>,
        config: &SafetyConfig,
        override_switch: OverrideSwitch,
    ) -> Result<Self, TurretError> {
        if config.laser_power > 100 {
            return Err(TurretError::Laser(LaserError::InvalidPower(
                config.laser_power,
            )));
        }
        let mut inner = Inner {
            laser,
            watchdog: Watchdog::new(config.watchdog_period()),
            laser_enabled: false,
            shutdown: false,
            power: config.laser_power,
            max_on: config.max_on(),
            cooldown: config.cooldown(),
            on_since: None,
            cooldown_until: None,
        };
        // 上电即确保激光关闭
        inner.write(false)?;
        info!(
            "🛡️ 安全联锁就绪: 看门狗 {:?}, 功率 {}%, 连续开启上限 {:?}",
            config.watchdog_period(),
            config.laser_power,
            config.max_on()
        );

        Ok(Self {
            inner: Mutex::new(inner),
            override_switch,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 每个控制节拍调用一次, 返回激光最终状态
    pub fn evaluate(&self, lock_state: LockState, now: Instant) -> Result<bool, TurretError> {
        let override_active = self.override_switch.is_engaged();
        let mut inner = self.lock();

        let reason = if inner.shutdown {
            Some("关机")
        } else if override_active {
            Some("手动急停")
        } else if inner.watchdog.expired(now) {
            Some("看门狗超时")
        } else if lock_state != LockState::Tracking {
            Some("未锁定")
        } else if inner.cooling_down(now) {
            Some("冷却中")
        } else if inner.trip_max_on(now) {
            Some("连续开启超时")
        } else {
            None
        };
        let desired = reason.is_none();

        if desired != inner.laser_enabled {
            inner.write(desired)?;
            if desired {
                inner.on_since = Some(now);
                info!("🔴 激光开启");
            } else {
                info!("⚫ 激光关闭 ({})", reason.unwrap_or_default());
            }
        }
        Ok(inner.laser_enabled)
    }

    /// 健康节拍后刷新看门狗
    pub fn refresh_watchdog(&self, now: Instant) {
        self.lock().watchdog.refresh(now);
    }

    /// 独立巡检: 看门狗超时、连续开启超限、急停或关机时强制关激光。
    /// 返回本次是否执行了关闭。
    pub fn check_watchdog(&self, now: Instant) -> Result<bool, TurretError> {
        let override_active = self.override_switch.is_engaged();
        let mut inner = self.lock();
        if !inner.laser_enabled {
            return Ok(false);
        }

        let reason = if inner.shutdown {
            "关机"
        } else if override_active {
            "手动急停"
        } else if inner.watchdog.expired(now) {
            "看门狗超时"
        } else if inner.trip_max_on(now) {
            "连续开启超时"
        } else {
            return Ok(false);
        };

        warn!("🐕 巡检强制关闭激光 ({})", reason);
        inner.write(false)?;
        Ok(true)
    }

    /// 故障时立即关激光 (无条件写入)
    pub fn force_off(&self) -> Result<(), TurretError> {
        let mut inner = self.lock();
        let was_on = inner.laser_enabled;
        inner.write(false)?;
        if was_on {
            warn!("⚫ 激光强制关闭");
        }
        Ok(())
    }

    /// 关机锁存: 此后激光永不再开
    pub fn shutdown(&self) -> Result<(), TurretError> {
        let mut inner = self.lock();
        inner.shutdown = true;
        inner.write(false)?;
        info!("🛑 安全联锁锁存, 激光关闭");
        Ok(())
    }

    pub fn state(&self) -> SafetyState {
        let inner = self.lock();
        SafetyState {
            laser_enabled: inner.laser_enabled,
            override_active: self.override_switch.is_engaged(),
            watchdog_deadline: inner.watchdog.deadline(),
            shutdown: inner.shutdown,
            laser_on_since: inner.on_since,
            cooldown_until: inner.cooldown_until,
        }
    }

    pub fn laser_enabled(&self) -> bool {
        self.lock().laser_enabled
    }

    pub fn override_switch(&self) -> OverrideSwitch {
        self.override_switch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct RecordingLaser {
        calls: Arc<Mutex<Vec<bool>>>,
        power: Arc<Mutex<Option<u8>>>,
        fail: Arc<AtomicBool>,
    }

    impl Laser for RecordingLaser {
        fn set_enabled(&mut self, enabled: bool) -> Result<(), LaserError> {
            if enabled && self.fail.load(Ordering::SeqCst) {
                return Err(LaserError::Io("gpio write".into()));
            }
            self.calls.lock().unwrap().push(enabled);
            Ok(())
        }

        fn set_power(&mut self, percent: u8) -> Result<(), LaserError> {
            *self.power.lock().unwrap() = Some(percent);
            Ok(())
        }
    }

    fn interlock() -> (SafetyInterlock, RecordingLaser, OverrideSwitch) {
        let laser = RecordingLaser::default();
        let switch = OverrideSwitch::new();
        let config = SafetyConfig {
            laser_power: 60,
            ..SafetyConfig::default()
        };
        let interlock =
            SafetyInterlock::new(Box::new(laser.clone()), &config, switch.clone()).unwrap();
        (interlock, laser, switch)
    }

    #[test]
    fn test_starts_off_with_expired_watchdog() {
        let (interlock, laser, _) = interlock();
        assert_eq!(*laser.calls.lock().unwrap(), vec![false]);
        assert!(!interlock
            .evaluate(LockState::Tracking, Instant::now())
            .unwrap());
    }

    #[test]
    fn test_truth_table() {
        let (interlock, _, switch) = interlock();
        let t0 = Instant::now();
        interlock.refresh_watchdog(t0);

        assert!(interlock.evaluate(LockState::Tracking, t0).unwrap());
        assert!(!interlock.evaluate(LockState::Acquired, t0).unwrap());
        assert!(!interlock.evaluate(LockState::Searching, t0).unwrap());

        switch.engage();
        assert!(!interlock.evaluate(LockState::Tracking, t0).unwrap());
        switch.release();
        assert!(interlock.evaluate(LockState::Tracking, t0).unwrap());

        let late = t0 + Duration::from_millis(1000);
        assert!(!interlock.evaluate(LockState::Tracking, late).unwrap());
    }

    #[test]
    fn test_writes_only_on_change_and_sets_power() {
        let (interlock, laser, _) = interlock();
        let t0 = Instant::now();
        interlock.refresh_watchdog(t0);
        for _ in 0..5 {
            interlock.evaluate(LockState::Tracking, t0).unwrap();
        }
        assert_eq!(*laser.calls.lock().unwrap(), vec![false, true]);
        assert_eq!(*laser.power.lock().unwrap(), Some(60));
    }

    #[test]
    fn test_monitor_cuts_laser_when_control_stalls() {
        let (interlock, laser, _) = interlock();
        let t0 = Instant::now();
        interlock.refresh_watchdog(t0);
        interlock.evaluate(LockState::Tracking, t0).unwrap();

        assert!(!interlock
            .check_watchdog(t0 + Duration::from_millis(500))
            .unwrap());
        assert!(interlock
            .check_watchdog(t0 + Duration::from_millis(1001))
            .unwrap());
        assert!(!interlock.laser_enabled());
        assert_eq!(laser.calls.lock().unwrap().last(), Some(&false));
    }

    #[test]
    fn test_shutdown_latches() {
        let (interlock, _, _) = interlock();
        let t0 = Instant::now();
        interlock.refresh_watchdog(t0);
        interlock.evaluate(LockState::Tracking, t0).unwrap();

        interlock.shutdown().unwrap();
        interlock.refresh_watchdog(t0);
        assert!(!interlock.evaluate(LockState::Tracking, t0).unwrap());
        assert!(interlock.state().shutdown);
    }

    #[test]
    fn test_laser_write_failure_is_fatal_and_off() {
        let (interlock, laser, _) = interlock();
        laser.fail.store(true, Ordering::SeqCst);
        let t0 = Instant::now();
        interlock.refresh_watchdog(t0);

        let err = interlock.evaluate(LockState::Tracking, t0).unwrap_err();
        assert!(err.is_fatal());
        assert!(!interlock.laser_enabled());
    }

    #[test]
    fn test_max_on_time_forces_cooldown() {
        let (interlock, laser, _) = interlock();
        let t0 = Instant::now();
        let at = |ms: u64| t0 + Duration::from_millis(ms);
        let step = |ms: u64| {
            interlock.refresh_watchdog(at(ms));
            interlock.evaluate(LockState::Tracking, at(ms)).unwrap()
        };

        assert!(step(0));
        assert!(step(4999));
        assert_eq!(interlock.state().laser_on_since, Some(t0));

        // 连续 5s 后关闭并冷却 1s
        assert!(!step(5000));
        assert_eq!(interlock.state().cooldown_until, Some(at(6000)));
        assert!(!step(5500));
        assert!(!step(5999));

        // 冷却结束重新开启, 计时从头开始
        assert!(step(6000));
        assert_eq!(interlock.state().laser_on_since, Some(at(6000)));
        assert!(step(10999));
        assert!(!step(11000));

        assert_eq!(
            *laser.calls.lock().unwrap(),
            vec![false, true, false, true, false]
        );
    }

    #[test]
    fn test_monitor_enforces_max_on_time() {
        let (interlock, _, _) = interlock();
        let t0 = Instant::now();
        interlock.refresh_watchdog(t0);
        interlock.evaluate(LockState::Tracking, t0).unwrap();

        // 控制线程停在 4.9s 前后, 巡检仍按连续开启时间关闭
        let t1 = t0 + Duration::from_millis(4900);
        interlock.refresh_watchdog(t1);
        assert!(!interlock.check_watchdog(t1).unwrap());
        assert!(interlock
            .check_watchdog(t0 + Duration::from_millis(5000))
            .unwrap());
        assert!(!interlock.laser_enabled());

        let t2 = t0 + Duration::from_millis(5100);
        interlock.refresh_watchdog(t2);
        assert!(!interlock.evaluate(LockState::Tracking, t2).unwrap());
    }

    /// 由测试控制的急停按钮
    #[derive(Clone, Default)]
    struct Button {
        pressed: Arc<AtomicBool>,
        broken: Arc<AtomicBool>,
    }

    impl OverrideInput for Button {
        fn is_pressed(&mut self) -> std::io::Result<bool> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("line read"));
            }
            Ok(self.pressed.load(Ordering::SeqCst))
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_override_watcher_follows_button() {
        let button = Button::default();
        let switch = OverrideSwitch::new();
        let mut watcher =
            OverrideWatcher::spawn(button.clone(), switch.clone(), Duration::from_millis(5))
                .unwrap();

        button.pressed.store(true, Ordering::SeqCst);
        assert!(wait_for(|| switch.is_engaged()));
        button.pressed.store(false, Ordering::SeqCst);
        assert!(wait_for(|| !switch.is_engaged()));

        // 读取失败按按下处理
        button.broken.store(true, Ordering::SeqCst);
        assert!(wait_for(|| switch.is_engaged()));
        watcher.stop();
    }

    #[test]
    fn test_override_watcher_keeps_existing_engage() {
        let switch = OverrideSwitch::new();
        switch.engage();
        let _watcher =
            OverrideWatcher::spawn(Button::default(), switch.clone(), Duration::from_millis(5))
                .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(switch.is_engaged());
    }

    #[test]
    fn test_watchdog() {
        let mut wd = Watchdog::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(wd.expired(t0));
        wd.refresh(t0);
        assert!(!wd.expired(t0 + Duration::from_millis(99)));
        assert!(wd.expired(t0 + Duration::from_millis(100)));
    }
}
