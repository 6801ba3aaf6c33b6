//! 系统配置 - 启动时从JSON文件加载一次, 之后只读
//!
//! 所有组件通过 `Arc<TurretConfig>` 显式获得配置, 不存在全局可变状态。

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TurretError;

/// 整体配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TurretConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub tracking: TrackingConfig,
    pub control: ControlConfig,
    pub actuator: ActuatorConfig,
    pub safety: SafetyConfig,
}

/// 像素偏移 → 角度误差 的换算模型
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingModel {
    /// 线性: 每像素固定角度 (FOV / 像素数)
    #[default]
    Linear,
    /// 针孔相机: atan(偏移 / 焦距)
    Pinhole,
}

/// 摄像头与视场标定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    pub hfov_deg: f32,         // 水平视场角
    pub vfov_deg: f32,         // 垂直视场角
    pub width: u32,            // 采集宽度
    pub height: u32,           // 采集高度
    pub fps: u32,              // 采集帧率
    pub frame_timeout_ms: u64, // 取帧超时
    pub device: String,        // 设备路径 (/dev/video0) 或图片目录
    pub mapping: MappingModel,
    pub invert_pan: bool,
    pub invert_tilt: bool,
    pub deadzone_px: f32, // 中心死区 (像素), 0 = 关闭
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            hfov_deg: 60.0,
            vfov_deg: 45.0,
            width: 640,
            height: 480,
            fps: 30,
            frame_timeout_ms: 200,
            device: String::from("/dev/video0"),
            mapping: MappingModel::Linear,
            invert_pan: false,
            invert_tilt: false,
            deadzone_px: 0.0,
        }
    }
}

impl CameraConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// 检测参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub confidence_threshold: f32, // 检测置信度阈值
    pub person_label: String,      // 只保留该类别
    pub max_latency_ms: u64,       // 单次推理延迟预算
    pub iou_threshold: f32,        // NMS IOU阈值
    pub model_path: String,
    pub input_size: u32, // 模型输入尺寸
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            person_label: String::from("person"),
            max_latency_ms: 80,
            iou_threshold: 0.45,
            model_path: String::from("models/yolov8n.onnx"),
            input_size: 640,
        }
    }
}

impl DetectionConfig {
    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

/// 锁定状态机参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingConfig {
    pub association_radius_px: f32, // 关联半径
    pub loss_timeout_frames: u32,   // 丢失容忍帧数
    pub acquire_frames: u32,        // ACQUIRED 去抖确认帧数
    pub position_alpha: f32,        // 位置平滑系数
    pub velocity_alpha: f32,        // 速度平滑系数
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            association_radius_px: 80.0,
            loss_timeout_frames: 15,
            acquire_frames: 3,
            position_alpha: 0.6,
            velocity_alpha: 0.5,
        }
    }
}

/// 单轴PID增益
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.25,
            ki: 0.02,
            kd: 0.02,
        }
    }
}

/// 控制环参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub tick_rate_hz: f32,
    pub pan: PidGains,
    pub tilt: PidGains,
    pub integral_clamp: f32,   // 积分限幅 (度·秒)
    pub derivative_tau_s: f32, // 微分低通时间常数
    pub max_lead_s: f32,       // 快照外推上限
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30.0,
            pan: PidGains::default(),
            tilt: PidGains::default(),
            integral_clamp: 20.0,
            derivative_tau_s: 0.05,
            max_lead_s: 0.1,
        }
    }
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_rate_hz)
    }
}

/// 单轴机械限位 (度)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisLimits {
    pub min: f32,
    pub max: f32,
}

impl AxisLimits {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, angle: f32) -> f32 {
        angle.clamp(self.min, self.max)
    }

    pub fn contains(&self, angle: f32) -> bool {
        angle >= self.min && angle <= self.max
    }
}

/// 舵机参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorConfig {
    pub pan_limits: AxisLimits,
    pub tilt_limits: AxisLimits,
    pub max_slew_deg_per_tick: f32, // 每节拍最大转角
    pub home_pan: f32,
    pub home_tilt: f32,
    pub pwm_chip: u32, // /sys/class/pwm/pwmchipN
    pub pan_channel: u32,
    pub tilt_channel: u32,
    pub pwm_frequency_hz: u32,
    pub park_on_shutdown: bool, // 关机时 (激光锁存之后) 回中
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            pan_limits: AxisLimits::new(-90.0, 90.0),
            tilt_limits: AxisLimits::new(-45.0, 45.0),
            max_slew_deg_per_tick: 3.0,
            home_pan: 0.0,
            home_tilt: 0.0,
            pwm_chip: 0,
            pan_channel: 0,
            tilt_channel: 1,
            pwm_frequency_hz: 50,
            park_on_shutdown: true,
        }
    }
}

/// 安全联锁参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    pub watchdog_ms: u64,
    pub monitor_hz: f32,   // 独立看门狗巡检频率
    pub laser_power: u8,   // 0-100
    pub gpio_chip: String, // 激光使能 GPIO 芯片
    pub laser_line: u32,   // 激光使能 GPIO 线号
    pub max_on_ms: u64,    // 激光连续开启上限
    pub cooldown_ms: u64,  // 超限关闭后的冷却时间
    pub override_line: Option<u32>, // 急停按钮输入线, None = 不接
    pub override_active_low: bool,  // 按钮接地 (上拉输入)
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: 1000,
            monitor_hz: 10.0,
            laser_power: 100,
            gpio_chip: String::from("gpiochip0"),
            laser_line: 20,
            max_on_ms: 5000,
            cooldown_ms: 1000,
            override_line: None,
            override_active_low: true,
        }
    }
}

impl SafetyConfig {
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn max_on(&self) -> Duration {
        Duration::from_millis(self.max_on_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.monitor_hz)
    }
}

/// 看门狗上限: 更长的周期等于关掉卡顿保护
pub const MAX_WATCHDOG_MS: u64 = 10_000;
/// 读帧等待与推理预算上限, 均不应超过看门狗
pub const MAX_STAGE_WAIT_MS: u64 = 10_000;
/// 激光连续开启上限的最大可配置值
pub const MAX_LASER_ON_MS: u64 = 60_000;

fn invalid(msg: impl Into<String>) -> TurretError {
    TurretError::ConfigInvalid(msg.into())
}

fn check(ok: bool, msg: &str) -> Result<(), TurretError> {
    if ok {
        Ok(())
    } else {
        Err(invalid(msg))
    }
}

fn check_gains(axis: &str, g: &PidGains) -> Result<(), TurretError> {
    for (name, v) in [("kp", g.kp), ("ki", g.ki), ("kd", g.kd)] {
        if !v.is_finite() || v < 0.0 {
            return Err(invalid(format!("control.{axis}.{name} = {v} 必须是非负有限数")));
        }
    }
    Ok(())
}

fn check_limits(axis: &str, l: &AxisLimits, home: f32) -> Result<(), TurretError> {
    if !(l.min.is_finite() && l.max.is_finite() && l.min < l.max) {
        return Err(invalid(format!(
            "actuator.{axis}_limits [{}, {}] 必须满足 min < max",
            l.min, l.max
        )));
    }
    if !l.contains(home) {
        return Err(invalid(format!(
            "actuator.home_{axis} = {home} 不在限位 [{}, {}] 内",
            l.min, l.max
        )));
    }
    Ok(())
}

impl TurretConfig {
    /// 从JSON文件加载并校验
    ///
    /// 文件缺失、解析失败或取值越界都返回 `ConfigInvalid`, 系统拒绝启动。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TurretError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| invalid(format!("读取 {} 失败: {e}", path.display())))?;
        let config: TurretConfig = serde_json::from_str(&json)
            .map_err(|e| invalid(format!("解析 {} 失败: {e}", path.display())))?;
        config.validate()?;
        tracing::info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件 (用于生成模板)
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        tracing::info!("💾 配置已保存到 {}", path.as_ref().display());
        Ok(())
    }

    /// 检查所有取值范围
    pub fn validate(&self) -> Result<(), TurretError> {
        let c = &self.camera;
        check(
            c.hfov_deg > 0.0 && c.hfov_deg < 180.0,
            "camera.hfov_deg 必须在 (0, 180) 内",
        )?;
        check(
            c.vfov_deg > 0.0 && c.vfov_deg < 180.0,
            "camera.vfov_deg 必须在 (0, 180) 内",
        )?;
        check(c.width > 0 && c.height > 0, "camera 分辨率不能为0")?;
        check(c.fps > 0, "camera.fps 必须大于0")?;
        check(
            c.frame_timeout_ms > 0 && c.frame_timeout_ms <= MAX_STAGE_WAIT_MS,
            "camera.frame_timeout_ms 必须在 (0, 10000] 内",
        )?;
        check(
            c.deadzone_px.is_finite() && c.deadzone_px >= 0.0,
            "camera.deadzone_px 必须非负",
        )?;

        let d = &self.detection;
        check(
            (0.0..=1.0).contains(&d.confidence_threshold),
            "detection.confidence_threshold 必须在 [0, 1] 内",
        )?;
        check(
            (0.0..=1.0).contains(&d.iou_threshold),
            "detection.iou_threshold 必须在 [0, 1] 内",
        )?;
        check(
            d.max_latency_ms > 0 && d.max_latency_ms <= MAX_STAGE_WAIT_MS,
            "detection.max_latency_ms 必须在 (0, 10000] 内",
        )?;
        check(!d.person_label.is_empty(), "detection.person_label 不能为空")?;
        check(d.input_size > 0, "detection.input_size 必须大于0")?;

        let t = &self.tracking;
        check(
            t.association_radius_px.is_finite() && t.association_radius_px > 0.0,
            "tracking.association_radius_px 必须大于0",
        )?;
        check(
            t.loss_timeout_frames >= 1,
            "tracking.loss_timeout_frames 至少为1",
        )?;
        check(t.acquire_frames >= 1, "tracking.acquire_frames 至少为1")?;
        check(
            t.position_alpha > 0.0 && t.position_alpha <= 1.0,
            "tracking.position_alpha 必须在 (0, 1] 内",
        )?;
        check(
            t.velocity_alpha > 0.0 && t.velocity_alpha <= 1.0,
            "tracking.velocity_alpha 必须在 (0, 1] 内",
        )?;

        let k = &self.control;
        check(
            k.tick_rate_hz > 0.0 && k.tick_rate_hz <= 1000.0,
            "control.tick_rate_hz 必须在 (0, 1000] 内",
        )?;
        check_gains("pan", &k.pan)?;
        check_gains("tilt", &k.tilt)?;
        check(
            k.integral_clamp.is_finite() && k.integral_clamp > 0.0,
            "control.integral_clamp 必须大于0",
        )?;
        check(
            k.derivative_tau_s.is_finite() && k.derivative_tau_s >= 0.0,
            "control.derivative_tau_s 必须非负",
        )?;
        check(
            k.max_lead_s.is_finite() && k.max_lead_s >= 0.0,
            "control.max_lead_s 必须非负",
        )?;

        let a = &self.actuator;
        check_limits("pan", &a.pan_limits, a.home_pan)?;
        check_limits("tilt", &a.tilt_limits, a.home_tilt)?;
        check(
            a.max_slew_deg_per_tick.is_finite() && a.max_slew_deg_per_tick > 0.0,
            "actuator.max_slew_deg_per_tick 必须大于0",
        )?;
        check(a.pwm_frequency_hz > 0, "actuator.pwm_frequency_hz 必须大于0")?;

        let s = &self.safety;
        check(
            s.watchdog_ms > 0 && s.watchdog_ms <= MAX_WATCHDOG_MS,
            "safety.watchdog_ms 必须在 (0, 10000] 内",
        )?;
        check(
            s.max_on_ms > 0 && s.max_on_ms <= MAX_LASER_ON_MS,
            "safety.max_on_ms 必须在 (0, 60000] 内",
        )?;
        check(
            s.cooldown_ms <= MAX_LASER_ON_MS,
            "safety.cooldown_ms 不能超过 60000",
        )?;
        if let Some(line) = s.override_line {
            check(line != s.laser_line, "safety.override_line 不能与 laser_line 相同")?;
        }
        check(
            s.monitor_hz > 0.0 && s.monitor_hz <= 1000.0,
            "safety.monitor_hz 必须在 (0, 1000] 内",
        )?;
        check(s.laser_power <= 100, "safety.laser_power 必须在 0-100 内")?;

        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        tracing::info!("🎛️  当前配置:");
        tracing::info!(
            "  视场: {:.1}°x{:.1}° @ {}x{}",
            self.camera.hfov_deg,
            self.camera.vfov_deg,
            self.camera.width,
            self.camera.height
        );
        tracing::info!(
            "  检测置信度: {:.2} | 推理预算: {}ms",
            self.detection.confidence_threshold,
            self.detection.max_latency_ms
        );
        tracing::info!(
            "  去抖: {}帧 | 丢失容忍: {}帧 | 关联半径: {:.0}px",
            self.tracking.acquire_frames,
            self.tracking.loss_timeout_frames,
            self.tracking.association_radius_px
        );
        tracing::info!(
            "  控制: {:.0}Hz | 摆率: {:.1}°/节拍 | 看门狗: {}ms",
            self.control.tick_rate_hz,
            self.actuator.max_slew_deg_per_tick,
            self.safety.watchdog_ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        TurretConfig::default().validate().unwrap();
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turret.json");

        let mut config = TurretConfig::default();
        config.tracking.loss_timeout_frames = 42;
        config.control.pan.kp = 0.5;
        config.save(&path).unwrap();

        let loaded = TurretConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{ "safety": { "watchdog_ms": 500 } }"#).unwrap();

        let loaded = TurretConfig::load(&path).unwrap();
        assert_eq!(loaded.safety.watchdog_ms, 500);
        assert_eq!(loaded.safety.laser_power, 100);
        assert_eq!(loaded.camera, CameraConfig::default());
    }

    #[test]
    fn test_missing_file_is_config_invalid() {
        let err = TurretConfig::load("/nonexistent/turret.json").unwrap_err();
        assert!(matches!(err, TurretError::ConfigInvalid(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.json");
        fs::write(&path, r#"{ "tracking": { "loss_timeout": 5 } }"#).unwrap();

        let err = TurretConfig::load(&path).unwrap_err();
        assert!(matches!(err, TurretError::ConfigInvalid(_)));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let cases: Vec<Box<dyn Fn(&mut TurretConfig)>> = vec![
            Box::new(|c: &mut TurretConfig| c.camera.hfov_deg = 0.0),
            Box::new(|c: &mut TurretConfig| c.camera.vfov_deg = 200.0),
            Box::new(|c: &mut TurretConfig| c.detection.confidence_threshold = 1.5),
            Box::new(|c: &mut TurretConfig| c.tracking.association_radius_px = -1.0),
            Box::new(|c: &mut TurretConfig| c.tracking.loss_timeout_frames = 0),
            Box::new(|c: &mut TurretConfig| c.tracking.acquire_frames = 0),
            Box::new(|c: &mut TurretConfig| c.control.tick_rate_hz = 0.0),
            Box::new(|c: &mut TurretConfig| c.control.pan.kp = f32::NAN),
            Box::new(|c: &mut TurretConfig| c.control.tilt.ki = -0.1),
            Box::new(|c: &mut TurretConfig| c.control.integral_clamp = 0.0),
            Box::new(|c: &mut TurretConfig| c.actuator.pan_limits = AxisLimits::new(10.0, -10.0)),
            Box::new(|c: &mut TurretConfig| c.actuator.home_tilt = 60.0),
            Box::new(|c: &mut TurretConfig| c.actuator.max_slew_deg_per_tick = 0.0),
            Box::new(|c: &mut TurretConfig| c.safety.watchdog_ms = 0),
            Box::new(|c: &mut TurretConfig| c.safety.laser_power = 101),
            Box::new(|c: &mut TurretConfig| c.safety.max_on_ms = 0),
            Box::new(|c: &mut TurretConfig| c.safety.override_line = Some(c.safety.laser_line)),
        ];

        for (i, mutate) in cases.iter().enumerate() {
            let mut config = TurretConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(TurretError::ConfigInvalid(_))),
                "case {i} should be rejected"
            );
        }
    }

    #[test]
    fn test_waits_longer_than_ceiling_rejected() {
        let cases: Vec<Box<dyn Fn(&mut TurretConfig)>> = vec![
            Box::new(|c: &mut TurretConfig| c.safety.watchdog_ms = u64::MAX),
            Box::new(|c: &mut TurretConfig| c.safety.watchdog_ms = MAX_WATCHDOG_MS + 1),
            Box::new(|c: &mut TurretConfig| c.camera.frame_timeout_ms = 60_000),
            Box::new(|c: &mut TurretConfig| c.detection.max_latency_ms = u64::MAX),
            Box::new(|c: &mut TurretConfig| c.safety.max_on_ms = MAX_LASER_ON_MS + 1),
            Box::new(|c: &mut TurretConfig| c.safety.cooldown_ms = u64::MAX),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = TurretConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(TurretError::ConfigInvalid(_))),
                "case {i} should be rejected"
            );
        }

        let mut config = TurretConfig::default();
        config.safety.watchdog_ms = MAX_WATCHDOG_MS;
        config.safety.override_line = Some(21);
        config.validate().unwrap();
    }

    #[test]
    fn test_tick_period() {
        let control = ControlConfig::default();
        let period = control.tick_period();
        assert!((period.as_secs_f64() - 1.0 / 30.0).abs() < 1e-6);
    }
}
