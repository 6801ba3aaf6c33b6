//! sysfs PWM 舵机 (Linux `/sys/class/pwm`)
//!
//! 标准舵机: 50Hz 周期, 脉宽 1.5ms 居中, 每 90° 偏移 0.5ms。

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::{Axis, Servo};
use crate::config::{ActuatorConfig, AxisLimits};
use crate::error::ActuatorError;

const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";

/// 中位脉宽
const CENTER_PULSE_NS: f64 = 1_500_000.0;
/// 每 90° 的脉宽偏移
const PULSE_NS_PER_90_DEG: f64 = 500_000.0;

/// 角度 → 脉宽 (纳秒)
pub fn angle_to_pulse_ns(degrees: f32) -> u64 {
    (CENTER_PULSE_NS + degrees as f64 / 90.0 * PULSE_NS_PER_90_DEG).round() as u64
}

struct PwmChannel {
    dir: PathBuf,
}

impl PwmChannel {
    fn write(&self, attr: &str, value: impl ToString) -> Result<(), ActuatorError> {
        let path = self.dir.join(attr);
        fs::write(&path, value.to_string())
            .map_err(|e| ActuatorError::NoAck(format!("{}: {}", path.display(), e)))
    }
}

pub struct PwmServo {
    channels: [PwmChannel; 2],
    limits: [AxisLimits; 2],
    period_ns: u64,
}

impl PwmServo {
    /// 打开 `/sys/class/pwm/pwmchipN` 下的两个通道
    pub fn open(config: &ActuatorConfig) -> Result<Self, ActuatorError> {
        Self::open_at(SYSFS_PWM_ROOT, config)
    }

    /// 指定 sysfs 根目录 (测试用假目录)
    pub fn open_at(root: impl AsRef<Path>, config: &ActuatorConfig) -> Result<Self, ActuatorError> {
        if config.pwm_frequency_hz == 0 {
            return Err(ActuatorError::Fault("PWM 频率不能为 0".into()));
        }
        let chip = root.as_ref().join(format!("pwmchip{}", config.pwm_chip));
        let period_ns = 1_000_000_000u64 / config.pwm_frequency_hz as u64;

        let pan = Self::export(&chip, config.pan_channel)?;
        let tilt = Self::export(&chip, config.tilt_channel)?;

        let servo = Self {
            channels: [pan, tilt],
            limits: [config.pan_limits, config.tilt_limits],
            period_ns,
        };
        for axis in Axis::ALL {
            servo.enable(axis)?;
        }
        info!(
            "✅ PWM 舵机就绪: {} (周期 {}ns)",
            chip.display(),
            servo.period_ns
        );
        Ok(servo)
    }

    fn export(chip: &Path, channel: u32) -> Result<PwmChannel, ActuatorError> {
        let dir = chip.join(format!("pwm{}", channel));
        if !dir.exists() {
            let export = chip.join("export");
            fs::write(&export, channel.to_string())
                .map_err(|e| ActuatorError::NoAck(format!("{}: {}", export.display(), e)))?;
            // udev 需要时间调整属性权限
            thread::sleep(Duration::from_millis(100));
        }
        Ok(PwmChannel { dir })
    }

    fn channel(&self, axis: Axis) -> &PwmChannel {
        &self.channels[axis.index()]
    }

    fn enable(&self, axis: Axis) -> Result<(), ActuatorError> {
        let ch = self.channel(axis);
        ch.write("period", self.period_ns)?;
        ch.write("duty_cycle", angle_to_pulse_ns(0.0))?;
        ch.write("enable", 1)
    }
}

impl Servo for PwmServo {
    fn set_angle(&mut self, axis: Axis, degrees: f32) -> Result<(), ActuatorError> {
        let limits = self.limits[axis.index()];
        if !limits.contains(degrees) {
            return Err(ActuatorError::OutOfRange {
                angle: degrees,
                min: limits.min,
                max: limits.max,
            });
        }
        let pulse = angle_to_pulse_ns(degrees);
        debug!("{:?} → {:.2}° ({}ns)", axis, degrees, pulse);
        self.channel(axis).write("duty_cycle", pulse)
    }

    fn reset(&mut self, axis: Axis) -> Result<(), ActuatorError> {
        self.channel(axis).write("enable", 0)?;
        self.enable(axis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_chip(root: &Path) {
        for ch in ["pwm0", "pwm1"] {
            fs::create_dir_all(root.join("pwmchip0").join(ch)).unwrap();
        }
    }

    fn read(root: &Path, ch: &str, attr: &str) -> String {
        fs::read_to_string(root.join("pwmchip0").join(ch).join(attr)).unwrap()
    }

    #[test]
    fn test_pulse_width_mapping() {
        assert_eq!(angle_to_pulse_ns(0.0), 1_500_000);
        assert_eq!(angle_to_pulse_ns(90.0), 2_000_000);
        assert_eq!(angle_to_pulse_ns(-90.0), 1_000_000);
        assert_eq!(angle_to_pulse_ns(-45.0), 1_250_000);
    }

    #[test]
    fn test_open_enables_channels_centered() {
        let dir = tempfile::tempdir().unwrap();
        fake_chip(dir.path());

        PwmServo::open_at(dir.path(), &ActuatorConfig::default()).unwrap();
        for ch in ["pwm0", "pwm1"] {
            assert_eq!(read(dir.path(), ch, "period"), "20000000");
            assert_eq!(read(dir.path(), ch, "duty_cycle"), "1500000");
            assert_eq!(read(dir.path(), ch, "enable"), "1");
        }
    }

    #[test]
    fn test_set_angle_writes_duty_and_checks_range() {
        let dir = tempfile::tempdir().unwrap();
        fake_chip(dir.path());
        let mut servo = PwmServo::open_at(dir.path(), &ActuatorConfig::default()).unwrap();

        servo.set_angle(Axis::Tilt, 45.0).unwrap();
        assert_eq!(read(dir.path(), "pwm1", "duty_cycle"), "1750000");

        assert!(matches!(
            servo.set_angle(Axis::Tilt, 46.0),
            Err(ActuatorError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_missing_chip_is_no_ack() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PwmServo::open_at(dir.path(), &ActuatorConfig::default()),
            Err(ActuatorError::NoAck(_))
        ));
    }
}
