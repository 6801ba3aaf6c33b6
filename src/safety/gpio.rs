//! GPIO 激光使能 (Linux GPIO 字符设备, 高电平有效) 与急停按钮输入

use gpiod::{Active, Bias, Chip, Input, Lines, Options, Output};
use tracing::info;

use super::{Laser, OverrideInput};
use crate::config::SafetyConfig;
use crate::error::LaserError;

fn chip_path(config: &SafetyConfig) -> String {
    if config.gpio_chip.contains('/') {
        config.gpio_chip.clone()
    } else {
        format!("/dev/{}", config.gpio_chip)
    }
}

pub struct GpioLaser {
    lines: Lines<Output>,
    line: u32,
}

impl GpioLaser {
    /// 申请激光使能线, 初始输出低电平
    pub fn open(config: &SafetyConfig) -> Result<Self, LaserError> {
        let path = chip_path(config);

        let chip = Chip::new(&path).map_err(|e| LaserError::Io(format!("{}: {}", path, e)))?;
        let opts = Options::output([config.laser_line])
            .values([false])
            .consumer("laser-turret");
        let lines = chip
            .request_lines(opts)
            .map_err(|e| LaserError::Io(format!("{} line {}: {}", path, config.laser_line, e)))?;

        info!("✅ 激光 GPIO 就绪: {} line {}", path, config.laser_line);
        Ok(Self {
            lines,
            line: config.laser_line,
        })
    }
}

impl Laser for GpioLaser {
    fn set_enabled(&mut self, enabled: bool) -> Result<(), LaserError> {
        self.lines
            .set_values([enabled])
            .map_err(|e| LaserError::Io(format!("line {}: {}", self.line, e)))
    }
}

/// 急停按钮输入线; 低电平有效时启用上拉, 按钮接地
pub struct GpioOverride {
    lines: Lines<Input>,
}

impl GpioOverride {
    pub fn open(config: &SafetyConfig, line: u32) -> std::io::Result<Self> {
        let path = chip_path(config);
        let chip = Chip::new(&path)?;
        let (active, bias) = if config.override_active_low {
            (Active::Low, Bias::PullUp)
        } else {
            (Active::High, Bias::PullDown)
        };
        let opts = Options::input([line])
            .active(active)
            .bias(bias)
            .consumer("laser-turret-override");
        let lines = chip.request_lines(opts)?;

        info!("✅ 急停按钮 GPIO 就绪: {} line {} ({:?})", path, line, active);
        Ok(Self { lines })
    }
}

impl OverrideInput for GpioOverride {
    fn is_pressed(&mut self) -> std::io::Result<bool> {
        let [pressed] = self.lines.get_values([false; 1])?;
        Ok(pressed)
    }
}
