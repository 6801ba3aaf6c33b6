/// 舵机扫描自检 (Servo sweep)
///
/// 经 ActuatorDriver 依次把两轴扫到限位再回中, 检查接线、方向和限位配置。
/// 激光全程保持关闭。
///
/// cargo run --bin servo_check -- --sim
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use laser_turret::actuator::{ActuatorDriver, Axis, PwmServo, Servo};
use laser_turret::config::AxisLimits;
use laser_turret::sim::{SimEventLog, SimServo, DEFAULT_SERVO_TAU};
use laser_turret::TurretConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "舵机扫描自检", long_about = None)]
struct Args {
    /// 配置文件 (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 使用仿真舵机
    #[arg(long, default_value_t = false)]
    sim: bool,

    /// 扫描轮数
    #[arg(long, default_value_t = 1)]
    cycles: u32,

    /// 只扫描限位的这一比例 (0-1]
    #[arg(long, default_value_t = 0.8)]
    span: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TurretConfig::load(path)?,
        None => TurretConfig::default(),
    };
    let span = args.span.clamp(0.05, 1.0);

    let sim = SimServo::new(&config.actuator, DEFAULT_SERVO_TAU, SimEventLog::default());
    let servo: Box<dyn Servo> = if args.sim {
        Box::new(sim.clone())
    } else {
        Box::new(PwmServo::open(&config.actuator)?)
    };

    let mut driver = ActuatorDriver::new(servo, &config.actuator);
    driver
        .home()
        .map_err(|(axis, e)| anyhow::anyhow!("{:?} 回中失败: {}", axis, e))?;

    let period = config.control.tick_period();
    let home = [config.actuator.home_pan, config.actuator.home_tilt];

    for cycle in 1..=args.cycles {
        info!("🔄 第 {}/{} 轮", cycle, args.cycles);
        for axis in Axis::ALL {
            let targets = sweep_targets(driver.limits(axis), home[axis.index()], span);
            for target in targets {
                let started = Instant::now();
                let ticks = sweep_to(&mut driver, axis, target, period)?;
                info!(
                    "🎯 {:?} → {:.1}°: {} 节拍, {:.2}s",
                    axis,
                    target,
                    ticks,
                    started.elapsed().as_secs_f64()
                );
                if args.sim {
                    info!("   仿真实际位置 {:.2}°", sim.position(axis));
                }
            }
        }
    }

    info!("✅ 自检完成");
    Ok(())
}

/// 扫描目标: 从回中位置朝两端各走 span 比例, 最后回中; 均落在限位内
fn sweep_targets(limits: AxisLimits, home: f32, span: f32) -> [f32; 3] {
    let home = limits.clamp(home);
    [
        limits.clamp(home + (limits.min - home) * span),
        limits.clamp(home + (limits.max - home) * span),
        home,
    ]
}

/// 连续这么多节拍没有进展即放弃
const MAX_STALLED_TICKS: u32 = 50;

/// 按控制节拍逐步逼近目标角度 (受限速约束)
fn sweep_to(driver: &mut ActuatorDriver, axis: Axis, target: f32, period: Duration) -> Result<u32> {
    let mut ticks = 0;
    let mut stalled = 0;
    while (driver.angle(axis) - target).abs() > 1e-3 {
        let before = driver.angle(axis);
        if let Err(e) = driver.apply(axis, target - before) {
            warn!("⚠️ {:?} 指令失败: {}, 尝试复位", axis, e);
            driver.reset(axis)?;
        }
        ticks += 1;
        if (driver.angle(axis) - before).abs() > 1e-4 {
            stalled = 0;
        } else {
            stalled += 1;
            if stalled >= MAX_STALLED_TICKS {
                anyhow::bail!("{:?} 无法到达 {:.1}° (停在 {:.1}°)", axis, target, before);
            }
        }
        thread::sleep(period);
    }
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_stay_inside_asymmetric_limits() {
        // 仰俯只能向上: 按比例缩放限位会落到 min 以下
        let limits = AxisLimits::new(10.0, 90.0);
        let targets = sweep_targets(limits, 10.0, 0.5);
        assert_eq!(targets, [10.0, 50.0, 10.0]);

        let targets = sweep_targets(limits, 30.0, 0.8);
        assert!(targets.iter().all(|t| limits.contains(*t)));
        assert!((targets[0] - 14.0).abs() < 1e-4);
        assert!((targets[1] - 78.0).abs() < 1e-4);
        assert_eq!(targets[2], 30.0);
    }

    #[test]
    fn test_sweep_reaches_targets_on_sim_servo() {
        let mut config = TurretConfig::default();
        config.actuator.tilt_limits = AxisLimits::new(10.0, 60.0);
        config.actuator.home_tilt = 10.0;
        let servo = SimServo::new(&config.actuator, 0.0, SimEventLog::default());
        let mut driver = ActuatorDriver::new(Box::new(servo), &config.actuator);
        driver.home().unwrap();

        for target in sweep_targets(driver.limits(Axis::Tilt), 10.0, 1.0) {
            sweep_to(&mut driver, Axis::Tilt, target, Duration::ZERO).unwrap();
            assert!((driver.angle(Axis::Tilt) - target).abs() <= 1e-3);
        }
    }
}
