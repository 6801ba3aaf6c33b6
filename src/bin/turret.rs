/// 激光炮塔 (Laser turret)
///
/// 单目标人体跟踪 + 云台 PID + 激光安全联锁
///
/// 系统架构:
/// 1. 采集线程:   摄像头 / 图片回放 / 仿真
/// 2. 推理线程:   人体检测 + 锁定状态机
/// 3. 控制线程:   固定频率 PID 节拍, 驱动舵机
/// 4. 巡检线程:   看门狗, 超时强制关激光
///
/// Ctrl-C / SIGTERM 先按下急停关激光, 再走完整关机序列
///
/// cargo run --bin turret -- --sim -d 20
/// cargo run --release --features onnx,ffmpeg --bin turret -- -c turret.json
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use laser_turret::camera::{Camera, ReplayCamera};
use laser_turret::detection::InferenceEngine;
use laser_turret::pipeline::{Hardware, Orchestrator, StatusHandle};
use laser_turret::safety::{Laser, OverrideSwitch, OverrideWatcher};
use laser_turret::sim::{SimPerson, SimRig};
use laser_turret::TurretConfig;

/// 激光炮塔参数
#[derive(Parser, Debug)]
#[command(author, version, about = "激光炮塔 - 单目标人体跟踪", long_about = None)]
struct Args {
    /// 配置文件 (JSON), 不指定则使用默认配置
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 使用仿真硬件 (摄像头/推理/舵机/激光)
    #[arg(long, default_value_t = false)]
    sim: bool,

    /// 图片目录回放, 替代摄像头
    #[arg(long)]
    replay: Option<PathBuf>,

    /// 运行秒数, 不指定则运行到致命错误或 Ctrl-C
    #[arg(short, long)]
    duration: Option<f32>,

    /// 状态遥测间隔 (秒), 以 JSON 输出到日志
    #[arg(long)]
    status_interval: Option<f32>,

    /// 写出默认配置模板后退出
    #[arg(long)]
    write_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();

    if let Some(path) = &args.write_config {
        TurretConfig::default().save(path)?;
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => TurretConfig::load(path)?,
        None => {
            info!("📄 未指定配置文件, 使用默认配置");
            TurretConfig::default()
        }
    };
    let config = Arc::new(config);

    info!("🚀 激光炮塔启动");
    let hardware = if args.sim {
        info!("🧪 仿真模式");
        sim_hardware(&config)
    } else {
        Hardware {
            camera: open_camera(&config, args.replay.as_deref())?,
            engine: open_engine(&config)?,
            servo: Box::new(laser_turret::actuator::PwmServo::open(&config.actuator)?),
            laser: open_laser(&config)?,
            override_switch: OverrideSwitch::new(),
        }
    };

    let turret = Orchestrator::start(Arc::clone(&config), hardware)?;

    let stop = turret.stop_handle();
    ctrlc::set_handler(move || {
        warn!("🛑 收到退出信号, 关闭激光并停机");
        stop.request_stop();
    })?;

    let mut watcher = spawn_override_watcher(&config, turret.override_switch())?;
    let telemetry = match args.status_interval {
        Some(secs) if secs > 0.0 => Some(StatusLogger::spawn(
            turret.status_handle(),
            Duration::from_secs_f32(secs),
        )?),
        _ => None,
    };

    let result = turret.run_for(args.duration.map(Duration::from_secs_f32));
    if let Some(telemetry) = telemetry {
        telemetry.stop();
    }
    if let Some(watcher) = watcher.as_mut() {
        watcher.stop();
    }

    let report = result?;
    info!(
        "👋 正常退出: 节拍 {} | 激光节拍 {} | 推理超时 {}",
        report.ticks, report.laser_on_ticks, report.inference_timeouts
    );
    Ok(())
}

// ========== 急停与遥测 ==========

/// 配置了急停输入线时轮询该 GPIO
fn spawn_override_watcher(
    config: &TurretConfig,
    switch: OverrideSwitch,
) -> Result<Option<OverrideWatcher>> {
    let Some(line) = config.safety.override_line else {
        return Ok(None);
    };

    #[cfg(target_os = "linux")]
    {
        let input = laser_turret::safety::GpioOverride::open(&config.safety, line)?;
        Ok(Some(OverrideWatcher::spawn(
            input,
            switch,
            config.safety.monitor_period(),
        )?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = switch;
        anyhow::bail!("急停输入线 {} 仅支持 Linux GPIO", line)
    }
}

/// 定期把状态快照写入日志
struct StatusLogger {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl StatusLogger {
    fn spawn(status: StatusHandle, interval: Duration) -> std::io::Result<Self> {
        let (stop, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("status".into())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => info!("📡 {}", status.status().to_json()),
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            warn!("⚠️ 状态遥测线程 panic");
        }
    }
}

// ========== 硬件装配 ==========

fn sim_hardware(config: &TurretConfig) -> Hardware {
    let (w, h) = (config.camera.width as f32, config.camera.height as f32);
    let rig = SimRig::new(
        config,
        vec![
            // 从左侧走入, 中途被遮挡一段
            SimPerson::standing(w * 0.3, h * 0.55)
                .walking(1.2, 0.0)
                .occluded(120..132),
            // 干扰物: 不是人
            SimPerson::standing(w * 0.8, h * 0.7)
                .with_label("chair")
                .with_size(80.0, 80.0),
            // 后出现的第二个人, 不应抢走锁定
            SimPerson::standing(w * 0.7, h * 0.5)
                .with_confidence(0.97)
                .appearing_at(200),
        ],
    );
    rig.hardware(rig.camera(), rig.engine())
}

fn open_camera(config: &TurretConfig, replay: Option<&Path>) -> Result<Box<dyn Camera>> {
    if let Some(dir) = replay {
        return Ok(Box::new(ReplayCamera::open(
            dir,
            config.camera.fps as f32,
            true,
        )?));
    }

    #[cfg(feature = "ffmpeg")]
    {
        Ok(Box::new(laser_turret::camera::FfmpegCamera::open(
            &config.camera,
        )?))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        anyhow::bail!("未启用 ffmpeg 功能, 请使用 --replay <目录> 或 --sim")
    }
}

fn open_engine(config: &TurretConfig) -> Result<Box<dyn InferenceEngine>> {
    #[cfg(feature = "onnx")]
    {
        Ok(Box::new(laser_turret::detection::YoloEngine::new(
            &config.detection,
        )?))
    }
    #[cfg(not(feature = "onnx"))]
    {
        let _ = config;
        anyhow::bail!("未启用 onnx 功能, 无法加载检测模型, 请使用 --sim")
    }
}

fn open_laser(config: &TurretConfig) -> Result<Box<dyn Laser>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(laser_turret::safety::GpioLaser::open(
            &config.safety,
        )?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        anyhow::bail!("激光 GPIO 仅支持 Linux, 请使用 --sim")
    }
}
