//! 多线程整机仿真: 真实线程、真实时钟, 只有硬件是仿真的

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use laser_turret::actuator::Axis;
use laser_turret::error::TurretError;
use laser_turret::pipeline::Orchestrator;
use laser_turret::sim::{SimEvent, SimPerson, SimRig};
use laser_turret::TurretConfig;

fn start(config: TurretConfig, rig: &SimRig) -> laser_turret::RunningTurret {
    let hardware = rig.hardware(rig.camera(), rig.engine());
    Orchestrator::start(Arc::new(config), hardware).unwrap()
}

/// 某轴下发过的最大指令角度
fn max_command(rig: &SimRig, axis: Axis) -> f32 {
    rig.events
        .events()
        .iter()
        .filter_map(|e| match e {
            SimEvent::ServoCommand { axis: a, angle } if *a == axis => Some(*angle),
            _ => None,
        })
        .fold(f32::MIN, f32::max)
}

#[test]
fn test_tracks_person_and_fires() {
    let config = TurretConfig::default();
    let rig = SimRig::new(&config, vec![SimPerson::standing(400.0, 260.0)]);
    let turret = start(config, &rig);

    let report = turret.run_for(Some(Duration::from_secs(2))).unwrap();

    assert!(report.ticks > 30);
    assert!(report.inferences > 10);
    assert!(report.laser_on_ticks > 0);
    assert_eq!(report.interlock_violations, 0);

    // 目标在中心右侧 80px, 云台应向右转约 7.5°; 关机后回中
    assert!(max_command(&rig, Axis::Pan) > 3.0);
    assert_eq!(rig.servo.commanded(Axis::Pan), 0.0);
    assert!(!rig.laser.is_on());
    assert_eq!(rig.laser.history().last(), Some(&false));
}

#[test]
fn test_camera_disconnect_is_sensor_failure() {
    let config = TurretConfig::default();
    let rig = SimRig::new(&config, vec![SimPerson::standing(320.0, 240.0)]);
    let hardware = rig.hardware(rig.camera().disconnect_after(20), rig.engine());
    let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();

    let err = turret.run_for(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, TurretError::SensorFailure(_)), "{err}");
    assert!(err.is_fatal());
    assert!(!rig.laser.is_on());
}

#[test]
fn test_shutdown_leaves_laser_off_and_all_stages_stopped() {
    let config = TurretConfig::default();
    let rig = SimRig::new(&config, vec![SimPerson::standing(420.0, 240.0)]);
    let turret = start(config, &rig);

    turret.run_for(Some(Duration::from_millis(1500))).unwrap();

    let timeline = rig.events.timeline();
    assert!(timeline.iter().any(|(_, e)| *e == SimEvent::Laser(true)));

    // 最后一次激光写入就是关机锁存, 之后不再亮
    let latch = timeline
        .iter()
        .rposition(|(_, e)| matches!(e, SimEvent::Laser(_)))
        .unwrap();
    assert_eq!(timeline[latch].1, SimEvent::Laser(false));
    assert_eq!(rig.laser.history().last(), Some(&false));

    // 最后两条舵机指令是锁存之后的回中
    let servo: Vec<(usize, SimEvent)> = timeline
        .iter()
        .enumerate()
        .filter(|(_, (_, e))| matches!(e, SimEvent::ServoCommand { .. }))
        .map(|(i, (_, e))| (i, *e))
        .collect();
    let parked = &servo[servo.len() - 2..];
    assert!(parked.iter().all(|(i, _)| *i > latch));
    assert_eq!(
        parked.iter().map(|(_, e)| *e).collect::<Vec<_>>(),
        vec![
            SimEvent::ServoCommand {
                axis: Axis::Pan,
                angle: 0.0
            },
            SimEvent::ServoCommand {
                axis: Axis::Tilt,
                angle: 0.0
            },
        ]
    );
    // 全部阶段已停: 不再有新的帧、舵机指令或激光写入
    let settled = timeline.len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(rig.events.timeline().len(), settled);
}

#[test]
fn test_stop_request_shuts_down_open_ended_run() {
    let config = TurretConfig::default();
    let rig = SimRig::new(&config, vec![SimPerson::standing(420.0, 240.0)]);
    let turret = start(config, &rig);

    let stop = turret.stop_handle();
    let status = turret.status_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1200));
        stop.request_stop();
        // 重复请求无害
        stop.request_stop();
    });

    let report = turret.run_for(None).unwrap();
    stopper.join().unwrap();

    assert!(report.laser_on_ticks > 0);
    assert_eq!(report.interlock_violations, 0);
    assert_eq!(rig.laser.history().last(), Some(&false));
    assert!(rig.override_switch.is_engaged());

    let status = status.status();
    assert!(status.shutdown);
    assert!(status.override_active);
    assert!(!status.laser_on);

    let settled = rig.events.timeline().len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(rig.events.timeline().len(), settled);
}

#[test]
fn test_inference_stall_turns_laser_off() {
    let mut config = TurretConfig::default();
    config.tracking.loss_timeout_frames = 1000;
    config.safety.watchdog_ms = 1000;
    let rig = SimRig::new(&config, vec![SimPerson::standing(330.0, 240.0)]);
    // 第 30 帧 (约 1s) 起推理卡死
    let engine = rig.engine().stalling_from(30, Duration::from_secs(3));
    let hardware = rig.hardware(rig.camera(), engine);
    let turret = Orchestrator::start(Arc::new(config), hardware).unwrap();

    thread::sleep(Duration::from_millis(2800));
    assert!(rig.laser.history().contains(&true));
    assert!(!rig.laser.is_on());
    assert!(!turret.safety_state().laser_enabled);

    let report = turret.run_for(Some(Duration::ZERO)).unwrap();
    assert!(report.inference_timeouts > 0);
    assert_eq!(report.interlock_violations, 0);
}

#[test]
fn test_actuator_fault_after_failed_reset_is_fatal() {
    let config = TurretConfig::default();
    let rig = SimRig::new(&config, vec![SimPerson::standing(420.0, 240.0)]);
    let turret = start(config, &rig);

    thread::sleep(Duration::from_millis(500));
    // 首次指令失败, 复位后重发也失败
    rig.servo.fail_next(3);

    let err = turret.run_for(Some(Duration::from_secs(3))).unwrap_err();
    assert!(matches!(err, TurretError::ActuatorFault { .. }), "{err}");
    assert!(!rig.laser.is_on());
    assert!(rig
        .events
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::ServoReset(_))));
}

#[test]
fn test_laser_write_failure_is_fatal() {
    let config = TurretConfig::default();
    let rig = SimRig::new(&config, vec![SimPerson::standing(320.0, 240.0)]);
    rig.laser.fail_writes(true);
    let turret = start(config, &rig);

    let err = turret.run_for(Some(Duration::from_secs(3))).unwrap_err();
    assert!(matches!(err, TurretError::Laser(_)), "{err}");
    assert!(!rig.laser.is_on());
}
