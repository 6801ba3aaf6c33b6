//! 单轴 PID (输出为指令增量)
//!
//! output = Kp·e + Ki·∫e dt + Kd·D
//! - 积分限幅防饱和, 执行机构截断时回退本次积分增量
//! - D 为误差变化率经单极点低通后的值, 复位后首步为 0
//! - dt 为实测节拍间隔, 非法 dt 不推进状态

use crate::config::PidGains;

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    integral_clamp: f32,
    derivative_tau: f32,

    integral: f32,
    prev_error: Option<f32>,
    derivative: f32,
    last_integral_step: f32,
}

impl PidController {
    pub fn new(gains: PidGains, integral_clamp: f32, derivative_tau: f32) -> Self {
        Self {
            gains,
            integral_clamp: integral_clamp.abs(),
            derivative_tau: derivative_tau.max(0.0),
            integral: 0.0,
            prev_error: None,
            derivative: 0.0,
            last_integral_step: 0.0,
        }
    }

    /// 推进一步, 返回指令增量 (度)
    pub fn step(&mut self, error: f32, dt: f32) -> f32 {
        if !(dt.is_finite() && dt > 0.0) || !error.is_finite() {
            self.last_integral_step = 0.0;
            return 0.0;
        }

        let before = self.integral;
        self.integral =
            (self.integral + error * dt).clamp(-self.integral_clamp, self.integral_clamp);
        self.last_integral_step = self.integral - before;

        let raw = match self.prev_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };
        let a = dt / (self.derivative_tau + dt);
        self.derivative += a * (raw - self.derivative);
        self.prev_error = Some(error);

        self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * self.derivative
    }

    /// 执行机构截断了本次指令: 撤销本次积分增量
    pub fn unwind(&mut self) {
        self.integral -= self.last_integral_step;
        self.last_integral_step = 0.0;
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
        self.derivative = 0.0;
        self.last_integral_step = 0.0;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn prev_error(&self) -> Option<f32> {
        self.prev_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pid(kp: f32, ki: f32, kd: f32) -> PidController {
        PidController::new(PidGains { kp, ki, kd }, 20.0, 0.05)
    }

    #[test]
    fn test_zero_error_zero_output() {
        let mut p = PidController::new(PidGains::default(), 20.0, 0.05);
        for _ in 0..100 {
            assert_eq!(p.step(0.0, 1.0 / 30.0), 0.0);
        }
        assert_eq!(p.integral(), 0.0);
    }

    #[test]
    fn test_proportional_only() {
        let mut p = pid(0.5, 0.0, 0.0);
        assert_relative_eq!(p.step(10.0, 0.033), 5.0);
    }

    #[test]
    fn test_invalid_dt_leaves_state() {
        let mut p = pid(1.0, 1.0, 1.0);
        p.step(2.0, 0.1);
        let integral = p.integral();
        assert_eq!(p.step(5.0, 0.0), 0.0);
        assert_eq!(p.step(5.0, -0.1), 0.0);
        assert_eq!(p.step(5.0, f32::NAN), 0.0);
        assert_eq!(p.step(f32::INFINITY, 0.1), 0.0);
        assert_eq!(p.integral(), integral);
        assert_eq!(p.prev_error(), Some(2.0));
    }

    #[test]
    fn test_integral_clamped() {
        let mut p = pid(0.0, 1.0, 0.0);
        for _ in 0..1000 {
            p.step(100.0, 0.1);
        }
        assert_eq!(p.integral(), 20.0);
        for _ in 0..1000 {
            p.step(-100.0, 0.1);
        }
        assert_eq!(p.integral(), -20.0);
    }

    #[test]
    fn test_first_derivative_is_zero_then_filtered() {
        let mut p = pid(0.0, 0.0, 1.0);
        assert_eq!(p.step(10.0, 0.05), 0.0);
        // raw = 200/s, a = 0.05/(0.05+0.05) = 0.5
        assert_relative_eq!(p.step(20.0, 0.05), 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_unwind_reverts_last_increment() {
        let mut p = pid(0.0, 1.0, 0.0);
        p.step(1.0, 0.5);
        p.step(1.0, 0.5);
        assert_relative_eq!(p.integral(), 1.0);
        p.unwind();
        assert_relative_eq!(p.integral(), 0.5);
        // 重复调用不再回退
        p.unwind();
        assert_relative_eq!(p.integral(), 0.5);
    }

    #[test]
    fn test_reset() {
        let mut p = pid(1.0, 1.0, 1.0);
        p.step(3.0, 0.1);
        p.step(4.0, 0.1);
        p.reset();
        assert_eq!(p.integral(), 0.0);
        assert_eq!(p.prev_error(), None);
        assert_relative_eq!(p.step(0.0, 0.1), 0.0);
    }
}
