//! 像素偏移 → 角度误差 (CoordinateMapper)
//!
//! 纯函数, 无内部状态; 标定参数来自相机配置。
//! 符号: pan 正 = 目标在中心右侧, tilt 正 = 目标在中心上方 (图像 y 轴向下)。

use crate::config::{CameraConfig, MappingModel};

#[derive(Debug, Clone)]
pub struct CoordinateMapper {
    hfov_deg: f32,
    vfov_deg: f32,
    model: MappingModel,
    invert_pan: bool,
    invert_tilt: bool,
    deadzone_px: f32,
}

impl CoordinateMapper {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            hfov_deg: config.hfov_deg,
            vfov_deg: config.vfov_deg,
            model: config.mapping,
            invert_pan: config.invert_pan,
            invert_tilt: config.invert_tilt,
            deadzone_px: config.deadzone_px,
        }
    }

    /// 返回 (pan 误差, tilt 误差), 单位: 度
    pub fn map_to_angles(&self, centroid: (f32, f32), width: u32, height: u32) -> (f32, f32) {
        if width == 0 || height == 0 || !centroid.0.is_finite() || !centroid.1.is_finite() {
            return (0.0, 0.0);
        }

        let offset_x = self.apply_deadzone(centroid.0 - width as f32 / 2.0);
        // 图像 y 向下, 云台 tilt 向上为正
        let offset_y = self.apply_deadzone(height as f32 / 2.0 - centroid.1);

        let pan = self.axis_angle(offset_x, width as f32, self.hfov_deg);
        let tilt = self.axis_angle(offset_y, height as f32, self.vfov_deg);

        (
            if self.invert_pan { -pan } else { pan },
            if self.invert_tilt { -tilt } else { tilt },
        )
    }

    fn apply_deadzone(&self, offset: f32) -> f32 {
        if offset.abs() < self.deadzone_px {
            0.0
        } else {
            offset
        }
    }

    fn axis_angle(&self, offset: f32, size: f32, fov_deg: f32) -> f32 {
        match self.model {
            // 每像素度数 = FOV / 像素数
            MappingModel::Linear => offset * fov_deg / size,
            MappingModel::Pinhole => {
                let half_tan = (fov_deg.to_radians() / 2.0).tan();
                (offset / (size / 2.0) * half_tan).atan().to_degrees()
            }
        }
    }
}
