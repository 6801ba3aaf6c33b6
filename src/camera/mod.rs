/// 视频输入系统 (Camera input)
///
/// 独立采集线程, 负责把摄像头帧写入单槽缓冲
/// - Camera:       摄像头能力接口 (真实设备 / 回放 / 仿真)
/// - FrameSource:  采集阶段, "最新帧优先" 缓冲策略
/// - ReplayCamera: 图片目录回放
/// - FfmpegCamera: FFmpeg 本地摄像头 (feature `ffmpeg`)
use std::time::{Duration, Instant};

use crate::error::CameraError;

pub mod replay;
pub mod source;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use replay::ReplayCamera;
pub use source::FrameSource;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegCamera;

/// 一帧图像, 交给下一阶段后由其独占
#[derive(Clone)]
pub struct Frame {
    pub id: u64,
    pub captured_at: Instant,
    pub pixels: Vec<u8>, // 紧凑 RGB8
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// 纯色帧 (仿真和测试用)
    pub fn blank(id: u64, width: u32, height: u32) -> Self {
        Self {
            id,
            captured_at: Instant::now(),
            pixels: vec![0; width as usize * height as usize * 3],
            width,
            height,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// 摄像头能力接口
///
/// `Timeout` 可重试; `Disconnected` 表示设备不可再读。
pub trait Camera: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError>;

    /// 日志用的设备描述
    fn describe(&self) -> String {
        String::from("camera")
    }
}

impl<C: Camera + ?Sized> Camera for Box<C> {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        (**self).next_frame(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
