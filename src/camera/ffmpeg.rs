//! FFmpeg 摄像头 (FfmpegCamera)
//!
//! 本地摄像头输入, 支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)。
//! FFmpeg 调度器在独立线程运行, 解码滤镜把 YUV420P 转为 RGB8 后写入单槽缓冲。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame as AvFrame, Input};
use tracing::{error, info, warn};

use super::{Camera, Frame};
use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::pipeline::slot::{LatestSlot, SlotRecv};

const MAX_OPEN_RETRIES: u32 = 3;

pub struct FfmpegCamera {
    device: String,
    slot: Arc<LatestSlot<Frame>>,
}

impl FfmpegCamera {
    /// 打开摄像头并启动解码线程
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let slot = Arc::new(LatestSlot::new());
        let device = config.device.clone();
        let fps = config.fps.to_string();
        let size = format!("{}x{}", config.width, config.height);

        {
            let slot = Arc::clone(&slot);
            let device = device.clone();
            thread::Builder::new()
                .name("ffmpeg".into())
                .spawn(move || {
                    decode_camera(&device, &fps, &size, Arc::clone(&slot));
                    // 调度器退出即视为设备断开
                    slot.close();
                })?;
        }

        Ok(Self { device, slot })
    }
}

impl Camera for FfmpegCamera {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        match self.slot.take_timeout(timeout) {
            SlotRecv::Item(frame) => Ok(frame),
            SlotRecv::Timeout => Err(CameraError::Timeout),
            SlotRecv::Closed => Err(CameraError::Disconnected(format!(
                "FFmpeg 解码结束: {}",
                self.device
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg {}", self.device)
    }
}

/// 摄像头解码实现
fn decode_camera(device: &str, fps: &str, size: &str, slot: Arc<LatestSlot<Frame>>) {
    #[cfg(target_os = "windows")]
    let format = "dshow"; // DirectShow

    #[cfg(target_os = "macos")]
    let format = "avfoundation"; // AVFoundation

    #[cfg(target_os = "linux")]
    let format = "v4l2"; // Video4Linux2

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    let format = "video4linux2";

    info!("🔍 使用格式: {}, 输入: {}", format, device);

    let mut retry_count = 0;
    loop {
        let filter = RgbFilter::new(Arc::clone(&slot));
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("rgb", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let input = Input::new(device)
            .set_format(format)
            .set_input_opts([("framerate", fps), ("video_size", size)].into());

        let ctx = match FfmpegContext::builder().input(input).output(out).build() {
            Ok(c) => c,
            Err(e) => {
                retry_count += 1;
                error!("❌ 摄像头构建错误: {}", e);
                if retry_count >= MAX_OPEN_RETRIES {
                    error!("❌ 摄像头构建失败 (重试{}次)", MAX_OPEN_RETRIES);
                    return;
                }
                warn!(
                    "⚠️ 摄像头忙或无法打开, 1秒后重试... ({}/{})",
                    retry_count, MAX_OPEN_RETRIES
                );
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let sch = match ctx.start() {
            Ok(s) => s,
            Err(e) => {
                error!("❌ 摄像头启动失败: {}", e);
                return;
            }
        };
        info!("✅ 摄像头连接成功, 开始解码");

        let _ = sch.wait();
        info!("📹 摄像头解码循环结束");
        return;
    }
}

/// 解码滤镜: YUV420P → RGB8 帧
struct RgbFilter {
    slot: Arc<LatestSlot<Frame>>,
    next_id: u64,
    dropped: u64,
}

impl RgbFilter {
    fn new(slot: Arc<LatestSlot<Frame>>) -> Self {
        Self {
            slot,
            next_id: 0,
            dropped: 0,
        }
    }
}

impl FrameFilter for RgbFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("✅ 解码滤镜启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        if self.slot.is_closed() {
            return Err("采集已停止".to_string());
        }

        let Some((width, height, pixels)) = (unsafe { rgb_pixels(&frame) }) else {
            self.dropped += 1;
            return Ok(None);
        };
        self.slot.put(Frame {
            id: self.next_id,
            captured_at: Instant::now(),
            pixels,
            width,
            height,
        });
        self.next_id += 1;

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!("✅ 解码滤镜退出 (丢弃损坏帧 {})", self.dropped);
    }
}

/// 取出 YUV420P 三个平面并转换; 空帧、损坏帧或尺寸异常返回 None
unsafe fn rgb_pixels(frame: &AvFrame) -> Option<(u32, u32, Vec<u8>)> {
    if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
        return None;
    }
    let raw = &*frame.as_ptr();
    let (w, h) = (raw.width as usize, raw.height as usize);
    if w == 0 || h == 0 || w > 4096 || h > 4096 {
        return None;
    }
    let (y_stride, uv_stride) = (raw.linesize[0] as usize, raw.linesize[1] as usize);
    if raw.data[0].is_null() || raw.data[1].is_null() || raw.data[2].is_null() {
        return None;
    }
    if y_stride < w || uv_stride < w.div_ceil(2) {
        return None;
    }

    let uv_rows = h.div_ceil(2);
    let y = std::slice::from_raw_parts(raw.data[0], y_stride * h);
    let u = std::slice::from_raw_parts(raw.data[1], uv_stride * uv_rows);
    let v = std::slice::from_raw_parts(raw.data[2], uv_stride * uv_rows);
    let pixels = yuv420p_to_rgb(y, u, v, y_stride, uv_stride, w, h);
    Some((w as u32, h as u32, pixels))
}

/// YUV420P → RGB8 (BT.601 整数近似)
fn yuv420p_to_rgb(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    y_stride: usize,
    uv_stride: usize,
    width: usize,
    height: usize,
) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        let luma = &y_plane[row * y_stride..row * y_stride + width];
        let uv_base = (row / 2) * uv_stride;
        for (col, &l) in luma.iter().enumerate() {
            let l = l as i32;
            let cb = u_plane[uv_base + col / 2] as i32 - 128;
            let cr = v_plane[uv_base + col / 2] as i32 - 128;
            rgb.push((l + ((cr * 179) >> 7)).clamp(0, 255) as u8);
            rgb.push((l - ((cb * 44) >> 7) - ((cr * 91) >> 7)).clamp(0, 255) as u8);
            rgb.push((l + ((cb * 227) >> 7)).clamp(0, 255) as u8);
        }
    }
    rgb
}
