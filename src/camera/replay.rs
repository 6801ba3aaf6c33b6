//! 图片目录回放 (Replay camera)
//!
//! 按文件名顺序读取目录下的图片, 以固定帧率输出, 用于无摄像头时离线调试检测与跟踪。

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::info;

use super::{Camera, Frame};
use crate::error::CameraError;

const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub struct ReplayCamera {
    files: Vec<PathBuf>,
    cursor: usize,
    period: Duration,
    looped: bool,
    next_id: u64,
    next_due: Instant,
}

impl ReplayCamera {
    /// 打开图片目录
    pub fn open(dir: impl AsRef<Path>, fps: f32, looped: bool) -> Result<Self> {
        let dir = dir.as_ref();
        if !fps.is_finite() || fps <= 0.0 {
            bail!("回放帧率必须为正: {}", fps);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("无法读取回放目录 {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            bail!("回放目录中没有图片: {}", dir.display());
        }
        info!("🎞️ 回放 {} 张图片 @ {:.1}fps", files.len(), fps);

        Ok(Self {
            files,
            cursor: 0,
            period: Duration::from_secs_f32(1.0 / fps),
            looped,
            next_id: 0,
            next_due: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Camera for ReplayCamera {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        if self.cursor >= self.files.len() {
            if !self.looped {
                return Err(CameraError::Disconnected("回放结束".into()));
            }
            self.cursor = 0;
        }

        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Err(CameraError::Timeout);
            }
            thread::sleep(wait);
        }

        let path = &self.files[self.cursor];
        let img = image::open(path)
            .map_err(|e| CameraError::Disconnected(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        let (width, height) = img.dimensions();

        let frame = Frame {
            id: self.next_id,
            captured_at: Instant::now(),
            pixels: img.into_raw(),
            width,
            height,
        };
        self.cursor += 1;
        self.next_id += 1;
        self.next_due = Instant::now() + self.period;
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("replay ({} files)", self.files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_images(dir: &Path, n: u32) {
        for i in 0..n {
            let img = image::RgbImage::from_pixel(8, 6, image::Rgb([i as u8, 0, 0]));
            img.save(dir.join(format!("{:03}.png", i))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
    }

    #[test]
    fn test_replay_in_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), 3);

        let mut cam = ReplayCamera::open(dir.path(), 1000.0, false).unwrap();
        assert_eq!(cam.len(), 3);

        for i in 0..3u64 {
            let frame = cam.next_frame(Duration::from_secs(1)).unwrap();
            assert_eq!(frame.id, i);
            assert_eq!((frame.width, frame.height), (8, 6));
            assert_eq!(frame.pixels.len(), 8 * 6 * 3);
            assert_eq!(frame.pixels[0], i as u8);
        }
        assert!(matches!(
            cam.next_frame(Duration::from_secs(1)),
            Err(CameraError::Disconnected(_))
        ));
    }

    #[test]
    fn test_replay_loops() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), 2);

        let mut cam = ReplayCamera::open(dir.path(), 1000.0, true).unwrap();
        let ids: Vec<u8> = (0..5)
            .map(|_| cam.next_frame(Duration::from_secs(1)).unwrap().pixels[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_empty_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReplayCamera::open(dir.path(), 30.0, false).is_err());
    }
}
