// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLO ONNX 推理引擎
// 包含: 模型加载、letterbox 预处理、推理、后处理 (v8 / v5 输出布局)

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use ndarray::{Array, ArrayViewD, Ix4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::detector::InferenceEngine;
use super::types::{non_max_suppression, BBox, RawDetection, COCO_NAMES};
use crate::camera::Frame;
use crate::config::DetectionConfig;

/// letterbox 填充灰度
const PAD_VALUE: f32 = 114.0 / 255.0;

/// 引擎内部的最低置信度, 最终阈值由 Detector 边界施加
const MIN_ENGINE_CONF: f32 = 0.1;

/// 模型输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// [1, 4+nc, N]: cx,cy,w,h + 类别分数
    V8,
    /// [1, N, 5+nc]: cx,cy,w,h,objectness + 类别分数
    V5,
}

impl OutputLayout {
    /// 锚点数远大于通道数, 以此区分两种布局
    pub fn detect(shape: &[usize]) -> Result<Self> {
        if shape.len() != 3 || shape[0] != 1 {
            bail!("不支持的输出形状 {:?}", shape);
        }
        if shape[1] < shape[2] {
            if shape[1] <= 4 {
                bail!("输出通道数不足 {:?}", shape);
            }
            Ok(OutputLayout::V8)
        } else {
            if shape[2] <= 5 {
                bail!("输出通道数不足 {:?}", shape);
            }
            Ok(OutputLayout::V5)
        }
    }
}

pub struct YoloEngine {
    session: Session,
    input_name: String,
    input_size: u32,
    iou: f32,
    resizer: fr::Resizer,
}

impl YoloEngine {
    /// 加载 ONNX 模型
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&config.model_path)
            .with_context(|| format!("无法加载模型 {}", config.model_path))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("模型没有输入")?;

        info!(
            "✅ 模型加载完成: {} (输入 {} {}x{})",
            config.model_path, input_name, config.input_size, config.input_size
        );

        Ok(Self {
            session,
            input_name,
            input_size: config.input_size,
            iou: config.iou_threshold,
            resizer: fr::Resizer::new(),
        })
    }

    /// letterbox: 等比缩放后贴到左上角, 其余填充灰色。返回 (张量, 缩放比)
    fn preprocess(&mut self, frame: &Frame) -> Result<(Array<f32, Ix4>, f32)> {
        let size = self.input_size;
        let ratio = (size as f32 / frame.width as f32).min(size as f32 / frame.height as f32);
        let w_new = ((frame.width as f32 * ratio).round() as u32).clamp(1, size);
        let h_new = ((frame.height as f32 * ratio).round() as u32).clamp(1, size);

        let src = fr::images::ImageRef::new(
            frame.width,
            frame.height,
            &frame.pixels,
            fr::PixelType::U8x3,
        )?;
        let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
        self.resizer.resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )?;

        let mut ys = Array::from_elem((1, 3, size as usize, size as usize), PAD_VALUE);
        let (w_new, h_new) = (w_new as usize, h_new as usize);
        for (i, rgb) in dst.buffer().chunks_exact(3).enumerate() {
            let (y, x) = (i / w_new, i % w_new);
            if y >= h_new {
                break;
            }
            ys[[0, 0, y, x]] = rgb[0] as f32 / 255.0;
            ys[[0, 1, y, x]] = rgb[1] as f32 / 255.0;
            ys[[0, 2, y, x]] = rgb[2] as f32 / 255.0;
        }
        Ok((ys, ratio))
    }
}

impl InferenceEngine for YoloEngine {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let t_pre = std::time::Instant::now();
        let (xs, ratio) = self.preprocess(frame)?;
        let pre_ms = t_pre.elapsed().as_secs_f64() * 1000.0;

        let t_run = std::time::Instant::now();
        let input = Tensor::from_array(xs)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input]?)?;
        let preds = outputs[0].try_extract_tensor::<f32>()?;
        let run_ms = t_run.elapsed().as_secs_f64() * 1000.0;

        let mut ys = decode_output(
            preds,
            ratio,
            frame.width as f32,
            frame.height as f32,
            MIN_ENGINE_CONF,
        )?;
        non_max_suppression(&mut ys, self.iou);

        debug!(
            "[Model] 预处理 {:.1}ms | 推理 {:.1}ms | 输出 {} 框",
            pre_ms,
            run_ms,
            ys.len()
        );
        Ok(ys)
    }

    fn name(&self) -> String {
        format!("yolo {}x{}", self.input_size, self.input_size)
    }
}

/// 解码模型输出为帧像素坐标下的检测框 (尚未 NMS)
pub fn decode_output(
    preds: ArrayViewD<'_, f32>,
    ratio: f32,
    width_original: f32,
    height_original: f32,
    conf_threshold: f32,
) -> Result<Vec<RawDetection>> {
    let shape = preds.shape().to_vec();
    let layout = OutputLayout::detect(&shape)?;
    let (anchors, channels) = match layout {
        OutputLayout::V8 => (shape[2], shape[1]),
        OutputLayout::V5 => (shape[1], shape[2]),
    };
    let at = |anchor: usize, channel: usize| match layout {
        OutputLayout::V8 => preds[[0, channel, anchor]],
        OutputLayout::V5 => preds[[0, anchor, channel]],
    };
    let cls_offset = match layout {
        OutputLayout::V8 => 4,
        OutputLayout::V5 => 5,
    };

    let mut ys = Vec::new();
    for i in 0..anchors {
        let objectness = match layout {
            OutputLayout::V8 => 1.0,
            OutputLayout::V5 => at(i, 4),
        };

        let Some((id, score)) = (cls_offset..channels)
            .map(|c| (c - cls_offset, at(i, c)))
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };

        let confidence = objectness * score;
        if !(confidence >= conf_threshold) {
            continue;
        }

        let cx = at(i, 0) / ratio;
        let cy = at(i, 1) / ratio;
        let w = at(i, 2) / ratio;
        let h = at(i, 3) / ratio;
        let bbox = BBox::from_center(cx, cy, w, h).clip(width_original, height_original);
        if !bbox.is_valid() {
            continue;
        }

        let label = COCO_NAMES
            .get(id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("class{}", id));
        ys.push(RawDetection::new(bbox, confidence, label));
    }
    Ok(ys)
}
