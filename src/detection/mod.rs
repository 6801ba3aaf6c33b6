/// 检测系统 (Detection System)
///
/// 独立工作线程运行推理引擎, 调用方按延迟预算等待结果
/// - InferenceEngine: 推理引擎能力接口
/// - Detector:        限时推理 + 人体/置信度过滤
/// - YoloEngine:      YOLOv8 / YOLOv5 ONNX 模型 (feature `onnx`)
pub mod detector;
pub mod types;

#[cfg(feature = "onnx")]
pub mod yolo;

pub use detector::{filter_detections, Detector, InferenceEngine};
pub use types::{non_max_suppression, BBox, Detection, RawDetection, COCO_NAMES};

#[cfg(feature = "onnx")]
pub use yolo::YoloEngine;
