//! 检测数据结构 (Detection data types)

// ========== 公共常量 ==========

/// COCO 80 类名称, 索引 0 为 person
pub const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

// ========== 数据结构 ==========

/// 检测框, 帧像素坐标 (x1,y1 左上; x2,y2 右下)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 以中心点和宽高构造
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// 坐标有限且宽高为正
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// 裁剪到帧范围内
    pub fn clip(&self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let l = self.x1.max(other.x1);
        let r = self.x2.min(other.x2);
        let t = self.y1.max(other.y1);
        let b = self.y2.min(other.y2);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    /// 交并比 (IoU)
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// 推理引擎原始输出 (bbox, confidence, classLabel)
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: BBox,
    pub confidence: f32,
    pub label: String,
}

impl RawDetection {
    pub fn new(bbox: BBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }
}

/// 通过 Detector 过滤后的人体检测
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }
}

// ========== 非极大值抑制 ==========

/// 按置信度降序, 去除与已保留框 IoU 超过阈值的框 (原地)
pub fn non_max_suppression(xs: &mut Vec<RawDetection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            // 不同类别互不抑制
            if xs[prev_index].label != xs[index].label {
                continue;
            }
            if xs[prev_index].bbox.iou(&xs[index].bbox) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bbox_geometry() {
        let b = BBox::from_center(100.0, 50.0, 40.0, 20.0);
        assert_eq!(b.center(), (100.0, 50.0));
        assert_relative_eq!(b.area(), 800.0);
        assert!(b.is_valid());
        assert!(!BBox::new(10.0, 10.0, 10.0, 20.0).is_valid());
        assert!(!BBox::new(f32::NAN, 0.0, 10.0, 10.0).is_valid());
    }

    #[test]
    fn test_bbox_clip() {
        let b = BBox::new(-10.0, 5.0, 700.0, 500.0).clip(640.0, 480.0);
        assert_eq!(b, BBox::new(0.0, 5.0, 640.0, 480.0));
    }

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert_relative_eq!(a.iou(&b), 50.0 / 150.0, epsilon = 1e-6);
        assert_relative_eq!(a.iou(&a), 1.0);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let mut xs = vec![
            RawDetection::new(BBox::new(0.0, 0.0, 100.0, 100.0), 0.6, "person"),
            RawDetection::new(BBox::new(2.0, 2.0, 102.0, 102.0), 0.9, "person"),
            RawDetection::new(BBox::new(300.0, 300.0, 350.0, 400.0), 0.7, "person"),
            RawDetection::new(BBox::new(1.0, 1.0, 101.0, 101.0), 0.8, "dog"),
        ];
        non_max_suppression(&mut xs, 0.45);

        assert_eq!(xs.len(), 3);
        assert_eq!(xs[0].confidence, 0.9);
        assert!(xs.iter().any(|d| d.label == "dog"));
        assert!(!xs.iter().any(|d| d.confidence == 0.6));
    }
}
