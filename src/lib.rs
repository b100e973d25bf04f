#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 配置参数
pub mod detection; // 检测/跟踪/点选
pub mod error; // 错误类型
pub mod models; // 模型接口与后处理
pub mod pipeline; // 流水线会话
pub mod submission; // 标注提交

pub use crate::config::{Args, LensMode, PipelineConfig};
pub use crate::detection::{
    AnchorRef, Detection, ObjectTracker, Point2, Prediction, RawDetection, Rect, Track, TrackId,
};
pub use crate::error::{LensError, NetworkErrorKind};
pub use crate::models::{Model, ModelOutput, YOLOv8Postprocessor};
pub use crate::pipeline::{Frame, PipelineEvent, PipelineSession, PipelineSnapshot};
pub use crate::submission::{AnnotationService, SubmissionCoordinator, SubmissionState};

/// 贪心 NMS
///
/// 按置信度稳定降序排序 (同分保持原顺序), 依次保留最高者并剔除与其 IOU ≥ 阈值的框,
/// 直到没有剩余或达到 `max_detections`.
pub fn non_max_suppression(
    mut xs: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(max_detections.min(xs.len()));
    for x in xs {
        if kept.len() >= max_detections {
            break;
        }
        let drop = kept
            .iter()
            .any(|k| k.bbox.iou(&x.bbox) >= iou_threshold);
        if !drop {
            kept.push(x);
        }
    }
    kept
}
