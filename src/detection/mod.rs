// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统 (Detection System)
///
/// - types:     边界框/检测/预测数据结构
/// - mask:      分割掩码 → 轮廓
/// - tracker:   目标追踪
/// - selection: 点选解析
pub mod mask;
pub mod selection;
pub mod tracker;
pub mod types;

pub use mask::MaskReconstructor;
pub use tracker::{AnchorRef, Evicted, ObjectTracker, Track, TrackId, TrackerConfig};
pub use types::{Detection, Point2, Prediction, RawDetection, Rect};
