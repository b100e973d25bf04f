// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 点选解析 (tap-to-inspect)

use super::types::{Point2, Prediction, Rect};

/// 从候选中选出一个预测
///
/// - 无点击点: 置信度最高者
/// - 有点击点: 包含该点的预测中置信度最高者;
///   都不包含时取中心最近者 (平方距离), 距离相同取置信度高者
pub fn resolve<'a>(point: Option<Point2>, predictions: &'a [Prediction]) -> Option<&'a Prediction> {
    let Some(point) = point else {
        return highest_confidence(predictions.iter());
    };

    let containing = predictions.iter().filter(|p| p.bbox.contains(&point));
    if let Some(best) = highest_confidence(containing) {
        return Some(best);
    }

    let mut best: Option<(&Prediction, f32)> = None;
    for p in predictions {
        let d = p.bbox.center().distance_sq(&point);
        best = match best {
            Some((b, bd)) if bd < d || (bd == d && b.confidence >= p.confidence) => Some((b, bd)),
            _ => Some((p, d)),
        };
    }
    best.map(|(p, _)| p)
}

/// 置信度最高者 (相同时取先出现的)
fn highest_confidence<'a>(it: impl Iterator<Item = &'a Prediction>) -> Option<&'a Prediction> {
    it.fold(None, |best: Option<&Prediction>, p| match best {
        Some(b) if b.confidence >= p.confidence => Some(b),
        _ => Some(p),
    })
}

/// 稳定选中框
///
/// 按自身尺寸外扩 `padding`, 再与以点击点为中心、边长 `min_influence` 的正方形取并集,
/// 最后裁剪到单位正方形.
pub fn stabilize(bbox: &Rect, tap: Option<Point2>, padding: f32, min_influence: f32) -> Rect {
    let padded = bbox.padded(padding);
    let region = match tap {
        Some(tap) => padded.union(&Rect::square_around(tap, min_influence)),
        None => padded,
    };
    region.clamped()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preds() -> Vec<Prediction> {
        vec![
            Prediction::new("a", 0.5, Rect::new(0.1, 0.1, 0.2, 0.2)),
            Prediction::new("b", 0.9, Rect::new(0.5, 0.5, 0.2, 0.2)),
        ]
    }

    #[test]
    fn test_no_point_highest_confidence() {
        let ps = preds();
        assert_eq!(resolve(None, &ps).unwrap().label, "b");
        assert!(resolve(None, &[]).is_none());
        assert!(resolve(Some(Point2::new(0.5, 0.5)), &[]).is_none());
    }

    #[test]
    fn test_containment_beats_confidence() {
        let ps = preds();
        assert_eq!(resolve(Some(Point2::new(0.15, 0.15)), &ps).unwrap().label, "a");
    }

    #[test]
    fn test_nearest_center_when_outside() {
        let ps = preds();
        // b 的中心 (0.6, 0.6) 更近
        assert_eq!(resolve(Some(Point2::new(0.9, 0.9)), &ps).unwrap().label, "b");
        // a 的中心 (0.2, 0.2) 更近
        assert_eq!(resolve(Some(Point2::new(0.0, 0.05)), &ps).unwrap().label, "a");
    }

    #[test]
    fn test_equal_distance_prefers_confidence() {
        let ps = vec![
            Prediction::new("low", 0.3, Rect::new(0.0, 0.0, 0.5, 0.5)),
            Prediction::new("high", 0.8, Rect::new(0.5, 0.0, 0.5, 0.5)),
        ];
        // 两中心 (0.25,0.25) 与 (0.75,0.25) 到 (0.5,0.75) 等距
        assert_eq!(resolve(Some(Point2::new(0.5, 0.75)), &ps).unwrap().label, "high");
    }

    #[test]
    fn test_stabilize_union_and_clamp() {
        let b = Rect::new(0.45, 0.45, 0.1, 0.1);
        let r = stabilize(&b, Some(Point2::new(0.5, 0.5)), 0.15, 0.2);
        // 点击影响区 0.2 大于外扩后的框
        assert!((r.x - 0.4).abs() < 1e-5);
        assert!((r.width - 0.2).abs() < 1e-5);

        let edge = stabilize(&Rect::new(0.9, 0.9, 0.1, 0.1), Some(Point2::new(0.95, 0.95)), 0.15, 0.2);
        assert!(edge.xmax() <= 1.0 + 1e-6 && edge.ymax() <= 1.0 + 1e-6);
        assert!((edge.x - 0.85).abs() < 1e-5);
    }
}
