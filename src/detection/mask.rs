// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 分割掩码重建 (MaskReconstructor)
//!
//! 掩码系数 · 原型张量 → sigmoid → 二值化 → 轮廓多边形
//!
//! ```text
//! coefs (nm)    protos (nm × ph × pw)
//!      \          /
//!       dot (仅框内像素) → sigmoid → > mask_threshold → GrayImage
//!                                                        ↓
//!                                              find_contours → 最大外轮廓
//! ```

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use ndarray::{ArrayD, ArrayView3, Axis, Ix3};

use super::types::{Point2, Rect};
use crate::error::LensError;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 原型张量中的像素区域 (左上原点)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoRegion {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

pub struct MaskReconstructor {
    threshold: f32,
}

impl MaskReconstructor {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// 接受 (nm, ph, pw) 或 (1, nm, ph, pw) 形状的原型张量
    pub fn proto_view(protos: &ArrayD<f32>) -> Result<ArrayView3<'_, f32>, LensError> {
        let view = match protos.ndim() {
            4 if protos.shape()[0] == 1 => protos.index_axis(Axis(0), 0),
            3 => protos.view(),
            _ => {
                return Err(LensError::InvalidResults(format!(
                    "prototype tensor shape {:?} is not (maskDim, h, w)",
                    protos.shape()
                )))
            }
        };
        view.into_dimensionality::<Ix3>()
            .map_err(|e| LensError::InvalidResults(format!("prototype tensor: {e}")))
    }

    /// 归一化框映射到原型张量像素区域 (裁剪到边界, 至少 1×1)
    pub fn region_for(bbox: &Rect, proto_w: usize, proto_h: usize) -> ProtoRegion {
        let r = bbox.clamped();
        let (pw, ph) = (proto_w as f32, proto_h as f32);

        let x0 = ((r.xmin() * pw).floor() as usize).min(proto_w.saturating_sub(1));
        let x1 = ((r.xmax() * pw).ceil() as usize).clamp(x0 + 1, proto_w.max(x0 + 1));
        // 翻转 y 轴: 左下原点 → 张量行号
        let y0 = (((1.0 - r.ymax()) * ph).floor() as usize).min(proto_h.saturating_sub(1));
        let y1 = (((1.0 - r.ymin()) * ph).ceil() as usize).clamp(y0 + 1, proto_h.max(y0 + 1));

        ProtoRegion {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// 框内二值掩码
    pub fn binary_mask(
        &self,
        coefficients: &[f32],
        protos: &ArrayView3<f32>,
        region: ProtoRegion,
    ) -> Result<GrayImage, LensError> {
        let (nm, ph, pw) = protos.dim();
        if coefficients.len() != nm {
            return Err(LensError::InvalidResults(format!(
                "mask coefficients ({}) do not match prototype channels ({nm})",
                coefficients.len()
            )));
        }
        if region.x + region.width > pw || region.y + region.height > ph {
            return Err(LensError::InvalidResults(format!(
                "mask region {region:?} exceeds prototype {pw}x{ph}"
            )));
        }

        let mut mask = GrayImage::new(region.width as u32, region.height as u32);
        for row in 0..region.height {
            for col in 0..region.width {
                let (py, px) = (region.y + row, region.x + col);
                let mut acc = 0.0f32;
                for (c, coef) in coefficients.iter().enumerate() {
                    acc += coef * protos[[c, py, px]];
                }
                if sigmoid(acc) > self.threshold {
                    mask.put_pixel(col as u32, row as u32, Luma([255u8]));
                }
            }
        }
        Ok(mask)
    }

    /// 重建轮廓 (原型张量像素坐标)
    ///
    /// 找不到轮廓时返回 `Ok(None)`: 无掩码不是错误.
    pub fn reconstruct(
        &self,
        coefficients: &[f32],
        bbox: &Rect,
        protos: &ArrayView3<f32>,
    ) -> Result<Option<Vec<Point2>>, LensError> {
        let (_, ph, pw) = protos.dim();
        if ph == 0 || pw == 0 {
            return Ok(None);
        }
        let region = Self::region_for(bbox, pw, ph);
        let mask = self.binary_mask(coefficients, protos, region)?;
        Ok(largest_outer_contour(&mask).map(|points| {
            points
                .into_iter()
                .map(|(x, y)| Point2::new((x + region.x) as f32, (y + region.y) as f32))
                .collect()
        }))
    }

    /// 原型像素坐标 → 归一化坐标 (左下原点)
    pub fn to_normalized(points: &[Point2], proto_w: usize, proto_h: usize) -> Vec<Point2> {
        let (pw, ph) = (proto_w.max(1) as f32, proto_h.max(1) as f32);
        points
            .iter()
            .map(|p| {
                Point2::new(
                    (p.x / pw).clamp(0.0, 1.0),
                    (1.0 - p.y / ph).clamp(0.0, 1.0),
                )
            })
            .collect()
    }
}

/// 点数最多的外轮廓
fn largest_outer_contour(mask: &GrayImage) -> Option<Vec<(usize, usize)>> {
    find_contours::<u32>(mask)
        .into_iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer) && !c.points.is_empty())
        .max_by_key(|c| c.points.len())
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| (p.x as usize, p.y as usize))
                .collect()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// 单通道原型: 中心 4×4 为正, 其余为负
    fn square_protos() -> Array3<f32> {
        let mut protos = Array3::from_elem((1, 8, 8), -10.0f32);
        for y in 2..6 {
            for x in 2..6 {
                protos[[0, y, x]] = 10.0;
            }
        }
        protos
    }

    #[test]
    fn test_region_minimum_size() {
        let r = MaskReconstructor::region_for(&Rect::new(0.5, 0.5, 0.0, 0.0), 8, 8);
        assert_eq!(r.width, 1);
        assert_eq!(r.height, 1);
        let r = MaskReconstructor::region_for(&Rect::new(1.0, 1.0, 0.0, 0.0), 8, 8);
        assert!(r.x + r.width <= 8 && r.y + r.height <= 8);
    }

    #[test]
    fn test_region_flips_y() {
        // 上半部分 → 张量前几行
        let r = MaskReconstructor::region_for(&Rect::new(0.0, 0.5, 1.0, 0.5), 8, 8);
        assert_eq!(r, ProtoRegion { x: 0, y: 0, width: 8, height: 4 });
    }

    #[test]
    fn test_reconstruct_square() {
        let protos = square_protos();
        let m = MaskReconstructor::new(0.5);
        let contour = m
            .reconstruct(&[1.0], &Rect::new(0.0, 0.0, 1.0, 1.0), &protos.view())
            .unwrap()
            .expect("contour");
        assert!(contour.len() >= 4);
        for p in &contour {
            assert!(p.x >= 2.0 && p.x <= 5.0);
            assert!(p.y >= 2.0 && p.y <= 5.0);
        }
    }

    #[test]
    fn test_no_contour_is_not_error() {
        let protos = square_protos();
        let m = MaskReconstructor::new(0.5);
        // 零系数: sigmoid(0) = 0.5, 没有像素超过阈值
        let contour = m
            .reconstruct(&[0.0], &Rect::new(0.0, 0.0, 1.0, 1.0), &protos.view())
            .unwrap();
        assert!(contour.is_none());
    }

    #[test]
    fn test_coefficient_mismatch() {
        let protos = square_protos();
        let m = MaskReconstructor::new(0.5);
        let r = m.reconstruct(&[1.0, 2.0], &Rect::new(0.0, 0.0, 1.0, 1.0), &protos.view());
        assert!(matches!(r, Err(LensError::InvalidResults(_))));
    }

    #[test]
    fn test_to_normalized() {
        let pts = MaskReconstructor::to_normalized(&[Point2::new(4.0, 2.0)], 8, 8);
        assert_eq!(pts[0], Point2::new(0.5, 0.75));
    }
}
