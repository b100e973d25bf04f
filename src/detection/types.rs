// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测系统数据结构定义
//! Data structures shared by decode, suppression, tracking and submission
//!
//! 坐标约定: 所有边界框归一化到 [0,1]×[0,1], 原点在画面左下角.

use serde::{Deserialize, Serialize};

// ========== 基础几何 ==========

/// 二维点 (归一化坐标或原型张量像素坐标,由上下文决定)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// 平方欧氏距离
    pub fn distance_sq(&self, other: &Point2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// 归一化边界框 (原点左下角)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 由两个角点构造 (自动排序)
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        let (l, r) = if x0 <= x1 { (x0, x1) } else { (x1, x0) };
        let (b, t) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
        Self::new(l, b, r - l, t - b)
    }

    pub fn xmin(&self) -> f32 {
        self.x
    }

    pub fn ymin(&self) -> f32 {
        self.y
    }

    pub fn xmax(&self) -> f32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point2 {
        Point2::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// 宽或高不为正
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// 点是否在框内 (含边界)
    pub fn contains(&self, p: &Point2) -> bool {
        p.x >= self.xmin() && p.x <= self.xmax() && p.y >= self.ymin() && p.y <= self.ymax()
    }

    /// 裁剪到单位正方形
    ///
    /// 幂等; 完全落在单位正方形外的框会退化为贴在最近边上的零面积框.
    pub fn clamped(&self) -> Rect {
        if self.is_within_unit() {
            return *self;
        }
        let x0 = self.xmin().clamp(0.0, 1.0);
        let x1 = self.xmax().clamp(0.0, 1.0);
        let y0 = self.ymin().clamp(0.0, 1.0);
        let y1 = self.ymax().clamp(0.0, 1.0);
        Rect::new(x0, y0, (x1 - x0).max(0.0), (y1 - y0).max(0.0))
    }

    /// 已位于单位正方形内 (容忍浮点舍入误差)
    fn is_within_unit(&self) -> bool {
        const EPS: f32 = 1e-6;
        self.x >= 0.0
            && self.y >= 0.0
            && self.width >= 0.0
            && self.height >= 0.0
            && self.xmax() <= 1.0 + EPS
            && self.ymax() <= 1.0 + EPS
    }

    pub fn intersection_area(&self, another: &Rect) -> f32 {
        let l = self.xmin().max(another.xmin());
        let r = self.xmax().min(another.xmax());
        let b = self.ymin().max(another.ymin());
        let t = self.ymax().min(another.ymax());
        (r - l).max(0.0) * (t - b).max(0.0)
    }

    pub fn union_area(&self, another: &Rect) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// Intersection over Union
    pub fn iou(&self, another: &Rect) -> f32 {
        let union = self.union_area(another);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection_area(another) / union
    }

    /// 同时包含两个框的最小框
    pub fn union(&self, another: &Rect) -> Rect {
        Rect::from_corners(
            self.xmin().min(another.xmin()),
            self.ymin().min(another.ymin()),
            self.xmax().max(another.xmax()),
            self.ymax().max(another.ymax()),
        )
    }

    /// 按自身尺寸的比例向外扩展
    pub fn padded(&self, fraction: f32) -> Rect {
        let dx = self.width * fraction;
        let dy = self.height * fraction;
        Rect::new(
            self.x - dx,
            self.y - dy,
            self.width + 2.0 * dx,
            self.height + 2.0 * dy,
        )
    }

    /// 以某点为中心的正方形
    pub fn square_around(center: Point2, side: f32) -> Rect {
        Rect::new(center.x - side / 2.0, center.y - side / 2.0, side, side)
    }

    /// 转换到左上角原点的像素矩形 `(x, y, w, h)`
    ///
    /// 先裁剪到单位正方形,再取整到像素网格.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let r = self.clamped();
        let (w, h) = (width as f32, height as f32);
        let x0 = (r.xmin() * w).floor() as u32;
        let x1 = ((r.xmax() * w).ceil() as u32).min(width);
        // 翻转 y 轴: 左下原点 → 左上原点
        let y0 = ((1.0 - r.ymax()) * h).floor() as u32;
        let y1 = (((1.0 - r.ymin()) * h).ceil() as u32).min(height);
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

// ========== 检测结果 ==========

/// 解码器输出的原始检测 (NMS 之前)
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_index: usize,
    pub confidence: f32,
    pub bbox: Rect,
    /// 分割掩码系数 (仅分割模型)
    pub mask_coefficients: Option<Vec<f32>>,
}

/// 抑制后的检测结果 (无身份)
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    pub bbox: Rect,
    /// 归一化坐标下的轮廓多边形
    pub contour: Option<Vec<Point2>>,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: Rect) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: bbox.clamped(),
            contour: None,
        }
    }

    pub fn with_contour(mut self, contour: Option<Vec<Point2>>) -> Self {
        self.contour = contour;
        self
    }
}

/// 一次检测: 原始解码结果 + 对外暴露的预测
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub raw: RawDetection,
    pub prediction: Prediction,
}
