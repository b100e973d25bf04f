// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 后处理 (检测 + 分割)
// 原始张量 → 候选框 → NMS → 掩码轮廓

use ndarray::{s, ArrayD, ArrayView2, Axis, Ix2};
use tracing::debug;

use super::ModelOutput;
use crate::config::{InputSize, PipelineConfig};
use crate::detection::mask::{sigmoid, MaskReconstructor};
use crate::detection::types::{Detection, Prediction, RawDetection, Rect};
use crate::error::LensError;
use crate::non_max_suppression;

const CXYWH_OFFSET: usize = 4;

/// YOLOv8 后处理配置
#[derive(Clone, Debug)]
pub struct YOLOv8Config {
    pub nc: usize,
    pub nm: usize,
    pub conf: f32,
    pub iou: f32,
    pub max_det: usize,
    pub mask_threshold: f32,
    pub input: InputSize,
    pub names: Vec<String>,
}

impl YOLOv8Config {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            nc: config.num_classes,
            nm: config.mask_dim,
            conf: config.conf_threshold,
            iou: config.iou_threshold,
            max_det: config.max_detections,
            mask_threshold: config.mask_threshold,
            input: config.model_input,
            names: config.class_names.clone(),
        }
    }

    /// 张量通道数: 4 + nc + nm
    pub fn channels(&self) -> usize {
        CXYWH_OFFSET + self.nc + self.nm
    }
}

/// YOLOv8 后处理器
pub struct YOLOv8Postprocessor {
    config: YOLOv8Config,
    masks: MaskReconstructor,
}

impl YOLOv8Postprocessor {
    pub fn new(config: YOLOv8Config) -> Self {
        let masks = MaskReconstructor::new(config.mask_threshold);
        Self { config, masks }
    }

    pub fn is_segmentation(&self) -> bool {
        self.config.nm > 0
    }

    /// 接受 (channels, anchors) 或 (1, channels, anchors)
    fn preds_view<'a>(&self, preds: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>, LensError> {
        let view = match preds.ndim() {
            3 if preds.shape()[0] == 1 => preds.index_axis(Axis(0), 0),
            2 => preds.view(),
            _ => {
                return Err(LensError::InvalidResults(format!(
                    "output shape {:?} is not (channels, anchors)",
                    preds.shape()
                )))
            }
        };
        let view = view
            .into_dimensionality::<Ix2>()
            .map_err(|e| LensError::InvalidResults(format!("output tensor: {e}")))?;
        if view.nrows() != self.config.channels() {
            return Err(LensError::InvalidResults(format!(
                "expected {} channels (4 + {} classes + {} mask), got {}",
                self.config.channels(),
                self.config.nc,
                self.config.nm,
                view.nrows()
            )));
        }
        Ok(view)
    }

    /// 解码: 原始张量 → 候选检测 (按 anchor 顺序)
    pub fn decode(&self, preds: &ArrayD<f32>) -> Result<Vec<RawDetection>, LensError> {
        let preds = self.preds_view(preds)?;
        let nc = self.config.nc;
        let nm = self.config.nm;
        let in_w = self.config.input.width as f32;
        let in_h = self.config.input.height as f32;

        let mut ys = Vec::new();
        for pred in preds.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

            // 类别 logits → sigmoid, 取最大
            let Some((class_index, confidence)) = clss
                .iter()
                .map(|&logit| sigmoid(logit))
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };

            if !(confidence >= self.config.conf) {
                continue;
            }

            // 中心点 + 宽高 (输入像素) → 归一化, 左下原点
            let (cx, cy, w, h) = (bbox[0], bbox[1], bbox[2], bbox[3]);
            let x = (cx - w / 2.0) / in_w;
            let y = 1.0 - (cy + h / 2.0) / in_h;
            let rect = Rect::new(x, y, w / in_w, h / in_h).clamped();
            if rect.is_degenerate() {
                continue;
            }

            let mask_coefficients = if nm > 0 {
                Some(pred.slice(s![CXYWH_OFFSET + nc..]).to_vec())
            } else {
                None
            };

            ys.push(RawDetection {
                class_index,
                confidence: confidence.clamp(0.0, 1.0),
                bbox: rect,
                mask_coefficients,
            });
        }
        Ok(ys)
    }

    /// 后处理: 解码 → NMS → 掩码轮廓
    ///
    /// 掩码重建失败只影响该检测的轮廓, 不影响整帧.
    pub fn postprocess(&self, output: &ModelOutput) -> Result<Vec<Detection>, LensError> {
        let candidates = self.decode(&output.preds)?;
        let n_candidates = candidates.len();
        let kept = non_max_suppression(candidates, self.config.iou, self.config.max_det);

        let protos = match (&output.protos, self.is_segmentation()) {
            (Some(protos), true) => Some(MaskReconstructor::proto_view(protos)?),
            _ => None,
        };

        let ys: Vec<Detection> = kept
            .into_iter()
            .map(|raw| {
                let contour = protos
                    .as_ref()
                    .and_then(|protos| self.contour_for(&raw, &raw.bbox, protos));
                let label = self.label_for(raw.class_index);
                let prediction =
                    Prediction::new(label, raw.confidence, raw.bbox).with_contour(contour);
                Detection { raw, prediction }
            })
            .collect();

        debug!("🔍 解码: 候选{}个 → NMS后{}个", n_candidates, ys.len());
        Ok(ys)
    }

    /// 在指定区域内重建轮廓 (归一化坐标)
    pub fn contour_for(
        &self,
        raw: &RawDetection,
        region: &Rect,
        protos: &ndarray::ArrayView3<f32>,
    ) -> Option<Vec<crate::detection::types::Point2>> {
        let coefs = raw.mask_coefficients.as_ref()?;
        let (_, ph, pw) = protos.dim();
        match self.masks.reconstruct(coefs, region, protos) {
            Ok(Some(points)) => Some(MaskReconstructor::to_normalized(&points, pw, ph)),
            Ok(None) => None,
            Err(e) => {
                debug!("⚠️ 掩码重建失败: {e}");
                None
            }
        }
    }

    pub fn label_for(&self, class_index: usize) -> String {
        self.config
            .names
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| "object".to_string())
    }
}
