// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测器 (Detector)
/// 职责: 接收 DetectJob → 推理 + 后处理 (+ 点选) → 返回 DetectOutcome
///
/// 运行在独立线程, 不接触跟踪器/提交状态.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use super::Frame;
use crate::detection::mask::MaskReconstructor;
use crate::detection::selection;
use crate::detection::types::{Point2, Prediction};
use crate::error::LensError;
use crate::models::{Model, YOLOv8Postprocessor};

/// 运行类型
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunKind {
    /// 连续帧
    Continuous,
    /// 单次选择 (点选), 携带代号用于取消
    SingleShot {
        point: Option<Point2>,
        generation: u64,
    },
}

#[derive(Clone, Debug)]
pub struct DetectJob {
    pub kind: RunKind,
    pub frame: Frame,
}

#[derive(Debug)]
pub struct DetectOutcome {
    pub kind: RunKind,
    pub frame: Frame,
    pub result: Result<Vec<Prediction>, LensError>,
}

/// 单次选择的稳定化参数
#[derive(Clone, Copy, Debug)]
pub struct SelectionParams {
    pub padding: f32,
    pub min_influence: f32,
}

pub struct Detector {
    model: Box<dyn Model>,
    postprocessor: YOLOv8Postprocessor,
    selection: SelectionParams,
    /// 当前单次选择代号 (会话共享)
    generation: Arc<AtomicU64>,

    // 统计
    count: u64,
    last: Instant,
    current_fps: f64,
}

impl Detector {
    pub fn new(
        model: Box<dyn Model>,
        postprocessor: YOLOv8Postprocessor,
        selection: SelectionParams,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            model,
            postprocessor,
            selection,
            generation,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    /// 线程主循环, job channel 关闭时退出
    pub fn run(mut self, jobs: Receiver<DetectJob>, results: Sender<DetectOutcome>) {
        info!("🔍 检测线程启动: {}", self.model.summary());

        for job in jobs {
            let result = if self.is_cancelled(&job.kind) {
                Err(LensError::Cancelled)
            } else {
                self.detect(&job)
            };
            self.tick();

            let outcome = DetectOutcome {
                kind: job.kind,
                frame: job.frame,
                result,
            };
            if results.send(outcome).is_err() {
                break;
            }
        }

        info!("🔍 检测线程退出");
    }

    fn is_cancelled(&self, kind: &RunKind) -> bool {
        match kind {
            RunKind::SingleShot { generation, .. } => {
                *generation != self.generation.load(Ordering::SeqCst)
            }
            RunKind::Continuous => false,
        }
    }

    fn detect(&mut self, job: &DetectJob) -> Result<Vec<Prediction>, LensError> {
        let output = self.model.run(&job.frame.image)?;
        // 推理期间可能已被新的点选取代
        if self.is_cancelled(&job.kind) {
            return Err(LensError::Cancelled);
        }

        let detections = self.postprocessor.postprocess(&output)?;

        let point = match job.kind {
            RunKind::Continuous => {
                return Ok(detections.into_iter().map(|d| d.prediction).collect());
            }
            RunKind::SingleShot { point, .. } => point,
        };

        // 点选: 选出一个 → 稳定化选框 → 在新区域内重建轮廓
        let predictions: Vec<Prediction> =
            detections.iter().map(|d| d.prediction.clone()).collect();
        let Some(chosen) = selection::resolve(point, &predictions) else {
            return Ok(Vec::new());
        };
        let Some(index) = predictions.iter().position(|p| std::ptr::eq(p, chosen)) else {
            return Ok(Vec::new());
        };

        let region = selection::stabilize(
            &chosen.bbox,
            point,
            self.selection.padding,
            self.selection.min_influence,
        );

        let contour = match (&output.protos, self.postprocessor.is_segmentation()) {
            (Some(protos), true) => {
                let protos = MaskReconstructor::proto_view(protos)?;
                self.postprocessor
                    .contour_for(&detections[index].raw, &region, &protos)
            }
            _ => None,
        }
        .or_else(|| chosen.contour.clone());

        debug!(
            "👆 点选: {} ({:.2}) 候选{}个",
            chosen.label,
            chosen.confidence,
            predictions.len()
        );
        Ok(vec![
            Prediction::new(chosen.label.clone(), chosen.confidence, region).with_contour(contour)
        ])
    }

    fn tick(&mut self) {
        self.count += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.current_fps = self.count as f64 / elapsed;
            self.count = 0;
            self.last = Instant::now();
            debug!("⚡ 检测 FPS: {:.1}", self.current_fps);
        }
    }
}
