// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 集成测试公共部分: 脚本化的假模型与假标注服务
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use image::{Rgb, RgbImage};
use ndarray::Array2;

use lens_rs::config::InputSize;
use lens_rs::detection::Rect;
use lens_rs::models::{Model, ModelOutput};
use lens_rs::pipeline::{Frame, PipelineEvent};
use lens_rs::submission::{AnnotatedAsset, AnnotationService, UploadRequest};
use lens_rs::{LensError, PipelineConfig};

pub const INPUT: u32 = 64;
pub const WAIT: Duration = Duration::from_secs(5);

/// 测试用配置: 2 类, 无分割, 64×64 输入
pub fn config() -> PipelineConfig {
    PipelineConfig {
        num_classes: 2,
        mask_dim: 0,
        class_names: vec!["cup".into(), "bottle".into()],
        model_input: InputSize {
            width: INPUT,
            height: INPUT,
        },
        ..PipelineConfig::default()
    }
}

/// 帧的 (0, 0) 像素红色通道作为脚本编号
pub fn frame(marker: u8, timestamp: f64) -> Frame {
    Frame::new(
        RgbImage::from_pixel(INPUT, INPUT, Rgb([marker, 90, 90])),
        timestamp,
    )
}

/// 一个脚本化的检测框: 归一化框 + 类别 + logit
#[derive(Clone, Copy, Debug)]
pub struct Scripted {
    pub bbox: Rect,
    pub class_index: usize,
    pub logit: f32,
}

pub fn cup(bbox: Rect, logit: f32) -> Scripted {
    Scripted {
        bbox,
        class_index: 0,
        logit,
    }
}

pub fn bottle(bbox: Rect, logit: f32) -> Scripted {
    Scripted {
        bbox,
        class_index: 1,
        logit,
    }
}

#[derive(Clone, Debug)]
enum Script {
    Boxes(Vec<Scripted>),
    BadShape,
}

/// 按帧编号输出预设张量的模型
#[derive(Default)]
pub struct FakeModel {
    scripts: HashMap<u8, Script>,
    /// 这些编号的帧在推理中阻塞, 直到收到放行信号
    gated: HashMap<u8, (Sender<()>, Receiver<()>)>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, marker: u8, boxes: Vec<Scripted>) -> Self {
        self.scripts.insert(marker, Script::Boxes(boxes));
        self
    }

    pub fn bad_shape(mut self, marker: u8) -> Self {
        self.scripts.insert(marker, Script::BadShape);
        self
    }

    /// 阻塞编号为 `marker` 的帧: 开始推理时向 `started` 发信号, 等待 `release`
    pub fn gate(mut self, marker: u8, started: Sender<()>, release: Receiver<()>) -> Self {
        self.gated.insert(marker, (started, release));
        self
    }

    fn tensor(boxes: &[Scripted]) -> Array2<f32> {
        let size = INPUT as f32;
        let mut t = Array2::<f32>::from_elem((6, boxes.len()), -20.0);
        for (i, b) in boxes.iter().enumerate() {
            let r = b.bbox;
            t[[0, i]] = (r.x + r.width / 2.0) * size;
            t[[1, i]] = (1.0 - (r.y + r.height / 2.0)) * size;
            t[[2, i]] = r.width * size;
            t[[3, i]] = r.height * size;
            t[[4 + b.class_index, i]] = b.logit;
        }
        t
    }
}

impl Model for FakeModel {
    fn run(&mut self, image: &RgbImage) -> Result<ModelOutput, LensError> {
        let marker = image.get_pixel(0, 0)[0];
        if let Some((started, release)) = self.gated.get(&marker) {
            let _ = started.send(());
            let _ = release.recv_timeout(WAIT);
        }
        let preds = match self.scripts.get(&marker) {
            Some(Script::Boxes(boxes)) => Self::tensor(boxes),
            Some(Script::BadShape) => Array2::<f32>::zeros((3, 1)),
            None => Self::tensor(&[]),
        };
        Ok(ModelOutput {
            preds: preds.into_dyn(),
            protos: None,
        })
    }

    fn input_size(&self) -> InputSize {
        InputSize {
            width: INPUT,
            height: INPUT,
        }
    }
}

/// 记录调用次数的标注服务
#[derive(Default)]
pub struct FakeService {
    pub calls: AtomicUsize,
    fail: Option<LensError>,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl FakeService {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing(err: LensError) -> Self {
        Self {
            fail: Some(err),
            ..Self::default()
        }
    }

    /// 每次上传开始时发信号, 并等待放行
    pub fn gated(started: Sender<()>, release: Receiver<()>) -> Self {
        Self {
            gate: Some((started, release)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AnnotationService for FakeService {
    fn submit(&self, request: &UploadRequest) -> Result<AnnotatedAsset, LensError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = &self.gate {
            let _ = started.send(());
            let _ = release.recv_timeout(WAIT);
        }
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        Ok(AnnotatedAsset {
            image: request.client_object_id.as_bytes().to_vec(),
            message: Some(format!("annotated {}", request.label)),
            equation: None,
            explanation: None,
        })
    }
}

/// 等待第一个满足条件的事件
pub fn wait_for<F>(events: &Receiver<PipelineEvent>, mut pred: F) -> Option<PipelineEvent>
where
    F: FnMut(&PipelineEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

pub fn tracks_updated(events: &Receiver<PipelineEvent>) -> Vec<lens_rs::pipeline::TrackView> {
    match wait_for(events, |e| matches!(e, PipelineEvent::TracksUpdated(_))) {
        Some(PipelineEvent::TracksUpdated(views)) => views,
        other => panic!("no TracksUpdated event: {other:?}"),
    }
}

/// 在 `window` 内收集所有事件
pub fn drain_for(events: &Receiver<PipelineEvent>, window: Duration) -> Vec<PipelineEvent> {
    let deadline = Instant::now() + window;
    let mut ys = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => ys.push(event),
            Err(_) => break,
        }
    }
    ys
}

/// 轮询快照直到条件成立
pub fn poll<T, F>(mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(v) = check() {
            return Some(v);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}
