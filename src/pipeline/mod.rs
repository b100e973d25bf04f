// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 流水线会话 (Pipeline Session)
///
/// 三类线程, 通过 crossbeam channel 通信:
/// - Owner:    唯一持有跟踪器与提交状态的线程, 串行执行所有修改
/// - Detector: 推理 + 后处理 (独立线程)
/// - Upload:   每个上传一个线程, 结果送回 Owner
///
/// 外部只能通过快照 (`snapshot`) 或事件 (`events`) 读取状态.
pub mod detector;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::detection::tracker::{AnchorRef, ObjectTracker, Track, TrackId, TrackerConfig};
use crate::detection::types::Point2;
use crate::error::LensError;
use crate::models::{self, Model, YOLOv8Config, YOLOv8Postprocessor};
use crate::submission::{
    self, AnnotatedAsset, AnnotationService, Completion, SubmissionCoordinator, SubmissionState,
    UploadEvent,
};
use detector::{DetectJob, DetectOutcome, Detector, RunKind, SelectionParams};

/// 帧队列容量, 满时丢弃最旧的帧
const FRAME_QUEUE: usize = 2;
/// 事件队列容量, 满时丢弃事件 (快照仍然最新)
const EVENT_QUEUE: usize = 256;

/// 一帧输入
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    /// 采集时间戳 (秒, 单调递增)
    pub timestamp: f64,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: f64) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
        }
    }
}

/// 状态提示 (可关闭)
#[derive(Clone, Debug, PartialEq)]
pub struct StatusBanner {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusBanner {
    fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// 渲染用: 轨迹 + 提交状态
#[derive(Clone, Debug, PartialEq)]
pub struct TrackView {
    pub track: Track,
    pub state: SubmissionState,
}

/// 线程安全的只读快照
#[derive(Clone, Debug, Default)]
pub struct PipelineSnapshot {
    /// 按 last_seen 升序
    pub tracks: Vec<TrackView>,
    pub banner: Option<StatusBanner>,
    /// 最近一次应用的帧时间戳
    pub last_timestamp: Option<f64>,
}

impl PipelineSnapshot {
    pub fn track(&self, id: &TrackId) -> Option<&TrackView> {
        self.tracks.iter().find(|v| &v.track.id == id)
    }
}

/// 对外事件
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    TracksUpdated(Vec<TrackView>),
    /// 渲染层据此释放锚点
    TrackEvicted {
        id: TrackId,
        anchor: Option<AnchorRef>,
    },
    Annotated {
        id: TrackId,
        asset: Arc<AnnotatedAsset>,
    },
    Status(StatusBanner),
}

enum Command {
    Select {
        frame: Frame,
        point: Option<Point2>,
        generation: u64,
    },
    AttachAnchor {
        id: TrackId,
        anchor: AnchorRef,
    },
    DismissBanner,
    Shutdown,
}

/// 流水线会话
pub struct PipelineSession {
    cmd_tx: Sender<Command>,
    frame_tx: Sender<Frame>,
    /// 队列满时用来挤掉最旧的帧
    frame_rx: Receiver<Frame>,
    event_rx: Receiver<PipelineEvent>,
    snapshot: Arc<Mutex<PipelineSnapshot>>,
    generation: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl PipelineSession {
    /// 加载模型并启动; 模型不可用时失败
    pub fn open(
        config: PipelineConfig,
        model_path: impl AsRef<Path>,
        service: Arc<dyn AnnotationService>,
    ) -> Result<Self, LensError> {
        let model = models::load(model_path, &config)?;
        Self::start(config, model, service)
    }

    pub fn start(
        config: PipelineConfig,
        model: Box<dyn Model>,
        service: Arc<dyn AnnotationService>,
    ) -> Result<Self, LensError> {
        let input = model.input_size();
        if input.width == 0 || input.height == 0 {
            return Err(LensError::ModelUnavailable(format!(
                "model reports an empty input size {}x{}",
                input.width, input.height
            )));
        }

        // 解码按模型实际输入尺寸换算
        let mut pp_config = YOLOv8Config::from_pipeline(&config);
        pp_config.input = input;
        let postprocessor = YOLOv8Postprocessor::new(pp_config);

        let generation = Arc::new(AtomicU64::new(0));
        let snapshot = Arc::new(Mutex::new(PipelineSnapshot::default()));

        let (cmd_tx, cmd_rx) = unbounded::<Command>();
        let (frame_tx, frame_rx) = bounded::<Frame>(FRAME_QUEUE);
        let (event_tx, event_rx) = bounded::<PipelineEvent>(EVENT_QUEUE);
        let (job_tx, job_rx) = bounded::<DetectJob>(1);
        let (result_tx, result_rx) = unbounded::<DetectOutcome>();
        let (upload_tx, upload_rx) = unbounded::<UploadEvent>();

        let detector = Detector::new(
            model,
            postprocessor,
            SelectionParams {
                padding: config.selection_padding,
                min_influence: config.selection_min_influence,
            },
            generation.clone(),
        );
        let detector_handle = std::thread::spawn(move || detector.run(job_rx, result_tx));

        let owner = Owner {
            tracker: ObjectTracker::new(TrackerConfig {
                match_iou_threshold: config.match_iou_threshold,
                expiration_secs: config.expiration_secs,
            }),
            submissions: SubmissionCoordinator::from_config(&config),
            service,
            generation: generation.clone(),
            snapshot: snapshot.clone(),
            event_tx,
            job_tx,
            upload_tx,
            pending_frame: None,
            pending_select: None,
            busy: false,
            last_timestamp: None,
            banner: None,
        };
        let owner_handle =
            std::thread::spawn({
                let frame_rx = frame_rx.clone();
                move || owner.run(cmd_rx, frame_rx, result_rx, upload_rx)
            });

        info!(
            "🚀 流水线启动: 输入 {}x{}, 镜头模式 {}",
            input.width,
            input.height,
            config.lens_mode.as_str()
        );

        Ok(Self {
            cmd_tx,
            frame_tx,
            frame_rx,
            event_rx,
            snapshot,
            generation,
            handles: vec![owner_handle, detector_handle],
        })
    }

    /// 提交连续帧 (不阻塞)
    ///
    /// 队列满时丢弃最旧的帧, 最新帧总能入队. 会话已停止时返回 false.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        if self.handles.is_empty() {
            return false;
        }
        offer_latest(&self.frame_tx, &self.frame_rx, frame)
    }

    /// 单次选择: 取消之前未完成的选择, 重置跟踪器后只保留选中的目标
    pub fn select(&self, frame: Frame, point: Option<Point2>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.cmd_tx.send(Command::Select {
            frame,
            point,
            generation,
        });
    }

    /// 取消进行中的单次选择 (不产生任何状态修改)
    pub fn cancel_selection(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn attach_anchor(&self, id: TrackId, anchor: AnchorRef) {
        let _ = self.cmd_tx.send(Command::AttachAnchor { id, anchor });
    }

    pub fn dismiss_banner(&self) {
        let _ = self.cmd_tx.send(Command::DismissBanner);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        lock(&self.snapshot).clone()
    }

    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.event_rx.clone()
    }

    /// 停止所有线程 (进行中的上传线程自然结束)
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("⚠️ 流水线线程异常退出");
            }
        }
        info!("🛑 流水线已停止");
    }
}

impl Drop for PipelineSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 非阻塞入队; 队列满时先取出最旧的一项再重试
fn offer_latest<T>(tx: &Sender<T>, rx: &Receiver<T>, item: T) -> bool {
    let mut item = item;
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                if rx.try_recv().is_ok() {
                    debug!("⏭️ 帧队列已满, 丢弃最旧的帧");
                }
                item = back;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

fn lock(snapshot: &Mutex<PipelineSnapshot>) -> MutexGuard<'_, PipelineSnapshot> {
    match snapshot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 所有者线程状态
struct Owner {
    tracker: ObjectTracker,
    submissions: SubmissionCoordinator,
    service: Arc<dyn AnnotationService>,
    generation: Arc<AtomicU64>,
    snapshot: Arc<Mutex<PipelineSnapshot>>,
    event_tx: Sender<PipelineEvent>,
    job_tx: Sender<DetectJob>,
    upload_tx: Sender<UploadEvent>,

    /// 最新的未处理帧 (只保留一帧)
    pending_frame: Option<Frame>,
    pending_select: Option<DetectJob>,
    /// 检测线程是否在处理任务
    busy: bool,
    last_timestamp: Option<f64>,
    banner: Option<StatusBanner>,
}

impl Owner {
    fn run(
        mut self,
        cmd_rx: Receiver<Command>,
        frame_rx: Receiver<Frame>,
        result_rx: Receiver<DetectOutcome>,
        upload_rx: Receiver<UploadEvent>,
    ) {
        loop {
            let running = select! {
                recv(cmd_rx) -> msg => match msg {
                    Ok(cmd) => self.on_command(cmd),
                    Err(_) => false,
                },
                recv(frame_rx) -> msg => match msg {
                    Ok(mut frame) => {
                        // 落后时只保留最新帧
                        while let Ok(newer) = frame_rx.try_recv() {
                            frame = newer;
                        }
                        self.pending_frame = Some(frame);
                        true
                    }
                    Err(_) => false,
                },
                recv(result_rx) -> msg => match msg {
                    Ok(outcome) => {
                        self.busy = false;
                        self.on_detected(outcome);
                        true
                    }
                    Err(_) => false,
                },
                recv(upload_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.on_upload(event);
                    }
                    true
                },
            };
            if !running {
                break;
            }
            self.schedule();
        }
    }

    /// 返回 false 表示退出
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Select {
                frame,
                point,
                generation,
            } => {
                // 未发出的旧选择直接替换
                self.pending_select = Some(DetectJob {
                    kind: RunKind::SingleShot { point, generation },
                    frame,
                });
            }
            Command::AttachAnchor { id, anchor } => {
                if self.tracker.attach_anchor(&id, anchor) {
                    self.publish();
                } else {
                    debug!("⚓ 轨迹不存在, 忽略锚点: {id}");
                }
            }
            Command::DismissBanner => {
                self.banner = None;
                self.publish();
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// 检测线程空闲时派发下一个任务 (点选优先)
    fn schedule(&mut self) {
        if self.busy {
            return;
        }
        let job = match (self.pending_select.take(), self.pending_frame.take()) {
            (Some(select), frame) => {
                self.pending_frame = frame;
                select
            }
            (None, Some(frame)) => DetectJob {
                kind: RunKind::Continuous,
                frame,
            },
            (None, None) => return,
        };
        if self.job_tx.send(job).is_ok() {
            self.busy = true;
        }
    }

    fn on_detected(&mut self, outcome: DetectOutcome) {
        let DetectOutcome {
            kind,
            frame,
            result,
        } = outcome;

        // 被取消的选择: 不做任何修改
        if let RunKind::SingleShot { generation, .. } = kind {
            if generation != self.generation.load(Ordering::SeqCst) {
                debug!("🚫 点选已取消, 丢弃结果");
                return;
            }
        }

        let predictions = match result {
            Ok(predictions) => predictions,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                warn!("⚠️ 检测失败 (t={:.3}): {e}", frame.timestamp);
                self.set_banner(e.user_message());
                return;
            }
        };

        let single_shot = matches!(kind, RunKind::SingleShot { .. });
        if !self.in_order(frame.timestamp, single_shot) {
            debug!(
                "⏪ 丢弃乱序结果: t={:.3} ≤ {:.3}",
                frame.timestamp,
                self.last_timestamp.unwrap_or_default()
            );
            return;
        }

        if single_shot {
            self.tracker.reset();
        }
        let tracks = self.tracker.update(&predictions, frame.timestamp);
        self.last_timestamp = Some(frame.timestamp);

        let evicted = self.tracker.drain_evicted();
        for e in &evicted {
            self.submissions.forget(&e.id);
        }

        // 裁剪与编码在上传线程中进行
        for job in self.submissions.plan(&tracks, &frame.image) {
            submission::dispatch(self.service.clone(), job, self.upload_tx.clone());
        }

        // 先刷新快照再发事件, 收到事件时快照已是最新
        let views = self.publish();
        for e in evicted {
            self.emit(PipelineEvent::TrackEvicted {
                id: e.id,
                anchor: e.anchor,
            });
        }
        self.emit(PipelineEvent::TracksUpdated(views));
    }

    /// 连续帧必须严格晚于已应用的帧; 点选允许与最近一帧同时刻
    fn in_order(&self, timestamp: f64, single_shot: bool) -> bool {
        match self.last_timestamp {
            None => true,
            Some(last) if single_shot => timestamp >= last,
            Some(last) => timestamp > last,
        }
    }

    fn on_upload(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Sent { id, ticket } => {
                if self.submissions.mark_sent(&id, ticket) {
                    self.publish();
                }
            }
            UploadEvent::Finished(outcome) => {
                let id = outcome.id;
                match self.submissions.complete(outcome) {
                    Completion::Stored(asset) => {
                        self.publish();
                        self.emit(PipelineEvent::Annotated { id, asset });
                    }
                    Completion::Failed(reason) => self.set_banner(reason),
                    Completion::Ignored => {}
                }
            }
        }
    }

    /// 设置提示并刷新快照
    fn set_banner(&mut self, message: String) {
        let banner = StatusBanner::now(message);
        self.banner = Some(banner.clone());
        self.publish();
        self.emit(PipelineEvent::Status(banner));
    }

    fn emit(&self, event: PipelineEvent) {
        if let Err(TrySendError::Full(_)) = self.event_tx.try_send(event) {
            debug!("⏭️ 事件队列已满, 丢弃事件");
        }
    }

    /// 刷新快照, 返回当前轨迹视图
    fn publish(&self) -> Vec<TrackView> {
        let views: Vec<TrackView> = self
            .tracker
            .tracks()
            .into_iter()
            .map(|track| {
                let state = self.submissions.state(&track.id);
                TrackView { track, state }
            })
            .collect();
        let mut snapshot = lock(&self.snapshot);
        snapshot.tracks = views.clone();
        snapshot.banner = self.banner.clone();
        snapshot.last_timestamp = self.last_timestamp;
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_latest_evicts_oldest() {
        let (tx, rx) = bounded::<u32>(2);
        assert!(offer_latest(&tx, &rx, 1));
        assert!(offer_latest(&tx, &rx, 2));
        assert!(offer_latest(&tx, &rx, 3));
        assert!(offer_latest(&tx, &rx, 4));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_offer_latest_disconnected() {
        let (tx, rx) = bounded::<u32>(1);
        let (_, unrelated) = bounded::<u32>(1);
        drop(rx);
        assert!(!offer_latest(&tx, &unrelated, 1));
    }
}
