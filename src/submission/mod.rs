// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 标注提交 (每个轨迹一个状态机)
///
/// ```text
/// idle ──────────→ uploading ──→ awaitingServer ──→ processed
///                     │               │                │
///                     └───────────────┴──→ failed      └─ 漂移 (IOU < 阈值) → 重新提交
///                                          (随时可重试)
/// ```
///
/// 协调器只由流水线所有者线程持有; 上传在独立线程中执行,
/// 结果通过 channel 送回, 按 ticket 过滤过期结果.
pub mod client;
pub mod crop;

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Sender;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::{LensMode, PipelineConfig};
use crate::detection::tracker::{Track, TrackId};
use crate::detection::types::Rect;
use crate::error::LensError;

pub use client::{AnnotatedAsset, AnnotationResponse, HttpAnnotationClient, UploadRequest};

/// 外部标注服务 (注入的能力)
///
/// 在上传线程中调用, 需要 `Send + Sync`.
pub trait AnnotationService: Send + Sync {
    fn submit(&self, request: &UploadRequest) -> Result<AnnotatedAsset, LensError>;
}

impl<S: AnnotationService + ?Sized> AnnotationService for Arc<S> {
    fn submit(&self, request: &UploadRequest) -> Result<AnnotatedAsset, LensError> {
        (**self).submit(request)
    }
}

/// 提交状态
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SubmissionState {
    #[default]
    Idle,
    Uploading,
    AwaitingServer,
    Processed,
    Failed(String),
}

impl SubmissionState {
    /// 上传中, 阻止重复提交
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SubmissionState::Uploading | SubmissionState::AwaitingServer)
    }
}

/// 每个轨迹的附加状态
#[derive(Clone, Debug, Default)]
pub struct ObjectState {
    pub state: SubmissionState,
    /// 最近一次实际提交的框 (用于漂移判断)
    pub last_submitted_box: Option<Rect>,
    pub last_asset: Option<Arc<AnnotatedAsset>>,
    ticket: u64,
}

/// 一次待执行的上传
///
/// 只携带帧的共享引用与提交框, 裁剪与编码在上传线程中完成.
#[derive(Clone, Debug)]
pub struct UploadJob {
    pub id: TrackId,
    pub ticket: u64,
    pub frame: Arc<RgbImage>,
    pub bbox: Rect,
    pub label: String,
    pub confidence: f32,
    pub lens_mode: LensMode,
    pub jpeg_quality: u8,
}

impl UploadJob {
    /// 裁剪 → JPEG → base64, 生成上传载荷
    pub fn request(&self) -> Result<UploadRequest, LensError> {
        let image_base64 = crop::encode_region(&self.frame, &self.bbox, self.jpeg_quality)?;
        Ok(UploadRequest {
            client_object_id: self.id.to_string(),
            lens_mode: self.lens_mode,
            label: self.label.clone(),
            confidence: self.confidence,
            bounding_box: self.bbox,
            image_base64,
        })
    }
}

/// 上传线程 → 所有者线程
#[derive(Clone, Debug)]
pub enum UploadEvent {
    /// 请求已发出, 等待服务端
    Sent { id: TrackId, ticket: u64 },
    Finished(UploadOutcome),
}

#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub id: TrackId,
    pub ticket: u64,
    pub result: Result<AnnotatedAsset, LensError>,
}

/// `complete` 的结果
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Stored(Arc<AnnotatedAsset>),
    Failed(String),
    /// 轨迹已删除, ticket 过期或被取消
    Ignored,
}

/// 提交协调器
pub struct SubmissionCoordinator {
    states: HashMap<TrackId, ObjectState>,
    drift_iou_threshold: f32,
    lens_mode: LensMode,
    jpeg_quality: u8,
    next_ticket: u64,
}

impl SubmissionCoordinator {
    pub fn new(drift_iou_threshold: f32, lens_mode: LensMode, jpeg_quality: u8) -> Self {
        Self {
            states: HashMap::new(),
            drift_iou_threshold,
            lens_mode,
            jpeg_quality,
            next_ticket: 1,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.drift_iou_threshold,
            config.lens_mode,
            config.jpeg_quality,
        )
    }

    /// 是否需要 (重新) 提交
    ///
    /// - 上传中: 否
    /// - 已处理: 当前框与上次提交框 IOU < 漂移阈值时是
    /// - 空闲/失败: 是
    pub fn should_submit(&self, track: &Track) -> bool {
        let Some(object) = self.states.get(&track.id) else {
            return true;
        };
        match &object.state {
            SubmissionState::Uploading | SubmissionState::AwaitingServer => false,
            SubmissionState::Processed => match &object.last_submitted_box {
                Some(last) => last.iou(&track.bbox) < self.drift_iou_threshold,
                None => true,
            },
            SubmissionState::Idle | SubmissionState::Failed(_) => true,
        }
    }

    /// 评估当前所有轨迹, 为符合条件的生成上传任务
    ///
    /// 只做判断和状态转移 (→ uploading), 不在调用线程中裁剪.
    pub fn plan(&mut self, tracks: &[Track], frame: &Arc<RgbImage>) -> Vec<UploadJob> {
        let mut jobs = Vec::new();
        for track in tracks {
            if !self.should_submit(track) {
                continue;
            }

            let ticket = self.next_ticket;
            self.next_ticket += 1;
            let object = self.states.entry(track.id).or_default();
            object.ticket = ticket;
            object.state = SubmissionState::Uploading;
            object.last_submitted_box = Some(track.bbox);
            jobs.push(UploadJob {
                id: track.id,
                ticket,
                frame: frame.clone(),
                bbox: track.bbox,
                label: track.label.clone(),
                confidence: track.confidence,
                lens_mode: self.lens_mode,
                jpeg_quality: self.jpeg_quality,
            });
        }
        jobs
    }

    /// 请求已发出: uploading → awaitingServer
    pub fn mark_sent(&mut self, id: &TrackId, ticket: u64) -> bool {
        match self.states.get_mut(id) {
            Some(object) if object.ticket == ticket && object.state == SubmissionState::Uploading => {
                object.state = SubmissionState::AwaitingServer;
                true
            }
            _ => false,
        }
    }

    /// 上传完成
    ///
    /// 轨迹已删除或 ticket 不匹配时忽略.
    pub fn complete(&mut self, outcome: UploadOutcome) -> Completion {
        let object = match self.states.get_mut(&outcome.id) {
            Some(object) if object.ticket == outcome.ticket && object.state.is_in_flight() => object,
            _ => {
                debug!("🗑️ 忽略过期上传结果: {}", outcome.id);
                return Completion::Ignored;
            }
        };

        match outcome.result {
            Ok(asset) => {
                let asset = Arc::new(asset);
                object.state = SubmissionState::Processed;
                object.last_asset = Some(asset.clone());
                info!("✅ 标注完成: {}", outcome.id);
                Completion::Stored(asset)
            }
            Err(LensError::Cancelled) => {
                // 不是错误: 回到空闲, 下一轮可再次提交
                object.state = SubmissionState::Idle;
                Completion::Ignored
            }
            Err(e) => {
                warn!("❌ 标注失败 {}: {e}", outcome.id);
                let reason = e.user_message();
                object.state = SubmissionState::Failed(reason.clone());
                Completion::Failed(reason)
            }
        }
    }

    /// 轨迹被删除时销毁其状态
    pub fn forget(&mut self, id: &TrackId) -> Option<ObjectState> {
        self.states.remove(id)
    }

    pub fn object(&self, id: &TrackId) -> Option<&ObjectState> {
        self.states.get(id)
    }

    /// 当前状态, 未提交过的轨迹为 `Idle`
    pub fn state(&self, id: &TrackId) -> SubmissionState {
        self.states
            .get(id)
            .map(|o| o.state.clone())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// 在独立线程中执行上传, 事件送回所有者线程
///
/// 不同轨迹的上传互相独立, 完成顺序不定.
/// 裁剪失败时不访问服务, 直接以 `CropFailure` 结束.
pub fn dispatch(service: Arc<dyn AnnotationService>, job: UploadJob, tx: Sender<UploadEvent>) {
    std::thread::spawn(move || {
        let (id, ticket) = (job.id, job.ticket);
        let request = match job.request() {
            Ok(request) => request,
            Err(e) => {
                debug!("✂️ 裁剪失败 {id}: {e}");
                let _ = tx.send(UploadEvent::Finished(UploadOutcome {
                    id,
                    ticket,
                    result: Err(e),
                }));
                return;
            }
        };
        if tx.send(UploadEvent::Sent { id, ticket }).is_err() {
            // 会话已关闭
            return;
        }
        let result = service.submit(&request);
        let _ = tx.send(UploadEvent::Finished(UploadOutcome { id, ticket, result }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::tracker::{ObjectTracker, TrackerConfig};
    use crate::detection::types::Prediction;
    use crossbeam_channel::unbounded;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn frame() -> Arc<RgbImage> {
        Arc::new(RgbImage::from_pixel(64, 64, Rgb([120, 120, 120])))
    }

    fn track_at(tracker: &mut ObjectTracker, bbox: Rect, t: f64) -> Track {
        tracker.update(&[Prediction::new("cup", 0.9, bbox)], t)[0].clone()
    }

    fn asset() -> AnnotatedAsset {
        AnnotatedAsset {
            image: vec![1, 2, 3],
            message: Some("ok".into()),
            equation: None,
            explanation: None,
        }
    }

    fn coordinator() -> SubmissionCoordinator {
        SubmissionCoordinator::new(0.3, LensMode::Math, 85)
    }

    #[test]
    fn test_plan_and_complete() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let mut sc = coordinator();
        let track = track_at(&mut tracker, Rect::new(0.1, 0.1, 0.4, 0.4), 0.0);

        let jobs = sc.plan(&[track.clone()], &frame());
        assert_eq!(jobs.len(), 1);
        let request = jobs[0].request().unwrap();
        assert_eq!(request.client_object_id, track.id.to_string());
        assert_eq!(request.bounding_box, track.bbox);
        assert_eq!(sc.state(&track.id), SubmissionState::Uploading);

        // 上传中不重复提交
        assert!(sc.plan(&[track.clone()], &frame()).is_empty());

        assert!(sc.mark_sent(&track.id, jobs[0].ticket));
        assert_eq!(sc.state(&track.id), SubmissionState::AwaitingServer);
        assert!(sc.plan(&[track.clone()], &frame()).is_empty());

        let stored = sc.complete(UploadOutcome {
            id: track.id,
            ticket: jobs[0].ticket,
            result: Ok(asset()),
        });
        assert!(matches!(stored, Completion::Stored(_)));
        assert_eq!(sc.state(&track.id), SubmissionState::Processed);
        assert!(sc.object(&track.id).unwrap().last_asset.is_some());

        // 框未变化, 不重新提交
        assert!(sc.plan(&[track], &frame()).is_empty());
    }

    #[test]
    fn test_drift_gating() {
        let mut sc = coordinator();
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let mut track = track_at(&mut tracker, Rect::new(0.0, 0.0, 0.4, 0.3), 0.0);
        let jobs = sc.plan(&[track.clone()], &frame());
        sc.complete(UploadOutcome {
            id: track.id,
            ticket: jobs[0].ticket,
            result: Ok(asset()),
        });

        // 水平平移 0.4/3 → IOU = 0.5
        track.bbox = Rect::new(0.4 / 3.0, 0.0, 0.4, 0.3);
        assert!((track.bbox.iou(&Rect::new(0.0, 0.0, 0.4, 0.3)) - 0.5).abs() < 1e-4);
        assert!(!sc.should_submit(&track));

        // 平移 0.4·9/11 → IOU = 0.1
        track.bbox = Rect::new(0.4 * 9.0 / 11.0, 0.0, 0.4, 0.3);
        assert!((track.bbox.iou(&Rect::new(0.0, 0.0, 0.4, 0.3)) - 0.1).abs() < 1e-4);
        assert!(sc.should_submit(&track));
        let jobs = sc.plan(&[track.clone()], &frame());
        assert_eq!(jobs.len(), 1);
        assert_eq!(sc.object(&track.id).unwrap().last_submitted_box, Some(track.bbox));
    }

    #[test]
    fn test_failure_is_retryable() {
        let mut sc = coordinator();
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let track = track_at(&mut tracker, Rect::new(0.2, 0.2, 0.3, 0.3), 0.0);
        let jobs = sc.plan(&[track.clone()], &frame());
        let done = sc.complete(UploadOutcome {
            id: track.id,
            ticket: jobs[0].ticket,
            result: Err(LensError::network(
                crate::error::NetworkErrorKind::Timeout,
                "timed out",
            )),
        });
        assert_eq!(
            done,
            Completion::Failed("The server took too long to respond.".into())
        );
        assert_eq!(
            sc.state(&track.id),
            SubmissionState::Failed("The server took too long to respond.".into())
        );
        assert_eq!(sc.plan(&[track], &frame()).len(), 1);
    }

    /// 统计调用次数的服务
    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl AnnotationService for Counting {
        fn submit(&self, _request: &UploadRequest) -> Result<AnnotatedAsset, LensError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(asset())
        }
    }

    #[test]
    fn test_crop_failure_short_circuits() {
        let mut sc = coordinator();
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let track = track_at(&mut tracker, Rect::new(0.2, 0.2, 0.3, 0.3), 0.0);
        let mut jobs = sc.plan(&[track.clone()], &Arc::new(RgbImage::new(0, 0)));
        assert_eq!(jobs.len(), 1);
        assert_eq!(sc.state(&track.id), SubmissionState::Uploading);

        let service = Arc::new(Counting::default());
        let (tx, rx) = unbounded();
        dispatch(service.clone(), jobs.remove(0), tx);

        // 不发 Sent, 直接以裁剪失败结束
        let outcome = match rx.recv_timeout(WAIT) {
            Ok(UploadEvent::Finished(outcome)) => outcome,
            other => panic!("expected Finished, got {other:?}"),
        };
        assert!(matches!(outcome.result, Err(LensError::CropFailure)));
        assert_eq!(sc.complete(outcome), Completion::Failed("crop failed".into()));
        assert_eq!(sc.state(&track.id), SubmissionState::Failed("crop failed".into()));
        assert_eq!(service.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_reports_sent_then_finished() {
        let mut sc = coordinator();
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let track = track_at(&mut tracker, Rect::new(0.2, 0.2, 0.3, 0.3), 0.0);
        let mut jobs = sc.plan(&[track.clone()], &frame());

        let service = Arc::new(Counting::default());
        let (tx, rx) = unbounded();
        dispatch(service.clone(), jobs.remove(0), tx);

        match rx.recv_timeout(WAIT) {
            Ok(UploadEvent::Sent { id, ticket }) => assert!(sc.mark_sent(&id, ticket)),
            other => panic!("expected Sent, got {other:?}"),
        }
        match rx.recv_timeout(WAIT) {
            Ok(UploadEvent::Finished(outcome)) => {
                assert!(matches!(sc.complete(outcome), Completion::Stored(_)));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert_eq!(sc.state(&track.id), SubmissionState::Processed);
        assert_eq!(service.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_result_after_forget_is_noop() {
        let mut sc = coordinator();
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let track = track_at(&mut tracker, Rect::new(0.2, 0.2, 0.3, 0.3), 0.0);
        let jobs = sc.plan(&[track.clone()], &frame());
        assert!(sc.forget(&track.id).is_some());

        let stored = sc.complete(UploadOutcome {
            id: track.id,
            ticket: jobs[0].ticket,
            result: Ok(asset()),
        });
        assert_eq!(stored, Completion::Ignored);
        assert!(sc.object(&track.id).is_none());
        assert!(sc.is_empty());
        assert!(!sc.mark_sent(&track.id, jobs[0].ticket));
    }

    #[test]
    fn test_stale_ticket_ignored() {
        let mut sc = coordinator();
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let track = track_at(&mut tracker, Rect::new(0.2, 0.2, 0.3, 0.3), 0.0);
        let first = sc.plan(&[track.clone()], &frame());
        sc.complete(UploadOutcome {
            id: track.id,
            ticket: first[0].ticket,
            result: Err(LensError::CropFailure),
        });
        let second = sc.plan(&[track.clone()], &frame());
        assert_ne!(first[0].ticket, second[0].ticket);

        // 第一次请求的迟到结果
        let late = sc.complete(UploadOutcome {
            id: track.id,
            ticket: first[0].ticket,
            result: Ok(asset()),
        });
        assert_eq!(late, Completion::Ignored);
        assert_eq!(sc.state(&track.id), SubmissionState::Uploading);
    }
}
