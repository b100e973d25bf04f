// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 多目标跟踪 (IOU 匹配)
//! Multi-object tracking by greedy IoU matching with time-based expiry
//!
//! 每帧:
//! 1. 已有轨迹按创建顺序依次认领 IOU 最大的未认领预测 (需 ≥ 匹配阈值)
//! 2. 未匹配轨迹在过期时间内保留, 超时则删除
//! 3. 未被认领的预测生成新轨迹
//! 4. 返回按 last_seen 升序排列的轨迹

use std::collections::HashMap;

use uuid::Uuid;

use super::types::{Point2, Prediction, Rect};

/// 轨迹唯一ID (生命周期内不变, 不复用)
pub type TrackId = Uuid;

/// 外部渲染系统的世界锚点句柄 (跟踪器只负责携带)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnchorRef(pub u64);

/// 跟踪对象
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    /// 唯一跟踪ID
    pub id: TrackId,

    pub label: String,

    pub confidence: f32,

    /// 当前边界框 (归一化, 左下原点)
    pub bbox: Rect,

    /// 最近一次匹配的帧时间戳 (秒)
    pub last_seen: f64,

    /// 世界锚点 (由渲染系统附加)
    pub anchor: Option<AnchorRef>,

    /// 最近一次匹配的轮廓
    pub contour: Option<Vec<Point2>>,

    /// 创建序号, 用于同一时间戳下的稳定排序
    serial: u64,
}

impl Track {
    fn spawn(prediction: &Prediction, timestamp: f64, serial: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: prediction.label.clone(),
            confidence: prediction.confidence,
            bbox: prediction.bbox,
            last_seen: timestamp,
            anchor: None,
            contour: prediction.contour.clone(),
            serial,
        }
    }

    fn apply(&mut self, prediction: &Prediction, timestamp: f64) {
        self.label = prediction.label.clone();
        self.confidence = prediction.confidence;
        self.bbox = prediction.bbox;
        self.contour = prediction.contour.clone();
        self.last_seen = timestamp;
    }
}

/// 被删除的轨迹 (通知渲染系统释放锚点)
#[derive(Clone, Debug, PartialEq)]
pub struct Evicted {
    pub id: TrackId,
    pub anchor: Option<AnchorRef>,
}

/// 跟踪器参数
#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
    /// 匹配 IOU 阈值
    pub match_iou_threshold: f32,
    /// 未匹配轨迹保留时长 (秒)
    pub expiration_secs: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_iou_threshold: 0.4,
            expiration_secs: 1.2,
        }
    }
}

/// IOU 多目标跟踪器
pub struct ObjectTracker {
    tracks: HashMap<TrackId, Track>,
    config: TrackerConfig,
    next_serial: u64,
    evicted: Vec<Evicted>,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: HashMap::new(),
            config,
            next_serial: 0,
            evicted: Vec::new(),
        }
    }

    /// 更新跟踪器
    ///
    /// # 参数
    /// - `predictions`: 当前帧的检测结果
    /// - `timestamp`: 当前帧时间戳 (秒)
    ///
    /// # 返回
    /// 当前所有存活的轨迹, 按 last_seen 升序 (最旧在前)
    pub fn update(&mut self, predictions: &[Prediction], timestamp: f64) -> Vec<Track> {
        let mut claimed = vec![false; predictions.len()];

        for id in self.ids_by_age() {
            let Some(track) = self.tracks.get_mut(&id) else {
                continue;
            };

            let mut best: Option<(usize, f32)> = None;
            for (i, p) in predictions.iter().enumerate() {
                if claimed[i] {
                    continue;
                }
                let iou = track.bbox.iou(&p.bbox);
                if best.map_or(true, |(_, b)| iou > b) {
                    best = Some((i, iou));
                }
            }

            match best {
                Some((i, iou)) if iou >= self.config.match_iou_threshold => {
                    claimed[i] = true;
                    track.apply(&predictions[i], timestamp);
                }
                _ => {
                    if timestamp - track.last_seen > self.config.expiration_secs {
                        if let Some(track) = self.tracks.remove(&id) {
                            self.evicted.push(Evicted {
                                id: track.id,
                                anchor: track.anchor,
                            });
                        }
                    }
                }
            }
        }

        for (p, _) in predictions.iter().zip(claimed).filter(|(_, c)| !c) {
            let track = Track::spawn(p, timestamp, self.next_serial);
            self.next_serial += 1;
            self.tracks.insert(track.id, track);
        }

        self.tracks()
    }

    /// 当前轨迹, 按 (last_seen, 创建顺序) 升序
    pub fn tracks(&self) -> Vec<Track> {
        let mut ys: Vec<Track> = self.tracks.values().cloned().collect();
        ys.sort_by(|a, b| {
            a.last_seen
                .total_cmp(&b.last_seen)
                .then(a.serial.cmp(&b.serial))
        });
        ys
    }

    fn ids_by_age(&self) -> Vec<TrackId> {
        let mut ids: Vec<(u64, TrackId)> = self.tracks.values().map(|t| (t.serial, t.id)).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn track(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.get(id)
    }

    /// 显式删除
    pub fn remove(&mut self, id: &TrackId) -> Option<Track> {
        let track = self.tracks.remove(id)?;
        self.evicted.push(Evicted {
            id: track.id,
            anchor: track.anchor,
        });
        Some(track)
    }

    /// 附加世界锚点, 轨迹不存在时返回 false
    pub fn attach_anchor(&mut self, id: &TrackId, anchor: AnchorRef) -> bool {
        match self.tracks.get_mut(id) {
            Some(track) => {
                track.anchor = Some(anchor);
                true
            }
            None => false,
        }
    }

    /// 重置跟踪器 (清除所有跟踪)
    pub fn reset(&mut self) {
        let mut ids = self.ids_by_age();
        for id in ids.drain(..) {
            if let Some(track) = self.tracks.remove(&id) {
                self.evicted.push(Evicted {
                    id: track.id,
                    anchor: track.anchor,
                });
            }
        }
    }

    /// 取出自上次调用以来删除的轨迹
    pub fn drain_evicted(&mut self) -> Vec<Evicted> {
        std::mem::take(&mut self.evicted)
    }

    /// 获取当前跟踪数量
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}
