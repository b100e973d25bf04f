// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 配置 - 命令行参数 + JSON 策略文件

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 命令行参数
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "Lens - 目标检测/跟踪/标注提交流水线", long_about = None)]
pub struct Args {
    /// ONNX 模型路径 (yolov8n-seg.onnx 等)
    #[arg(long, default_value = "models/yolov8n-seg.onnx")]
    pub model: String,

    /// JSON 策略配置文件
    #[arg(long, default_value = "lens.json")]
    pub config: String,

    /// 标注服务地址 (覆盖配置文件)
    #[arg(long)]
    pub server: Option<String>,

    /// 镜头模式: math 或 physics (覆盖配置文件)
    #[arg(long)]
    pub lens_mode: Option<LensMode>,

    /// 帧来源: 图片文件或目录 (按文件名排序作为连续帧)
    #[arg(long, default_value = "frames")]
    pub source: PathBuf,

    /// 帧间隔 (秒), 用于生成时间戳
    #[arg(long, default_value_t = 0.1)]
    pub frame_interval: f64,

    /// 单次选择模式: 点击坐标 "x,y" (归一化, 左下原点)
    #[arg(long, value_parser = parse_point)]
    pub tap: Option<(f32, f32)>,

    /// 仅检查标注服务健康状态
    #[arg(long, default_value_t = false)]
    pub health: bool,
}

fn parse_point(s: &str) -> Result<(f32, f32), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected \"x,y\", got {s:?}"))?;
    let x: f32 = x.trim().parse().map_err(|e| format!("bad x: {e}"))?;
    let y: f32 = y.trim().parse().map_err(|e| format!("bad y: {e}"))?;
    Ok((x, y))
}

/// 镜头模式 (随每次上传发送)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LensMode {
    #[default]
    Math,
    Physics,
}

impl LensMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LensMode::Math => "math",
            LensMode::Physics => "physics",
        }
    }
}

/// 模型输入尺寸 (像素)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

/// 流水线策略参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 解码/NMS ===
    pub conf_threshold: f32, // 置信度阈值
    pub iou_threshold: f32,  // NMS IOU阈值
    pub max_detections: usize,
    pub mask_threshold: f32, // 掩码二值化阈值

    // === 模型 ===
    pub model_input: InputSize,
    pub num_classes: usize,
    pub mask_dim: usize, // 0 表示纯检测模型
    pub class_names: Vec<String>,

    // === 跟踪 ===
    pub match_iou_threshold: f32, // 轨迹匹配 IOU 阈值
    pub expiration_secs: f64,     // 未匹配轨迹保留时长

    // === 提交 ===
    pub drift_iou_threshold: f32, // IOU 低于此值时重新提交
    pub lens_mode: LensMode,
    pub server_url: String,
    pub request_timeout_secs: u64,
    pub jpeg_quality: u8,

    // === 单次选择 ===
    pub selection_padding: f32,       // 选中框外扩比例
    pub selection_min_influence: f32, // 点击影响区最小边长 (视口比例)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.35,
            iou_threshold: 0.45,
            max_detections: 12,
            mask_threshold: 0.5,

            model_input: InputSize {
                width: 640,
                height: 640,
            },
            num_classes: 80,
            mask_dim: 32,
            class_names: COCO_NAMES.iter().map(|s| s.to_string()).collect(),

            match_iou_threshold: 0.4,
            expiration_secs: 1.2,

            drift_iou_threshold: 0.3,
            lens_mode: LensMode::Math,
            server_url: "http://127.0.0.1:5050".to_string(),
            request_timeout_secs: 30,
            jpeg_quality: 85,

            selection_padding: 0.15,
            selection_min_influence: 0.2,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置, 文件不存在时写入默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("📝 配置文件不存在,创建默认配置: {}", path.display());
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("⚠️  默认配置写入失败: {e:#}");
            }
            return Ok(config);
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)
            .with_context(|| format!("failed to write config {}", path.as_ref().display()))?;
        info!("💾 配置已保存到 {}", path.as_ref().display());
        Ok(())
    }

    /// 检查阈值范围
    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("conf_threshold", self.conf_threshold),
            ("iou_threshold", self.iou_threshold),
            ("mask_threshold", self.mask_threshold),
            ("match_iou_threshold", self.match_iou_threshold),
            ("drift_iou_threshold", self.drift_iou_threshold),
            ("selection_min_influence", self.selection_min_influence),
        ];
        for (name, v) in unit {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be within [0, 1], got {v}");
            }
        }
        if self.selection_padding < 0.0 {
            bail!("selection_padding must not be negative");
        }
        if self.max_detections == 0 {
            bail!("max_detections must be positive");
        }
        if self.expiration_secs < 0.0 {
            bail!("expiration_secs must not be negative");
        }
        if self.model_input.width == 0 || self.model_input.height == 0 {
            bail!("model_input must be non-empty");
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!(
            "🎛️  当前配置: conf={:.2} iou={:.2} max={} match={:.2} drift={:.2} expire={:.1}s lens={} server={}",
            self.conf_threshold,
            self.iou_threshold,
            self.max_detections,
            self.match_iou_threshold,
            self.drift_iou_threshold,
            self.expiration_secs,
            self.lens_mode.as_str(),
            self.server_url,
        );
    }
}

pub const COCO_NAMES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];
