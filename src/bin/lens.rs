// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// Lens 命令行驱动
///
/// 从图片目录读取连续帧 (按文件名排序), 驱动检测 → 跟踪 → 标注提交流水线.
///
/// ```text
/// lens --source frames/                 # 连续模式
/// lens --source frame.jpg --tap 0.4,0.6 # 单次点选
/// lens --health                         # 仅检查标注服务
/// ```
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lens_rs::detection::Point2;
use lens_rs::pipeline::{Frame, PipelineEvent, PipelineSession};
use lens_rs::submission::HttpAnnotationClient;
use lens_rs::{Args, PipelineConfig};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];
/// 最后一帧之后, 无事件多久视为结束
const SETTLE: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::load(&args.config)?;
    if let Some(server) = &args.server {
        config.server_url = server.clone();
    }
    if let Some(mode) = args.lens_mode {
        config.lens_mode = mode;
    }
    config.print_summary();

    let client = HttpAnnotationClient::new(
        config.server_url.clone(),
        Duration::from_secs(config.request_timeout_secs),
    );

    if args.health {
        client
            .health()
            .with_context(|| format!("annotation service at {}", client.base_url()))?;
        return Ok(());
    }

    let frames = list_frames(&args.source)?;
    info!("🎞️ 共 {} 帧: {}", frames.len(), args.source.display());

    // 模型不可用是唯一的致命错误
    let mut session = PipelineSession::open(config, &args.model, Arc::new(client))
        .with_context(|| format!("failed to start pipeline with {}", args.model))?;
    let events = session.events();

    match args.tap {
        Some((x, y)) => {
            let frame = read_frame(&frames[0], 0.0)?;
            info!("👆 点选 ({x:.3}, {y:.3}): {}", frames[0].display());
            session.select(frame, Some(Point2::new(x, y)));
        }
        None => {
            for (i, path) in frames.iter().enumerate() {
                let timestamp = i as f64 * args.frame_interval;
                let frame = match read_frame(path, timestamp) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("⚠️ 跳过 {}: {e:#}", path.display());
                        continue;
                    }
                };
                session.submit_frame(frame);
                log_events(&events, Duration::from_secs_f64(args.frame_interval.max(0.0)));
            }
        }
    }

    // 等待剩余检测与上传结束
    log_events(&events, SETTLE);

    let snapshot = session.snapshot();
    info!("📊 最终轨迹 {} 个", snapshot.tracks.len());
    for view in &snapshot.tracks {
        info!(
            "   {} {} ({:.2}) {:?}",
            view.track.id, view.track.label, view.track.confidence, view.state
        );
    }
    if let Some(banner) = &snapshot.banner {
        warn!("⚠️ {} ({})", banner.message, banner.at.format("%H:%M:%S"));
    }

    session.shutdown();
    Ok(())
}

/// 打印事件, 直到 `idle` 时间内没有新事件
fn log_events(events: &crossbeam_channel::Receiver<PipelineEvent>, idle: Duration) {
    while let Ok(event) = events.recv_timeout(idle) {
        match event {
            PipelineEvent::TracksUpdated(views) => {
                info!("🎯 轨迹更新: {} 个", views.len());
            }
            PipelineEvent::TrackEvicted { id, .. } => info!("👋 轨迹移除: {id}"),
            PipelineEvent::Annotated { id, asset } => {
                info!(
                    "🖼️ {id}: {} bytes {}",
                    asset.image.len(),
                    asset.message.as_deref().unwrap_or_default()
                );
                if let Some(equation) = &asset.equation {
                    info!("   = {equation}");
                }
            }
            PipelineEvent::Status(banner) => error!("❗ {}", banner.message),
        }
    }
}

fn list_frames(source: &Path) -> Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    let mut frames: Vec<PathBuf> = std::fs::read_dir(source)
        .with_context(|| format!("failed to read {}", source.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    if frames.is_empty() {
        bail!("no image frames found in {}", source.display());
    }
    Ok(frames)
}

fn read_frame(path: &Path, timestamp: f64) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    Ok(Frame::new(image, timestamp))
}
