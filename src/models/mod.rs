// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 模型统一接口与实现
///
/// # 架构说明
///
/// 推理引擎被当作黑盒: 输入一帧图片, 输出原始张量.
/// 解码/NMS/掩码全部由后处理器完成:
///
/// ```text
/// 原始图片 → Model::run → ModelOutput (preds, protos)
///                              ↓
///                 YOLOv8Postprocessor::postprocess → Vec<Detection>
/// ```
///
/// - `onnx.rs`:   ONNX Runtime 后端 (feature `onnx`)
/// - `yolov8.rs`: YOLOv8 检测/分割张量解码
use std::path::Path;

use image::RgbImage;
use ndarray::ArrayD;

use crate::config::{InputSize, PipelineConfig};
use crate::error::LensError;

/// 模型原始输出
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// (channels, anchors), 可带 batch 维
    pub preds: ArrayD<f32>,
    /// (maskDim, protoH, protoW), 仅分割模型
    pub protos: Option<ArrayD<f32>>,
}

/// 统一的推理接口
///
/// 在检测工作线程中调用, 因此要求 `Send`.
pub trait Model: Send {
    /// 推理: 图片 → 原始张量
    fn run(&mut self, image: &RgbImage) -> Result<ModelOutput, LensError>;

    /// 模型输入尺寸
    fn input_size(&self) -> InputSize;

    /// 打印模型信息
    fn summary(&self) -> String {
        let size = self.input_size();
        format!("input {}x{}", size.width, size.height)
    }
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn run(&mut self, image: &RgbImage) -> Result<ModelOutput, LensError> {
        (**self).run(image)
    }

    fn input_size(&self) -> InputSize {
        (**self).input_size()
    }

    fn summary(&self) -> String {
        (**self).summary()
    }
}

/// 加载模型
///
/// 找不到文件或未启用推理后端时返回 `ModelUnavailable`.
pub fn load(path: impl AsRef<Path>, config: &PipelineConfig) -> Result<Box<dyn Model>, LensError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(LensError::ModelUnavailable(format!(
            "model file not found: {}",
            path.display()
        )));
    }

    #[cfg(feature = "onnx")]
    {
        let model = onnx::OrtModel::load(path, config.model_input)?;
        Ok(Box::new(model))
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = config;
        Err(LensError::ModelUnavailable(format!(
            "{}: built without the `onnx` feature",
            path.display()
        )))
    }
}

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod yolov8;

pub use yolov8::{YOLOv8Config, YOLOv8Postprocessor};
