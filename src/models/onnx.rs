// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端

use std::path::Path;

use anyhow::Result;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::{Model, ModelOutput};
use crate::config::InputSize;
use crate::error::LensError;

pub struct OrtModel {
    session: Session,
    input: InputSize,
    name: String,
}

impl OrtModel {
    pub fn load(path: &Path, input: InputSize) -> Result<Self, LensError> {
        let session = Self::build(path)
            .map_err(|e| LensError::ModelUnavailable(format!("{}: {e:#}", path.display())))?;
        info!("✅ 检测模型加载成功: {}", path.display());
        Ok(Self {
            session,
            input,
            name: path.display().to_string(),
        })
    }

    fn build(path: &Path) -> Result<Session> {
        Ok(Session::builder()?.commit_from_file(path)?)
    }

    /// 预处理: 缩放到输入尺寸 → NCHW, [0, 1]
    fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let (w, h) = (self.input.width, self.input.height);
        let resized = imageops::resize(image, w, h, imageops::FilterType::Triangle);
        let mut ys = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = r as f32 / 255.0;
            ys[[0, 1, y, x]] = g as f32 / 255.0;
            ys[[0, 2, y, x]] = b as f32 / 255.0;
        }
        ys
    }

    fn infer(&mut self, xs: Array4<f32>) -> Result<ModelOutput> {
        let input = Tensor::from_array(xs)?;
        let outputs = self.session.run(ort::inputs![input])?;
        let preds = outputs[0].try_extract_array::<f32>()?.into_owned();
        let protos = if outputs.len() > 1 {
            Some(outputs[1].try_extract_array::<f32>()?.into_owned())
        } else {
            None
        };
        Ok(ModelOutput { preds, protos })
    }
}

impl Model for OrtModel {
    fn run(&mut self, image: &RgbImage) -> Result<ModelOutput, LensError> {
        let xs = self.preprocess(image);
        self.infer(xs)
            .map_err(|e| LensError::InvalidResults(format!("inference failed: {e:#}")))
    }

    fn input_size(&self) -> InputSize {
        self.input
    }

    fn summary(&self) -> String {
        format!(
            "{} (input {}x{})",
            self.name, self.input.width, self.input.height
        )
    }
}
