// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 裁剪 + JPEG 编码 + base64

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};

use crate::detection::types::Rect;
use crate::error::LensError;

/// 按归一化框 (左下原点) 裁剪帧
///
/// 框裁剪到单位正方形后为空, 或映射到像素后宽/高为 0 时返回 `CropFailure`.
pub fn crop_region(frame: &RgbImage, bbox: &Rect) -> Result<RgbImage, LensError> {
    let (fw, fh) = frame.dimensions();
    if fw == 0 || fh == 0 || bbox.clamped().is_degenerate() {
        return Err(LensError::CropFailure);
    }
    let (x, y, w, h) = bbox.to_pixel_rect(fw, fh);
    if w == 0 || h == 0 {
        return Err(LensError::CropFailure);
    }
    Ok(imageops::crop_imm(frame, x, y, w, h).to_image())
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, LensError> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|_| LensError::CropFailure)?;
    Ok(buf.into_inner())
}

/// 裁剪 → JPEG → base64 (上传载荷中的 `imageBase64`)
pub fn encode_region(frame: &RgbImage, bbox: &Rect, quality: u8) -> Result<String, LensError> {
    let crop = crop_region(frame, bbox)?;
    let jpeg = encode_jpeg(&crop, quality)?;
    Ok(STANDARD.encode(jpeg))
}
