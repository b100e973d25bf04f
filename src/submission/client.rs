// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 标注服务 HTTP 客户端
//!
//! - `POST {server}/api/objects`: 上传裁剪图, 返回标注后的图片
//! - `GET  {server}/api/health`:  健康检查
//!
//! 非 2xx 响应体为 `{"error": .., "details": ..}`.

use std::io::Read;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::AnnotationService;
use crate::config::LensMode;
use crate::detection::types::Rect;
use crate::error::{LensError, NetworkErrorKind};

/// 上传载荷
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// 等于轨迹ID, 服务端据此做幂等
    pub client_object_id: String,
    pub lens_mode: LensMode,
    pub label: String,
    pub confidence: f32,
    pub bounding_box: Rect,
    pub image_base64: String,
}

/// 服务端响应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationResponse {
    pub client_object_id: String,
    pub annotated_image_base64: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub equation: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub lens_mode: Option<LensMode>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

/// 标注结果 (交给渲染层)
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedAsset {
    /// 解码后的图片字节
    pub image: Vec<u8>,
    pub message: Option<String>,
    pub equation: Option<String>,
    pub explanation: Option<String>,
}

impl AnnotationResponse {
    /// 校验并解码为 `AnnotatedAsset`
    pub fn into_asset(self, expected_id: &str) -> Result<AnnotatedAsset, LensError> {
        if self.client_object_id != expected_id {
            return Err(LensError::network(
                NetworkErrorKind::InvalidResponse,
                format!(
                    "clientObjectId mismatch: sent {expected_id}, got {}",
                    self.client_object_id
                ),
            ));
        }
        let image = decode_image_base64(&self.annotated_image_base64)?;
        Ok(AnnotatedAsset {
            image,
            message: self.message,
            equation: self.equation,
            explanation: self.explanation,
        })
    }
}

/// 解码 base64 图片, 允许 `data:image/png;base64,` 前缀
pub fn decode_image_base64(s: &str) -> Result<Vec<u8>, LensError> {
    let s = s.trim();
    let payload = match s.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => s,
    };
    let bytes = STANDARD.decode(payload).map_err(|e| {
        LensError::network(
            NetworkErrorKind::InvalidResponse,
            format!("annotatedImageBase64: {e}"),
        )
    })?;
    if bytes.is_empty() {
        return Err(LensError::network(
            NetworkErrorKind::InvalidResponse,
            "annotatedImageBase64 is empty",
        ));
    }
    Ok(bytes)
}

/// 基于 ureq 的同步客户端 (在上传线程中调用)
pub struct HttpAnnotationClient {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpAnnotationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { agent, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 健康检查: 期望 `{"status": "ok"}`
    pub fn health(&self) -> Result<(), LensError> {
        let resp = self
            .agent
            .get(&self.endpoint("/api/health"))
            .call()
            .map_err(classify)?;
        let body = read_body(resp)?;

        #[derive(Deserialize)]
        struct Health {
            status: String,
        }
        let health: Health = serde_json::from_str(&body).map_err(|e| {
            LensError::network(NetworkErrorKind::InvalidResponse, format!("health: {e}"))
        })?;
        if health.status != "ok" {
            return Err(LensError::network(
                NetworkErrorKind::Server,
                format!("status {}", health.status),
            ));
        }
        info!("🩺 标注服务正常: {}", self.base_url);
        Ok(())
    }
}

impl AnnotationService for HttpAnnotationClient {
    fn submit(&self, request: &UploadRequest) -> Result<AnnotatedAsset, LensError> {
        let payload = serde_json::to_string(request).map_err(|e| {
            LensError::network(NetworkErrorKind::Client, format!("encode request: {e}"))
        })?;
        debug!(
            "📤 上传 {} ({}, {} bytes)",
            request.client_object_id,
            request.label,
            payload.len()
        );

        let resp = self
            .agent
            .post(&self.endpoint("/api/objects"))
            .set("Content-Type", "application/json")
            .send_string(&payload)
            .map_err(classify)?;
        let body = read_body(resp)?;

        let response: AnnotationResponse = serde_json::from_str(&body).map_err(|e| {
            LensError::network(NetworkErrorKind::InvalidResponse, format!("response: {e}"))
        })?;
        response.into_asset(&request.client_object_id)
    }
}

fn read_body(resp: ureq::Response) -> Result<String, LensError> {
    let mut body = String::new();
    resp.into_reader()
        .read_to_string(&mut body)
        .map_err(|e| io_error("read response", &e))?;
    Ok(body)
}

fn io_error(context: &str, e: &std::io::Error) -> LensError {
    let kind = match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
        _ => NetworkErrorKind::Network,
    };
    LensError::network(kind, format!("{context}: {e}"))
}

/// ureq 错误 → 网络错误分类
fn classify(err: ureq::Error) -> LensError {
    match err {
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            classify_status(code, &body)
        }
        ureq::Error::Transport(t) => {
            let io = std::error::Error::source(&t)
                .and_then(|s| s.downcast_ref::<std::io::Error>());
            match io {
                Some(e) => io_error("transport", e),
                None => LensError::network(NetworkErrorKind::Network, t.to_string()),
            }
        }
    }
}

/// 状态码 + 响应体 → 错误 (4xx → Client, 其余 → Server)
pub fn classify_status(code: u16, body: &str) -> LensError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .error
        .or(parsed.details)
        .unwrap_or_else(|| format!("HTTP {code}"));
    let kind = if (400..500).contains(&code) {
        NetworkErrorKind::Client
    } else {
        NetworkErrorKind::Server
    };
    LensError::network(kind, message)
}
