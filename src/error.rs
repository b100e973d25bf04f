// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误类型
//!
//! - `ModelUnavailable`: 致命, 会话无法启动
//! - `InvalidResults`:   单帧失败, 丢弃当前帧
//! - `CropFailure`:      单目标失败, 下一轮可重试
//! - `Network`:          单目标失败, 分类后可重试
//! - `Cancelled`:        不是错误, 静默丢弃

use std::fmt;

use thiserror::Error;

/// 网络错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Network,
    Timeout,
    Server,
    Client,
    InvalidResponse,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkErrorKind::Network => "network",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Server => "server",
            NetworkErrorKind::Client => "client",
            NetworkErrorKind::InvalidResponse => "invalid-response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LensError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid results: {0}")]
    InvalidResults(String),

    #[error("crop failed")]
    CropFailure,

    #[error("{kind} error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl LensError {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        LensError::Network {
            kind,
            message: message.into(),
        }
    }

    /// 面向用户的失败原因 (写入 `failed(reason)`)
    pub fn user_message(&self) -> String {
        match self {
            LensError::ModelUnavailable(_) => "Detection model is unavailable.".to_string(),
            LensError::InvalidResults(_) => "Detection results were invalid.".to_string(),
            LensError::CropFailure => "crop failed".to_string(),
            LensError::Network { kind, message } => match kind {
                NetworkErrorKind::Network => "Network connection failed.".to_string(),
                NetworkErrorKind::Timeout => "The server took too long to respond.".to_string(),
                NetworkErrorKind::Server | NetworkErrorKind::Client if !message.is_empty() => {
                    message.clone()
                }
                NetworkErrorKind::Server => "The server failed to process the object.".to_string(),
                NetworkErrorKind::Client => "The request was rejected.".to_string(),
                NetworkErrorKind::InvalidResponse => {
                    "The server returned an unreadable response.".to_string()
                }
            },
            LensError::Cancelled => "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LensError::Cancelled)
    }
}
