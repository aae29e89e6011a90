use std::io::Cursor;
use std::time::Duration;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineKind;

/// 网关统一错误类型
///
/// 每个变体都对应一个固定的 HTTP 状态码和 OpenAI 风格的错误信封
/// `{"error":{"message","type","param","code"}}`。
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to load model `{name}`: {cause}")]
    ModelLoad { name: String, cause: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Resource limit reached for {resource}: {current} >= {limit}")]
    ResourceLimit {
        resource: String,
        current: usize,
        limit: usize,
    },

    /// 只在引擎回退链内部使用，不会渲染给客户端
    #[error("Engine `{0}` is not supported on this platform")]
    EngineNotSupported(EngineKind),

    #[error("No inference engine could be initialized: {0}")]
    NoEngineAvailable(String),

    #[error("No instance available{}", .0.as_deref().map(|m| format!(" for model `{m}`")).unwrap_or_default())]
    NoInstanceAvailable(Option<String>),

    #[error("{message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },

    #[error("Operation timed out after {0:?}; outcome unknown")]
    Timeout(Duration),

    #[error("Upstream instance returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("{0}")]
    Server(String),
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>, param: Option<&str>) -> Self {
        GatewayError::InvalidRequest {
            message: message.into(),
            param: param.map(str::to_string),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            GatewayError::InvalidRequest { .. } => Status::BadRequest,
            GatewayError::ModelNotFound(_) => Status::NotFound,
            GatewayError::ResourceLimit { .. }
            | GatewayError::NoEngineAvailable(_)
            | GatewayError::NoInstanceAvailable(_)
            | GatewayError::EngineNotSupported(_) => Status::ServiceUnavailable,
            GatewayError::Timeout(_) => Status::GatewayTimeout,
            GatewayError::Upstream { status, .. } => {
                Status::from_code(*status).unwrap_or(Status::BadGateway)
            }
            GatewayError::ModelLoad { .. }
            | GatewayError::Inference(_)
            | GatewayError::Process(_)
            | GatewayError::Server(_) => Status::InternalServerError,
        }
    }

    /// 转成错误信封
    pub fn to_body(&self) -> ErrorBody {
        let (kind, param, code) = match self {
            GatewayError::InvalidRequest { param, .. } => {
                ("invalid_request_error", param.clone(), None)
            }
            GatewayError::ModelNotFound(_) => (
                "model_not_found",
                Some("model".to_string()),
                Some("model_not_found"),
            ),
            GatewayError::ModelLoad { .. } => ("server_error", None, Some("model_load_error")),
            GatewayError::Inference(_) => ("server_error", None, Some("inference_error")),
            GatewayError::ResourceLimit { .. } => ("server_error", None, Some("resource_limit")),
            GatewayError::NoEngineAvailable(_) | GatewayError::EngineNotSupported(_) => {
                ("server_error", None, Some("engine_unavailable"))
            }
            GatewayError::NoInstanceAvailable(_) => {
                ("server_error", None, Some("no_instance_available"))
            }
            GatewayError::Timeout(_) => ("timeout_error", None, Some("timeout")),
            GatewayError::Upstream { .. } => ("upstream_error", None, Some("upstream_error")),
            GatewayError::Process(_) | GatewayError::Server(_) => ("server_error", None, None),
        };

        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: kind.to_string(),
                param,
                code: code.map(str::to_string),
            },
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Upstream {
                status: 504,
                body: e.to_string(),
            }
        } else {
            GatewayError::Upstream {
                status: 502,
                body: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// `param` 与 `code` 即使为空也要输出 `null`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":{"message":"internal error","type":"server_error","param":null,"code":null}}"#
                .to_string()
        })
    }
}

impl<'r> Responder<'r, 'static> for GatewayError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            tracing::error!(status = status.code, "{}", self);
        } else {
            tracing::debug!(status = status.code, "{}", self);
        }
        let body = self.to_body().to_json();
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
