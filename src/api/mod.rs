//! HTTP 层：OpenAI 兼容接口、模型管理、集群管理

use std::sync::Arc;

use chrono::Utc;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::serde::json::{self, Json};
use rocket::{catch, catchers, get, routes, Build, Rocket, State};
use serde_json::Value;

use crate::app_state::{AppState, Backend};
use crate::config::InferenceMode;
use crate::engine::HealthState;
use crate::error::{ErrorBody, ErrorDetail, GatewayError, GatewayResult};
use crate::types::HealthResponse;

pub mod cluster;
pub mod fairings;
pub mod management;
pub mod openai;
pub mod proxy;
pub mod streaming;

/// 所有业务路由的响应
#[derive(rocket::Responder)]
pub enum Reply {
    Json(Json<Value>),
    Stream(streaming::EventStream),
    Proxied(proxy::Proxied),
}

impl Reply {
    pub fn json<T: serde::Serialize>(value: &T) -> GatewayResult<Self> {
        serde_json::to_value(value)
            .map(|v| Reply::Json(Json(v)))
            .map_err(|e| GatewayError::Server(format!("failed to encode response: {e}")))
    }
}

/// 请求体解析失败统一转成 400 信封
pub fn parse_body(body: Result<Json<Value>, json::Error<'_>>) -> GatewayResult<Value> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(json::Error::Io(e)) => Err(GatewayError::invalid(format!("failed to read request body: {e}"), None)),
        Err(json::Error::Parse(_, e)) => Err(GatewayError::invalid(format!("invalid JSON body: {e}"), None)),
    }
}

pub fn decode<T: serde::de::DeserializeOwned>(value: Value) -> GatewayResult<T> {
    serde_json::from_value(value).map_err(|e| GatewayError::invalid(format!("invalid request: {e}"), None))
}

#[get("/health")]
pub async fn health(state: &State<Arc<AppState>>) -> (Status, Json<HealthResponse>) {
    let (health, details) = match &state.backend {
        Backend::Local(manager) => {
            let report = manager.health().await;
            let details = serde_json::to_value(&report).unwrap_or(Value::Null);
            (report.status, details)
        }
        Backend::Cluster { cluster, .. } => {
            let overview = cluster.load_balancer().overview();
            let health = if overview.healthy_instances == 0 {
                HealthState::Unhealthy
            } else if overview.healthy_instances < overview.total_instances {
                HealthState::Degraded
            } else {
                HealthState::Healthy
            };
            (health, serde_json::to_value(&overview).unwrap_or(Value::Null))
        }
    };

    let status = if health == HealthState::Healthy {
        Status::Ok
    } else {
        Status::ServiceUnavailable
    };
    let label = match health {
        HealthState::Healthy => "healthy",
        HealthState::Degraded => "degraded",
        HealthState::Unhealthy => "unhealthy",
    };
    let mode = match state.mode() {
        InferenceMode::Single => "single",
        InferenceMode::LoadBalance => "load_balance",
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            timestamp: Utc::now(),
            mode: mode.to_string(),
            instance_id: state.config.instance_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            details,
        }),
    )
}

fn envelope(status: Status, message: String, kind: &str, code: Option<&str>) -> (Status, (ContentType, String)) {
    let body = ErrorBody {
        error: ErrorDetail {
            message,
            r#type: kind.to_string(),
            param: None,
            code: code.map(str::to_string),
        },
    };
    (status, (ContentType::JSON, body.to_json()))
}

#[catch(404)]
fn not_found(req: &Request<'_>) -> (Status, (ContentType, String)) {
    envelope(
        Status::NotFound,
        format!("Unknown route: {} {}", req.method(), req.uri().path()),
        "invalid_request_error",
        Some("not_found"),
    )
}

#[catch(422)]
fn unprocessable(_req: &Request<'_>) -> (Status, (ContentType, String)) {
    envelope(
        Status::BadRequest,
        "Request body could not be parsed".to_string(),
        "invalid_request_error",
        None,
    )
}

#[catch(default)]
fn default_catcher(status: Status, _req: &Request<'_>) -> (Status, (ContentType, String)) {
    let kind = if status.code < 500 {
        "invalid_request_error"
    } else {
        "server_error"
    };
    envelope(status, status.reason_lossy().to_string(), kind, None)
}

/// 按推理模式挂载路由；集群管理接口只在 load_balance 模式下存在
pub fn build_rocket(figment: rocket::figment::Figment, state: Arc<AppState>) -> Rocket<Build> {
    let mode = state.mode();
    let mut rocket = rocket::custom(figment)
        .manage(state)
        .attach(fairings::RequestLogger)
        .register("/", catchers![not_found, unprocessable, default_catcher])
        .mount("/", routes![health])
        .mount("/v1", openai::routes())
        .mount("/v1", management::routes());

    if mode == InferenceMode::LoadBalance {
        rocket = rocket.mount("/v1/cluster", cluster::routes());
    }
    rocket
}

/// 测试与嵌入用的最小 figment：随机端口、关闭 Rocket 自带日志
pub fn default_figment() -> rocket::figment::Figment {
    rocket::Config::figment()
        .merge(("log_level", rocket::config::LogLevel::Off))
        .merge(("limits.json", 32 * 1024 * 1024))
        .merge(("cli_colors", false))
}

pub(crate) fn json_value(value: Value) -> Reply {
    Reply::Json(Json(value))
}
