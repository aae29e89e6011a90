use std::sync::Arc;

use chrono::Utc;
use rocket::serde::json::{self, Json};
use rocket::{get, post, routes, Route, State};
use serde_json::{json, Value};

use super::{decode, json_value, parse_body, Reply};
use crate::app_state::{AppState, Backend};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{LoadModelRequest, ManagementResponse, UnloadModelRequest};

pub fn routes() -> Vec<Route> {
    routes![load_model, unload_model, model_status, system_status, system_metrics]
}

#[post("/models/load", data = "<body>")]
pub async fn load_model(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let req: LoadModelRequest = decode(parse_body(body)?)?;
    let manager = Arc::clone(state.manager()?);
    let name = state.resolve_model(&req.model_name).to_string();

    tracing::info!(model = %name, force = req.force, "load requested");
    let target = name.clone();
    state
        .coordinate(async move { manager.load(&target, req.force).await })
        .await?;

    Reply::json(&ManagementResponse {
        success: true,
        message: format!("Model '{name}' loaded"),
        model_name: name,
    })
}

#[post("/models/unload", data = "<body>")]
pub async fn unload_model(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let req: UnloadModelRequest = decode(parse_body(body)?)?;
    let manager = Arc::clone(state.manager()?);
    let name = state.resolve_model(&req.model_name).to_string();

    tracing::info!(model = %name, "unload requested");
    let target = name.clone();
    let unloaded = state
        .coordinate(async move { manager.unload(&target).await })
        .await?;
    if !unloaded {
        return Err(GatewayError::invalid(
            format!("Model '{name}' is not loaded"),
            Some("model_name"),
        ));
    }

    Reply::json(&ManagementResponse {
        success: true,
        message: format!("Model '{name}' unloaded"),
        model_name: name,
    })
}

#[get("/models/<id>/status")]
pub async fn model_status(id: &str, state: &State<Arc<AppState>>) -> GatewayResult<Reply> {
    let manager = state.manager()?;
    let name = state.resolve_model(id);
    let info = manager
        .model_info(name)
        .ok_or_else(|| GatewayError::ModelNotFound(id.to_string()))?;
    Reply::json(&info)
}

#[get("/system/status")]
pub async fn system_status(state: &State<Arc<AppState>>) -> GatewayResult<Reply> {
    let body = match &state.backend {
        Backend::Local(manager) => json!({
            "mode": "single",
            "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
            "manager": manager.status(),
        }),
        Backend::Cluster { cluster, .. } => json!({
            "mode": "load_balance",
            "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
            "cluster": cluster.status(),
        }),
    };
    Ok(json_value(body))
}

#[get("/system/metrics")]
pub async fn system_metrics(state: &State<Arc<AppState>>) -> GatewayResult<Reply> {
    let http = state.metrics.snapshot();
    let body = match &state.backend {
        Backend::Local(manager) => json!({
            "timestamp": Utc::now(),
            "http": http,
            "inference": manager.metrics(),
        }),
        Backend::Cluster { cluster, .. } => {
            let balancer = cluster.load_balancer();
            json!({
                "timestamp": Utc::now(),
                "http": http,
                "load_balancer": balancer.overview(),
                "instances": balancer.stats(),
            })
        }
    };
    Ok(json_value(body))
}
