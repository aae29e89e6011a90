use std::sync::Arc;

use rocket::serde::json::{self, Json};
use rocket::{get, post, routes, Route, State};
use serde_json::Value;

use super::{decode, parse_body, Reply};
use crate::app_state::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{ClusterActionResponse, RestartRequest, ScaleRequest, StrategyRequest};

pub fn routes() -> Vec<Route> {
    routes![status, scale, strategy, restart]
}

#[get("/status")]
pub async fn status(state: &State<Arc<AppState>>) -> GatewayResult<Reply> {
    Reply::json(&state.cluster()?.status())
}

#[post("/scale", data = "<body>")]
pub async fn scale(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let req: ScaleRequest = decode(parse_body(body)?)?;
    if req.count == 0 {
        return Err(GatewayError::invalid("'count' must be at least 1", Some("count")));
    }
    let cluster = Arc::clone(state.cluster()?);
    let count = req.count;

    let (verb, instances) = match req.action.as_str() {
        "up" => ("added", state.coordinate(async move { cluster.scale_up(count).await }).await?),
        "down" => ("removed", state.coordinate(async move { cluster.scale_down(count).await }).await?),
        other => {
            return Err(GatewayError::invalid(
                format!("Unknown scale action '{other}', expected 'up' or 'down'"),
                Some("action"),
            ))
        }
    };

    Reply::json(&ClusterActionResponse {
        success: true,
        message: format!("{} instance(s) {verb}", instances.len()),
        instances,
    })
}

#[post("/strategy", data = "<body>")]
pub async fn strategy(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let req: StrategyRequest = decode(parse_body(body)?)?;
    let strategy = state.cluster()?.set_strategy(&req.strategy)?;
    tracing::info!(%strategy, "load balancing strategy changed");

    Reply::json(&ClusterActionResponse {
        success: true,
        message: format!("Strategy set to {strategy}"),
        instances: Vec::new(),
    })
}

#[post("/restart", data = "<body>")]
pub async fn restart(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let req: RestartRequest = decode(parse_body(body)?)?;
    let cluster = Arc::clone(state.cluster()?);
    let id = req.instance_id.clone();
    state
        .coordinate(async move { cluster.restart_instance(&id).await })
        .await?;

    Reply::json(&ClusterActionResponse {
        success: true,
        message: format!("Instance '{}' restarted", req.instance_id),
        instances: vec![req.instance_id],
    })
}
