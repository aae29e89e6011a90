use std::sync::Arc;
use std::time::Instant;

use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use rocket::{Data, Request, Response};

use crate::app_state::AppState;

/// 每个请求一个 id，响应时写回 `X-Request-Id` 并记录耗时
pub struct RequestLogger;

#[derive(Clone)]
struct RequestTiming {
    id: String,
    started: Instant,
}

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, req: &mut Request<'_>, _: &mut Data<'_>) {
        let id = req
            .headers()
            .get_one("X-Request-Id")
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        req.local_cache(|| RequestTiming {
            id,
            started: Instant::now(),
        });
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let timing = req.local_cache(|| RequestTiming {
            id: uuid::Uuid::new_v4().simple().to_string(),
            started: Instant::now(),
        });
        let status = res.status().code;

        if let Some(state) = req.rocket().state::<Arc<AppState>>() {
            state.metrics.record(status);
        }
        res.set_header(Header::new("X-Request-Id", timing.id.clone()));

        let elapsed_ms = timing.started.elapsed().as_secs_f64() * 1000.0;
        if status >= 500 {
            tracing::warn!(request_id = %timing.id, method = %req.method(), path = %req.uri().path(), status, elapsed_ms, "request failed");
        } else {
            tracing::info!(request_id = %timing.id, method = %req.method(), path = %req.uri().path(), status, elapsed_ms, "request handled");
        }
    }
}
