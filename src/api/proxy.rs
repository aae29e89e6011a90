use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde_json::Value;

use super::streaming::{error_frame, EventStream};
use super::Reply;
use crate::app_state::{AppState, Backend};
use crate::error::{GatewayError, GatewayResult};
use crate::load_balancer::LoadBalancer;

/// 实例返回的非流式响应，原样转给客户端
pub struct Proxied {
    status: Status,
    content_type: ContentType,
    body: Vec<u8>,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Proxied {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'o> {
        Response::build()
            .status(self.status)
            .header(self.content_type)
            .sized_body(self.body.len(), Cursor::new(self.body))
            .ok()
    }
}

/// 一次转发的在途记录；drop 时调用 mark_end，客户端中途断开也会结算
struct InFlight {
    balancer: Arc<LoadBalancer>,
    instance_id: String,
    started: Instant,
    success: bool,
}

impl InFlight {
    fn begin(balancer: Arc<LoadBalancer>, instance_id: String) -> Self {
        balancer.mark_start(&instance_id);
        Self {
            balancer,
            instance_id,
            started: Instant::now(),
            success: false,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.balancer
            .mark_end(&self.instance_id, self.started.elapsed(), self.success);
    }
}

/// 选一个实例转发请求；`body` 为空时发 GET
pub async fn forward(
    state: Arc<AppState>,
    path: String,
    body: Option<Value>,
    model: Option<String>,
    stream: bool,
) -> GatewayResult<Reply> {
    let Backend::Cluster { cluster, proxy } = &state.backend else {
        return Err(GatewayError::Server("request forwarding requires load_balance mode".into()));
    };
    let balancer = Arc::clone(cluster.load_balancer());
    let instance = balancer
        .select(model.as_deref())
        .ok_or_else(|| GatewayError::NoInstanceAvailable(model.clone()))?;

    let url = format!("{}{}", instance.url(), path);
    tracing::debug!(instance = %instance.id, %url, "forwarding request");
    let mut in_flight = InFlight::begin(balancer, instance.id.clone());

    let request = match &body {
        Some(body) => proxy.post(&url).json(body),
        None => proxy.get(&url),
    };
    let upstream = request.send().await?;
    let status = upstream.status();

    if stream && status.is_success() {
        let mut bytes = upstream.bytes_stream();
        return Ok(Reply::Stream(EventStream(Box::pin(async_stream::stream! {
            // 整个守卫移进流里，字节发完才结算
            let mut guard = in_flight;
            let mut ok = true;
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        yield chunk.to_vec();
                    }
                    Err(e) => {
                        ok = false;
                        yield error_frame(&GatewayError::from(e));
                        break;
                    }
                }
            }
            guard.success = ok;
        }))));
    }

    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentType::parse_flexible)
        .unwrap_or(ContentType::JSON);
    let body = upstream.bytes().await?.to_vec();
    in_flight.success = status.is_success();

    if !status.is_success() {
        tracing::warn!(instance = %instance.id, status = status.as_u16(), "upstream returned an error");
        // 实例已经给出错误信封时直接透传
        let is_envelope = serde_json::from_slice::<Value>(&body)
            .map(|v| v.get("error").is_some())
            .unwrap_or(false);
        if !is_envelope {
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
    }

    Ok(Reply::Proxied(Proxied {
        status: Status::from_code(status.as_u16()).unwrap_or(Status::BadGateway),
        content_type,
        body,
    }))
}
