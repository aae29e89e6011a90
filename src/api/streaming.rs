use std::io::Cursor;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use rocket::http::ContentType;
use rocket::request::Request;
use rocket::response::stream::ReaderStream;
use rocket::response::{self, Responder, Response};
use serde::Serialize;

use crate::error::GatewayError;
use crate::model_manager::FragmentStream;
use crate::types::{ChatCompletionChunk, ChatDelta, CompletionChoice, CompletionResponse, SYSTEM_FINGERPRINT};

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

pub type Frames = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// `text/event-stream` 响应，帧按顺序原样写出
pub struct EventStream(pub Frames);

impl<'r, 'o: 'r> Responder<'r, 'o> for EventStream {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'o> {
        Response::build()
            .header(ContentType::EventStream)
            .raw_header("Cache-Control", "no-cache")
            .raw_header("X-Accel-Buffering", "no")
            .streamed_body(ReaderStream::from(self.0.map(Cursor::new)))
            .ok()
    }
}

/// `data: <json>\n\n`
pub fn data_frame<T: Serialize>(payload: &T) -> Vec<u8> {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n").into_bytes()
}

pub fn error_frame(err: &GatewayError) -> Vec<u8> {
    tracing::error!("stream aborted: {err}");
    data_frame(&err.to_body())
}

/// 角色帧 → 内容帧 → 结束帧 → [DONE]；中途失败时以一个错误帧收尾
pub fn chat_stream(mut fragments: FragmentStream, id: String, created: i64, model: String) -> EventStream {
    EventStream(Box::pin(async_stream::stream! {
        let role = ChatDelta { role: Some("assistant".to_string()), content: None };
        yield data_frame(&ChatCompletionChunk::new(&id, created, &model, role, None));

        let mut failed = false;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(text) => {
                    let delta = ChatDelta { role: None, content: Some(text) };
                    yield data_frame(&ChatCompletionChunk::new(&id, created, &model, delta, None));
                }
                Err(e) => {
                    yield error_frame(&e);
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            yield data_frame(&ChatCompletionChunk::new(&id, created, &model, ChatDelta::default(), Some("stop")));
            yield DONE_FRAME.to_vec();
        }
    }))
}

fn completion_chunk(id: &str, created: i64, model: &str, text: String, finish_reason: Option<&str>) -> CompletionResponse {
    CompletionResponse {
        id: id.to_string(),
        object: "text_completion".to_string(),
        created,
        model: model.to_string(),
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices: vec![CompletionChoice {
            text,
            index: 0,
            logprobs: None,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage: None,
    }
}

/// 文本补全流；`echo` 的提示词作为第一帧，`suffix` 在结束帧之前
pub fn completion_stream(
    mut fragments: FragmentStream,
    id: String,
    created: i64,
    model: String,
    echo: Option<String>,
    suffix: Option<String>,
) -> EventStream {
    EventStream(Box::pin(async_stream::stream! {
        if let Some(prompt) = echo {
            yield data_frame(&completion_chunk(&id, created, &model, prompt, None));
        }

        let mut failed = false;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(text) => {
                    yield data_frame(&completion_chunk(&id, created, &model, text, None));
                }
                Err(e) => {
                    yield error_frame(&e);
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            if let Some(suffix) = suffix {
                yield data_frame(&completion_chunk(&id, created, &model, suffix, None));
            }
            yield data_frame(&completion_chunk(&id, created, &model, String::new(), Some("stop")));
            yield DONE_FRAME.to_vec();
        }
    }))
}
