use std::sync::Arc;

use chrono::Utc;
use rocket::serde::json::{self, Json};
use rocket::{get, post, routes, Route, State};
use serde_json::Value;

use super::streaming::{chat_stream, completion_stream};
use super::{decode, parse_body, proxy, Reply};
use crate::app_state::{AppState, Backend};
use crate::engine::InferenceRequest;
use crate::error::{GatewayError, GatewayResult};
use crate::prompt::{build_chat_prompt, chat_turns, multimodal_parts, VALID_ROLES};
use crate::types::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, CompletionChoice,
    CompletionRequest, CompletionResponse, ModelCard, ModelList, ResponseMessage, Usage,
    SYSTEM_FINGERPRINT,
};

const DEFAULT_COMPLETION_MAX_TOKENS: usize = 16;
const MAX_DEFAULT_CHAT_TOKENS: usize = 4096;
const MAX_CHOICES: u32 = 128;

pub fn routes() -> Vec<Route> {
    routes![list_models, get_model, chat_completions, completions]
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// 没有显式 max_tokens 时取剩余上下文的一半，最多 4096
pub fn default_chat_max_tokens(max_sequence_length: usize, prompt_tokens: usize) -> usize {
    (max_sequence_length.saturating_sub(prompt_tokens) / 2).clamp(1, MAX_DEFAULT_CHAT_TOKENS)
}

fn validate_sampling(
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<i64>,
    n: Option<u32>,
) -> GatewayResult<()> {
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(GatewayError::invalid("'temperature' must be between 0 and 2", Some("temperature")));
        }
    }
    if let Some(p) = top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(GatewayError::invalid("'top_p' must be between 0 and 1", Some("top_p")));
        }
    }
    if max_tokens.is_some_and(|m| m < 1) {
        return Err(GatewayError::invalid("'max_tokens' must be at least 1", Some("max_tokens")));
    }
    if n.is_some_and(|n| !(1..=MAX_CHOICES).contains(&n)) {
        return Err(GatewayError::invalid(
            format!("'n' must be between 1 and {MAX_CHOICES}"),
            Some("n"),
        ));
    }
    Ok(())
}

pub fn validate_chat(req: &ChatCompletionRequest) -> GatewayResult<()> {
    if req.model.trim().is_empty() {
        return Err(GatewayError::invalid("'model' is required", Some("model")));
    }
    if req.messages.is_empty() {
        return Err(GatewayError::invalid("'messages' must be a non-empty array", Some("messages")));
    }
    for (i, msg) in req.messages.iter().enumerate() {
        if !VALID_ROLES.contains(&msg.role.as_str()) {
            return Err(GatewayError::invalid(
                format!("Invalid role '{}' in message at index {i}", msg.role),
                Some(format!("messages[{i}].role").as_str()),
            ));
        }
        if msg.content.is_none() && msg.tool_calls.is_none() && msg.function_call.is_none() {
            return Err(GatewayError::invalid(
                format!("Missing 'content' in message at index {i}"),
                Some(format!("messages[{i}].content").as_str()),
            ));
        }
    }
    validate_sampling(req.temperature, req.top_p, req.max_tokens, req.n)
}

pub fn validate_completion(req: &CompletionRequest) -> GatewayResult<()> {
    if req.model.trim().is_empty() {
        return Err(GatewayError::invalid("'model' is required", Some("model")));
    }
    validate_sampling(req.temperature, req.top_p, req.max_tokens, req.n)
}

fn repetition_penalty(frequency_penalty: Option<f32>) -> f32 {
    1.0 + 0.1 * frequency_penalty.unwrap_or(0.0)
}

fn completion_tokens(state: &AppState, text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        state.tokens.count(text)
    }
}

#[get("/models")]
pub async fn list_models(state: &State<Arc<AppState>>) -> GatewayResult<Reply> {
    let manager = match &state.backend {
        Backend::Local(manager) => manager,
        Backend::Cluster { .. } => {
            let state = state.inner().clone();
            let work = proxy::forward(state.clone(), "/v1/models".into(), None, None, false);
            return state.coordinate(work).await;
        }
    };

    let fallback = state.started_at.timestamp();
    let mut data: Vec<ModelCard> = manager
        .list_registered()
        .iter()
        .map(|config| {
            let created = manager
                .model_info(&config.name)
                .and_then(|info| info.loaded_at)
                .map(|t| t.timestamp())
                .unwrap_or(fallback);
            ModelCard::new(&config.name, created, "local")
        })
        .collect();
    data.extend(
        state
            .aliases
            .keys()
            .filter(|alias| !manager.is_registered(alias))
            .map(|alias| ModelCard::new(alias, fallback, "openai")),
    );

    Reply::json(&ModelList {
        object: "list".to_string(),
        data,
    })
}

#[get("/models/<id>")]
pub async fn get_model(id: &str, state: &State<Arc<AppState>>) -> GatewayResult<Reply> {
    let manager = match &state.backend {
        Backend::Local(manager) => manager,
        Backend::Cluster { .. } => {
            let state = state.inner().clone();
            let work = proxy::forward(state.clone(), format!("/v1/models/{id}"), None, None, false);
            return state.coordinate(work).await;
        }
    };

    let fallback = state.started_at.timestamp();
    if let Some(info) = manager.model_info(id) {
        let created = info.loaded_at.map(|t| t.timestamp()).unwrap_or(fallback);
        return Reply::json(&ModelCard::new(id, created, "local"));
    }
    if state.aliases.contains_key(id) {
        return Reply::json(&ModelCard::new(id, fallback, "openai"));
    }
    Err(GatewayError::ModelNotFound(id.to_string()))
}

#[post("/chat/completions", data = "<body>")]
pub async fn chat_completions(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let raw = parse_body(body)?;
    let req: ChatCompletionRequest = decode(raw.clone())?;
    validate_chat(&req)?;

    let state = state.inner().clone();
    if let Backend::Cluster { .. } = &state.backend {
        let model = Some(req.model.clone());
        let work = proxy::forward(state.clone(), "/v1/chat/completions".into(), Some(raw), model, req.stream);
        return state.coordinate(work).await;
    }
    let manager = Arc::clone(state.manager()?);

    let model_id = req.model.clone();
    let prompt = build_chat_prompt(&req.messages);
    let prompt_tokens = state.tokens.count(&prompt);
    let max_tokens = req
        .max_tokens
        .map(|m| m as usize)
        .unwrap_or_else(|| default_chat_max_tokens(state.config.max_sequence_length, prompt_tokens));

    let mut inference = InferenceRequest::new(state.resolve_model(&req.model), prompt);
    inference.messages = Some(chat_turns(&req.messages));
    inference.multimodal = multimodal_parts(&req.messages);
    inference.max_tokens = max_tokens;
    inference.temperature = req.temperature.unwrap_or(1.0);
    inference.top_p = req.top_p.unwrap_or(1.0);
    inference.top_k = req.top_k;
    inference.repetition_penalty = repetition_penalty(req.frequency_penalty);
    inference.stop = req.stop.clone().map(|s| s.into_vec()).unwrap_or_default();
    inference.stream = req.stream;

    let id = new_id("chatcmpl");
    let created = Utc::now().timestamp();

    if req.stream {
        let fragments = state
            .coordinate(async move { manager.infer_stream(inference).await })
            .await?;
        return Ok(Reply::Stream(chat_stream(fragments, id, created, model_id)));
    }

    let resp = state
        .coordinate(async move { manager.infer(inference).await })
        .await?;
    let usage = Usage::new(prompt_tokens, completion_tokens(&state, &resp.text));
    let choices = (0..req.n.unwrap_or(1))
        .map(|index| ChatChoice {
            index,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: resp.text.clone(),
            },
            logprobs: None,
            finish_reason: resp.finish_reason.as_str().to_string(),
        })
        .collect();

    Reply::json(&ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model: model_id,
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices,
        usage,
    })
}

#[post("/completions", data = "<body>")]
pub async fn completions(
    state: &State<Arc<AppState>>,
    body: Result<Json<Value>, json::Error<'_>>,
) -> GatewayResult<Reply> {
    let raw = parse_body(body)?;
    let req: CompletionRequest = decode(raw.clone())?;
    validate_completion(&req)?;

    let state = state.inner().clone();
    if let Backend::Cluster { .. } = &state.backend {
        let model = Some(req.model.clone());
        let work = proxy::forward(state.clone(), "/v1/completions".into(), Some(raw), model, req.stream);
        return state.coordinate(work).await;
    }
    let manager = Arc::clone(state.manager()?);

    let model_id = req.model.clone();
    let prompt = req.prompt.joined();
    let prompt_tokens = state.tokens.count(&prompt);

    let mut inference = InferenceRequest::new(state.resolve_model(&req.model), prompt.clone());
    inference.max_tokens = req
        .max_tokens
        .map(|m| m as usize)
        .unwrap_or(DEFAULT_COMPLETION_MAX_TOKENS);
    inference.temperature = req.temperature.unwrap_or(1.0);
    inference.top_p = req.top_p.unwrap_or(1.0);
    inference.top_k = req.top_k;
    inference.repetition_penalty = repetition_penalty(req.frequency_penalty);
    inference.stop = req.stop.clone().map(|s| s.into_vec()).unwrap_or_default();
    inference.stream = req.stream;

    let id = new_id("cmpl");
    let created = Utc::now().timestamp();

    if req.stream {
        let fragments = state
            .coordinate(async move { manager.infer_stream(inference).await })
            .await?;
        let echo = req.echo.then_some(prompt);
        return Ok(Reply::Stream(completion_stream(fragments, id, created, model_id, echo, req.suffix)));
    }

    let resp = state
        .coordinate(async move { manager.infer(inference).await })
        .await?;
    let usage = Usage::new(prompt_tokens, completion_tokens(&state, &resp.text));

    let mut text = String::new();
    if req.echo {
        text.push_str(&prompt);
    }
    text.push_str(&resp.text);
    if let Some(suffix) = &req.suffix {
        text.push_str(suffix);
    }

    let choices = (0..req.n.unwrap_or(1))
        .map(|index| CompletionChoice {
            text: text.clone(),
            index,
            logprobs: None,
            finish_reason: Some(resp.finish_reason.as_str().to_string()),
        })
        .collect();

    Reply::json(&CompletionResponse {
        id,
        object: "text_completion".to_string(),
        created,
        model: model_id,
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices,
        usage: Some(usage),
    })
}
