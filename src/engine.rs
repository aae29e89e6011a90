use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// 后端运行时种类（封闭枚举，启动时解析一次）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// 按回退链自动选择
    Auto,
    Vllm,
    Mlx,
    LlamaCpp,
    Dummy,
}

impl EngineKind {
    /// 显式的回退顺序；`Auto` 本身永远不会被实例化
    pub fn fallback_chain(self) -> Vec<EngineKind> {
        match self {
            EngineKind::Auto => vec![
                EngineKind::Vllm,
                EngineKind::Mlx,
                EngineKind::LlamaCpp,
                EngineKind::Dummy,
            ],
            EngineKind::LlamaCpp => vec![EngineKind::LlamaCpp],
            EngineKind::Dummy => vec![EngineKind::Dummy],
            other => vec![other, EngineKind::LlamaCpp],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Auto => "auto",
            EngineKind::Vllm => "vllm",
            EngineKind::Mlx => "mlx",
            EngineKind::LlamaCpp => "llama_cpp",
            EngineKind::Dummy => "dummy",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(EngineKind::Auto),
            "vllm" => Ok(EngineKind::Vllm),
            "mlx" => Ok(EngineKind::Mlx),
            "llama_cpp" | "llamacpp" => Ok(EngineKind::LlamaCpp),
            "dummy" => Ok(EngineKind::Dummy),
            other => Err(GatewayError::invalid(
                format!("unknown engine type `{other}`"),
                Some("engine_type"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
        }
    }

    /// 把各引擎五花八门的结束原因归一到协议的封闭集合
    pub fn normalize(raw: &str) -> FinishReason {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("stop") || lower.contains("complete") || lower.is_empty() {
            FinishReason::Stop
        } else if lower.contains("length") || lower.contains("max") {
            FinishReason::Length
        } else if lower.contains("tool") || lower.contains("function") {
            FinishReason::ToolCalls
        } else if lower.contains("content") {
            FinishReason::ContentFilter
        } else {
            FinishReason::Stop
        }
    }
}

/// 发给引擎的推理请求（与 wire 协议无关）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model_name: String,
    pub prompt: String,
    #[serde(default)]
    pub messages: Option<Vec<ChatTurn>>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    #[serde(default)]
    pub stop: Vec<String>,
    pub stream: bool,
    pub request_id: String,
    /// 多模态附件，原样透传给引擎
    #[serde(default)]
    pub multimodal: Option<Vec<Value>>,
}

impl InferenceRequest {
    pub fn new(model_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            prompt: prompt.into(),
            messages: None,
            max_tokens: 256,
            temperature: 1.0,
            top_p: 1.0,
            top_k: None,
            repetition_penalty: 1.0,
            stop: Vec::new(),
            stream: false,
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            multimodal: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub model_name: String,
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// 秒
    pub inference_time: f64,
    pub tokens_per_second: f64,
    pub finish_reason: FinishReason,
    pub request_id: Option<String>,
}

impl InferenceResponse {
    pub fn new(
        model_name: impl Into<String>,
        text: impl Into<String>,
        prompt_tokens: usize,
        completion_tokens: usize,
        inference_time: f64,
        finish_reason: FinishReason,
    ) -> Self {
        let mut resp = Self {
            model_name: model_name.into(),
            text: text.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: 0,
            inference_time,
            tokens_per_second: 0.0,
            finish_reason,
            request_id: None,
        };
        resp.normalize();
        resp
    }

    /// 保证 total == prompt + completion，并重新推导吞吐
    pub fn normalize(&mut self) {
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
        self.tokens_per_second = if self.inference_time > 0.0 {
            self.completion_tokens as f64 / self.inference_time
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: HealthState,
    pub message: Option<String>,
}

impl EngineHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            message: None,
        }
    }
}

/// 引擎在加载后报告的模型信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDetails {
    pub size_mb: Option<f64>,
    pub parameters: Option<u64>,
    pub context_length: Option<usize>,
    pub memory_usage: Option<String>,
}

/// 统一的推理引擎抽象
///
/// 编排层只通过这个 trait 与具体运行时交互。计算密集且不是原生异步的
/// 实现应当在内部用 `spawn_blocking`，不要阻塞调度线程。
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn initialize(&self) -> Result<bool>;

    /// 失败时返回 Err（加载错误）
    async fn load_model(&self, name: &str, path: &str, opts: &Map<String, Value>) -> Result<bool>;

    async fn unload_model(&self, name: &str) -> Result<bool>;

    /// 一次性生成完整结果
    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse>;

    /// 流式生成：把文本片段按顺序推送到 sender 中；接收端关闭时应尽快返回
    async fn generate_stream(
        &self,
        request: &InferenceRequest,
        sender: mpsc::Sender<String>,
    ) -> Result<()>;

    async fn health_check(&self) -> EngineHealth;

    fn model_details(&self, _name: &str) -> Option<ModelDetails> {
        None
    }

    async fn shutdown(&self) {}
}

/// 按种类创建引擎实例；不认识的种类返回 `EngineNotSupported`
pub trait EngineFactory: Send + Sync {
    fn create(&self, kind: EngineKind) -> Result<Arc<dyn InferenceEngine>, GatewayError>;
}

/// 本仓库自带的引擎集合：只有 dummy
#[derive(Debug, Clone, Default)]
pub struct BuiltinEngines {
    pub dummy_delay: Duration,
}

impl EngineFactory for BuiltinEngines {
    fn create(&self, kind: EngineKind) -> Result<Arc<dyn InferenceEngine>, GatewayError> {
        match kind {
            EngineKind::Dummy => Ok(DummyEngine::with_delay(self.dummy_delay)),
            other => Err(GatewayError::EngineNotSupported(other)),
        }
    }
}

/// 沿回退链找到第一个能初始化成功的引擎
pub async fn resolve_engine(
    factory: &dyn EngineFactory,
    preferred: EngineKind,
) -> Result<(EngineKind, Arc<dyn InferenceEngine>), GatewayError> {
    let mut failures = Vec::new();
    for kind in preferred.fallback_chain() {
        let engine = match factory.create(kind) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::debug!(engine = %kind, "{}", e);
                failures.push(format!("{kind}: {e}"));
                continue;
            }
        };
        match engine.initialize().await {
            Ok(true) => {
                tracing::info!(engine = %kind, "inference engine initialized");
                return Ok((kind, engine));
            }
            Ok(false) => {
                tracing::warn!(engine = %kind, "engine initialization reported failure");
                failures.push(format!("{kind}: initialize returned false"));
            }
            Err(e) => {
                tracing::warn!(engine = %kind, "engine initialization failed: {e:#}");
                failures.push(format!("{kind}: {e}"));
            }
        }
    }
    Err(GatewayError::NoEngineAvailable(failures.join("; ")))
}

/// Dummy 实现：只做字符串处理和延迟模拟
pub struct DummyEngine {
    delay: Duration,
    models: RwLock<HashMap<String, ModelDetails>>,
}

impl DummyEngine {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(50))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            models: RwLock::new(HashMap::new()),
        })
    }

    fn reply_words(&self, request: &InferenceRequest) -> (Vec<String>, FinishReason) {
        let full = format!("[{} DUMMY] {}", request.model_name, request.prompt.to_uppercase());
        let mut words: Vec<String> = full.split_whitespace().map(|s| s.to_string()).collect();
        if words.len() > request.max_tokens {
            words.truncate(request.max_tokens);
            (words, FinishReason::Length)
        } else {
            (words, FinishReason::Stop)
        }
    }
}

#[async_trait]
impl InferenceEngine for DummyEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Dummy
    }

    async fn initialize(&self) -> Result<bool> {
        Ok(true)
    }

    async fn load_model(&self, name: &str, _path: &str, opts: &Map<String, Value>) -> Result<bool> {
        let context_length = opts
            .get("context_length")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(2048);
        self.models.write().insert(
            name.to_string(),
            ModelDetails {
                size_mb: Some(100.0),
                parameters: Some(1_000_000),
                context_length: Some(context_length),
                memory_usage: Some("100MB".to_string()),
            },
        );
        Ok(true)
    }

    async fn unload_model(&self, name: &str) -> Result<bool> {
        Ok(self.models.write().remove(name).is_some())
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let started = Instant::now();
        // 模拟一点延迟
        tokio::time::sleep(self.delay).await;

        let (words, finish) = self.reply_words(request);
        let prompt_tokens = request.prompt.split_whitespace().count();
        let mut resp = InferenceResponse::new(
            &request.model_name,
            words.join(" "),
            prompt_tokens,
            words.len(),
            started.elapsed().as_secs_f64(),
            finish,
        );
        resp.request_id = Some(request.request_id.clone());
        Ok(resp)
    }

    async fn generate_stream(
        &self,
        request: &InferenceRequest,
        sender: mpsc::Sender<String>,
    ) -> Result<()> {
        let (words, _) = self.reply_words(request);
        for w in words {
            if sender.send(format!("{w} ")).await.is_err() {
                // 客户端断开连接
                break;
            }
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    async fn health_check(&self) -> EngineHealth {
        EngineHealth::healthy()
    }

    fn model_details(&self, name: &str) -> Option<ModelDetails> {
        self.models.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnlyLlamaCpp;

    impl EngineFactory for OnlyLlamaCpp {
        fn create(&self, kind: EngineKind) -> Result<Arc<dyn InferenceEngine>, GatewayError> {
            match kind {
                // 借用 dummy 充当 llama.cpp
                EngineKind::LlamaCpp => Ok(DummyEngine::with_delay(Duration::ZERO)),
                other => Err(GatewayError::EngineNotSupported(other)),
            }
        }
    }

    #[test]
    fn fallback_chains_are_ordered() {
        assert_eq!(
            EngineKind::Vllm.fallback_chain(),
            vec![EngineKind::Vllm, EngineKind::LlamaCpp]
        );
        assert_eq!(EngineKind::Auto.fallback_chain().last(), Some(&EngineKind::Dummy));
        assert!(!EngineKind::Auto.fallback_chain().contains(&EngineKind::Auto));
    }

    #[tokio::test]
    async fn unsupported_engine_falls_back_silently() {
        let (kind, _) = resolve_engine(&OnlyLlamaCpp, EngineKind::Mlx).await.unwrap();
        assert_eq!(kind, EngineKind::LlamaCpp);
    }

    #[tokio::test]
    async fn exhausted_chain_is_reported() {
        let err = resolve_engine(&BuiltinEngines::default(), EngineKind::Vllm)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::NoEngineAvailable(_)));
    }

    #[tokio::test]
    async fn dummy_respects_max_tokens() {
        let engine = DummyEngine::with_delay(Duration::ZERO);
        let mut req = InferenceRequest::new("m", "one two three four five");
        req.max_tokens = 3;
        let resp = engine.generate(&req).await.unwrap();
        assert_eq!(resp.completion_tokens, 3);
        assert_eq!(resp.finish_reason, FinishReason::Length);
        assert_eq!(resp.total_tokens, resp.prompt_tokens + resp.completion_tokens);
    }

    #[tokio::test]
    async fn dummy_stream_stops_when_receiver_drops() {
        let engine = DummyEngine::with_delay(Duration::ZERO);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let req = InferenceRequest::new("m", "hello world");
        assert!(engine.generate_stream(&req, tx).await.is_ok());
    }

    #[test]
    fn finish_reason_normalization() {
        assert_eq!(FinishReason::normalize("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::normalize("function_call"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::normalize("content_filter"), FinishReason::ContentFilter);
        assert_eq!(FinishReason::normalize("eos"), FinishReason::Stop);
    }
}
