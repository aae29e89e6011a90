#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rocket::local::asynchronous::Client;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use local_llm_gateway::api::{build_rocket, default_figment};
use local_llm_gateway::app_state::{AppState, Backend};
use local_llm_gateway::cluster::{ClusterManager, ClusterSettings, LaunchCommand};
use local_llm_gateway::config::{GatewayConfig, InferenceMode};
use local_llm_gateway::engine::{
    DummyEngine, EngineFactory, EngineHealth, EngineKind, InferenceEngine, InferenceRequest,
    InferenceResponse, ModelDetails,
};
use local_llm_gateway::error::GatewayError;
use local_llm_gateway::load_balancer::Strategy;
use local_llm_gateway::model_manager::{ManagerSettings, ModelManager};
use local_llm_gateway::model_registry::ModelConfig;

/// 流式生成在第一个片段之后失败的模型
pub const FLAKY_MODEL: &str = "flaky";

/// dummy 引擎，`flaky` 模型的流式生成会中途报错
pub struct FlakyStreams {
    inner: Arc<DummyEngine>,
}

#[async_trait]
impl InferenceEngine for FlakyStreams {
    fn kind(&self) -> EngineKind {
        EngineKind::Dummy
    }

    async fn initialize(&self) -> Result<bool> {
        self.inner.initialize().await
    }

    async fn load_model(&self, name: &str, path: &str, opts: &Map<String, Value>) -> Result<bool> {
        self.inner.load_model(name, path, opts).await
    }

    async fn unload_model(&self, name: &str) -> Result<bool> {
        self.inner.unload_model(name).await
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        self.inner.generate(request).await
    }

    async fn generate_stream(&self, request: &InferenceRequest, sender: mpsc::Sender<String>) -> Result<()> {
        if request.model_name != FLAKY_MODEL {
            return self.inner.generate_stream(request, sender).await;
        }
        let _ = sender.send("partial ".to_string()).await;
        Err(anyhow!("device lost"))
    }

    async fn health_check(&self) -> EngineHealth {
        self.inner.health_check().await
    }

    fn model_details(&self, name: &str) -> Option<ModelDetails> {
        self.inner.model_details(name)
    }
}

pub struct TestEngines;

impl EngineFactory for TestEngines {
    fn create(&self, kind: EngineKind) -> Result<Arc<dyn InferenceEngine>, GatewayError> {
        match kind {
            EngineKind::Dummy => Ok(Arc::new(FlakyStreams {
                inner: DummyEngine::with_delay(Duration::ZERO),
            })),
            other => Err(GatewayError::EngineNotSupported(other)),
        }
    }
}

pub fn test_config(mode: InferenceMode) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.inference_mode = mode;
    config.default_engine = EngineKind::Dummy;
    config.default_model = "tiny".to_string();
    config.request_timeout_secs = 10;
    config
}

pub async fn single_state() -> Arc<AppState> {
    let config = test_config(InferenceMode::Single);
    let manager = ModelManager::new(
        ManagerSettings {
            default_engine: EngineKind::Dummy,
            max_loaded_models: 2,
            ..Default::default()
        },
        Arc::new(TestEngines),
    );
    manager
        .initialize(vec![
            ModelConfig::new("tiny", "/models/tiny"),
            ModelConfig::new("small", "/models/small"),
            ModelConfig::new(FLAKY_MODEL, "/models/flaky"),
        ])
        .await
        .unwrap();
    AppState::with_backend(config, Backend::Local(manager))
}

pub fn cluster_settings(min_instances: usize) -> ClusterSettings {
    ClusterSettings {
        command: LaunchCommand {
            program: "true".to_string(),
            args: Vec::new(),
            instance_flags: false,
        },
        strategy: Strategy::RoundRobin,
        instance_host: "127.0.0.1".to_string(),
        base_port: 21000,
        startup_timeout: Duration::from_secs(2),
        ready_poll_interval: Duration::from_millis(50),
        stop_grace: Duration::from_secs(1),
        restart_delay: Duration::from_millis(10),
        monitor_interval: Duration::from_secs(3600),
        health_check_interval: Duration::from_secs(3600),
        health_check_timeout: Duration::from_secs(1),
        min_instances,
        max_instances: 4,
        max_restarts: None,
    }
}

/// 集群里没有托管进程；测试直接往负载均衡器里登记实例
pub fn cluster_state() -> Arc<AppState> {
    let config = test_config(InferenceMode::LoadBalance);
    let cluster = ClusterManager::new(cluster_settings(0), Vec::new());
    AppState::with_backend(
        config,
        Backend::Cluster {
            cluster,
            proxy: reqwest::Client::new(),
        },
    )
}

pub async fn client(state: Arc<AppState>) -> Client {
    Client::tracked(build_rocket(default_figment(), state))
        .await
        .unwrap()
}

/// 对任何请求都回同一个 JSON 的上游实例，返回端口
pub async fn fake_upstream(status_line: &'static str, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

/// 读完请求头和 content-length 指定的请求体
async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + length {
            return;
        }
    }
}

/// 把 SSE 响应体切成帧
pub fn frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| f.trim_start_matches("data: ").to_string())
        .collect()
}
