use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cluster::ClusterManager;
use crate::config::{GatewayConfig, InferenceMode};
use crate::engine::EngineFactory;
use crate::error::{GatewayError, GatewayResult};
use crate::model_manager::{ManagerSettings, ModelManager};
use crate::tokens::TokenCounter;

/// 处理请求的后端：单机模式直接走 Model Manager，负载均衡模式转发给集群实例
pub enum Backend {
    Local(Arc<ModelManager>),
    Cluster {
        cluster: Arc<ClusterManager>,
        proxy: reqwest::Client,
    },
}

/// HTTP 层计数，由请求日志 fairing 维护
#[derive(Debug, Default)]
pub struct RequestMetrics {
    pub requests: AtomicU64,
    pub client_errors: AtomicU64,
    pub server_errors: AtomicU64,
}

impl RequestMetrics {
    pub fn record(&self, status: u16) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match status {
            400..=499 => {
                self.client_errors.fetch_add(1, Ordering::Relaxed);
            }
            500..=599 => {
                self.server_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> RequestMetricsSnapshot {
        RequestMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RequestMetricsSnapshot {
    pub requests: u64,
    pub client_errors: u64,
    pub server_errors: u64,
}

/// 全局共享状态：
/// - config: 启动后只读的配置
/// - backend: Model Manager 或 集群 + 负载均衡器
/// - tokens: token 计数
/// - aliases: 外部模型 id -> 内部模型名
pub struct AppState {
    pub config: GatewayConfig,
    pub backend: Backend,
    pub tokens: TokenCounter,
    pub aliases: BTreeMap<String, String>,
    pub metrics: RequestMetrics,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// 按推理模式构建并启动各组件
    pub async fn initialize(
        config: GatewayConfig,
        config_path: Option<&Path>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Arc<Self>> {
        let backend = match config.inference_mode {
            InferenceMode::Single => {
                let settings = ManagerSettings {
                    max_loaded_models: config.max_concurrent_models,
                    max_concurrent_requests: config.max_concurrent_requests,
                    default_engine: config.default_engine,
                    monitor_interval: Duration::from_secs(config.monitor_interval_secs.max(1)),
                };
                let manager = ModelManager::new(settings, factory);
                manager
                    .initialize(config.models.clone())
                    .await
                    .map_err(|e| anyhow!("model manager failed to initialize: {e}"))?;
                manager.start_monitor();
                Backend::Local(manager)
            }
            InferenceMode::LoadBalance => {
                let cluster = ClusterManager::from_config(&config, config_path)?;
                let started = cluster
                    .start_cluster()
                    .await
                    .map_err(|e| anyhow!("cluster failed to start: {e}"))?;
                tracing::info!(started, "load balanced cluster is up");
                let proxy = reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .build()?;
                Backend::Cluster { cluster, proxy }
            }
        };

        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: GatewayConfig, backend: Backend) -> Arc<Self> {
        let tokens = TokenCounter::from_optional_path(config.tokenizer_path.as_deref());
        let aliases = config.aliases();
        Arc::new(Self {
            config,
            backend,
            tokens,
            aliases,
            metrics: RequestMetrics::default(),
            started_at: Utc::now(),
        })
    }

    pub async fn shutdown(&self) {
        match &self.backend {
            Backend::Local(manager) => manager.shutdown().await,
            Backend::Cluster { cluster, .. } => cluster.stop_cluster().await,
        }
    }

    pub fn mode(&self) -> InferenceMode {
        self.config.inference_mode
    }

    pub fn manager(&self) -> GatewayResult<&Arc<ModelManager>> {
        match &self.backend {
            Backend::Local(manager) => Ok(manager),
            Backend::Cluster { .. } => Err(GatewayError::invalid(
                "model management is not available in load_balance mode",
                None,
            )),
        }
    }

    pub fn cluster(&self) -> GatewayResult<&Arc<ClusterManager>> {
        match &self.backend {
            Backend::Cluster { cluster, .. } => Ok(cluster),
            Backend::Local(_) => Err(GatewayError::invalid(
                "cluster management is only available in load_balance mode",
                None,
            )),
        }
    }

    /// 别名映射；未知 id 原样返回
    pub fn resolve_model<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// 把协调工作交给运行时并限时等待；超时后任务继续运行，结果未知
    pub async fn coordinate<T, F>(&self, work: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let limit = self.request_timeout();
        match tokio::time::timeout(limit, tokio::spawn(work)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GatewayError::Server(format!("request task failed: {e}"))),
            Err(_) => {
                tracing::warn!(timeout = ?limit, "request timed out; work continues in background");
                Err(GatewayError::Timeout(limit))
            }
        }
    }
}
