use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, OwnedMutexGuard, Semaphore};

use crate::engine::{
    resolve_engine, EngineFactory, EngineHealth, EngineKind, HealthState, InferenceEngine,
    InferenceRequest, InferenceResponse,
};
use crate::error::{GatewayError, GatewayResult};
use crate::model_registry::{ModelConfig, ModelInfo, ModelRegistry, ModelStatus};
use crate::tasks::{periodic, BackgroundTask};

const STREAM_BUFFER: usize = 32;

/// 流式推理输出：按顺序的文本片段，生成失败时最后一项为 Err
pub type FragmentStream = Pin<Box<dyn Stream<Item = GatewayResult<String>> + Send>>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_loaded_models: usize,
    pub max_concurrent_requests: usize,
    pub default_engine: EngineKind,
    pub monitor_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_loaded_models: 1,
            max_concurrent_requests: 16,
            default_engine: EngineKind::Auto,
            monitor_interval: Duration::from_secs(60),
        }
    }
}

struct Slot {
    info: ModelInfo,
    engine: Option<Arc<dyn InferenceEngine>>,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    failed: AtomicU64,
    completion_tokens: AtomicU64,
}

enum Admission {
    Admitted,
    Evict(String),
    Full(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine_type: EngineKind,
    pub loaded_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub initialized: bool,
    pub default_engine: Option<EngineKind>,
    pub total_engines: usize,
    pub registered_models: usize,
    pub loaded_models: usize,
    pub max_concurrent_models: usize,
    pub models: Vec<ModelInfo>,
    pub engines: Vec<EngineStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
    pub manager_initialized: bool,
    pub engines: BTreeMap<String, EngineHealth>,
    pub models: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub completion_tokens: u64,
    pub registered_models: usize,
    pub loaded_models: usize,
}

/// 模型管理器：注册表、生命周期、并发上限与推理路由
///
/// 状态机：UNLOADED → LOADING → {LOADED, ERROR}；LOADED → UNLOADING → {UNLOADED, ERROR}。
/// 同名模型的状态迁移由注册表里的每模型锁串行化，不同模型互不阻塞。
pub struct ModelManager {
    settings: ManagerSettings,
    registry: ModelRegistry,
    slots: RwLock<HashMap<String, Slot>>,
    engines: RwLock<HashMap<EngineKind, Arc<dyn InferenceEngine>>>,
    /// 请求的引擎种类 -> 回退后实际使用的种类
    resolved: RwLock<HashMap<EngineKind, EngineKind>>,
    engine_init: tokio::sync::Mutex<()>,
    default_engine: RwLock<Option<EngineKind>>,
    factory: Arc<dyn EngineFactory>,
    workers: Arc<Semaphore>,
    counters: Arc<Counters>,
    monitor: Mutex<Option<BackgroundTask>>,
    initialized: AtomicBool,
}

impl ModelManager {
    pub fn new(settings: ManagerSettings, factory: Arc<dyn EngineFactory>) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1)));
        Arc::new(Self {
            settings,
            registry: ModelRegistry::new(),
            slots: RwLock::new(HashMap::new()),
            engines: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
            engine_init: tokio::sync::Mutex::new(()),
            default_engine: RwLock::new(None),
            factory,
            workers,
            counters: Arc::new(Counters::default()),
            monitor: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// 解析默认引擎、注册配置里的模型，并加载 auto_load 的模型
    pub async fn initialize(&self, models: Vec<ModelConfig>) -> GatewayResult<()> {
        tracing::info!(engine = %self.settings.default_engine, "initializing model manager");
        let (kind, _) = self.engine_for(None).await?;
        *self.default_engine.write() = Some(kind);

        let auto_load: Vec<String> = models
            .iter()
            .filter(|m| m.auto_load)
            .map(|m| m.name.clone())
            .collect();
        for config in models {
            self.register(config);
        }
        self.initialized.store(true, Ordering::SeqCst);

        for name in auto_load {
            if let Err(e) = self.load(&name, false).await {
                tracing::error!(model = %name, "auto-load failed: {e}");
            }
        }
        tracing::info!("model manager initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn register(&self, config: ModelConfig) {
        tracing::info!(model = %config.name, path = %config.path, "registered model");
        self.registry.register(config);
    }

    /// 只允许注销未加载的模型
    pub async fn unregister(&self, name: &str) -> GatewayResult<()> {
        // 与进行中的加载/卸载串行
        let _guard = self.lock_model(name).await?;
        {
            let mut slots = self.slots.write();
            if let Some(slot) = slots.get(name) {
                if slot.info.status != ModelStatus::Error {
                    return Err(GatewayError::invalid(
                        format!("model `{name}` is {:?}; unload it first", slot.info.status),
                        Some("model_name"),
                    ));
                }
            }
            slots.remove(name);
        }
        self.registry.unregister(name);
        tracing::info!(model = %name, "unregistered model");
        Ok(())
    }

    pub fn list_registered(&self) -> Vec<ModelConfig> {
        self.registry.list()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn status_of(&self, name: &str) -> Option<ModelStatus> {
        if let Some(slot) = self.slots.read().get(name) {
            return Some(slot.info.status);
        }
        self.registry.contains(name).then_some(ModelStatus::Unloaded)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.status_of(name) == Some(ModelStatus::Loaded)
    }

    /// 已加载模型，按 loaded_at 从旧到新
    pub fn loaded_models(&self) -> Vec<String> {
        let slots = self.slots.read();
        let mut loaded: Vec<(&String, Option<DateTime<Utc>>)> = slots
            .iter()
            .filter(|(_, s)| s.info.status == ModelStatus::Loaded)
            .map(|(n, s)| (n, s.info.loaded_at))
            .collect();
        loaded.sort_by_key(|(n, at)| (*at, self.registry.seq_of(n)));
        loaded.into_iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn model_info(&self, name: &str) -> Option<ModelInfo> {
        if let Some(slot) = self.slots.read().get(name) {
            return Some(slot.info.clone());
        }
        self.registry
            .get(name)
            .map(|config| ModelInfo::new(&config, ModelStatus::Unloaded))
    }

    /// 拿到每模型锁；等锁期间被注销或重新注册都按不存在处理
    async fn lock_model(&self, name: &str) -> GatewayResult<OwnedMutexGuard<()>> {
        let entry = self
            .registry
            .entry(name)
            .ok_or_else(|| GatewayError::ModelNotFound(name.to_string()))?;
        let guard = Arc::clone(&entry.lock).lock_owned().await;
        if self.registry.seq_of(name) != entry.seq {
            return Err(GatewayError::ModelNotFound(name.to_string()));
        }
        Ok(guard)
    }

    pub async fn load(&self, name: &str, force: bool) -> GatewayResult<()> {
        let _guard = self.lock_model(name).await?;
        self.load_locked(name, force).await
    }

    /// 返回 false 表示模型本来就没有加载
    pub async fn unload(&self, name: &str) -> GatewayResult<bool> {
        let _guard = self.lock_model(name).await?;
        if !self.is_loaded(name) {
            tracing::warn!(model = %name, "unload requested but model is not loaded");
            return Ok(false);
        }
        self.unload_locked(name).await?;
        Ok(true)
    }

    // 调用方必须持有 name 的模型锁
    async fn load_locked(&self, name: &str, force: bool) -> GatewayResult<()> {
        let config = self
            .registry
            .get(name)
            .ok_or_else(|| GatewayError::ModelNotFound(name.to_string()))?;

        if self.is_loaded(name) {
            if !force {
                tracing::debug!(model = %name, "model already loaded");
                return Ok(());
            }
            tracing::info!(model = %name, "force reload requested");
            self.unload_locked(name).await?;
        }

        self.admit(&config).await?;

        let (kind, engine) = match self.engine_for(config.engine_type).await {
            Ok(found) => found,
            Err(e) => return Err(self.fail_load(name, None, e.to_string()).await),
        };

        tracing::info!(model = %name, engine = %kind, "loading model");
        match engine
            .load_model(name, &config.path, &config.load_options())
            .await
        {
            Ok(true) => {
                let details = engine.model_details(name).unwrap_or_default();
                let mut slots = self.slots.write();
                if let Some(slot) = slots.get_mut(name) {
                    slot.info.status = ModelStatus::Loaded;
                    slot.info.engine_type = Some(kind);
                    slot.info.loaded_at = Some(Utc::now());
                    slot.info.size_mb = details.size_mb;
                    slot.info.parameters = details.parameters;
                    slot.info.context_length = config.max_context_length.or(details.context_length);
                    slot.info.memory_usage = details.memory_usage;
                    slot.info.error_message = None;
                    slot.engine = Some(engine);
                }
                tracing::info!(model = %name, engine = %kind, "model loaded");
                Ok(())
            }
            Ok(false) => Err(self
                .fail_load(name, Some(engine), "engine reported load failure".to_string())
                .await),
            Err(e) => Err(self.fail_load(name, Some(engine), format!("{e:#}")).await),
        }
    }

    /// 丢弃引擎里的半成品状态，把模型留在 ERROR
    async fn fail_load(
        &self,
        name: &str,
        engine: Option<Arc<dyn InferenceEngine>>,
        cause: String,
    ) -> GatewayError {
        if let Some(engine) = engine {
            if let Err(e) = engine.unload_model(name).await {
                tracing::debug!(model = %name, "discarding partial load failed: {e:#}");
            }
        }
        {
            let mut slots = self.slots.write();
            if let Some(slot) = slots.get_mut(name) {
                slot.info.status = ModelStatus::Error;
                slot.info.error_message = Some(cause.clone());
                slot.engine = None;
            }
        }
        tracing::error!(model = %name, "model load failed: {cause}");
        GatewayError::ModelLoad {
            name: name.to_string(),
            cause,
        }
    }

    // 调用方必须持有 name 的模型锁
    async fn unload_locked(&self, name: &str) -> GatewayResult<()> {
        let engine = {
            let mut slots = self.slots.write();
            match slots.get_mut(name) {
                Some(slot) => {
                    slot.info.status = ModelStatus::Unloading;
                    slot.engine.clone()
                }
                None => return Ok(()),
            }
        };

        let outcome = match engine {
            Some(engine) => engine.unload_model(name).await.map_err(|e| format!("{e:#}")),
            None => Ok(true),
        };

        let mut slots = self.slots.write();
        match outcome {
            Ok(true) => {
                slots.remove(name);
                tracing::info!(model = %name, "model unloaded");
                Ok(())
            }
            Ok(false) | Err(_) => {
                let cause = outcome
                    .err()
                    .unwrap_or_else(|| "engine reported unload failure".to_string());
                if let Some(slot) = slots.get_mut(name) {
                    slot.info.status = ModelStatus::Error;
                    slot.info.error_message = Some(cause.clone());
                    slot.engine = None;
                }
                tracing::error!(model = %name, "model unload failed: {cause}");
                Err(GatewayError::Server(format!(
                    "failed to unload model `{name}`: {cause}"
                )))
            }
        }
    }

    /// 检查并占用一个加载名额；满了就驱逐 loaded_at 最早的模型
    ///
    /// 名额检查与进入 LOADING 在同一把写锁下完成，LOADED + LOADING 的数量不会超过上限。
    /// 锁被别的迁移占用的候选直接跳过，不等待，避免两个加载互相驱逐时死锁。
    async fn admit(&self, config: &ModelConfig) -> GatewayResult<()> {
        let name = config.name.as_str();
        let limit = self.settings.max_loaded_models.max(1);
        let mut skipped: HashSet<String> = HashSet::new();

        loop {
            let decision = {
                let mut slots = self.slots.write();
                let occupied = slots
                    .iter()
                    .filter(|(n, s)| {
                        n.as_str() != name
                            && matches!(s.info.status, ModelStatus::Loaded | ModelStatus::Loading)
                    })
                    .count();
                if occupied < limit {
                    slots.insert(
                        name.to_string(),
                        Slot {
                            info: ModelInfo::new(config, ModelStatus::Loading),
                            engine: None,
                        },
                    );
                    Admission::Admitted
                } else {
                    slots
                        .iter()
                        .filter(|(n, s)| {
                            n.as_str() != name
                                && s.info.status == ModelStatus::Loaded
                                && !skipped.contains(n.as_str())
                        })
                        .min_by_key(|(n, s)| (s.info.loaded_at, self.registry.seq_of(n)))
                        .map(|(n, _)| Admission::Evict(n.clone()))
                        .unwrap_or(Admission::Full(occupied))
                }
            };

            match decision {
                Admission::Admitted => return Ok(()),
                Admission::Full(current) => {
                    return Err(GatewayError::ResourceLimit {
                        resource: "concurrently loaded models".to_string(),
                        current,
                        limit,
                    })
                }
                Admission::Evict(victim) => {
                    let Some(entry) = self.registry.entry(&victim) else {
                        skipped.insert(victim);
                        continue;
                    };
                    let Ok(_victim_guard) = entry.lock.clone().try_lock_owned() else {
                        tracing::debug!(model = %victim, "eviction candidate busy, skipping");
                        skipped.insert(victim);
                        continue;
                    };
                    if !self.is_loaded(&victim) {
                        continue;
                    }
                    tracing::warn!(model = %victim, incoming = %name, "evicting oldest loaded model");
                    if let Err(e) = self.unload_locked(&victim).await {
                        tracing::warn!(model = %victim, "eviction failed: {e}");
                        skipped.insert(victim);
                    }
                }
            }
        }
    }

    /// 取得（必要时创建）某种类的引擎；None 表示用默认引擎
    async fn engine_for(
        &self,
        requested: Option<EngineKind>,
    ) -> GatewayResult<(EngineKind, Arc<dyn InferenceEngine>)> {
        let wanted = match requested {
            Some(EngineKind::Auto) | None => {
                (*self.default_engine.read()).unwrap_or(self.settings.default_engine)
            }
            Some(kind) => kind,
        };

        if let Some(found) = self.cached_engine(wanted) {
            return Ok(found);
        }

        let _init = self.engine_init.lock().await;
        if let Some(found) = self.cached_engine(wanted) {
            return Ok(found);
        }

        let (kind, engine) = resolve_engine(self.factory.as_ref(), wanted).await?;
        let engine = {
            let mut engines = self.engines.write();
            Arc::clone(engines.entry(kind).or_insert(engine))
        };
        self.resolved.write().insert(wanted, kind);
        if kind != wanted {
            tracing::warn!(requested = %wanted, using = %kind, "engine fell back");
        }
        Ok((kind, engine))
    }

    fn cached_engine(&self, wanted: EngineKind) -> Option<(EngineKind, Arc<dyn InferenceEngine>)> {
        let kind = self.resolved.read().get(&wanted).copied()?;
        self.engines
            .read()
            .get(&kind)
            .map(|engine| (kind, Arc::clone(engine)))
    }

    fn bound_engine(&self, name: &str) -> Option<Arc<dyn InferenceEngine>> {
        let slots = self.slots.read();
        slots
            .get(name)
            .filter(|s| s.info.status == ModelStatus::Loaded)
            .and_then(|s| s.engine.clone())
    }

    /// 已注册但未加载的模型在第一次使用时自动加载
    async fn ready_engine(&self, name: &str) -> GatewayResult<Arc<dyn InferenceEngine>> {
        if !self.registry.contains(name) {
            return Err(GatewayError::ModelNotFound(name.to_string()));
        }
        for _ in 0..2 {
            if let Some(engine) = self.bound_engine(name) {
                return Ok(engine);
            }
            tracing::info!(model = %name, "auto-loading model on first use");
            self.load(name, false).await?;
        }
        self.bound_engine(name).ok_or_else(|| GatewayError::ModelLoad {
            name: name.to_string(),
            cause: "model was unloaded before inference could start".to_string(),
        })
    }

    pub async fn infer(&self, request: InferenceRequest) -> GatewayResult<InferenceResponse> {
        let engine = self.ready_engine(&request.model_name).await?;
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Server("inference worker pool is closed".to_string()))?;

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        match engine.generate(&request).await {
            Ok(mut resp) => {
                resp.normalize();
                if resp.request_id.is_none() {
                    resp.request_id = Some(request.request_id.clone());
                }
                self.counters
                    .completion_tokens
                    .fetch_add(resp.completion_tokens as u64, Ordering::Relaxed);
                Ok(resp)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::Inference(format!("{e:#}")))
            }
        }
    }

    /// 模型解析与自动加载立即完成，生成在第一次 poll 时才开始
    pub async fn infer_stream(&self, request: InferenceRequest) -> GatewayResult<FragmentStream> {
        let engine = self.ready_engine(&request.model_name).await?;
        let workers = Arc::clone(&self.workers);
        let counters = Arc::clone(&self.counters);

        Ok(Box::pin(async_stream::stream! {
            match workers.acquire_owned().await {
                Err(_) => {
                    yield Err(GatewayError::Server("inference worker pool is closed".to_string()));
                }
                Ok(permit) => {
                    counters.requests.fetch_add(1, Ordering::Relaxed);
                    let (tx, mut rx) = mpsc::channel::<String>(STREAM_BUFFER);
                    let task = tokio::spawn(async move {
                        let _permit = permit;
                        engine.generate_stream(&request, tx).await
                    });

                    let mut fragments = 0u64;
                    while let Some(fragment) = rx.recv().await {
                        fragments += 1;
                        yield Ok(fragment);
                    }

                    match task.await {
                        Ok(Ok(())) => {
                            counters.completion_tokens.fetch_add(fragments, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            yield Err(GatewayError::Inference(format!("{e:#}")));
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            yield Err(GatewayError::Inference(format!("generation task failed: {e}")));
                        }
                    }
                }
            }
        }))
    }

    pub fn status(&self) -> SystemStatus {
        let models: Vec<ModelInfo> = self
            .registry
            .list()
            .iter()
            .filter_map(|config| self.model_info(&config.name))
            .collect();
        let loaded = self.loaded_models();

        let engines = {
            let slots = self.slots.read();
            let engines = self.engines.read();
            let mut out: Vec<EngineStatus> = engines
                .keys()
                .map(|kind| EngineStatus {
                    engine_type: *kind,
                    loaded_models: slots
                        .iter()
                        .filter(|(_, s)| {
                            s.info.status == ModelStatus::Loaded && s.info.engine_type == Some(*kind)
                        })
                        .map(|(n, _)| n.clone())
                        .collect(),
                })
                .collect();
            out.sort_by_key(|e| e.engine_type.as_str());
            out
        };

        SystemStatus {
            initialized: self.is_initialized(),
            default_engine: *self.default_engine.read(),
            total_engines: engines.len(),
            registered_models: self.registry.len(),
            loaded_models: loaded.len(),
            max_concurrent_models: self.settings.max_loaded_models,
            models,
            engines,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let engines: Vec<(EngineKind, Arc<dyn InferenceEngine>)> = self
            .engines
            .read()
            .iter()
            .map(|(k, e)| (*k, Arc::clone(e)))
            .collect();

        let mut issues = Vec::new();
        let mut report = BTreeMap::new();
        for (kind, engine) in engines {
            let health = engine.health_check().await;
            if health.status != HealthState::Healthy {
                issues.push(format!(
                    "engine {kind} is {:?}{}",
                    health.status,
                    health
                        .message
                        .as_deref()
                        .map(|m| format!(": {m}"))
                        .unwrap_or_default()
                ));
            }
            report.insert(kind.to_string(), health);
        }

        for (name, slot) in self.slots.read().iter() {
            if slot.info.status == ModelStatus::Error {
                issues.push(format!("model {name} is in error state"));
            }
        }
        issues.sort();

        let initialized = self.is_initialized();
        let status = if !initialized {
            HealthState::Unhealthy
        } else if issues.is_empty() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            manager_initialized: initialized,
            engines: report,
            models: self.loaded_models().len(),
            issues,
        }
    }

    pub fn metrics(&self) -> InferenceMetrics {
        InferenceMetrics {
            total_requests: self.counters.requests.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            completion_tokens: self.counters.completion_tokens.load(Ordering::Relaxed),
            registered_models: self.registry.len(),
            loaded_models: self.loaded_models().len(),
        }
    }

    /// 周期性记录一次状态摘要
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *monitor = Some(periodic(
            "model-monitor",
            self.settings.monitor_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        let metrics = manager.metrics();
                        tracing::info!(
                            registered = metrics.registered_models,
                            loaded = metrics.loaded_models,
                            requests = metrics.total_requests,
                            failed = metrics.failed_requests,
                            "model manager status"
                        );
                    }
                }
            },
        ));
    }

    pub async fn stop_monitor(&self) {
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// 卸载所有模型并关闭引擎
    pub async fn shutdown(&self) {
        tracing::info!("shutting down model manager");
        self.stop_monitor().await;

        for name in self.loaded_models() {
            if let Err(e) = self.unload(&name).await {
                tracing::error!(model = %name, "unload during shutdown failed: {e}");
            }
        }

        let engines: Vec<Arc<dyn InferenceEngine>> =
            self.engines.write().drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.shutdown().await;
        }
        self.resolved.write().clear();
        self.slots.write().clear();
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("model manager shut down");
    }
}
