use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::tasks::{periodic, BackgroundTask};

/// 请求结束时的 EWMA 平滑因子
pub const REQUEST_ALPHA: f64 = 0.1;
/// 健康探测用更小的权重
pub const PROBE_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Weighted,
    Random,
    ResponseTime,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Weighted => "weighted",
            Strategy::Random => "random",
            Strategy::ResponseTime => "response_time",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "weighted" => Ok(Strategy::Weighted),
            "random" => Ok(Strategy::Random),
            "response_time" => Ok(Strategy::ResponseTime),
            other => Err(GatewayError::invalid(
                format!(
                    "unknown strategy `{other}`; expected one of round_robin, least_connections, weighted, random, response_time"
                ),
                Some("strategy"),
            )),
        }
    }
}

/// 负载均衡器里的一个实例；统计量都是原子量
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    /// 为空表示支持所有模型
    pub models: Vec<String>,
    active: AtomicUsize,
    total: AtomicU64,
    failed: AtomicU64,
    avg_response_bits: AtomicU64,
    healthy: AtomicBool,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl Instance {
    fn new(id: &str, host: &str, port: u16, weight: u32, models: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            weight: weight.max(1),
            models,
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            avg_response_bits: AtomicU64::new(0f64.to_bits()),
            healthy: AtomicBool::new(true),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// 秒
    pub fn avg_response_time(&self) -> f64 {
        f64::from_bits(self.avg_response_bits.load(Ordering::Relaxed))
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        (total - self.failed_requests().min(total)) as f64 / total as f64
    }

    pub fn supports(&self, model: Option<&str>) -> bool {
        match model {
            None => true,
            Some(_) if self.models.is_empty() => true,
            Some(model) => self.models.iter().any(|m| m == model),
        }
    }

    fn fold_response_time(&self, sample: f64, alpha: f64) {
        let _ = self
            .avg_response_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let avg = f64::from_bits(bits);
                Some(((1.0 - alpha) * avg + alpha * sample).to_bits())
            });
    }

    fn score(&self) -> f64 {
        self.active_connections() as f64 / self.weight as f64
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            instance_id: self.id.clone(),
            url: self.url(),
            weight: self.weight,
            active_connections: self.active_connections(),
            total_requests: self.total_requests(),
            failed_requests: self.failed_requests(),
            success_rate: self.success_rate(),
            avg_response_time: self.avg_response_time(),
            is_healthy: self.is_healthy(),
            models: self.models.clone(),
            last_health_check: *self.last_health_check.lock(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub instance_id: String,
    pub url: String,
    pub weight: u32,
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub is_healthy: bool,
    pub models: Vec<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerOverview {
    pub strategy: Strategy,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub active_connections: usize,
    pub avg_response_time: f64,
}

/// 在健康实例之间分发请求
pub struct LoadBalancer {
    instances: RwLock<Vec<Arc<Instance>>>,
    strategy: RwLock<Strategy>,
    cursor: AtomicUsize,
    health_task: Mutex<Option<BackgroundTask>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(Vec::new()),
            strategy: RwLock::new(strategy),
            cursor: AtomicUsize::new(0),
            health_task: Mutex::new(None),
        })
    }

    /// 同 id 重复添加时原位替换并清零统计
    pub fn add_instance(&self, id: &str, host: &str, port: u16, weight: u32, models: Vec<String>) {
        let instance = Arc::new(Instance::new(id, host, port, weight, models));
        let mut instances = self.instances.write();
        match instances.iter().position(|i| i.id == id) {
            Some(pos) => instances[pos] = instance,
            None => instances.push(instance),
        }
        tracing::info!(instance = %id, url = %format!("http://{host}:{port}"), "instance added");
    }

    pub fn remove_instance(&self, id: &str) -> bool {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|i| i.id != id);
        let removed = instances.len() != before;
        if removed {
            tracing::info!(instance = %id, "instance removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.read().iter().find(|i| i.id == id).cloned()
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().clone()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write() = strategy;
        tracing::info!(%strategy, "load balancing strategy switched");
    }

    /// 按当前策略选一个健康且支持该模型的实例；平局取最早加入的
    pub fn select(&self, model: Option<&str>) -> Option<Arc<Instance>> {
        let candidates: Vec<Arc<Instance>> = self
            .instances
            .read()
            .iter()
            .filter(|i| i.is_healthy() && i.supports(model))
            .cloned()
            .collect();
        if candidates.is_empty() {
            tracing::warn!(model = ?model, "no healthy instance available");
            return None;
        }

        let strategy = self.strategy();
        let chosen = match strategy {
            Strategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(idx).cloned()
            }
            Strategy::LeastConnections => candidates
                .iter()
                .min_by_key(|i| i.active_connections())
                .cloned(),
            Strategy::Weighted => candidates
                .iter()
                .min_by(|a, b| a.score().total_cmp(&b.score()))
                .cloned(),
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(idx).cloned()
            }
            Strategy::ResponseTime => candidates
                .iter()
                .min_by(|a, b| a.avg_response_time().total_cmp(&b.avg_response_time()))
                .cloned(),
        };

        if let Some(instance) = &chosen {
            tracing::debug!(instance = %instance.id, %strategy, "selected instance");
        }
        chosen
    }

    pub fn mark_start(&self, id: &str) -> bool {
        match self.get(id) {
            Some(instance) => {
                instance.active.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// active_connections 不会减到 0 以下
    pub fn mark_end(&self, id: &str, latency: Duration, success: bool) -> bool {
        let Some(instance) = self.get(id) else {
            return false;
        };
        let _ = instance
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        instance.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            instance.failed.fetch_add(1, Ordering::Relaxed);
        }
        instance.fold_response_time(latency.as_secs_f64(), REQUEST_ALPHA);
        true
    }

    /// 健康状态的唯一写入口，探测与集群监控共用
    pub fn set_health(&self, id: &str, healthy: bool) -> bool {
        let Some(instance) = self.get(id) else {
            return false;
        };
        let was = instance.healthy.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            if healthy {
                tracing::info!(instance = %id, "instance is healthy again");
            } else {
                tracing::warn!(instance = %id, "instance marked unhealthy");
            }
        }
        true
    }

    pub fn stats(&self) -> Vec<InstanceStats> {
        self.instances.read().iter().map(|i| i.stats()).collect()
    }

    pub fn overview(&self) -> BalancerOverview {
        let instances = self.instances();
        let total_requests: u64 = instances.iter().map(|i| i.total_requests()).sum();
        let failed_requests: u64 = instances.iter().map(|i| i.failed_requests()).sum();
        let avg_response_time = if instances.is_empty() {
            0.0
        } else {
            instances.iter().map(|i| i.avg_response_time()).sum::<f64>() / instances.len() as f64
        };
        BalancerOverview {
            strategy: self.strategy(),
            total_instances: instances.len(),
            healthy_instances: instances.iter().filter(|i| i.is_healthy()).count(),
            total_requests,
            failed_requests,
            success_rate: if total_requests == 0 {
                1.0
            } else {
                (total_requests - failed_requests.min(total_requests)) as f64 / total_requests as f64
            },
            active_connections: instances.iter().map(|i| i.active_connections()).sum(),
            avg_response_time,
        }
    }

    /// 对所有实例并发探测一次 `GET /health`；探测不会移除实例
    pub async fn probe_all(&self, client: &reqwest::Client) {
        let instances = self.instances();
        let probes = instances.iter().map(|instance| self.probe(client, instance));
        futures::future::join_all(probes).await;
    }

    async fn probe(&self, client: &reqwest::Client, instance: &Arc<Instance>) {
        let started = Instant::now();
        match client.get(format!("{}/health", instance.url())).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                instance.fold_response_time(started.elapsed().as_secs_f64(), PROBE_ALPHA);
                *instance.last_health_check.lock() = Some(Utc::now());
                self.set_health(&instance.id, true);
                tracing::debug!(instance = %instance.id, "health probe passed");
            }
            Ok(resp) => {
                *instance.last_health_check.lock() = Some(Utc::now());
                tracing::warn!(instance = %instance.id, status = resp.status().as_u16(), "health probe failed");
                self.set_health(&instance.id, false);
            }
            Err(e) => {
                *instance.last_health_check.lock() = Some(Utc::now());
                tracing::warn!(instance = %instance.id, "health probe error: {e}");
                self.set_health(&instance.id, false);
            }
        }
    }

    pub fn start_health_loop(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        let mut slot = self.health_task.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("failed to build health check client: {e}");
                return;
            }
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        tracing::info!(interval = ?interval, "starting load balancer health checks");
        *slot = Some(periodic("lb-health", interval, move || {
            let weak = weak.clone();
            let client = client.clone();
            async move {
                if let Some(balancer) = weak.upgrade() {
                    balancer.probe_all(&client).await;
                }
            }
        }));
    }

    pub async fn stop_health_loop(&self) {
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!("load balancer health checks stopped");
        }
    }
}
