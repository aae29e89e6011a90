use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::process::{Child, Command};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::load_balancer::{BalancerOverview, InstanceStats, LoadBalancer, Strategy};
use crate::tasks::{periodic, BackgroundTask};

/// 一个集群实例的启动参数
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub models: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl InstanceSpec {
    pub fn new(id: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            weight: 1,
            models: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    fn health_url(&self) -> String {
        format!("http://{}:{}/health", self.host, self.port)
    }
}

/// 子进程命令；`instance_flags` 为 true 时追加 `--host/--port/--instance-id`
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub instance_flags: bool,
}

impl LaunchCommand {
    /// 当前可执行文件以 single 模式运行
    pub fn current_exe(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the gateway executable")?;
        let mut args = vec!["--mode".to_string(), "single".to_string()];
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        Ok(Self {
            program: exe.display().to_string(),
            args,
            instance_flags: true,
        })
    }

    fn build(&self, spec: &InstanceSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if self.instance_flags {
            cmd.args(["--host", &spec.host])
                .args(["--port", &spec.port.to_string()])
                .args(["--instance-id", &spec.id]);
        }
        cmd.env("HOST", &spec.host)
            .env("PORT", spec.port.to_string())
            .env("INSTANCE_ID", &spec.id)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub command: LaunchCommand,
    pub strategy: Strategy,
    pub instance_host: String,
    pub base_port: u16,
    pub startup_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub stop_grace: Duration,
    pub restart_delay: Duration,
    pub monitor_interval: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub min_instances: usize,
    pub max_instances: usize,
    pub max_restarts: Option<u32>,
}

struct ManagedInstance {
    spec: InstanceSpec,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    /// 显式停止中或已停止，监控不把退出当成崩溃
    stopping: AtomicBool,
    restarting: AtomicBool,
    restarts: AtomicU32,
}

impl ManagedInstance {
    fn new(spec: InstanceSpec) -> Self {
        Self {
            spec,
            child: tokio::sync::Mutex::new(None),
            pid: Mutex::new(None),
            started_at: Mutex::new(None),
            stopping: AtomicBool::new(true),
            restarting: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
        }
    }

    fn is_running(&self) -> bool {
        match self.child.try_lock() {
            Ok(mut guard) => guard
                .as_mut()
                .is_some_and(|child| matches!(child.try_wait(), Ok(None))),
            // 正在启动或停止
            Err(_) => self.pid.lock().is_some(),
        }
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.spec.id.clone(),
            host: self.spec.host.clone(),
            port: self.spec.port,
            weight: self.spec.weight,
            models: self.spec.models.clone(),
            is_running: self.is_running(),
            pid: *self.pid.lock(),
            restarts: self.restarts.load(Ordering::Relaxed),
            started_at: *self.started_at.lock(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub models: Vec<String>,
    pub is_running: bool,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub is_running: bool,
    pub total_instances: usize,
    pub running_instances: usize,
    pub load_balancer_strategy: Strategy,
    pub instances: Vec<InstanceStatus>,
    pub load_balancer_stats: Vec<InstanceStats>,
    pub overview: BalancerOverview,
}

/// 管理实例进程的启动、停止、重启与扩缩容，并把就绪的实例注册到负载均衡器
pub struct ClusterManager {
    settings: ClusterSettings,
    balancer: Arc<LoadBalancer>,
    instances: RwLock<Vec<Arc<ManagedInstance>>>,
    running: AtomicBool,
    monitor: Mutex<Option<BackgroundTask>>,
    next_index: AtomicUsize,
    http: reqwest::Client,
}

impl ClusterManager {
    pub fn new(settings: ClusterSettings, specs: Vec<InstanceSpec>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.health_check_timeout)
            .build()
            .unwrap_or_default();
        let balancer = LoadBalancer::new(settings.strategy);
        let next_index = AtomicUsize::new(specs.len());
        Arc::new(Self {
            settings,
            balancer,
            instances: RwLock::new(specs.into_iter().map(|s| Arc::new(ManagedInstance::new(s))).collect()),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            next_index,
            http,
        })
    }

    /// 按配置生成 `instance_0..n` 的规格，端口从 instance_base_port 依次递增
    pub fn from_config(config: &GatewayConfig, config_path: Option<&Path>) -> anyhow::Result<Arc<Self>> {
        let cluster = &config.cluster;
        let command = match &cluster.command {
            Some(parts) => {
                let (program, args) = parts
                    .split_first()
                    .context("cluster.command must name a program")?;
                LaunchCommand {
                    program: program.clone(),
                    args: args.to_vec(),
                    instance_flags: false,
                }
            }
            None => LaunchCommand::current_exe(config_path)?,
        };

        let settings = ClusterSettings {
            command,
            strategy: cluster.strategy,
            instance_host: "127.0.0.1".to_string(),
            base_port: config.instance_base_port(),
            startup_timeout: cluster.startup_timeout(),
            ready_poll_interval: cluster.ready_poll_interval(),
            stop_grace: cluster.stop_grace(),
            restart_delay: cluster.restart_delay(),
            monitor_interval: cluster.monitor_interval(),
            health_check_interval: cluster.health_check_interval(),
            health_check_timeout: cluster.health_check_timeout(),
            min_instances: cluster.min_instances,
            max_instances: cluster.max_instances,
            max_restarts: cluster.max_restarts,
        };

        let base = settings.base_port;
        let specs = (0..cluster.instances)
            .map(|i| InstanceSpec::new(&format!("instance_{i}"), &settings.instance_host, base + i as u16))
            .collect();
        Ok(Self::new(settings, specs))
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn find(&self, id: &str) -> GatewayResult<Arc<ManagedInstance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.spec.id == id)
            .cloned()
            .ok_or_else(|| GatewayError::invalid(format!("unknown instance `{id}`"), Some("instance_id")))
    }

    pub fn add_instance_config(&self, spec: InstanceSpec) -> GatewayResult<()> {
        let mut instances = self.instances.write();
        if instances.iter().any(|i| i.spec.id == spec.id) {
            return Err(GatewayError::invalid(
                format!("instance `{}` already exists", spec.id),
                Some("instance_id"),
            ));
        }
        if instances.iter().any(|i| i.spec.port == spec.port) {
            return Err(GatewayError::invalid(
                format!("port {} is already used by another instance", spec.port),
                Some("port"),
            ));
        }
        tracing::info!(instance = %spec.id, port = spec.port, weight = spec.weight, "instance configured");
        instances.push(Arc::new(ManagedInstance::new(spec)));
        Ok(())
    }

    /// 停止并忘掉该实例
    pub async fn remove_instance(&self, id: &str) -> GatewayResult<()> {
        self.stop_instance(id).await?;
        self.instances.write().retain(|i| i.spec.id != id);
        tracing::info!(instance = %id, "instance removed from cluster");
        Ok(())
    }

    /// 拉起进程并等待 `/health` 返回 200；失败时杀掉进程
    pub async fn start_instance(&self, id: &str) -> GatewayResult<()> {
        let instance = self.find(id)?;
        let spec = &instance.spec;
        let mut slot = instance.child.lock().await;

        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::warn!(instance = %id, "instance already running");
                return Ok(());
            }
        }

        tracing::info!(instance = %id, program = %self.settings.command.program, port = spec.port, "starting instance");
        let mut child = self
            .settings
            .command
            .build(spec)
            .spawn()
            .map_err(|e| GatewayError::Process(format!("failed to spawn instance `{id}`: {e}")))?;
        *instance.pid.lock() = child.id();
        instance.stopping.store(false, Ordering::SeqCst);

        match self.wait_ready(spec, &mut child).await {
            Ok(()) => {
                *slot = Some(child);
                *instance.started_at.lock() = Some(Utc::now());
                self.balancer
                    .add_instance(id, &spec.host, spec.port, spec.weight, spec.models.clone());
                tracing::info!(instance = %id, "instance ready");
                Ok(())
            }
            Err(e) => {
                let _ = child.kill().await;
                *slot = None;
                *instance.pid.lock() = None;
                tracing::error!(instance = %id, "instance failed to start: {e}");
                Err(e)
            }
        }
    }

    async fn wait_ready(&self, spec: &InstanceSpec, child: &mut Child) -> GatewayResult<()> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        let url = spec.health_url();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(GatewayError::Process(format!(
                        "instance `{}` exited during startup ({status})",
                        spec.id
                    )))
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(GatewayError::Process(format!(
                        "cannot poll instance `{}`: {e}",
                        spec.id
                    )))
                }
            }

            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status() == reqwest::StatusCode::OK {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(GatewayError::Process(format!(
                    "instance `{}` did not become ready within {:?}",
                    spec.id, self.settings.startup_timeout
                )));
            }
            tokio::time::sleep(self.settings.ready_poll_interval).await;
        }
    }

    /// 先注销再终止进程；进程本来就没运行也算成功
    pub async fn stop_instance(&self, id: &str) -> GatewayResult<()> {
        let instance = self.find(id)?;
        instance.stopping.store(true, Ordering::SeqCst);
        self.balancer.remove_instance(id);

        let child = {
            let mut slot = instance.child.lock().await;
            // 启动可能在拿到锁之前刚完成注册
            instance.stopping.store(true, Ordering::SeqCst);
            self.balancer.remove_instance(id);
            slot.take()
        };
        match child {
            Some(mut child) => {
                tracing::info!(instance = %id, "stopping instance");
                terminate(&mut child, self.settings.stop_grace, id).await;
                tracing::info!(instance = %id, "instance stopped");
            }
            None => tracing::debug!(instance = %id, "instance was not running"),
        }
        *instance.pid.lock() = None;
        Ok(())
    }

    /// 同一实例同时只会有一个重启在进行
    pub async fn restart_instance(&self, id: &str) -> GatewayResult<()> {
        let instance = self.find(id)?;
        if instance
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!(instance = %id, "restart already in progress");
            return Ok(());
        }
        let result = self.restart_locked(id).await;
        instance.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn restart_locked(&self, id: &str) -> GatewayResult<()> {
        tracing::info!(instance = %id, "restarting instance");
        self.stop_instance(id).await?;
        tokio::time::sleep(self.settings.restart_delay).await;
        self.start_instance(id).await
    }

    /// 崩溃后的自动重启；等待期间集群被停止就不再拉起
    async fn recover(&self, id: &str) -> GatewayResult<()> {
        tracing::info!(instance = %id, "recovering crashed instance");
        self.stop_instance(id).await?;
        tokio::time::sleep(self.settings.restart_delay).await;
        if !self.is_running() {
            return Ok(());
        }
        self.start_instance(id).await
    }

    /// 返回成功启动的实例数；一个都没起来时报错
    pub async fn start_cluster(self: &Arc<Self>) -> GatewayResult<usize> {
        if self.is_running() {
            tracing::warn!("cluster already running");
            return Ok(self.status().running_instances);
        }

        let ids: Vec<String> = self.instances.read().iter().map(|i| i.spec.id.clone()).collect();
        tracing::info!(instances = ids.len(), "starting cluster");
        let results = futures::future::join_all(ids.iter().map(|id| self.start_instance(id))).await;
        let started = results.iter().filter(|r| r.is_ok()).count();

        if started == 0 && !ids.is_empty() {
            return Err(GatewayError::Process("no cluster instance could be started".to_string()));
        }

        self.running.store(true, Ordering::SeqCst);
        self.start_monitor();
        self.balancer
            .start_health_loop(self.settings.health_check_interval, self.settings.health_check_timeout);
        tracing::info!(started, total = ids.len(), "cluster started");
        Ok(started)
    }

    pub async fn stop_cluster(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::debug!("cluster is not running");
        }
        tracing::info!("stopping cluster");

        let task = self.monitor.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.balancer.stop_health_loop().await;

        let ids: Vec<String> = self.instances.read().iter().map(|i| i.spec.id.clone()).collect();
        for result in futures::future::join_all(ids.iter().map(|id| self.stop_instance(id))).await {
            if let Err(e) = result {
                tracing::error!("stopping instance failed: {e}");
            }
        }
        tracing::info!("cluster stopped");
    }

    /// 新实例端口取当前最大端口 + 1
    pub async fn scale_up(&self, count: usize) -> GatewayResult<Vec<String>> {
        let current = self.instances.read().len();
        if current
            .checked_add(count)
            .map_or(true, |n| n > self.settings.max_instances)
        {
            return Err(GatewayError::ResourceLimit {
                resource: "cluster instances".to_string(),
                current,
                limit: self.settings.max_instances,
            });
        }

        tracing::info!(count, "scaling cluster up");
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let port = self
                .instances
                .read()
                .iter()
                .map(|i| i.spec.port)
                .max()
                .map(|p| p.saturating_add(1))
                .unwrap_or(self.settings.base_port);
            let id = format!("instance_{}", self.next_index.fetch_add(1, Ordering::SeqCst));
            self.add_instance_config(InstanceSpec::new(&id, &self.settings.instance_host, port))?;

            if self.is_running() {
                if let Err(e) = self.start_instance(&id).await {
                    tracing::error!(instance = %id, "scaled-up instance failed to start: {e}");
                    continue;
                }
            }
            added.push(id);
        }
        Ok(added)
    }

    /// 从最后加入的实例开始移除，不会低于 min_instances
    pub async fn scale_down(&self, count: usize) -> GatewayResult<Vec<String>> {
        let victims: Vec<String> = {
            let instances = self.instances.read();
            if count > instances.len() || instances.len() - count < self.settings.min_instances {
                return Err(GatewayError::invalid(
                    format!(
                        "cannot remove {count} of {} instances; at least {} must remain",
                        instances.len(),
                        self.settings.min_instances
                    ),
                    Some("count"),
                ));
            }
            instances.iter().rev().take(count).map(|i| i.spec.id.clone()).collect()
        };

        tracing::info!(count, "scaling cluster down");
        for id in &victims {
            self.remove_instance(id).await?;
        }
        Ok(victims)
    }

    pub fn set_strategy(&self, name: &str) -> GatewayResult<Strategy> {
        let strategy: Strategy = name.parse()?;
        self.balancer.set_strategy(strategy);
        Ok(strategy)
    }

    pub fn status(&self) -> ClusterStatus {
        let instances: Vec<InstanceStatus> = self.instances.read().iter().map(|i| i.status()).collect();
        ClusterStatus {
            is_running: self.is_running(),
            total_instances: instances.len(),
            running_instances: instances.iter().filter(|i| i.is_running).count(),
            load_balancer_strategy: self.balancer.strategy(),
            instances,
            load_balancer_stats: self.balancer.stats(),
            overview: self.balancer.overview(),
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(periodic("cluster-monitor", self.settings.monitor_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(cluster) = weak.upgrade() {
                    cluster.check_instances();
                }
            }
        }));
    }

    /// 发现非显式停止的退出就标记不健康并安排重启
    fn check_instances(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        let instances = self.instances.read().clone();
        for instance in instances {
            if instance.stopping.load(Ordering::SeqCst) || instance.restarting.load(Ordering::SeqCst) {
                continue;
            }
            let exited = match instance.child.try_lock() {
                Ok(mut guard) => match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => Some(status.to_string()),
                        Ok(None) => None,
                        Err(e) => Some(e.to_string()),
                    },
                    None => Some("not running".to_string()),
                },
                Err(_) => None,
            };
            let Some(reason) = exited else {
                continue;
            };

            let id = instance.spec.id.clone();
            tracing::warn!(instance = %id, %reason, "instance exited unexpectedly");
            self.balancer.set_health(&id, false);

            if let Some(limit) = self.settings.max_restarts {
                if instance.restarts.load(Ordering::Relaxed) >= limit {
                    tracing::error!(instance = %id, limit, "restart limit reached; leaving instance down");
                    continue;
                }
            }
            if instance
                .restarting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            instance.restarts.fetch_add(1, Ordering::Relaxed);

            let cluster = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = cluster.recover(&id).await {
                    tracing::error!(instance = %id, "automatic restart failed: {e}");
                    // 启动失败的实例仍然算作需要恢复
                    if let Ok(instance) = cluster.find(&id) {
                        instance.stopping.store(false, Ordering::SeqCst);
                    }
                }
                if let Ok(instance) = cluster.find(&id) {
                    instance.restarting.store(false, Ordering::SeqCst);
                }
            });
        }
    }
}

/// unix 上先发 SIGTERM，宽限期后仍在运行则强杀
async fn terminate(child: &mut Child, grace: Duration, id: &str) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(instance = %id, "failed to send SIGTERM: {e}");
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(instance = %id, "instance did not exit within {grace:?}; killing");
        if let Err(e) = child.kill().await {
            tracing::error!(instance = %id, "failed to kill instance: {e}");
        }
    }
}
