use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rocket::figment::providers::{Env, Format, Serialized, Toml};
use rocket::figment::Figment;
use serde::{Deserialize, Serialize};

use crate::engine::EngineKind;
use crate::load_balancer::Strategy;
use crate::model_registry::ModelConfig;

pub const DEFAULT_CONFIG_FILE: &str = "gateway.toml";
pub const ENV_PREFIX: &str = "GATEWAY_";

/// 客户端常用的 OpenAI 模型 id，默认都映射到 default_model
const OPENAI_MODEL_IDS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-16k",
    "gpt-3.5-turbo-instruct",
    "gpt-4",
    "gpt-4-32k",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4o-mini",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    #[value(name = "single")]
    Single,
    #[value(name = "load_balance")]
    LoadBalance,
}

/// 网关配置：默认值 → TOML 文件 → `GATEWAY_` 环境变量，启动后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// 集群子实例由父进程指定
    pub instance_id: Option<String>,
    pub inference_mode: InferenceMode,
    pub default_engine: EngineKind,
    pub default_model: String,
    pub models: Vec<ModelConfig>,
    /// 外部 id -> 内部模型名，覆盖内置的 OpenAI 别名
    pub model_aliases: BTreeMap<String, String>,
    pub max_concurrent_models: usize,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub max_sequence_length: usize,
    /// HuggingFace tokenizer.json；不配置时用启发式估算
    pub tokenizer_path: Option<PathBuf>,
    pub monitor_interval_secs: u64,
    pub cluster: ClusterConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            instance_id: None,
            inference_mode: InferenceMode::Single,
            default_engine: EngineKind::Auto,
            default_model: "qwen-0.5b".to_string(),
            models: Vec::new(),
            model_aliases: BTreeMap::new(),
            max_concurrent_models: 1,
            max_concurrent_requests: 100,
            request_timeout_secs: 300,
            max_sequence_length: 8192,
            tokenizer_path: None,
            monitor_interval_secs: 60,
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// 启动时拉起的实例数
    pub instances: usize,
    pub strategy: Strategy,
    /// 为空时取 port + 1
    pub instance_base_port: Option<u16>,
    /// 自定义子进程命令（程序 + 参数）；为空时用当前可执行文件
    pub command: Option<Vec<String>>,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub ready_poll_interval_ms: u64,
    pub stop_grace_secs: u64,
    pub restart_delay_ms: u64,
    pub min_instances: usize,
    pub max_instances: usize,
    /// 每个实例崩溃重启的上限；为空表示不限
    pub max_restarts: Option<u32>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            strategy: Strategy::RoundRobin,
            instance_base_port: None,
            command: None,
            health_check_interval_secs: 30,
            health_check_timeout_secs: 5,
            monitor_interval_secs: 5,
            startup_timeout_secs: 60,
            ready_poll_interval_ms: 500,
            stop_grace_secs: 10,
            restart_delay_ms: 1000,
            min_instances: 1,
            max_instances: 10,
            max_restarts: None,
        }
    }
}

impl GatewayConfig {
    /// `path` 为空时读取工作目录下的 gateway.toml（不存在则忽略）
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
        }
        let config: GatewayConfig = Self::figment(path)
            .extract()
            .context("failed to parse gateway configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be in 1..=65535");
        }
        if self.max_concurrent_models == 0 {
            bail!("max_concurrent_models must be at least 1");
        }
        if self.max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.max_sequence_length == 0 {
            bail!("max_sequence_length must be at least 1");
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                bail!("model names must not be empty");
            }
            if !seen.insert(model.name.as_str()) {
                bail!("model `{}` is configured twice", model.name);
            }
        }

        let cluster = &self.cluster;
        if cluster.min_instances > cluster.max_instances {
            bail!(
                "cluster.min_instances ({}) exceeds cluster.max_instances ({})",
                cluster.min_instances,
                cluster.max_instances
            );
        }
        if cluster.instances > cluster.max_instances {
            bail!(
                "cluster.instances ({}) exceeds cluster.max_instances ({})",
                cluster.instances,
                cluster.max_instances
            );
        }
        let last_port = self.instance_base_port() as usize + cluster.max_instances;
        if last_port > u16::MAX as usize {
            bail!("instance ports would exceed 65535 (base {})", self.instance_base_port());
        }
        if cluster.command.as_ref().is_some_and(|c| c.is_empty()) {
            bail!("cluster.command must name a program");
        }
        Ok(())
    }

    pub fn instance_base_port(&self) -> u16 {
        self.cluster
            .instance_base_port
            .unwrap_or_else(|| self.port.saturating_add(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 生效的别名表：内置 OpenAI id 指向 default_model，再叠加显式配置
    pub fn aliases(&self) -> BTreeMap<String, String> {
        let mut aliases: BTreeMap<String, String> = OPENAI_MODEL_IDS
            .iter()
            .map(|id| (id.to_string(), self.default_model.clone()))
            .collect();
        aliases.extend(self.model_aliases.clone());
        aliases
    }
}

impl ClusterConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(10))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.instance_base_port(), 8001);
        assert_eq!(config.cluster.strategy, Strategy::RoundRobin);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let file = write_config(
            r#"
port = 9000
inference_mode = "load_balance"
default_engine = "dummy"
max_concurrent_models = 2

[[models]]
name = "qwen"
path = "./models/qwen"
auto_load = true

[model_aliases]
"gpt-4" = "qwen-large"

[cluster]
instances = 3
strategy = "least_connections"
max_restarts = 5
"#,
        );

        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.inference_mode, InferenceMode::LoadBalance);
        assert_eq!(config.default_engine, EngineKind::Dummy);
        assert_eq!(config.models.len(), 1);
        assert!(config.models[0].auto_load);
        assert_eq!(config.cluster.instances, 3);
        assert_eq!(config.cluster.strategy, Strategy::LeastConnections);
        assert_eq!(config.cluster.max_restarts, Some(5));
        // 未出现的键保持默认
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.cluster.min_instances, 1);

        let aliases = config.aliases();
        assert_eq!(aliases["gpt-4"], "qwen-large");
        assert_eq!(aliases["gpt-3.5-turbo"], config.default_model);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let file = write_config("[cluster]\nstrategy = \"fastest\"\n");
        assert!(GatewayConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = GatewayConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = GatewayConfig::default();
        config.max_concurrent_models = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.cluster.min_instances = 4;
        config.cluster.max_instances = 2;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.models = vec![ModelConfig::new("a", "/a"), ModelConfig::new("a", "/b")];
        assert!(config.validate().is_err());
    }
}
