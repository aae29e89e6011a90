use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::engine::EngineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

/// 模型注册记录；同名重新注册之前不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub path: String,
    /// 为空时在加载时解析为管理器的默认引擎
    #[serde(default)]
    pub engine_type: Option<EngineKind>,
    #[serde(default)]
    pub auto_load: bool,
    /// 数字越小优先级越高
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub max_context_length: Option<usize>,
    #[serde(default)]
    pub extra_params: Map<String, Value>,
}

fn default_priority() -> u32 {
    1
}

impl ModelConfig {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            engine_type: None,
            auto_load: false,
            priority: default_priority(),
            max_context_length: None,
            extra_params: Map::new(),
        }
    }

    /// 传给引擎的加载参数：extra_params 加上上下文长度覆盖
    pub fn load_options(&self) -> Map<String, Value> {
        let mut opts = self.extra_params.clone();
        if let Some(ctx) = self.max_context_length {
            opts.insert("context_length".to_string(), Value::from(ctx));
        }
        opts
    }
}

/// Model Manager 对外暴露的运行时记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: String,
    pub status: ModelStatus,
    pub engine_type: Option<EngineKind>,
    pub size_mb: Option<f64>,
    pub parameters: Option<u64>,
    pub context_length: Option<usize>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub memory_usage: Option<String>,
    pub error_message: Option<String>,
}

impl ModelInfo {
    pub fn new(config: &ModelConfig, status: ModelStatus) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            status,
            engine_type: config.engine_type,
            size_mb: None,
            parameters: None,
            context_length: config.max_context_length,
            loaded_at: None,
            memory_usage: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegisteredModel {
    pub config: ModelConfig,
    /// 注册顺序，驱逐时用来打破 loaded_at 的平局
    pub seq: u64,
    pub lock: Arc<Mutex<()>>,
}

/// 模型配置注册表
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, RegisteredModel>>,
    next_seq: RwLock<u64>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或覆盖同名配置；同名覆盖时保留原有的锁和注册顺序
    pub fn register(&self, config: ModelConfig) {
        let mut guard = self.models.write();
        match guard.get_mut(&config.name) {
            Some(existing) => existing.config = config,
            None => {
                let seq = {
                    let mut next = self.next_seq.write();
                    *next += 1;
                    *next
                };
                guard.insert(
                    config.name.clone(),
                    RegisteredModel {
                        config,
                        seq,
                        lock: Arc::new(Mutex::new(())),
                    },
                );
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<ModelConfig> {
        self.models.write().remove(name).map(|m| m.config)
    }

    pub fn get(&self, name: &str) -> Option<ModelConfig> {
        self.models.read().get(name).map(|m| m.config.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    pub(crate) fn entry(&self, name: &str) -> Option<RegisteredModel> {
        self.models.read().get(name).cloned()
    }

    pub(crate) fn seq_of(&self, name: &str) -> u64 {
        self.models.read().get(name).map(|m| m.seq).unwrap_or(u64::MAX)
    }

    /// 按注册顺序列出
    pub fn list(&self) -> Vec<ModelConfig> {
        let guard = self.models.read();
        let mut models: Vec<&RegisteredModel> = guard.values().collect();
        models.sort_by_key(|m| m.seq);
        models.into_iter().map(|m| m.config.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistration_keeps_order_and_lock() {
        let registry = ModelRegistry::new();
        registry.register(ModelConfig::new("a", "/m/a"));
        registry.register(ModelConfig::new("b", "/m/b"));
        let lock_before = registry.entry("a").unwrap().lock;

        registry.register(ModelConfig::new("a", "/m/a-v2"));

        let names: Vec<String> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().path, "/m/a-v2");
        assert!(Arc::ptr_eq(&lock_before, &registry.entry("a").unwrap().lock));
        assert!(registry.seq_of("a") < registry.seq_of("b"));
    }

    #[test]
    fn load_options_carry_context_override() {
        let mut config = ModelConfig::new("a", "/m/a");
        config.max_context_length = Some(8192);
        config
            .extra_params
            .insert("n_gpu_layers".into(), Value::from(32));
        let opts = config.load_options();
        assert_eq!(opts["context_length"], 8192);
        assert_eq!(opts["n_gpu_layers"], 32);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"name":"qwen","path":"./models/qwen","engine_type":"llama_cpp"}"#)
                .unwrap();
        assert_eq!(config.engine_type, Some(EngineKind::LlamaCpp));
        assert_eq!(config.priority, 1);
        assert!(!config.auto_load);
        assert!(config.extra_params.is_empty());
    }
}
