//! 本地 LLM 推理网关：模型管理、负载均衡、集群管理与 OpenAI 兼容接口

pub mod api;
pub mod app_state;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod load_balancer;
pub mod model_manager;
pub mod model_registry;
pub mod prompt;
pub mod tasks;
pub mod tokens;
pub mod types;
