use std::path::PathBuf;

use clap::Parser;

use crate::config::{GatewayConfig, InferenceMode};

/// Local LLM gateway - OpenAI compatible inference service
#[derive(Debug, Parser)]
#[command(name = "local-llm-gateway")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML config file (defaults to ./gateway.toml when present)
    #[arg(long, short, env = "LLM_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Inference mode, overrides the config file
    #[arg(long, value_enum)]
    pub mode: Option<InferenceMode>,

    /// Bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Instance id, set by the cluster manager on child processes
    #[arg(long)]
    pub instance_id: Option<String>,
}

impl Args {
    /// 命令行参数优先于配置文件和环境变量
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(mode) = self.mode {
            config.inference_mode = mode;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(id) = &self.instance_id {
            config.instance_id = Some(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_instance_flags_override_config() {
        let args = Args::try_parse_from([
            "local-llm-gateway",
            "--mode",
            "single",
            "--host",
            "127.0.0.1",
            "--port",
            "8101",
            "--instance-id",
            "instance_1",
        ])
        .unwrap();

        let mut config = GatewayConfig::default();
        config.inference_mode = InferenceMode::LoadBalance;
        args.apply(&mut config);

        assert_eq!(config.inference_mode, InferenceMode::Single);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8101);
        assert_eq!(config.instance_id.as_deref(), Some("instance_1"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["local-llm-gateway", "--mode", "cluster"]).is_err());
    }
}
