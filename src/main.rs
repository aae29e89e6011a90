use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use local_llm_gateway::api::{build_rocket, default_figment};
use local_llm_gateway::app_state::AppState;
use local_llm_gateway::cli::Args;
use local_llm_gateway::config::GatewayConfig;
use local_llm_gateway::engine::BuiltinEngines;

#[rocket::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "local_llm_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        mode = ?config.inference_mode,
        host = %config.host,
        port = config.port,
        instance = config.instance_id.as_deref().unwrap_or("-"),
        "starting gateway"
    );

    let address: std::net::IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid bind address {}", config.host))?;
    let figment = default_figment()
        .merge(("address", address))
        .merge(("port", config.port));

    let state = AppState::initialize(
        config,
        args.config.as_deref(),
        Arc::new(BuiltinEngines::default()),
    )
    .await?;

    let launched = build_rocket(figment, Arc::clone(&state)).launch().await;
    state.shutdown().await;
    launched.map_err(|e| anyhow!("http server failed: {e}"))?;
    tracing::info!("gateway stopped");
    Ok(())
}
