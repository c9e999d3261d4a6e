//! PULSE Node Entry Point
//!
//! Runs a coordinator-only node over TCP: it routes, caches and learns, but
//! has no on-device model, so every task it accepts locally fails over to
//! peers. Peers are fed in through [`ChannelDiscovery`] by whatever discovery
//! mechanism the host provides.

use async_trait::async_trait;
use futures_util::stream;
use pulse_core::{
    ConfigError, Embedding, GenerationParams, GovernorDecision, InferenceEngine, InferenceError,
    ModelInfo, NodeAnnouncement, NodeCapabilities, PulseConfig, ResourceGovernor, SwarmError,
    SwarmResult, TokenStream, TranscriptionResult,
};
use pulse_scheduler::{run_inbound_loop, run_maintenance, TaskScheduler};
use pulse_transport::{
    follow_discovery, inbound_channel, ChannelDiscovery, DiscoveryService, PeerRegistry,
    TcpConnector, TcpTransport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> SwarmResult<()> {
    init_tracing()?;

    let config = PulseConfig::from_env();
    config.validate()?;

    let addr = resolve_bind_addr(config.transport.port)?;
    let (inbound_tx, inbound) = inbound_channel();
    let transport = TcpTransport::bind(addr, inbound_tx.clone(), &config.transport).await?;
    let local_addr = transport.local_addr()?;

    let connector = Arc::new(TcpConnector::new(&config.transport, inbound_tx));
    let registry = Arc::new(PeerRegistry::new(config.transport.clone(), connector));
    let capabilities = coordinator_capabilities();

    let scheduler = Arc::new(TaskScheduler::new(
        config.clone(),
        capabilities.clone(),
        Arc::clone(&registry),
        Arc::new(AlwaysAllow),
        Arc::new(NoModel),
    ));

    let discovery = Arc::new(ChannelDiscovery::default());
    discovery
        .announce(&NodeAnnouncement {
            node_id: config.transport.node_id.clone(),
            display_name: config.transport.display_name.clone(),
            address: local_addr,
            capabilities,
        })
        .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(transport.run_accept_loop(shutdown_rx.clone())),
        tokio::spawn(run_inbound_loop(
            Arc::clone(&scheduler),
            inbound,
            shutdown_rx.clone(),
        )),
        tokio::spawn(follow_discovery(
            Arc::clone(&registry),
            discovery,
            shutdown_rx.clone(),
        )),
    ];
    let maintenance = tokio::spawn(run_maintenance(
        Arc::clone(&scheduler),
        config.jobs.clone(),
        shutdown_rx,
    ));

    tracing::info!(
        node_id = %config.transport.node_id,
        address = %local_addr,
        strategy = scheduler.strategy_name(),
        "PULSE node running"
    );

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    shutdown_tx.send_replace(true);

    for task in tasks.drain(..) {
        if let Err(error) = task.await {
            tracing::warn!(error = %error, "Background task ended abnormally");
        }
    }
    match maintenance.await {
        Ok(metrics) => {
            let stats = scheduler.stats();
            tracing::info!(
                completed = stats.completed_tasks,
                failed = stats.failed_tasks,
                gossip_rounds = metrics.snapshot().gossip_rounds,
                "PULSE node stopped"
            );
        }
        Err(error) => tracing::warn!(error = %error, "Maintenance task ended abnormally"),
    }

    Ok(())
}

/// JSON logs when `PULSE_LOG_JSON=1`, human-readable otherwise.
fn init_tracing() -> SwarmResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pulse_scheduler=debug,pulse_transport=debug,info"));
    let json = std::env::var("PULSE_LOG_JSON").is_ok_and(|value| value == "1");

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| {
        config_error("tracing", "subscriber", &format!("failed to init subscriber: {e}"))
    })
}

/// A coordinator advertises no models so peers never route work to it.
fn coordinator_capabilities() -> NodeCapabilities {
    NodeCapabilities {
        supported_models: Vec::new(),
        ..NodeCapabilities::default()
    }
}

fn resolve_bind_addr(port: u16) -> SwarmResult<SocketAddr> {
    let host = std::env::var("PULSE_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| config_error("PULSE_BIND", &addr, &e.to_string()))
}

fn config_error(field: &str, value: &str, reason: &str) -> SwarmError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Governor for hosts without battery or thermal policy.
struct AlwaysAllow;

#[async_trait]
impl ResourceGovernor for AlwaysAllow {
    async fn can_execute_task(&self, _memory_mb: u64, _duration_secs: u64, _requires_npu: bool) -> GovernorDecision {
        GovernorDecision::Allowed
    }
}

/// Inference runtime stand-in for nodes without a model.
struct NoModel;

fn no_model() -> SwarmError {
    InferenceError::Unavailable {
        reason: "no on-device model on this node".to_string(),
    }
    .into()
}

#[async_trait]
impl InferenceEngine for NoModel {
    async fn load_model(&self, _path: &str, _context_length: u32, _threads: u32) -> SwarmResult<()> {
        Err(no_model())
    }

    fn is_model_loaded(&self) -> bool {
        false
    }

    async fn unload_model(&self) -> SwarmResult<()> {
        Ok(())
    }

    fn model_info(&self) -> Option<ModelInfo> {
        None
    }

    fn available_memory_mb(&self) -> u64 {
        0
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> SwarmResult<String> {
        Err(no_model())
    }

    fn generate_stream(&self, _prompt: &str, _params: &GenerationParams) -> TokenStream {
        Box::pin(stream::once(async { Err(no_model()) }))
    }

    fn stop_generation(&self) {}

    async fn get_embedding(&self, _text: &str) -> SwarmResult<Embedding> {
        Err(InferenceError::ModelNotLoaded.into())
    }

    async fn transcribe(&self, _samples: &[f32], _language: Option<&str>) -> SwarmResult<TranscriptionResult> {
        Err(no_model())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_no_model_reports_unavailable() {
        let engine = NoModel;
        let err = engine.generate("hi", &GenerationParams::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!engine.is_model_loaded());

        let first = engine.generate_stream("hi", &GenerationParams::default()).next().await;
        assert!(matches!(first, Some(Err(_))));
    }

    #[test]
    fn test_coordinator_advertises_no_models() {
        let caps = coordinator_capabilities();
        assert!(caps.supported_models.is_empty());
        assert!(!caps.supports(pulse_core::ModelType::Llm));
        assert!(!caps.supports(pulse_core::ModelType::Embedding));
    }

    #[test]
    fn test_bind_addr_uses_port() {
        let addr = resolve_bind_addr(37373).unwrap();
        assert_eq!(addr.port(), 37373);
    }
}
