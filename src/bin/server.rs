//! mcp-agent server binary.
//!
//! Serves the gateway WebSocket endpoint and the MCP HTTP transport on their
//! configured addresses, with a built-in `agent` capability provider.
//!
//! # Environment Variables
//!
//! - `MCP_AGENT_CONFIG`: YAML config file (defaults apply when unset)
//! - `MCP_AGENT_AUTH_TOKEN`: gateway auth secret override
//! - `MCP_AGENT_BEARER_TOKEN`: MCP bearer token override
//! - `RUST_LOG`: Tracing filter (default: "info,mcp_agent=debug")
//!
//! # Usage
//!
//! ```bash
//! MCP_AGENT_CONFIG=agent.yaml cargo run --bin server
//! ```

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;

use mcp_agent::audit::{AuditLogger, LogAuditSink};
use mcp_agent::capabilities::{
    handler_fn, CapabilityBinding, CapabilityProvider, CapabilityRegistry, CapabilitySpec,
};
use mcp_agent::config::AgentConfig;
use mcp_agent::core::ExecutionEngine;
use mcp_agent::gateway::{
    DefaultHostStatus, GatewayDispatcher, HeartbeatHandler, SessionManager, SessionManagerConfig,
};
use mcp_agent::mcp::lifecycle::SESSION_TIMEOUT;
use mcp_agent::mcp::{McpHandler, McpSessionManager};
use mcp_agent::server::{app_router, gateway_router, AppState};

/// Capabilities describing the agent itself.
struct AgentProvider {
    agent_id: String,
    started_at: DateTime<Utc>,
}

impl CapabilityProvider for AgentProvider {
    fn id(&self) -> &str {
        "agent"
    }

    fn name(&self) -> &str {
        "Agent"
    }

    fn version(&self) -> &str {
        mcp_agent::VERSION
    }

    fn capabilities(&self) -> Vec<CapabilityBinding> {
        let agent_id = self.agent_id.clone();
        let started_at = self.started_at;
        vec![CapabilityBinding::new(
            CapabilitySpec::context("agent.status.get", "Report agent identity, version and uptime")
                .with_name("Agent status")
                .with_tag("agent"),
            handler_fn(move |_| {
                let agent_id = agent_id.clone();
                async move {
                    Ok(json!({
                        "agentId": agent_id,
                        "version": mcp_agent::VERSION,
                        "startedAt": started_at,
                        "uptimeSeconds": (Utc::now() - started_at).num_seconds(),
                    }))
                }
            }),
        )]
    }
}

async fn serve(
    name: &'static str,
    addr: String,
    app: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {} listener on {}", name, addr))?;
    tracing::info!("{} listening on {}", name, addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .with_context(|| format!("{} server failed", name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mcp_agent=debug".into()),
        )
        .init();

    let config = AgentConfig::load().context("failed to load configuration")?;
    tracing::info!(
        "Starting {} ({}) v{} [{}]",
        config.agent_info.agent_name,
        config.agent_info.agent_id,
        config.agent_info.agent_version,
        config.agent_info.environment
    );

    let registry = Arc::new(CapabilityRegistry::new());
    registry
        .register(
            Arc::new(AgentProvider {
                agent_id: config.agent_info.agent_id.clone(),
                started_at: Utc::now(),
            }),
            "mcp-agent",
        )
        .context("failed to register built-in provider")?;

    let audit = AuditLogger::start(Arc::new(LogAuditSink));
    let engine = Arc::new(ExecutionEngine::with_default_interceptors(registry.clone(), audit.clone()));

    let sessions = SessionManager::new(SessionManagerConfig::from_config(&config.websocket_server));
    sessions.start();
    let heartbeat = HeartbeatHandler::from_config(sessions.clone(), Arc::new(DefaultHostStatus), &config.websocket_server);
    heartbeat.start();
    let gateway = Arc::new(GatewayDispatcher::from_config(&config, sessions, engine.clone(), heartbeat));

    let mcp_sessions = McpSessionManager::new(SESSION_TIMEOUT);
    mcp_sessions.start();
    let mcp = Arc::new(McpHandler::from_config(&config, mcp_sessions.clone(), engine));

    let state = AppState {
        registry,
        mcp,
        gateway: gateway.clone(),
        bearer_token: Arc::from(config.mcp_server.bearer_token.as_str()),
        mcp_path: Arc::from(config.mcp_server.path.as_str()),
        ws_path: Arc::from(config.websocket_server.path.as_str()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = vec![tokio::spawn(serve(
        "gateway",
        config.websocket_server.bind_addr(),
        gateway_router(state.clone()),
        shutdown_rx.clone(),
    ))];
    if config.mcp_server.enabled {
        servers.push(tokio::spawn(serve(
            "mcp",
            config.mcp_server.bind_addr(),
            app_router(state),
            shutdown_rx,
        )));
    } else {
        tracing::info!("MCP HTTP transport disabled");
    }

    tracing::info!("Endpoints:");
    tracing::info!("  WS   {}{}  gateway protocol", config.websocket_server.bind_addr(), config.websocket_server.path);
    if config.mcp_server.enabled {
        tracing::info!("  POST {}{}  MCP JSON-RPC", config.mcp_server.bind_addr(), config.mcp_server.path);
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    gateway.stop();
    mcp_sessions.stop();
    let _ = shutdown_tx.send(true);
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{:#}", e),
            Err(e) => tracing::error!("server task panicked: {}", e),
        }
    }

    audit.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
