//! relayd
//!
//! This binary:
//! - Loads configuration from the environment
//! - Populates the backend pool
//! - Serves inbound connections until a termination signal arrives

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relayd::config::Config;
use relayd::proxy::{Client, Proxy, Server, ServerConfig};
use relayd_hooks::{HookName, HookRegistry, HookRunner, Payload};
use relayd_pool::Pool;
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to RELAYD_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relayd");
    info!(
        listen_addr = %config.listen_addr,
        backend = %config.client.address,
        network = %config.client.network,
        pool_size = config.pool_size,
        elastic = config.proxy.elastic,
        "Configuration loaded"
    );

    // No handlers are registered in-process; the registry still drives every hook
    let hooks: Arc<dyn HookRunner> = Arc::new(HookRegistry::new(config.verification));

    match serde_json::to_value(&config) {
        Ok(serde_json::Value::Object(payload)) => {
            hooks.notify(HookName::OnConfigLoaded, payload).await
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to convert configuration for hooks"),
    }
    hooks
        .notify(
            HookName::OnNewLogger,
            payload(json!({"level": config.log_level, "format": "json"})),
        )
        .await;

    // Populate the backend pool
    let pool = Pool::new(config.pool_size);
    for _ in 0..config.pool_size {
        let client = match Client::connect(&config.client).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(error = %e, address = %config.client.address, "Failed to create client");
                continue;
            }
        };
        hooks
            .notify(
                HookName::OnNewClient,
                payload(json!({
                    "id": client.id(),
                    "network": config.client.network,
                    "address": config.client.address,
                    "localAddr": client.local_addr(),
                    "remoteAddr": client.remote_addr(),
                })),
            )
            .await;
        pool.put(client.id().to_string(), client)
            .context("Failed to add client to the pool")?;
    }

    if pool.size() != config.pool_size {
        anyhow::bail!(
            "pool populated with {} of {} clients, check the backend at {}",
            pool.size(),
            config.pool_size,
            config.client.address
        );
    }
    info!(count = pool.size(), "Backend pool populated");
    hooks
        .notify(
            HookName::OnNewPool,
            payload(json!({"size": pool.size(), "capacity": pool.cap()})),
        )
        .await;

    let proxy = Arc::new(Proxy::new(
        pool,
        Arc::clone(&hooks),
        config.proxy,
        config.client.clone(),
    ));
    hooks
        .notify(
            HookName::OnNewProxy,
            payload(json!({
                "elastic": config.proxy.elastic,
                "reuseElasticClients": config.proxy.reuse_elastic_clients,
            })),
        )
        .await;

    let mut server_config = ServerConfig::new(config.listen_addr);
    server_config.max_connections = config.max_connections;
    let server = Arc::new(Server::bind(server_config, Arc::clone(&proxy), Arc::clone(&hooks)).await?);
    hooks
        .notify(
            HookName::OnNewServer,
            payload(json!({
                "address": server.local_addr()?.to_string(),
                "maxConnections": config.max_connections,
            })),
        )
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run(shutdown_rx).await }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = sigint.recv() => Some("SIGINT"),
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sighup.recv() => Some("SIGHUP"),
        _ = sigquit.recv() => Some("SIGQUIT"),
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            None
        }
    };

    if let Some(name) = received {
        info!(signal = name, "Received shutdown signal");
        hooks
            .notify(HookName::OnSignal, payload(json!({"signal": name})))
            .await;

        let _ = shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(10), server_handle).await {
            Ok(Ok(Err(e))) => error!(error = %e, "Server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "Server task panicked"),
            Err(_) => {
                warn!("Server did not shut down in time");
                proxy.shutdown();
            }
            Ok(Ok(Ok(()))) => {}
        }
    }

    info!("relayd stopped");
    Ok(())
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}
