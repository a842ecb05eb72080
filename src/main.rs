//! k2mm - link diagnostics node
//!
//! A UDP node that answers probes, runs latency tests and bridges memory-access records.

use k2mm_core::{Engine, MemoryBus};
use k2mm_server::{run_metrics_server, Config, Metrics, Server, ServerConfig};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if K2MM_CONFIG is set, then env overrides)
    let config_path = std::env::var("K2MM_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting k2mm node");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Link: {}-bit beats, {}-bit addresses, {:?} endian, fifo depth {}, queue depth {}",
        config.link.beat_width_bits,
        config.link.address_width_bits,
        config.link.endianness,
        config.link.fifo_depth,
        config.link.datagram_queue_depth
    );
    if config.link.beat_width_bits > 64 {
        tracing::warn!("  Record bridge: disabled (beats wider than 64 bits)");
    } else {
        tracing::info!("  Record bridge: {}", config.link.bridge_mode.as_str());
    }
    match (config.tester.enabled, config.tester.peer) {
        (true, Some(peer)) => tracing::info!(
            "  Latency test: {} beats to {} every {}ms",
            config.tester.length,
            peer,
            config.tester.interval_ms
        ),
        (true, None) => tracing::warn!("  Latency test: enabled but no peer configured"),
        _ => tracing::info!("  Latency test: disabled"),
    }
    if let (true, Some(peer)) = (config.probe.enabled, config.probe.peer) {
        tracing::info!("  Probe: {} every {}ms", peer, config.probe.interval_ms);
    }

    let bus = MemoryBus::new().with_wait_states(config.memory.wait_states);
    let engine = Engine::new(config.engine_config(), bus)?;

    let mut server_config = ServerConfig::from_config(&config);

    // Start the metrics endpoint if enabled
    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown.subscribe();
        tracing::info!("  Metrics: http://{}/metrics", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::bind(server_config, engine).await?);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping node...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let stats = server.engine().lock().await.stats();
    tracing::info!(
        "Node stopped (datagrams in={} out={} dropped={}, frames discarded={}, tests lost={})",
        stats.datagrams_in,
        stats.datagrams_out,
        stats.datagrams_dropped,
        stats.frames_discarded,
        stats.tests_aborted
    );
    Ok(())
}
