//! UDP node implementation.
//!
//! One task owns the socket and drives the engine: every received datagram is queued
//! into the engine, the engine is stepped until idle (bounded per tick), and whatever
//! it produced is sent back out. Periodic probes and latency tests are started from the
//! same loop.

use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use bytes::Bytes;
use k2mm_core::{Bus, Datagram, Engine, EngineStats, LatencySample, ProbeResponder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Interval, MissedTickBehavior};

/// Periodic latency test.
#[derive(Debug, Clone)]
pub struct TestSchedule {
    pub peer: SocketAddr,
    pub length: u16,
    pub interval: Duration,
}

/// Periodic probe.
#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    pub peer: SocketAddr,
    pub payload_bytes: usize,
    pub interval: Duration,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// UDP address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest datagram accepted or sent.
    pub max_datagram_size: usize,
    /// Idle tick interval.
    pub tick_interval: Duration,
    /// Upper bound on engine steps per loop iteration.
    pub steps_per_tick: usize,
    pub tester: Option<TestSchedule>,
    pub probe: Option<ProbeSchedule>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_datagram_size", &self.max_datagram_size)
            .field("tick_interval", &self.tick_interval)
            .field("steps_per_tick", &self.steps_per_tick)
            .field("tester", &self.tester)
            .field("probe", &self.probe)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_datagram_size: 9000,
            tick_interval: Duration::from_millis(1),
            steps_per_tick: 4096,
            tester: None,
            probe: None,
            metrics: None,
        }
    }

    /// Builds the server configuration from the node configuration.
    pub fn from_config(config: &Config) -> Self {
        let tester = config
            .tester
            .peer
            .filter(|_| config.tester.enabled)
            .map(|peer| TestSchedule {
                peer,
                length: config.tester.length,
                interval: config.tester.interval(),
            });
        let probe = config
            .probe
            .peer
            .filter(|_| config.probe.enabled)
            .map(|peer| ProbeSchedule {
                peer,
                payload_bytes: config.probe.payload_bytes,
                interval: config.probe.interval(),
            });

        Self {
            bind_addr: config.network.bind_addr,
            max_datagram_size: config.network.max_datagram_size,
            tick_interval: config.network.tick_interval(),
            steps_per_tick: config.network.steps_per_tick.max(1),
            tester,
            probe,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub datagrams_rx: AtomicU64,
    pub datagrams_tx: AtomicU64,
    pub oversize_dropped: AtomicU64,
    pub send_errors: AtomicU64,
    pub latency_samples: AtomicU64,
    /// Latency tests abandoned because their frame did not return in time.
    pub tests_lost: AtomicU64,
}

/// State carried between loop iterations.
#[derive(Default)]
struct LoopState {
    last_stats: EngineStats,
    test_started: Option<Instant>,
    probe_sequence: u64,
}

/// UDP node for k2mm.
pub struct Server<B> {
    config: ServerConfig,
    socket: UdpSocket,
    engine: Mutex<Engine<B>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl<B: Bus + Send> Server<B> {
    /// Binds the socket and creates the server.
    pub async fn bind(config: ServerConfig, engine: Engine<B>) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            socket,
            engine: Mutex::new(engine),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Engine shared with the run loop.
    pub fn engine(&self) -> &Mutex<Engine<B>> {
        &self.engine
    }

    /// Runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Node listening on {} (udp)", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.config.max_datagram_size + 1];
        let mut state = LoopState::default();

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut test_timer = self
            .config
            .tester
            .as_ref()
            .map(|t| tokio::time::interval(t.interval));
        let mut probe_timer = self
            .config
            .probe
            .as_ref()
            .map(|p| tokio::time::interval(p.interval));

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, peer)) => self.receive(&buf[..n], peer).await,
                        Err(e) => tracing::warn!("Receive error: {}", e),
                    }
                }
                _ = tick.tick() => {}
                _ = maybe_tick(&mut test_timer) => self.start_scheduled_test(&mut state).await,
                _ = maybe_tick(&mut probe_timer) => self.send_scheduled_probe(&mut state).await,
                _ = shutdown_rx.recv() => {
                    tracing::info!("Node shutting down");
                    break;
                }
            }

            self.pump(&mut state).await;
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self, data: &[u8], peer: SocketAddr) {
        if data.len() > self.config.max_datagram_size {
            self.stats.oversize_dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.config.metrics {
                metrics
                    .frames_dropped_total
                    .with_label_values(&["oversize"])
                    .inc();
            }
            tracing::debug!("[{}] Dropping oversize datagram", peer);
            return;
        }

        self.stats.datagrams_rx.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.frames_rx_total.inc();
            metrics.bytes_rx_total.inc_by(data.len() as f64);
        }
        tracing::trace!("[{}] Received {} bytes", peer, data.len());

        self.engine
            .lock()
            .await
            .push_datagram(Datagram::new(peer, Bytes::copy_from_slice(data)));
    }

    async fn start_scheduled_test(&self, state: &mut LoopState) {
        let Some(ref schedule) = self.config.tester else {
            return;
        };
        let mut engine = self.engine.lock().await;
        // A test still running a full interval later has lost its frame
        if engine.abort_test() {
            let elapsed = state
                .test_started
                .take()
                .map(|started| started.elapsed())
                .unwrap_or_default();
            tracing::warn!(
                "[{}] Latency test frame not returned after {:?}",
                schedule.peer,
                elapsed
            );
            while let Some(sample) = engine.take_latency_sample() {
                self.record_sample(&sample, elapsed);
            }
        }
        match engine.start_test(schedule.length, Some(schedule.peer)) {
            Ok(()) => state.test_started = Some(Instant::now()),
            Err(e) if e.is_retryable() => {
                tracing::debug!("Skipping latency test: {}", e);
            }
            Err(e) => tracing::warn!("Latency test failed to start: {}", e),
        }
    }

    async fn send_scheduled_probe(&self, state: &mut LoopState) {
        let Some(ref schedule) = self.config.probe else {
            return;
        };
        let payload =
            ProbeResponder::sequence_payload(state.probe_sequence, schedule.payload_bytes);
        state.probe_sequence = state.probe_sequence.wrapping_add(1);
        self.engine
            .lock()
            .await
            .send_probe(Some(schedule.peer), &payload);
    }

    /// Steps the engine and flushes everything it produced.
    async fn pump(&self, state: &mut LoopState) {
        let mut engine = self.engine.lock().await;
        engine.run_until_idle(self.config.steps_per_tick);

        while let Some(datagram) = engine.poll_transmit() {
            if let Err(e) = self.transmit(&datagram).await {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] Send failed: {}", datagram.peer, e);
            }
        }

        while let Some(sample) = engine.take_latency_sample() {
            let elapsed = state
                .test_started
                .take()
                .map(|started| started.elapsed())
                .unwrap_or_default();
            self.record_sample(&sample, elapsed);
        }

        while let Some(status) = engine.take_test_status() {
            tracing::debug!(
                "[{}] Test frame: length={} error={}",
                status.peer,
                status.length,
                status.error
            );
            if status.error {
                if let Some(ref metrics) = self.config.metrics {
                    metrics.test_errors_total.inc();
                }
            }
        }

        while let Some(reply) = engine.take_probe_reply() {
            tracing::debug!("[{}] Probe reply: {} bytes", reply.peer, reply.length);
        }

        let current = engine.stats();
        if let Some(ref metrics) = self.config.metrics {
            metrics.sync_engine(&state.last_stats, &current);
        }
        state.last_stats = current;
    }

    fn record_sample(&self, sample: &LatencySample, elapsed: Duration) {
        if sample.is_lost() {
            self.stats.tests_lost.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.latency_samples.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "Latency: length={} ticks={} time={:?} error={}",
                sample.requested_length,
                sample.elapsed_ticks,
                elapsed,
                sample.error
            );
        }
        if let Some(ref metrics) = self.config.metrics {
            metrics.observe_latency(sample, elapsed);
        }
    }

    async fn transmit(&self, datagram: &Datagram) -> Result<(), ServerError> {
        let size = datagram.payload.len();
        if size > self.config.max_datagram_size {
            return Err(ServerError::DatagramTooLarge {
                size,
                max: self.config.max_datagram_size,
            });
        }

        self.socket.send_to(&datagram.payload, datagram.peer).await?;
        self.stats.datagrams_tx.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.frames_tx_total.inc();
        }
        Ok(())
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

async fn maybe_tick(interval: &mut Option<Interval>) -> tokio::time::Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}
