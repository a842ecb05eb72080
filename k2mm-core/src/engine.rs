//! Engine - wires every stage together and advances them one step at a time.
//!
//! ```text
//! datagram -> Depacketizer -> Dispatcher -+-> ProbeResponder ----+
//!                                         +-> RecordBridge ------+-> Arbiter
//!                                         +-> TestFrameChecker   |      |
//!                                             TestFrameGenerator +      v
//!                                                          datagram <- Packetizer
//! ```
//!
//! Stages are stepped downstream first so a beat moves through at most one channel
//! per step. All state lives in the engine; the caller drives it.
//!
//! Whole datagrams are queued on both sides up to `datagram_queue_depth`. Inbound
//! datagrams beyond that are dropped and counted; a full outbound queue stalls the
//! pipeline until the caller polls.

use crate::bridge::{BridgeMode, BridgeStats, BusCompletion, RecordBridge};
use crate::bus::{Bus, BusTransaction};
use crate::error::CoreError;
use crate::framing::{Datagram, Depacketizer, FramingStats, Packetizer, Reassembler};
use crate::mux::{route_by_flags, Arbiter, Dispatcher, TrafficClass};
use crate::probe::{ProbeReply, ProbeResponder, ProbeStats};
use crate::stream::{
    unspecified_peer, Beat, Channel, PacketParams, Stage, TransportParams,
    DEFAULT_DATAGRAM_QUEUE_DEPTH, DEFAULT_FIFO_DEPTH,
};
use crate::tester::{
    LatencySample, LatencyTester, TestFrameChecker, TestFrameGenerator, TestStatus,
};
use k2mm_protocol::{Endianness, RecordCodec};
use std::collections::VecDeque;
use std::net::SocketAddr;

type Selector = fn(&PacketParams) -> Option<usize>;

/// Engine construction parameters. Fixed for the engine's lifetime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Beat width in bits; a power of two in 32..=512.
    pub beat_width_bits: usize,
    /// Record address width in bits; 32 or 64.
    pub address_width_bits: usize,
    pub endianness: Endianness,
    pub bridge_mode: BridgeMode,
    /// Capacity of every inter-stage channel.
    pub fifo_depth: usize,
    /// Datagrams held before the engine inbound side and after its outbound side.
    pub datagram_queue_depth: usize,
    /// Destination of locally originated traffic when the caller names none.
    pub default_peer: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            beat_width_bits: 32,
            address_width_bits: 32,
            endianness: Endianness::Big,
            bridge_mode: BridgeMode::Master,
            fifo_depth: DEFAULT_FIFO_DEPTH,
            datagram_queue_depth: DEFAULT_DATAGRAM_QUEUE_DEPTH,
            default_peer: unspecified_peer(),
        }
    }
}

impl EngineConfig {
    pub fn beat_bytes(&self) -> usize {
        self.beat_width_bits / 8
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let bits = self.beat_width_bits;
        if !bits.is_power_of_two() || !(32..=512).contains(&bits) {
            return Err(CoreError::InvalidConfig {
                reason: format!("beat width must be a power of two in 32..=512, got {}", bits),
            });
        }
        if !matches!(self.address_width_bits, 32 | 64) {
            return Err(CoreError::InvalidConfig {
                reason: format!(
                    "address width must be 32 or 64, got {}",
                    self.address_width_bits
                ),
            });
        }
        if self.address_width_bits > bits {
            return Err(CoreError::InvalidConfig {
                reason: format!(
                    "address width {} exceeds beat width {}",
                    self.address_width_bits, bits
                ),
            });
        }
        if self.fifo_depth == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "fifo depth must be at least 1".to_string(),
            });
        }
        if self.datagram_queue_depth == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "datagram queue depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Snapshot of every stage counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    /// Inbound datagrams refused because the queue was full.
    pub datagrams_dropped: u64,
    pub framing: FramingStats,
    /// Frames the dispatcher or a disabled bridge consumed without handling.
    pub frames_discarded: u64,
    pub probe: ProbeStats,
    pub bridge: BridgeStats,
    pub test_frames_sent: u64,
    /// Latency measurements given up before their frame returned.
    pub tests_aborted: u64,
}

pub struct Engine<B> {
    config: EngineConfig,
    beat_bytes: usize,
    tick: u64,

    ingress: VecDeque<Datagram>,
    ingress_beats: VecDeque<Beat<TransportParams>>,
    rx_transport: Channel<Beat<TransportParams>>,
    rx_packet: Channel<Beat<PacketParams>>,
    probe_rx: Channel<Beat<PacketParams>>,
    record_rx: Channel<Beat<PacketParams>>,
    tester_rx: Channel<Beat<PacketParams>>,
    probe_tx: Channel<Beat<PacketParams>>,
    record_tx: Channel<Beat<PacketParams>>,
    tester_tx: Channel<Beat<PacketParams>>,
    tx_packet: Channel<Beat<PacketParams>>,
    tx_transport: Channel<Beat<TransportParams>>,
    egress: VecDeque<Datagram>,

    depacketizer: Depacketizer,
    dispatcher: Dispatcher<Selector>,
    probe: ProbeResponder,
    bridge: Option<RecordBridge>,
    generator: TestFrameGenerator,
    checker: TestFrameChecker,
    latency: LatencyTester,
    arbiter: Arbiter,
    packetizer: Packetizer,
    reassembler: Reassembler,

    bus: B,
    datagrams_in: u64,
    datagrams_out: u64,
    datagrams_dropped: u64,
    bridge_discarded: u64,
    tests_aborted: u64,
}

impl<B: Bus> Engine<B> {
    pub fn new(config: EngineConfig, bus: B) -> Result<Self, CoreError> {
        config.validate()?;
        let beat_bytes = config.beat_bytes();
        let depth = config.fifo_depth;

        let codec = RecordCodec::new(beat_bytes, config.address_width_bits, config.endianness);
        let bridge = match codec {
            Ok(codec) => Some(RecordBridge::new(codec, config.bridge_mode)),
            Err(e) => {
                tracing::warn!("Record bridge disabled: {}", e);
                None
            }
        };

        tracing::debug!(
            "Engine created: beat={} bits, address={} bits, endianness={:?}, bridge={}",
            config.beat_width_bits,
            config.address_width_bits,
            config.endianness,
            config.bridge_mode.as_str()
        );

        Ok(Self {
            beat_bytes,
            tick: 0,
            ingress: VecDeque::new(),
            ingress_beats: VecDeque::new(),
            rx_transport: Channel::new(depth),
            rx_packet: Channel::new(depth),
            probe_rx: Channel::new(depth),
            record_rx: Channel::new(depth),
            tester_rx: Channel::new(depth),
            probe_tx: Channel::new(depth),
            record_tx: Channel::new(depth),
            tester_tx: Channel::new(depth),
            tx_packet: Channel::new(depth),
            tx_transport: Channel::new(depth),
            egress: VecDeque::new(),
            depacketizer: Depacketizer::new(beat_bytes),
            dispatcher: Dispatcher::new(route_by_flags as Selector),
            probe: ProbeResponder::new(beat_bytes),
            bridge,
            generator: TestFrameGenerator::new(beat_bytes),
            checker: TestFrameChecker::new(beat_bytes),
            latency: LatencyTester::new(),
            arbiter: Arbiter::new(TrafficClass::ALL.len()),
            packetizer: Packetizer::new(beat_bytes),
            reassembler: Reassembler::new(),
            bus,
            datagrams_in: 0,
            datagrams_out: 0,
            datagrams_dropped: 0,
            bridge_discarded: 0,
            tests_aborted: 0,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scheduler steps taken so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Queues an inbound datagram for processing.
    ///
    /// Returns false, and counts a drop, when `datagram_queue_depth` datagrams are
    /// already waiting.
    pub fn push_datagram(&mut self, datagram: Datagram) -> bool {
        if self.ingress.len() >= self.config.datagram_queue_depth {
            self.datagrams_dropped += 1;
            tracing::debug!("Ingress queue full, dropping datagram from {}", datagram.peer);
            return false;
        }
        self.datagrams_in += 1;
        self.ingress.push_back(datagram);
        true
    }

    /// Next outbound datagram, if one is complete.
    pub fn poll_transmit(&mut self) -> Option<Datagram> {
        self.egress.pop_front()
    }

    /// Advances every stage by one step.
    pub fn step(&mut self) {
        if self.egress.len() < self.config.datagram_queue_depth {
            if let Some(datagram) = self.reassembler.step(&mut self.tx_transport) {
                self.datagrams_out += 1;
                self.egress.push_back(datagram);
            }
        }
        self.packetizer
            .step(&mut self.tx_packet, &mut self.tx_transport);
        self.arbiter.step(
            &mut [
                &mut self.probe_tx,
                &mut self.record_tx,
                &mut self.tester_tx,
            ],
            &mut self.tx_packet,
        );

        self.probe.step(&mut self.probe_rx, &mut self.probe_tx);
        match self.bridge.as_mut() {
            Some(bridge) => {
                bridge.step(&mut self.record_rx, &mut self.record_tx, &mut self.bus)
            }
            None => {
                if let Some(beat) = self.record_rx.pop() {
                    if beat.last {
                        self.bridge_discarded += 1;
                        tracing::debug!("Discarding record frame from {}", beat.params.peer);
                    }
                }
            }
        }
        self.generator.step(&mut self.tester_tx);
        self.checker.step(&mut self.tester_rx);
        while let Some(status) = self.checker.take_status() {
            self.latency.observe(status, self.tick);
        }

        self.dispatcher.step(
            &mut self.rx_packet,
            &mut [
                &mut self.probe_rx,
                &mut self.record_rx,
                &mut self.tester_rx,
            ],
        );
        self.depacketizer
            .step(&mut self.rx_transport, &mut self.rx_packet);

        if self.ingress_beats.is_empty() {
            if let Some(datagram) = self.ingress.pop_front() {
                self.ingress_beats = datagram.into_beats(self.beat_bytes).into();
            }
        }
        if self.rx_transport.is_ready() {
            if let Some(beat) = self.ingress_beats.pop_front() {
                self.rx_transport.send(beat);
            }
        }

        self.tick += 1;
    }

    /// No beat is queued anywhere and every stage is between frames.
    pub fn is_idle(&self) -> bool {
        let channels_empty = self.ingress.is_empty()
            && self.ingress_beats.is_empty()
            && self.rx_transport.is_empty()
            && self.rx_packet.is_empty()
            && self.probe_rx.is_empty()
            && self.record_rx.is_empty()
            && self.tester_rx.is_empty()
            && self.probe_tx.is_empty()
            && self.record_tx.is_empty()
            && self.tester_tx.is_empty()
            && self.tx_packet.is_empty()
            && self.tx_transport.is_empty();

        channels_empty
            && self.depacketizer.is_idle()
            && self.dispatcher.is_idle()
            && self.probe.is_idle()
            && self.bridge.as_ref().map_or(true, |b| b.is_idle())
            && self.generator.is_idle()
            && self.checker.is_idle()
            && self.arbiter.is_idle()
            && self.packetizer.is_idle()
            && self.reassembler.is_idle()
    }

    /// Steps until idle or `max_steps` is reached. Returns the steps taken.
    pub fn run_until_idle(&mut self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && !self.is_idle() {
            self.step();
            steps += 1;
        }
        steps
    }

    /// Queues a probe request. `None` sends to the configured default peer.
    pub fn send_probe(&mut self, peer: Option<SocketAddr>, payload: &[u8]) {
        let peer = peer.unwrap_or(self.config.default_peer);
        self.probe.send_probe(peer, payload);
    }

    pub fn take_probe_reply(&mut self) -> Option<ProbeReply> {
        self.probe.take_reply()
    }

    /// Starts a latency measurement with a test frame of `length + 1` beats.
    pub fn start_test(&mut self, length: u16, peer: Option<SocketAddr>) -> Result<(), CoreError> {
        let peer = peer.unwrap_or(self.config.default_peer);
        self.latency
            .start(&mut self.generator, length, peer, self.tick)
    }

    /// Abandons the running latency measurement, recording a failed sample.
    ///
    /// A test frame still being generated is finished rather than cut short, so
    /// [`start_test`](Self::start_test) may report busy until it has left.
    pub fn abort_test(&mut self) -> bool {
        if !self.latency.abort(self.tick) {
            return false;
        }
        self.tests_aborted += 1;
        tracing::debug!("Latency test aborted at tick {}", self.tick);
        true
    }

    pub fn is_testing(&self) -> bool {
        self.latency.is_counting()
    }

    pub fn take_latency_sample(&mut self) -> Option<LatencySample> {
        self.latency.take_sample()
    }

    /// Statuses of test frames received with no measurement running.
    pub fn take_test_status(&mut self) -> Option<TestStatus> {
        self.latency.take_status()
    }

    /// Forwards a local bus access to the peer (slave mode only).
    pub fn submit_bus_access(
        &mut self,
        transaction: BusTransaction,
        peer: Option<SocketAddr>,
    ) -> Result<(), CoreError> {
        let peer = peer.unwrap_or(self.config.default_peer);
        let Some(bridge) = self.bridge.as_mut() else {
            return Err(CoreError::BridgeUnavailable {
                beat_bits: self.config.beat_width_bits,
            });
        };
        bridge.submit(transaction, peer)
    }

    pub fn take_bus_completion(&mut self) -> Option<BusCompletion> {
        self.bridge.as_mut().and_then(|b| b.take_completion())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            datagrams_in: self.datagrams_in,
            datagrams_out: self.datagrams_out,
            datagrams_dropped: self.datagrams_dropped,
            framing: self.depacketizer.stats(),
            frames_discarded: self.dispatcher.discarded() + self.bridge_discarded,
            probe: self.probe.stats(),
            bridge: self.bridge.as_ref().map(|b| b.stats()).unwrap_or_default(),
            test_frames_sent: self.generator.frames_sent(),
            tests_aborted: self.tests_aborted,
        }
    }

    /// Forces every stage idle and discards all partially processed traffic.
    ///
    /// Completed outbound datagrams are kept.
    pub fn flush(&mut self) {
        tracing::warn!("Flushing engine at tick {}", self.tick);

        self.ingress.clear();
        self.ingress_beats.clear();
        for channel in [&mut self.rx_transport, &mut self.tx_transport] {
            channel.clear();
        }
        for channel in [
            &mut self.rx_packet,
            &mut self.probe_rx,
            &mut self.record_rx,
            &mut self.tester_rx,
            &mut self.probe_tx,
            &mut self.record_tx,
            &mut self.tester_tx,
            &mut self.tx_packet,
        ] {
            channel.clear();
        }

        self.depacketizer.reset();
        self.dispatcher.reset();
        self.probe.reset();
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.reset();
        }
        self.generator.reset();
        self.checker.reset();
        self.latency.reset();
        self.arbiter.reset();
        self.packetizer.reset();
        self.reassembler.reset();
    }
}
