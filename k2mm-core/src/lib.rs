//! # k2mm-core
//!
//! Dataflow core for k2mm.
//!
//! This crate provides:
//! - Beat streams over bounded valid/ready channels
//! - Packet framing and datagram segmentation
//! - Frame-atomic arbitration and dispatch
//! - Probe responder, record bridge and test traffic stages
//! - A single-threaded engine stepping all of the above

pub mod bridge;
pub mod bus;
pub mod engine;
pub mod error;
pub mod framing;
pub mod mux;
pub mod probe;
pub mod stream;
pub mod tester;

pub use bridge::{BridgeMode, BridgeStats, BusCompletion, RecordBridge};
pub use bus::{Bus, BusTransaction, MemoryBus};
pub use engine::{Engine, EngineConfig, EngineStats};
pub use error::CoreError;
pub use framing::{Datagram, Depacketizer, FramingStats, Packetizer, Reassembler};
pub use mux::{route_by_flags, Arbiter, Dispatcher, TrafficClass};
pub use probe::{ProbeReply, ProbeResponder, ProbeStats};
pub use stream::{
    Beat, Channel, PacketParams, Stage, TransportParams, DEFAULT_DATAGRAM_QUEUE_DEPTH,
    DEFAULT_FIFO_DEPTH, MAX_PENDING_RESULTS,
};
pub use tester::{
    expected_beat, LatencySample, LatencyTester, TestFrameChecker, TestFrameGenerator, TestStatus,
};
