//! Record bridge between the wire and a local bus.
//!
//! In master mode inbound records are executed against the local [`Bus`]: writes go to
//! consecutive addresses, reads go to the explicit addresses in the record, and the
//! read data returns to the requester as a write record at its return address.
//!
//! In slave mode the roles flip. Local bus accesses submitted through
//! [`RecordBridge::submit`] become single-word records on the wire, and a pending read
//! completes with the first data word of the next inbound write record.

use crate::bus::{Bus, BusTransaction};
use crate::error::CoreError;
use crate::stream::{
    collect_payload, push_result, segment, Beat, Channel, PacketParams, Stage,
};
use k2mm_protocol::{PacketFlags, ProtocolError, Record, RecordCodec};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Which side of the bus the bridge sits on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Executes inbound records on the local bus.
    #[default]
    Master,
    /// Forwards local bus accesses to the peer.
    Slave,
}

impl BridgeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeMode::Master => "master",
            BridgeMode::Slave => "slave",
        }
    }
}

/// Outcome of a slave-side bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusCompletion {
    pub transaction: BusTransaction,
    /// Read result; `None` for writes.
    pub data: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub records_received: u64,
    pub records_dropped: u64,
    pub bus_writes: u64,
    pub bus_reads: u64,
    pub records_sent: u64,
}

enum Phase {
    Writes { index: usize },
    Reads { index: usize, data: Vec<u64> },
}

/// A decoded record being executed in master mode.
struct MasterJob {
    record: Record,
    peer: SocketAddr,
    phase: Phase,
}

enum SlaveAccess {
    Sending(BusTransaction),
    AwaitingData(BusTransaction),
}

pub struct RecordBridge {
    codec: RecordCodec,
    mode: BridgeMode,
    rx: Vec<Beat<PacketParams>>,
    job: Option<MasterJob>,
    tx: VecDeque<Beat<PacketParams>>,
    slave: Option<SlaveAccess>,
    completions: VecDeque<BusCompletion>,
    stats: BridgeStats,
}

impl RecordBridge {
    pub fn new(codec: RecordCodec, mode: BridgeMode) -> Self {
        Self {
            codec,
            mode,
            rx: Vec::new(),
            job: None,
            tx: VecDeque::new(),
            slave: None,
            completions: VecDeque::new(),
            stats: BridgeStats::default(),
        }
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Starts a slave-side bus access towards `peer`.
    ///
    /// Only one access may be outstanding; the next one is accepted once
    /// [`take_completion`](Self::take_completion) can report the previous one.
    pub fn submit(
        &mut self,
        transaction: BusTransaction,
        peer: SocketAddr,
    ) -> Result<(), CoreError> {
        if self.mode != BridgeMode::Slave {
            return Err(CoreError::WrongMode {
                mode: self.mode.as_str(),
            });
        }
        if self.slave.is_some() || !self.tx.is_empty() {
            return Err(CoreError::BridgeBusy {
                reason: "access pending",
            });
        }

        let record = Record::new(transaction.byte_enable);
        let record = if transaction.write {
            record.with_writes(transaction.address, vec![transaction.data])
        } else {
            record.with_reads(0, vec![transaction.address])
        };
        self.queue_record(&record, peer)?;
        self.slave = Some(SlaveAccess::Sending(transaction));
        Ok(())
    }

    pub fn take_completion(&mut self) -> Option<BusCompletion> {
        self.completions.pop_front()
    }

    /// Advances the bridge: at most one outbound beat, one inbound beat and one bus
    /// access per call.
    pub fn step<B: Bus>(
        &mut self,
        input: &mut Channel<Beat<PacketParams>>,
        output: &mut Channel<Beat<PacketParams>>,
        bus: &mut B,
    ) {
        self.transmit(output);
        self.receive(input);
        if self.mode == BridgeMode::Master {
            self.execute(bus);
        }
    }

    fn transmit(&mut self, output: &mut Channel<Beat<PacketParams>>) {
        if !output.is_ready() {
            return;
        }
        let Some(beat) = self.tx.pop_front() else {
            return;
        };
        let last = beat.last;
        output.send(beat);
        if !last {
            return;
        }

        self.stats.records_sent += 1;
        if let Some(SlaveAccess::Sending(transaction)) = self.slave {
            if transaction.write {
                push_result(
                    &mut self.completions,
                    BusCompletion {
                        transaction,
                        data: None,
                    },
                );
                self.slave = None;
            } else {
                self.slave = Some(SlaveAccess::AwaitingData(transaction));
            }
        }
    }

    fn receive(&mut self, input: &mut Channel<Beat<PacketParams>>) {
        // One record executes at a time; later frames wait upstream.
        if self.job.is_some() {
            return;
        }
        let Some(beat) = input.pop() else {
            return;
        };
        let last = beat.last;
        self.rx.push(beat);
        if !last {
            return;
        }

        let beats = std::mem::take(&mut self.rx);
        let params = beats[0].params;
        let payload = collect_payload(&beats, params.length);

        let record = match self.codec.decode(&payload) {
            Ok(record) => record,
            Err(e) => {
                self.stats.records_dropped += 1;
                tracing::warn!("Dropping record from {}: {}", params.peer, e);
                return;
            }
        };
        self.stats.records_received += 1;
        tracing::trace!(
            "Record from {}: wcount={} rcount={}",
            params.peer,
            record.wcount(),
            record.rcount()
        );

        match self.mode {
            BridgeMode::Master => {
                self.job = Some(MasterJob {
                    record,
                    peer: params.peer,
                    phase: Phase::Writes { index: 0 },
                });
            }
            BridgeMode::Slave => self.complete_read(&record),
        }
    }

    fn complete_read(&mut self, record: &Record) {
        let Some(SlaveAccess::AwaitingData(transaction)) = self.slave else {
            tracing::debug!("Ignoring record with no read outstanding");
            return;
        };
        let Some(&data) = record.writes.as_ref().and_then(|w| w.data.first()) else {
            return;
        };
        push_result(
            &mut self.completions,
            BusCompletion {
                transaction,
                data: Some(data),
            },
        );
        self.slave = None;
    }

    fn execute<B: Bus>(&mut self, bus: &mut B) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        let byte_enable = job.record.byte_enable;

        match &mut job.phase {
            Phase::Writes { index } => {
                let targets: Vec<(u64, u64)> = job.record.write_targets().collect();
                if let Some(&(address, data)) = targets.get(*index) {
                    let txn = BusTransaction::write(address, data, byte_enable)
                        .with_last(*index + 1 == targets.len());
                    if bus.access(&txn).is_none() {
                        return;
                    }
                    self.stats.bus_writes += 1;
                    *index += 1;
                    if *index < targets.len() {
                        return;
                    }
                }
                job.phase = Phase::Reads {
                    index: 0,
                    data: Vec::with_capacity(job.record.rcount()),
                };
                if job.record.rcount() == 0 {
                    self.job = None;
                }
            }
            Phase::Reads { index, data } => {
                let addrs = job.record.read_addresses();
                if let Some(&address) = addrs.get(*index) {
                    let txn = BusTransaction::read(address, byte_enable)
                        .with_last(*index + 1 == addrs.len());
                    let Some(value) = bus.access(&txn) else {
                        return;
                    };
                    self.stats.bus_reads += 1;
                    data.push(value);
                    *index += 1;
                    if *index < addrs.len() {
                        return;
                    }
                }

                // The response frame waits until the previous one has left.
                if !self.tx.is_empty() {
                    return;
                }
                let Some(job) = self.job.take() else {
                    return;
                };
                let Phase::Reads { data, .. } = job.phase else {
                    return;
                };
                let base_ret_addr = job.record.reads.as_ref().map_or(0, |r| r.base_ret_addr);
                let response = Record::new(byte_enable).with_writes(base_ret_addr, data);
                if let Err(e) = self.queue_record(&response, job.peer) {
                    tracing::warn!("Failed to encode read response for {}: {}", job.peer, e);
                }
            }
        }
    }

    fn queue_record(&mut self, record: &Record, peer: SocketAddr) -> Result<(), ProtocolError> {
        let payload = self.codec.encode(record)?;
        let params = PacketParams {
            flags: PacketFlags::new(),
            peer,
            length: payload.len(),
        };
        self.tx
            .extend(segment(&payload, self.codec.beat_bytes(), params));
        Ok(())
    }
}

impl Stage for RecordBridge {
    fn is_idle(&self) -> bool {
        self.rx.is_empty() && self.job.is_none() && self.tx.is_empty()
    }

    fn reset(&mut self) {
        self.rx.clear();
        self.job = None;
        self.tx.clear();
        self.slave = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::stream::unspecified_peer;
    use k2mm_protocol::Endianness;

    fn codec() -> RecordCodec {
        RecordCodec::new(4, 32, Endianness::Big).unwrap()
    }

    fn peer() -> SocketAddr {
        "10.1.1.1:50000".parse().unwrap()
    }

    fn frame(record: &Record) -> Vec<Beat<PacketParams>> {
        let payload = codec().encode(record).unwrap();
        segment(
            &payload,
            4,
            PacketParams {
                flags: PacketFlags::new(),
                peer: peer(),
                length: payload.len(),
            },
        )
    }

    fn run<B: Bus>(
        bridge: &mut RecordBridge,
        bus: &mut B,
        beats: Vec<Beat<PacketParams>>,
        steps: usize,
    ) -> Vec<Beat<PacketParams>> {
        let mut input = Channel::new(64);
        let mut output = Channel::new(64);
        for beat in beats {
            input.push(beat).unwrap();
        }
        for _ in 0..steps {
            bridge.step(&mut input, &mut output, bus);
        }
        std::iter::from_fn(|| output.pop()).collect()
    }

    fn decode(beats: &[Beat<PacketParams>]) -> Record {
        let length = beats[0].params.length;
        codec().decode(&collect_payload(beats, length)).unwrap()
    }

    /// Records every transaction it acknowledges.
    #[derive(Default)]
    struct TraceBus {
        memory: MemoryBus,
        trace: Vec<BusTransaction>,
    }

    impl Bus for TraceBus {
        fn access(&mut self, txn: &BusTransaction) -> Option<u64> {
            let result = self.memory.access(txn);
            if result.is_some() {
                self.trace.push(*txn);
            }
            result
        }
    }

    #[test]
    fn test_master_burst_write() {
        let record = Record::new(0xF).with_writes(0x1000, vec![0xAA, 0xBB, 0xCC]);
        let mut bridge = RecordBridge::new(codec(), BridgeMode::Master);
        let mut bus = TraceBus::default();

        let out = run(&mut bridge, &mut bus, frame(&record), 32);
        assert!(out.is_empty());
        assert!(bridge.is_idle());

        let writes: Vec<(u64, u64)> = bus.trace.iter().map(|t| (t.address, t.data)).collect();
        assert_eq!(writes, vec![(0x1000, 0xAA), (0x1001, 0xBB), (0x1002, 0xCC)]);
        assert!(bus.trace.iter().all(|t| t.write && t.byte_enable == 0xF));
        assert!(bus.trace[2].last && !bus.trace[0].last);
        assert_eq!(bridge.stats().bus_writes, 3);
    }

    #[test]
    fn test_master_reads_explicit_addresses() {
        let record = Record::new(0xF).with_reads(0x8000, vec![0x30, 0x10, 0x20]);
        let mut bridge = RecordBridge::new(codec(), BridgeMode::Master);
        let mut bus = TraceBus::default();
        bus.memory.write_word(0x10, 1);
        bus.memory.write_word(0x20, 2);
        bus.memory.write_word(0x30, 3);

        let out = run(&mut bridge, &mut bus, frame(&record), 32);

        let addrs: Vec<u64> = bus.trace.iter().map(|t| t.address).collect();
        assert_eq!(addrs, vec![0x30, 0x10, 0x20]);

        let response = decode(&out);
        assert_eq!(out[0].params.peer, peer());
        assert!(!out[0].params.flags.is_probe_request());
        assert_eq!(response.writes.as_ref().unwrap().data, vec![3, 1, 2]);
        assert_eq!(response.rcount(), 0);
        assert_eq!(bridge.stats().records_sent, 1);
    }

    #[test]
    fn test_master_write_then_read() {
        let record = Record::new(0xF)
            .with_writes(0x40, vec![7, 8])
            .with_reads(0x9000, vec![0x41]);
        let mut bridge = RecordBridge::new(codec(), BridgeMode::Master);
        let mut bus = MemoryBus::new().with_wait_states(3);

        let out = run(&mut bridge, &mut bus, frame(&record), 64);
        let response = decode(&out);
        let writes = response.writes.unwrap();
        assert_eq!(writes.base_addr, 0x9000);
        assert_eq!(writes.data, vec![8]);
    }

    #[test]
    fn test_master_holds_next_frame_while_busy() {
        let record = Record::new(0xF).with_writes(0, vec![1, 2, 3, 4]);
        let mut beats = frame(&record);
        beats.extend(frame(&record));

        let mut bridge = RecordBridge::new(codec(), BridgeMode::Master);
        let mut bus = MemoryBus::new().with_wait_states(100);
        let mut input = Channel::new(64);
        let mut output = Channel::new(4);
        let total = beats.len();
        for beat in beats {
            input.push(beat).unwrap();
        }
        for _ in 0..20 {
            bridge.step(&mut input, &mut output, &mut bus);
        }
        // Only the first frame has been taken in
        assert_eq!(input.len(), total / 2);
    }

    #[test]
    fn test_truncated_record_never_reaches_bus() {
        let record = Record::new(0xF).with_writes(0x1000, vec![1, 2, 3]);
        let mut beats = frame(&record);
        beats.pop();
        if let Some(beat) = beats.last_mut() {
            beat.last = true;
        }
        for beat in beats.iter_mut() {
            beat.params.length -= 4;
        }

        let mut bridge = RecordBridge::new(codec(), BridgeMode::Master);
        let mut bus = TraceBus::default();
        let out = run(&mut bridge, &mut bus, beats, 32);

        assert!(out.is_empty());
        assert!(bus.trace.is_empty());
        assert_eq!(bridge.stats().records_dropped, 1);
        assert!(bridge.is_idle());
    }

    #[test]
    fn test_slave_write_completes_on_send() {
        let mut bridge = RecordBridge::new(codec(), BridgeMode::Slave);
        let mut bus = MemoryBus::new();
        let txn = BusTransaction::write(0x200, 0x55, 0xF);
        bridge.submit(txn, peer()).unwrap();

        let err = bridge.submit(txn, peer()).unwrap_err();
        assert!(matches!(err, CoreError::BridgeBusy { .. }));

        let out = run(&mut bridge, &mut bus, Vec::new(), 16);
        let record = decode(&out);
        assert_eq!(record.write_targets().collect::<Vec<_>>(), vec![(0x200, 0x55)]);
        assert_eq!(
            bridge.take_completion(),
            Some(BusCompletion {
                transaction: txn,
                data: None
            })
        );
        // Slave mode never touches the local bus
        assert_eq!(bus.accesses(), 0);
    }

    #[test]
    fn test_slave_read_completes_on_response() {
        let mut bridge = RecordBridge::new(codec(), BridgeMode::Slave);
        let mut bus = MemoryBus::new();
        let txn = BusTransaction::read(0x300, 0xF);
        bridge.submit(txn, peer()).unwrap();

        let out = run(&mut bridge, &mut bus, Vec::new(), 16);
        let request = decode(&out);
        assert_eq!(request.read_addresses(), &[0x300]);
        assert_eq!(request.reads.unwrap().base_ret_addr, 0);
        assert_eq!(bridge.take_completion(), None);

        let response = Record::new(0xF).with_writes(0, vec![0xCAFE]);
        run(&mut bridge, &mut bus, frame(&response), 16);
        assert_eq!(
            bridge.take_completion(),
            Some(BusCompletion {
                transaction: txn,
                data: Some(0xCAFE)
            })
        );
        assert!(bridge.submit(txn, peer()).is_ok());
    }

    #[test]
    fn test_master_and_slave_interoperate() {
        let mut slave = RecordBridge::new(codec(), BridgeMode::Slave);
        let mut master = RecordBridge::new(codec(), BridgeMode::Master);
        let mut remote = MemoryBus::new();
        remote.write_word(0x77, 0x1234);
        let mut unused = MemoryBus::new();

        slave
            .submit(BusTransaction::read(0x77, 0xF), unspecified_peer())
            .unwrap();
        let request = run(&mut slave, &mut unused, Vec::new(), 16);
        let response = run(&mut master, &mut remote, request, 32);
        run(&mut slave, &mut unused, response, 16);

        assert_eq!(slave.take_completion().and_then(|c| c.data), Some(0x1234));
    }

    #[test]
    fn test_submit_in_master_mode() {
        let mut bridge = RecordBridge::new(codec(), BridgeMode::Master);
        let err = bridge
            .submit(BusTransaction::read(0, 0xF), peer())
            .unwrap_err();
        assert!(matches!(err, CoreError::WrongMode { mode: "master" }));
    }
}
