//! Synthetic test traffic and round-trip timing.
//!
//! The generator emits frames whose beat *i* carries the 16-bit counter *i* repeated
//! across the beat, least significant byte first. The checker recomputes the same
//! pattern on reception and reports one status per frame.

use crate::error::CoreError;
use crate::stream::{full_byte_enable, push_result, Beat, Channel, PacketParams, Stage};
use bytes::Bytes;
use k2mm_protocol::PacketFlags;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Payload of beat `index` in a test frame.
pub fn expected_beat(index: usize, beat_bytes: usize) -> Bytes {
    let counter = (index as u16).to_le_bytes();
    (0..beat_bytes).map(|i| counter[i % 2]).collect()
}

struct Generation {
    length: u16,
    index: usize,
    peer: SocketAddr,
}

/// Emits one test frame of `length + 1` beats per request.
pub struct TestFrameGenerator {
    beat_bytes: usize,
    active: Option<Generation>,
    frames_sent: u64,
}

impl TestFrameGenerator {
    pub fn new(beat_bytes: usize) -> Self {
        Self {
            beat_bytes,
            active: None,
            frames_sent: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Accepts a request for a frame of `length + 1` beats towards `peer`.
    pub fn start(&mut self, length: u16, peer: SocketAddr) -> Result<(), CoreError> {
        if self.is_busy() {
            return Err(CoreError::TesterBusy);
        }
        self.active = Some(Generation {
            length,
            index: 0,
            peer,
        });
        Ok(())
    }

    pub fn step(&mut self, output: &mut Channel<Beat<PacketParams>>) {
        if !output.is_ready() {
            return;
        }
        let Some(generation) = self.active.as_mut() else {
            return;
        };

        let beats = generation.length as usize + 1;
        let index = generation.index;
        let last = index + 1 == beats;
        output.send(Beat {
            data: expected_beat(index, self.beat_bytes),
            first: index == 0,
            last,
            last_be: if last {
                full_byte_enable(self.beat_bytes)
            } else {
                0
            },
            params: PacketParams {
                flags: PacketFlags::new().with_no_response(),
                peer: generation.peer,
                length: beats * self.beat_bytes,
            },
        });

        generation.index += 1;
        if last {
            self.active = None;
            self.frames_sent += 1;
        }
    }
}

impl Stage for TestFrameGenerator {
    fn is_idle(&self) -> bool {
        !self.is_busy()
    }

    fn reset(&mut self) {
        self.active = None;
    }
}

/// Result of checking one received test frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestStatus {
    pub peer: SocketAddr,
    /// At least one beat did not match the expected pattern.
    pub error: bool,
    /// Received length in bytes.
    pub length: usize,
}

/// Verifies received test frames. Always consumes its input.
pub struct TestFrameChecker {
    beat_bytes: usize,
    index: usize,
    error: bool,
    statuses: VecDeque<TestStatus>,
}

impl TestFrameChecker {
    pub fn new(beat_bytes: usize) -> Self {
        Self {
            beat_bytes,
            index: 0,
            error: false,
            statuses: VecDeque::new(),
        }
    }

    pub fn step(&mut self, input: &mut Channel<Beat<PacketParams>>) {
        let Some(beat) = input.pop() else {
            return;
        };

        if beat.data != expected_beat(self.index, self.beat_bytes) {
            self.error = true;
        }
        self.index += 1;

        if beat.last {
            let status = TestStatus {
                peer: beat.params.peer,
                error: self.error,
                length: self.index * self.beat_bytes,
            };
            if status.error {
                tracing::debug!("Test frame from {} failed check", status.peer);
            }
            push_result(&mut self.statuses, status);
            self.index = 0;
            self.error = false;
        }
    }

    pub fn take_status(&mut self) -> Option<TestStatus> {
        self.statuses.pop_front()
    }
}

impl Stage for TestFrameChecker {
    fn is_idle(&self) -> bool {
        self.index == 0
    }

    fn reset(&mut self) {
        self.index = 0;
        self.error = false;
    }
}

/// One latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub requested_length: u16,
    /// Scheduler steps from request to checked frame.
    pub elapsed_ticks: u64,
    pub error: bool,
    pub length: usize,
}

impl LatencySample {
    /// The frame never came back and the measurement was aborted.
    pub fn is_lost(&self) -> bool {
        self.length == 0
    }
}

enum LatencyState {
    Stopped,
    Counting { requested_length: u16, started_at: u64 },
}

/// Times generator requests against checker statuses, one measurement at a time.
pub struct LatencyTester {
    state: LatencyState,
    samples: VecDeque<LatencySample>,
    statuses: VecDeque<TestStatus>,
}

impl Default for LatencyTester {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTester {
    pub fn new() -> Self {
        Self {
            state: LatencyState::Stopped,
            samples: VecDeque::new(),
            statuses: VecDeque::new(),
        }
    }

    pub fn is_counting(&self) -> bool {
        matches!(self.state, LatencyState::Counting { .. })
    }

    /// Issues a generator request and starts counting at `now`.
    pub fn start(
        &mut self,
        generator: &mut TestFrameGenerator,
        length: u16,
        peer: SocketAddr,
        now: u64,
    ) -> Result<(), CoreError> {
        if self.is_counting() {
            return Err(CoreError::TesterBusy);
        }
        generator.start(length, peer)?;
        self.state = LatencyState::Counting {
            requested_length: length,
            started_at: now,
        };
        Ok(())
    }

    /// Feeds a checker status observed at `now`.
    pub fn observe(&mut self, status: TestStatus, now: u64) {
        match self.state {
            LatencyState::Counting {
                requested_length,
                started_at,
            } => {
                push_result(
                    &mut self.samples,
                    LatencySample {
                        requested_length,
                        elapsed_ticks: now.saturating_sub(started_at),
                        error: status.error,
                        length: status.length,
                    },
                );
                self.state = LatencyState::Stopped;
            }
            LatencyState::Stopped => {
                push_result(&mut self.statuses, status);
            }
        }
    }

    /// Gives up on the running measurement, e.g. after its frame was lost.
    ///
    /// Records a failed sample with no received length and returns to stopped.
    /// Returns false if nothing was being measured.
    pub fn abort(&mut self, now: u64) -> bool {
        let LatencyState::Counting {
            requested_length,
            started_at,
        } = self.state
        else {
            return false;
        };
        push_result(
            &mut self.samples,
            LatencySample {
                requested_length,
                elapsed_ticks: now.saturating_sub(started_at),
                error: true,
                length: 0,
            },
        );
        self.state = LatencyState::Stopped;
        true
    }

    pub fn take_sample(&mut self) -> Option<LatencySample> {
        self.samples.pop_front()
    }

    /// Statuses of frames that arrived with no measurement running.
    pub fn take_status(&mut self) -> Option<TestStatus> {
        self.statuses.pop_front()
    }
}

impl Stage for LatencyTester {
    fn is_idle(&self) -> bool {
        !self.is_counting()
    }

    fn reset(&mut self) {
        self.state = LatencyState::Stopped;
    }
}
