//! Packet framing between the transport and the traffic handlers.
//!
//! The packetizer prepends a k2mm header to every outgoing frame; the depacketizer
//! strips and validates it on the way in. Because beats are a power of two of at
//! least four bytes, the header always covers a whole number of beats and the payload
//! segmentation passes through unchanged.

use crate::stream::{
    collect_payload, segment, Beat, Channel, PacketParams, Stage, TransportParams,
};
use bytes::{Bytes, BytesMut};
use k2mm_protocol::{header_length, PacketHeader, MAGIC};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// One frame as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(peer: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            peer,
            payload: payload.into(),
        }
    }

    /// Splits the datagram into transport beats.
    pub fn into_beats(self, beat_bytes: usize) -> Vec<Beat<TransportParams>> {
        let params = TransportParams {
            peer: self.peer,
            length: self.payload.len(),
        };
        segment(&self.payload, beat_bytes, params)
    }
}

/// Depacketizer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramingStats {
    /// Frames forwarded to the dispatcher.
    pub frames_received: u64,
    /// Frames discarded for a bad magic value.
    pub frames_dropped: u64,
    /// Frames that ended inside their header.
    pub frames_truncated: u64,
    /// Frames with a valid header and no payload.
    pub frames_empty: u64,
}

enum PacketizerState {
    Idle,
    Header {
        beats: VecDeque<Bytes>,
        params: TransportParams,
        sent: usize,
    },
    Payload {
        params: TransportParams,
    },
}

/// Prepends the packet header to each outgoing frame.
pub struct Packetizer {
    beat_bytes: usize,
    header_len: usize,
    state: PacketizerState,
}

impl Packetizer {
    pub fn new(beat_bytes: usize) -> Self {
        Self {
            beat_bytes,
            header_len: header_length(beat_bytes),
            state: PacketizerState::Idle,
        }
    }

    pub fn header_length(&self) -> usize {
        self.header_len
    }

    /// Advances by at most one output beat.
    pub fn step(
        &mut self,
        input: &mut Channel<Beat<PacketParams>>,
        output: &mut Channel<Beat<TransportParams>>,
    ) {
        if !output.is_ready() {
            return;
        }

        if let PacketizerState::Idle = self.state {
            let Some(beat) = input.peek() else {
                return;
            };
            let header = PacketHeader::new(beat.params.flags, self.beat_bytes)
                .encode(self.header_len)
                .freeze();
            let beats = (0..header.len())
                .step_by(self.beat_bytes)
                .map(|start| header.slice(start..start + self.beat_bytes))
                .collect();
            self.state = PacketizerState::Header {
                beats,
                params: TransportParams {
                    peer: beat.params.peer,
                    length: beat.params.length + self.header_len,
                },
                sent: 0,
            };
        }

        match &mut self.state {
            PacketizerState::Header {
                beats,
                params,
                sent,
            } => {
                if let Some(data) = beats.pop_front() {
                    output.send(Beat {
                        data,
                        first: *sent == 0,
                        last: false,
                        last_be: 0,
                        params: *params,
                    });
                    *sent += 1;
                }
                if beats.is_empty() {
                    self.state = PacketizerState::Payload { params: *params };
                }
            }
            PacketizerState::Payload { params } => {
                let params = *params;
                if let Some(beat) = input.pop() {
                    let last = beat.last;
                    let mut beat = beat.with_params(params);
                    beat.first = false;
                    output.send(beat);
                    if last {
                        self.state = PacketizerState::Idle;
                    }
                }
            }
            PacketizerState::Idle => {}
        }
    }
}

impl Stage for Packetizer {
    fn is_idle(&self) -> bool {
        matches!(self.state, PacketizerState::Idle)
    }

    fn reset(&mut self) {
        self.state = PacketizerState::Idle;
    }
}

enum DepacketizerState {
    Idle,
    Header {
        buf: BytesMut,
        transport: TransportParams,
    },
    Receive {
        params: PacketParams,
        first: bool,
    },
    Drop,
}

/// Strips and validates the packet header of each incoming frame.
pub struct Depacketizer {
    header_len: usize,
    state: DepacketizerState,
    stats: FramingStats,
}

impl Depacketizer {
    pub fn new(beat_bytes: usize) -> Self {
        Self {
            header_len: header_length(beat_bytes),
            state: DepacketizerState::Idle,
            stats: FramingStats::default(),
        }
    }

    pub fn stats(&self) -> FramingStats {
        self.stats
    }

    /// Advances by at most one input beat.
    pub fn step(
        &mut self,
        input: &mut Channel<Beat<TransportParams>>,
        output: &mut Channel<Beat<PacketParams>>,
    ) {
        match &mut self.state {
            DepacketizerState::Idle => {
                let Some(beat) = input.pop() else {
                    return;
                };

                let magic = PacketHeader::peek_magic(&beat.data);
                if magic != Some(MAGIC) {
                    self.stats.frames_dropped += 1;
                    tracing::debug!(
                        "Dropping frame from {}: bad magic {:#06x}",
                        beat.params.peer,
                        magic.unwrap_or(0)
                    );
                    if !beat.last {
                        self.state = DepacketizerState::Drop;
                    }
                    return;
                }

                let mut buf = BytesMut::with_capacity(self.header_len);
                buf.extend_from_slice(&beat.data);
                self.absorb_header(buf, beat.params, beat.last);
            }
            DepacketizerState::Header { buf, transport } => {
                let Some(beat) = input.pop() else {
                    return;
                };
                let mut buf = std::mem::take(buf);
                let transport = *transport;
                buf.extend_from_slice(&beat.data);
                self.absorb_header(buf, transport, beat.last);
            }
            DepacketizerState::Receive { params, first } => {
                if !output.is_ready() {
                    return;
                }
                let Some(beat) = input.pop() else {
                    return;
                };
                let last = beat.last;
                let mut beat = beat.with_params(*params);
                beat.first = *first;
                *first = false;
                output.send(beat);
                if last {
                    self.state = DepacketizerState::Idle;
                }
            }
            DepacketizerState::Drop => {
                if let Some(beat) = input.pop() {
                    if beat.last {
                        self.state = DepacketizerState::Idle;
                    }
                }
            }
        }
    }

    fn absorb_header(&mut self, buf: BytesMut, transport: TransportParams, last: bool) {
        if buf.len() < self.header_len {
            if last {
                self.stats.frames_truncated += 1;
                tracing::debug!("Frame from {} ended inside its header", transport.peer);
                self.state = DepacketizerState::Idle;
            } else {
                self.state = DepacketizerState::Header { buf, transport };
            }
            return;
        }

        let header = match PacketHeader::decode_checked(&buf, self.header_len) {
            Ok(header) => header,
            Err(e) => {
                self.stats.frames_dropped += 1;
                tracing::debug!("Dropping frame from {}: {}", transport.peer, e);
                self.state = if last {
                    DepacketizerState::Idle
                } else {
                    DepacketizerState::Drop
                };
                return;
            }
        };

        if last {
            self.stats.frames_empty += 1;
            tracing::debug!("Frame from {} has no payload", transport.peer);
            self.state = DepacketizerState::Idle;
            return;
        }

        self.stats.frames_received += 1;
        self.state = DepacketizerState::Receive {
            params: PacketParams {
                flags: header.flags,
                peer: transport.peer,
                length: transport.length.saturating_sub(self.header_len),
            },
            first: true,
        };
    }
}

impl Stage for Depacketizer {
    fn is_idle(&self) -> bool {
        matches!(self.state, DepacketizerState::Idle)
    }

    fn reset(&mut self) {
        self.state = DepacketizerState::Idle;
    }
}

/// Collects outgoing transport beats back into datagrams.
#[derive(Default)]
pub struct Reassembler {
    beats: Vec<Beat<TransportParams>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes at most one beat; returns a datagram when a frame completes.
    pub fn step(&mut self, input: &mut Channel<Beat<TransportParams>>) -> Option<Datagram> {
        let beat = input.pop()?;
        let last = beat.last;
        self.beats.push(beat);
        if !last {
            return None;
        }

        let beats = std::mem::take(&mut self.beats);
        let params = beats[0].params;
        Some(Datagram {
            peer: params.peer,
            payload: collect_payload(&beats, params.length),
        })
    }
}

impl Stage for Reassembler {
    fn is_idle(&self) -> bool {
        self.beats.is_empty()
    }

    fn reset(&mut self) {
        self.beats.clear();
    }
}
