//! Loopback probing.
//!
//! Inbound probe requests are echoed back with the response flag set. Probes requested
//! locally are emitted between responses, and inbound responses are consumed and
//! counted as replies.

use crate::stream::{push_result, segment, Beat, Channel, PacketParams, Stage};
use bytes::Bytes;
use k2mm_protocol::PacketFlags;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Probe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub requests_answered: u64,
    pub requests_sent: u64,
    pub replies_received: u64,
}

/// A probe response received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub peer: SocketAddr,
    /// Payload length in bytes.
    pub length: usize,
}

enum ProbeState {
    Idle,
    Respond,
    Swallow { peer: SocketAddr, length: usize },
    Initiate { beats: VecDeque<Beat<PacketParams>> },
}

pub struct ProbeResponder {
    beat_bytes: usize,
    state: ProbeState,
    outbound: VecDeque<Vec<Beat<PacketParams>>>,
    replies: VecDeque<ProbeReply>,
    stats: ProbeStats,
}

impl ProbeResponder {
    pub fn new(beat_bytes: usize) -> Self {
        Self {
            beat_bytes,
            state: ProbeState::Idle,
            outbound: VecDeque::new(),
            replies: VecDeque::new(),
            stats: ProbeStats::default(),
        }
    }

    pub fn stats(&self) -> ProbeStats {
        self.stats
    }

    /// Queues a probe request carrying `payload` to `peer`.
    pub fn send_probe(&mut self, peer: SocketAddr, payload: &[u8]) {
        let params = PacketParams {
            flags: PacketFlags::new().with_probe_request(),
            peer,
            length: payload.len(),
        };
        self.outbound
            .push_back(segment(payload, self.beat_bytes, params));
    }

    /// Oldest reply not yet collected.
    pub fn take_reply(&mut self) -> Option<ProbeReply> {
        self.replies.pop_front()
    }

    /// Advances by at most one beat.
    pub fn step(
        &mut self,
        input: &mut Channel<Beat<PacketParams>>,
        output: &mut Channel<Beat<PacketParams>>,
    ) {
        if let ProbeState::Idle = self.state {
            if let Some(beat) = input.peek() {
                let flags = beat.params.flags;
                self.state = if flags.is_probe_request() && !flags.is_probe_response() {
                    ProbeState::Respond
                } else {
                    ProbeState::Swallow {
                        peer: beat.params.peer,
                        length: beat.params.length,
                    }
                };
            } else if let Some(beats) = self.outbound.pop_front() {
                self.state = ProbeState::Initiate {
                    beats: beats.into(),
                };
            } else {
                return;
            }
        }

        match &mut self.state {
            ProbeState::Respond => {
                if !output.is_ready() {
                    return;
                }
                let Some(mut beat) = input.pop() else {
                    return;
                };
                beat.params.flags = beat.params.flags.into_probe_response();
                let last = beat.last;
                output.send(beat);
                if last {
                    self.stats.requests_answered += 1;
                    self.state = ProbeState::Idle;
                }
            }
            ProbeState::Swallow { peer, length } => {
                let reply = ProbeReply {
                    peer: *peer,
                    length: *length,
                };
                if let Some(beat) = input.pop() {
                    if beat.last {
                        tracing::trace!("Probe reply from {} ({} bytes)", reply.peer, reply.length);
                        self.stats.replies_received += 1;
                        if push_result(&mut self.replies, reply) {
                            tracing::debug!("Reply queue full, dropped oldest reply");
                        }
                        self.state = ProbeState::Idle;
                    }
                }
            }
            ProbeState::Initiate { beats } => {
                if !output.is_ready() {
                    return;
                }
                if let Some(beat) = beats.pop_front() {
                    output.send(beat);
                }
                if beats.is_empty() {
                    self.stats.requests_sent += 1;
                    self.state = ProbeState::Idle;
                }
            }
            ProbeState::Idle => {}
        }
    }

    /// Payload of a probe is opaque; this helper builds a recognizable one.
    pub fn sequence_payload(sequence: u64, len: usize) -> Bytes {
        let bytes = sequence.to_be_bytes();
        (0..len).map(|i| bytes[i % bytes.len()]).collect()
    }
}

impl Stage for ProbeResponder {
    fn is_idle(&self) -> bool {
        matches!(self.state, ProbeState::Idle) && self.outbound.is_empty()
    }

    fn reset(&mut self) {
        self.state = ProbeState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_payload, unspecified_peer, MAX_PENDING_RESULTS};
    use proptest::prelude::*;

    fn request(payload: &[u8], flags: PacketFlags) -> Vec<Beat<PacketParams>> {
        segment(
            payload,
            4,
            PacketParams {
                flags,
                peer: "192.168.1.2:50000".parse().unwrap(),
                length: payload.len(),
            },
        )
    }

    fn drive(
        responder: &mut ProbeResponder,
        input: &mut Channel<Beat<PacketParams>>,
        steps: usize,
    ) -> Vec<Beat<PacketParams>> {
        let mut output = Channel::new(64);
        for _ in 0..steps {
            responder.step(input, &mut output);
        }
        std::iter::from_fn(|| output.pop()).collect()
    }

    #[test]
    fn test_echo_five_beat_probe() {
        let payload: Vec<u8> = (0..20).collect();
        let flags = PacketFlags::new().with_probe_request();

        let mut input = Channel::new(16);
        for beat in request(&payload, flags) {
            input.push(beat).unwrap();
        }

        let mut responder = ProbeResponder::new(4);
        let out = drive(&mut responder, &mut input, 16);

        assert_eq!(out.len(), 5);
        assert!(out[0].first && out[4].last);
        assert!(out.iter().all(|b| b.params.length == 20));
        assert!(out.iter().all(|b| !b.params.flags.is_probe_request()));
        assert!(out.iter().all(|b| b.params.flags.is_probe_response()));
        assert_eq!(collect_payload(&out, 20).as_ref(), payload.as_slice());
        assert_eq!(out[0].params.peer, "192.168.1.2:50000".parse().unwrap());
        assert_eq!(responder.stats().requests_answered, 1);
    }

    #[test]
    fn test_response_keeps_other_flags() {
        let flags = PacketFlags::new().with_probe_request().with_no_response();
        let mut input = Channel::new(4);
        for beat in request(&[1, 2, 3, 4], flags) {
            input.push(beat).unwrap();
        }

        let mut responder = ProbeResponder::new(4);
        let out = drive(&mut responder, &mut input, 4);
        assert!(out[0].params.flags.is_no_response());
        assert!(out[0].params.flags.is_probe_response());
    }

    #[test]
    fn test_sequential_responses() {
        let flags = PacketFlags::new().with_probe_request();
        let mut input = Channel::new(16);
        for beat in request(&[1; 8], flags).into_iter().chain(request(&[2; 8], flags)) {
            input.push(beat).unwrap();
        }

        let mut responder = ProbeResponder::new(4);
        let mut output = Channel::new(1);
        let mut seen = Vec::new();
        for _ in 0..16 {
            responder.step(&mut input, &mut output);
            seen.extend(output.pop());
        }

        let data: Vec<u8> = seen.iter().map(|b| b.data[0]).collect();
        assert_eq!(data, vec![1, 1, 2, 2]);
        assert_eq!(responder.stats().requests_answered, 2);
    }

    #[test]
    fn test_replies_are_consumed() {
        let flags = PacketFlags::new().with_probe_response();
        let mut input = Channel::new(8);
        for beat in request(&[0; 12], flags) {
            input.push(beat).unwrap();
        }

        let mut responder = ProbeResponder::new(4);
        let out = drive(&mut responder, &mut input, 8);
        assert!(out.is_empty());
        assert!(input.is_empty());
        assert_eq!(responder.stats().replies_received, 1);

        let reply = responder.take_reply().unwrap();
        assert_eq!(reply.length, 12);
        assert_eq!(responder.take_reply(), None);
    }

    #[test]
    fn test_send_probe() {
        let mut responder = ProbeResponder::new(4);
        let payload = ProbeResponder::sequence_payload(7, 8);
        responder.send_probe(unspecified_peer(), &payload);

        let mut input = Channel::new(4);
        let out = drive(&mut responder, &mut input, 8);
        assert_eq!(out.len(), 2);
        assert!(out[0].params.flags.is_probe_request());
        assert_eq!(collect_payload(&out, 8), payload);
        assert_eq!(responder.stats().requests_sent, 1);
        assert!(responder.is_idle());
    }

    #[test]
    fn test_queued_request_is_pending_work() {
        let mut responder = ProbeResponder::new(4);
        assert!(responder.is_idle());
        responder.send_probe(unspecified_peer(), &[1, 2, 3]);
        assert!(!responder.is_idle());

        let mut input = Channel::new(4);
        let out = drive(&mut responder, &mut input, 2);
        assert_eq!(out.len(), 1);
        assert!(responder.is_idle());
    }

    #[test]
    fn test_reply_queue_is_bounded() {
        let flags = PacketFlags::new().with_probe_response();
        let mut responder = ProbeResponder::new(4);
        let mut input = Channel::new(4);
        for len in 1..=MAX_PENDING_RESULTS + 3 {
            for beat in request(&vec![0; len], flags) {
                input.push(beat).unwrap();
                responder.step(&mut input, &mut Channel::new(1));
            }
        }

        assert_eq!(
            responder.stats().replies_received,
            (MAX_PENDING_RESULTS + 3) as u64
        );
        let lengths: Vec<usize> = std::iter::from_fn(|| responder.take_reply())
            .map(|r| r.length)
            .collect();
        assert_eq!(lengths.len(), MAX_PENDING_RESULTS);
        assert_eq!(lengths[0], 4);
    }

    #[test]
    fn test_sequence_payload() {
        let payload = ProbeResponder::sequence_payload(0x0102, 10);
        assert_eq!(payload.as_ref(), &[0, 0, 0, 0, 0, 0, 1, 2, 0, 0]);
    }

    proptest! {
        #[test]
        fn prop_response_echoes_any_payload(
            payload in prop::collection::vec(any::<u8>(), 0..200),
            beat_bytes in prop::sample::select(vec![4usize, 8, 16, 32, 64]),
            no_response in any::<bool>(),
        ) {
            let mut flags = PacketFlags::new().with_probe_request();
            if no_response {
                flags = flags.with_no_response();
            }
            let params = PacketParams {
                flags,
                peer: unspecified_peer(),
                length: payload.len(),
            };
            let beats = segment(&payload, beat_bytes, params);
            let count = beats.len();

            let mut input = Channel::new(count);
            for beat in beats {
                input.push(beat).unwrap();
            }
            let mut responder = ProbeResponder::new(beat_bytes);
            let out = drive(&mut responder, &mut input, count + 1);

            prop_assert_eq!(out.len(), count);
            prop_assert!(out[0].first && out[count - 1].last);
            for beat in &out {
                prop_assert!(!beat.params.flags.is_probe_request());
                prop_assert!(beat.params.flags.is_probe_response());
                prop_assert_eq!(beat.params.flags.is_no_response(), no_response);
                prop_assert_eq!(beat.params.length, payload.len());
            }
            let collected = collect_payload(&out, payload.len());
            prop_assert_eq!(collected.as_ref(), payload.as_slice());
            prop_assert_eq!(responder.stats().requests_answered, 1);
            prop_assert!(responder.is_idle());
        }
    }
}
