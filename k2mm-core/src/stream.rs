//! Stream primitives: beats, bounded channels and the stage contract.
//!
//! Every processing stage exchanges [`Beat`]s through [`Channel`]s. A transfer happens
//! only when the producer has a beat (valid) and the consumer has room (ready) in the
//! same scheduler step; anything not transferred stays where it is.

use bytes::{Bytes, BytesMut};
use k2mm_protocol::PacketFlags;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Default channel capacity between two stages.
pub const DEFAULT_FIFO_DEPTH: usize = 4;

/// Default number of whole datagrams the engine holds on either side.
pub const DEFAULT_DATAGRAM_QUEUE_DEPTH: usize = 64;

/// Uncollected results (replies, samples, completions) a stage keeps per queue.
pub const MAX_PENDING_RESULTS: usize = 64;

/// One transfer unit of a framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beat<P> {
    /// Beat payload, exactly one beat wide.
    pub data: Bytes,
    /// First beat of a frame.
    pub first: bool,
    /// Last beat of a frame.
    pub last: bool,
    /// Valid bytes of the last beat. Zero on every other beat.
    pub last_be: u64,
    /// Frame metadata, repeated on every beat.
    pub params: P,
}

impl<P> Beat<P> {
    pub fn with_params<Q>(self, params: Q) -> Beat<Q> {
        Beat {
            data: self.data,
            first: self.first,
            last: self.last,
            last_be: self.last_be,
            params,
        }
    }
}

/// Metadata exchanged with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    /// Opaque peer address, passed through untouched.
    pub peer: SocketAddr,
    /// Datagram length in bytes.
    pub length: usize,
}

/// Metadata of a depacketized frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketParams {
    pub flags: PacketFlags,
    pub peer: SocketAddr,
    /// Payload length in bytes, header excluded.
    pub length: usize,
}

/// Placeholder peer used before any traffic has been seen.
pub fn unspecified_peer() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Byte-enable mask covering a whole beat.
pub fn full_byte_enable(beat_bytes: usize) -> u64 {
    if beat_bytes >= 64 {
        u64::MAX
    } else {
        (1u64 << beat_bytes) - 1
    }
}

/// Cuts `payload` into beats. The final beat is zero-padded and its `last_be` marks
/// the valid bytes. An empty payload still yields one (empty) beat.
pub fn segment<P: Clone>(payload: &[u8], beat_bytes: usize, params: P) -> Vec<Beat<P>> {
    let count = payload.len().div_ceil(beat_bytes).max(1);
    let mut beats = Vec::with_capacity(count);

    for i in 0..count {
        let start = (i * beat_bytes).min(payload.len());
        let end = ((i + 1) * beat_bytes).min(payload.len());

        let mut data = BytesMut::zeroed(beat_bytes);
        data[..end - start].copy_from_slice(&payload[start..end]);

        let last = i + 1 == count;
        beats.push(Beat {
            data: data.freeze(),
            first: i == 0,
            last,
            last_be: if last {
                full_byte_enable(end - start)
            } else {
                0
            },
            params: params.clone(),
        });
    }

    beats
}

/// Concatenates beat payloads and truncates the result to `length` bytes.
pub fn collect_payload<'a, P: 'a>(
    beats: impl IntoIterator<Item = &'a Beat<P>>,
    length: usize,
) -> Bytes {
    let mut buf = BytesMut::new();
    for beat in beats {
        buf.extend_from_slice(&beat.data);
    }
    buf.truncate(length);
    buf.freeze()
}

/// Bounded FIFO between two stages.
#[derive(Debug)]
pub struct Channel<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Producer side has something to offer.
    pub fn is_valid(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Consumer side can take one more item.
    pub fn is_ready(&self) -> bool {
        self.queue.len() < self.capacity
    }

    pub fn peek(&self) -> Option<&T> {
        self.queue.front()
    }

    /// Appends an item, handing it back if the channel is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if !self.is_ready() {
            return Err(item);
        }
        self.queue.push_back(item);
        Ok(())
    }

    /// Appends an item after the caller has checked [`is_ready`](Self::is_ready).
    pub(crate) fn send(&mut self, item: T) {
        debug_assert!(self.is_ready(), "send on a full channel");
        self.queue.push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops everything buffered. Only used by an explicit flush.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Common contract of all processing stages.
pub trait Stage {
    /// No frame is in flight inside the stage.
    fn is_idle(&self) -> bool;

    /// Returns the stage to idle, discarding any partial frame.
    fn reset(&mut self);
}

/// Queues a result for the caller, evicting the oldest one when
/// [`MAX_PENDING_RESULTS`] are already waiting. Returns true on eviction.
pub(crate) fn push_result<T>(queue: &mut VecDeque<T>, item: T) -> bool {
    let evicted = queue.len() >= MAX_PENDING_RESULTS;
    if evicted {
        queue.pop_front();
    }
    queue.push_back(item);
    evicted
}
