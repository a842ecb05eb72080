//! Frame-atomic merge and split of beat streams.

use crate::stream::{Beat, Channel, PacketParams, Stage};
use k2mm_protocol::PacketFlags;

/// Traffic handled by the node, in arbiter priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Probe,
    Record,
    Tester,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 3] = [
        TrafficClass::Probe,
        TrafficClass::Record,
        TrafficClass::Tester,
    ];

    /// Sink/source slot of this class.
    pub fn index(self) -> usize {
        match self {
            TrafficClass::Probe => 0,
            TrafficClass::Record => 1,
            TrafficClass::Tester => 2,
        }
    }

    /// Classifies an inbound frame by its header flags.
    pub fn classify(flags: PacketFlags) -> Self {
        if flags.is_probe_request() || flags.is_probe_response() {
            TrafficClass::Probe
        } else if flags.is_no_response() {
            TrafficClass::Tester
        } else {
            TrafficClass::Record
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficClass::Probe => "probe",
            TrafficClass::Record => "record",
            TrafficClass::Tester => "tester",
        }
    }
}

/// Default dispatcher selector.
pub fn route_by_flags(params: &PacketParams) -> Option<usize> {
    Some(TrafficClass::classify(params.flags).index())
}

/// Round-robin merge of several frame sources onto one sink.
///
/// A grant lasts until the granted source delivers its last beat, so frames from
/// different sources never interleave.
#[derive(Debug)]
pub struct Arbiter {
    sources: usize,
    next: usize,
    grant: Option<usize>,
}

impl Arbiter {
    pub fn new(sources: usize) -> Self {
        Self {
            sources,
            next: 0,
            grant: None,
        }
    }

    /// Source currently holding the grant.
    pub fn grant(&self) -> Option<usize> {
        self.grant
    }

    /// Moves at most one beat from the granted source to `output`.
    pub fn step<P>(&mut self, inputs: &mut [&mut Channel<Beat<P>>], output: &mut Channel<Beat<P>>) {
        if !output.is_ready() {
            return;
        }

        let granted = match self.grant {
            Some(index) => index,
            None => {
                let count = self.sources.min(inputs.len());
                let Some(index) = (0..count)
                    .map(|offset| (self.next + offset) % count)
                    .find(|&index| inputs[index].is_valid())
                else {
                    return;
                };
                self.grant = Some(index);
                self.next = (index + 1) % count;
                index
            }
        };

        if let Some(beat) = inputs[granted].pop() {
            let last = beat.last;
            output.send(beat);
            if last {
                self.grant = None;
            }
        }
    }
}

impl Stage for Arbiter {
    fn is_idle(&self) -> bool {
        self.grant.is_none()
    }

    fn reset(&mut self) {
        self.grant = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Idle,
    Sink(usize),
    Discard,
}

/// Routes whole frames from one source to one of several sinks.
///
/// The selector runs on the first beat of each frame; its decision holds until the
/// frame's last beat. `None`, or an index with no sink behind it, discards the frame.
pub struct Dispatcher<F> {
    selector: F,
    route: Route,
    discarded: u64,
}

impl<F> Dispatcher<F> {
    pub fn new(selector: F) -> Self {
        Self {
            selector,
            route: Route::Idle,
            discarded: 0,
        }
    }

    /// Frames consumed without a sink.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Moves at most one beat from `input` to the selected sink.
    pub fn step<P>(&mut self, input: &mut Channel<Beat<P>>, outputs: &mut [&mut Channel<Beat<P>>])
    where
        F: Fn(&P) -> Option<usize>,
    {
        if self.route == Route::Idle {
            let Some(beat) = input.peek() else {
                return;
            };
            self.route = match (self.selector)(&beat.params) {
                Some(index) if index < outputs.len() => Route::Sink(index),
                _ => {
                    self.discarded += 1;
                    tracing::debug!("No sink for inbound frame, discarding");
                    Route::Discard
                }
            };
        }

        match self.route {
            Route::Sink(index) => {
                if !outputs[index].is_ready() {
                    return;
                }
                if let Some(beat) = input.pop() {
                    let last = beat.last;
                    outputs[index].send(beat);
                    if last {
                        self.route = Route::Idle;
                    }
                }
            }
            Route::Discard => {
                if let Some(beat) = input.pop() {
                    if beat.last {
                        self.route = Route::Idle;
                    }
                }
            }
            Route::Idle => {}
        }
    }
}

impl<F> Stage for Dispatcher<F> {
    fn is_idle(&self) -> bool {
        self.route == Route::Idle
    }

    fn reset(&mut self) {
        self.route = Route::Idle;
    }
}
