use crate::coordinator::ConnectError;
use crate::ids::EndpointId;

/// Fire-and-forget notifications about the visible link.
pub trait LinkHooks {
    fn materialize_link(&mut self, a: EndpointId, b: EndpointId);

    fn teardown_link(&mut self, endpoint: EndpointId);

    /// Failure cue for the endpoint that initiated a rejected connection.
    fn connection_failed(&mut self, _source: EndpointId, _reason: &ConnectError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LinkHooks for NoopHooks {
    fn materialize_link(&mut self, _a: EndpointId, _b: EndpointId) {}

    fn teardown_link(&mut self, _endpoint: EndpointId) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Materialized(EndpointId, EndpointId),
    TornDown(EndpointId),
    Failed(EndpointId, ConnectError),
}

/// Keeps every notification for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingHooks {
    pub events: Vec<LinkEvent>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }
}

impl LinkHooks for RecordingHooks {
    fn materialize_link(&mut self, a: EndpointId, b: EndpointId) {
        self.events.push(LinkEvent::Materialized(a, b));
    }

    fn teardown_link(&mut self, endpoint: EndpointId) {
        self.events.push(LinkEvent::TornDown(endpoint));
    }

    fn connection_failed(&mut self, source: EndpointId, reason: &ConnectError) {
        self.events.push(LinkEvent::Failed(source, reason.clone()));
    }
}
