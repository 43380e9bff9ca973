use crate::stream::data::{FramePacket, SharedFrame};

/// Live display sink consuming throttled annotated frames.
///
/// Implementations must not buffer: each packet replaces whatever came
/// before, and a consumer that misses a frame simply waits for the next one.
pub(crate) trait DisplaySink {
    fn publish(&mut self, packet: FramePacket);
}

/// Display sink over the shared preview slot read by the HTTP server.
pub(crate) struct SharedFrameSink {
    slot: SharedFrame,
}

impl SharedFrameSink {
    pub(crate) fn new(slot: SharedFrame) -> Self {
        Self { slot }
    }
}

impl DisplaySink for SharedFrameSink {
    fn publish(&mut self, packet: FramePacket) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some(packet);
        }
    }
}
