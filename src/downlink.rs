//! Telemetry batching helper for MAVLink-parsed downlink traffic:
//! accumulate whole messages and flush them as one radio frame, amortizing
//! per-frame wireless overhead. Available to higher-layer senders but not
//! wired into [`crate::engine::Engine`]'s default downlink path, which
//! emits one frame per parsed message directly.

use crate::config::TELEMETRY_BATCH_SIZE;

/// Fixed-capacity byte accumulator for up to [`TELEMETRY_BATCH_SIZE`] whole
/// MAVLink messages. Never splits a message across a flush boundary, and
/// never ages out on its own — a quiet link can hold bytes indefinitely.
// TODO: age-based flush (e.g. >=100ms since first buffered message) would
// bound that latency; see the open question this batcher is grounded on.
#[derive(Debug, Default)]
pub struct TelemetryBatch {
    buf: Vec<u8>,
    count: usize,
}

impl TelemetryBatch {
    pub fn new() -> Self {
        TelemetryBatch { buf: Vec::new(), count: 0 }
    }

    /// Add one whole message. Returns `true` if the batch has now reached
    /// [`TELEMETRY_BATCH_SIZE`] messages and should be flushed.
    pub fn push(&mut self, message: &[u8]) -> bool {
        self.buf.extend_from_slice(message);
        self.count += 1;
        self.count >= TELEMETRY_BATCH_SIZE
    }

    pub fn message_count(&self) -> usize {
        self.count
    }

    /// Drain the accumulated bytes for one radio-frame flush and reset the
    /// counters.
    pub fn take(&mut self) -> Vec<u8> {
        self.count = 0;
        std::mem::take(&mut self.buf)
    }
}
