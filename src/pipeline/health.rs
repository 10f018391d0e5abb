//! Health monitoring and metrics for the receive pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for the pipeline
///
/// Tracks counters across the receive, depacketize and decode stages.
/// All fields use atomic operations for thread-safe access.
#[derive(Default)]
pub struct PipelineHealth {
    /// Datagrams pulled off the transport
    pub packets_received: AtomicU64,

    /// Total payload bytes received
    pub bytes_received: AtomicU64,

    /// Packets discarded before depacketization (malformed, duplicate, late)
    pub packets_dropped: AtomicU64,

    /// Codec frames assembled by the depacketizer
    pub frames_assembled: AtomicU64,

    /// Frames successfully decoded and written to the sink
    pub frames_decoded: AtomicU64,

    /// Frames the decoder rejected
    pub decode_failures: AtomicU64,

    /// Fatal-path transport errors observed
    pub network_errors: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one received datagram of `size` bytes
    pub fn record_packet(&self, size: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a packet discarded before depacketization
    pub fn record_packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an assembled codec frame
    pub fn record_frame_assembled(&self) {
        self.frames_assembled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decoded frame delivered to the sink
    pub fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode failure
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a network error
    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the number of packets received
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Get the total bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get the number of packets dropped
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    /// Get the number of frames assembled
    pub fn frames_assembled(&self) -> u64 {
        self.frames_assembled.load(Ordering::Relaxed)
    }

    /// Get the number of frames decoded
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    /// Get the number of decode failures
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Get the number of network errors
    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            packets_received: self.packets_received(),
            bytes_received: self.bytes_received(),
            packets_dropped: self.packets_dropped(),
            frames_assembled: self.frames_assembled(),
            frames_decoded: self.frames_decoded(),
            decode_failures: self.decode_failures(),
            network_errors: self.network_errors(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
    pub frames_assembled: u64,
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub network_errors: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} packets ({} bytes, {} dropped), {} frames assembled, {} decoded, {} decode failures, {} network errors",
            self.packets_received,
            self.bytes_received,
            self.packets_dropped,
            self.frames_assembled,
            self.frames_decoded,
            self.decode_failures,
            self.network_errors
        )
    }
}
