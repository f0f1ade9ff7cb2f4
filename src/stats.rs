use std::sync::atomic::Ordering;

use portable_atomic::AtomicU64;

/// Milli-unit fixed point used for the float gauges (pressure, emit rate) so
/// they can live in the same atomic counter blocks as everything else.
pub(crate) fn to_milli(v: f64) -> u64 {
    (v * 1000.0).max(0.0) as u64
}

fn from_milli(v: u64) -> f64 {
    v as f64 / 1000.0
}

/// Endpoint-wide counters, written by the driver, read by `snapshot_stats`.
#[derive(Default, Debug)]
pub(crate) struct EndpointCounters {
    pub(crate) packets_received: AtomicU64,
    pub(crate) packets_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) malformed_drops: AtomicU64,
    pub(crate) checksum_drops: AtomicU64,
    pub(crate) unknown_exposure_drops: AtomicU64,
    pub(crate) unhandled_drops: AtomicU64,
}

impl EndpointCounters {
    pub(crate) fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            packets_received: self.packets_received.load(Ordering::SeqCst),
            packets_sent: self.packets_sent.load(Ordering::SeqCst),
            bytes_received: self.bytes_received.load(Ordering::SeqCst),
            bytes_sent: self.bytes_sent.load(Ordering::SeqCst),
            malformed_drops: self.malformed_drops.load(Ordering::SeqCst),
            checksum_drops: self.checksum_drops.load(Ordering::SeqCst),
            unknown_exposure_drops: self.unknown_exposure_drops.load(Ordering::SeqCst),
            unhandled_drops: self.unhandled_drops.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of an endpoint's counters.
#[derive(Debug, Default, Copy, Clone)]
pub struct EndpointStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub malformed_drops: u64,
    pub checksum_drops: u64,
    pub unknown_exposure_drops: u64,
    pub unhandled_drops: u64,
}

/// Per-exposure counters held by the Surface and shared with its handle.
#[derive(Default, Debug)]
pub(crate) struct SurfaceCounters {
    pub(crate) pulls_received: AtomicU64,
    pub(crate) pulls_coalesced: AtomicU64,
    pub(crate) pulls_out_of_range: AtomicU64,
    pub(crate) chunks_emitted: AtomicU64,
    pub(crate) bytes_emitted: AtomicU64,
    pub(crate) manifests_emitted: AtomicU64,
    pub(crate) parity_chunks_encoded: AtomicU64,
    pub(crate) rate_adjustments: AtomicU64,
    /// Gauges, milli-units.
    pub(crate) pull_pressure_milli: AtomicU64,
    pub(crate) emit_rate_milli: AtomicU64,
}

impl SurfaceCounters {
    pub(crate) fn snapshot(&self) -> ExposureStats {
        ExposureStats {
            pulls_received: self.pulls_received.load(Ordering::SeqCst),
            pulls_coalesced: self.pulls_coalesced.load(Ordering::SeqCst),
            pulls_out_of_range: self.pulls_out_of_range.load(Ordering::SeqCst),
            chunks_emitted: self.chunks_emitted.load(Ordering::SeqCst),
            bytes_emitted: self.bytes_emitted.load(Ordering::SeqCst),
            manifests_emitted: self.manifests_emitted.load(Ordering::SeqCst),
            parity_chunks_encoded: self.parity_chunks_encoded.load(Ordering::SeqCst),
            rate_adjustments: self.rate_adjustments.load(Ordering::SeqCst),
            pull_pressure: from_milli(self.pull_pressure_milli.load(Ordering::SeqCst)),
            emit_rate: from_milli(self.emit_rate_milli.load(Ordering::SeqCst)),
        }
    }
}

/// Point-in-time copy of an exposure's counters.
#[derive(Debug, Default, Copy, Clone)]
pub struct ExposureStats {
    pub pulls_received: u64,
    pub pulls_coalesced: u64,
    pub pulls_out_of_range: u64,
    pub chunks_emitted: u64,
    pub bytes_emitted: u64,
    pub manifests_emitted: u64,
    pub parity_chunks_encoded: u64,
    pub rate_adjustments: u64,
    /// Decayed pull pressure at the last driver touch.
    pub pull_pressure: f64,
    /// Current emit rate in chunks per second.
    pub emit_rate: f64,
}

/// Per-reception counters held by the Reception and shared with its handle.
#[derive(Default, Debug)]
pub(crate) struct ReceptionCounters {
    pub(crate) requests_sent: AtomicU64,
    pub(crate) retransmits: AtomicU64,
    pub(crate) chunks_received: AtomicU64,
    pub(crate) duplicate_chunks: AtomicU64,
    pub(crate) checksum_failures: AtomicU64,
    pub(crate) malformed_chunks: AtomicU64,
    pub(crate) blocks_decoded: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) manifests_seen: AtomicU64,
    pub(crate) exposure_completes_seen: AtomicU64,
    /// Gauge: current in-flight window.
    pub(crate) window: AtomicU64,
}

impl ReceptionCounters {
    pub(crate) fn snapshot(&self) -> ReceptionStats {
        ReceptionStats {
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            retransmits: self.retransmits.load(Ordering::SeqCst),
            chunks_received: self.chunks_received.load(Ordering::SeqCst),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::SeqCst),
            checksum_failures: self.checksum_failures.load(Ordering::SeqCst),
            malformed_chunks: self.malformed_chunks.load(Ordering::SeqCst),
            blocks_decoded: self.blocks_decoded.load(Ordering::SeqCst),
            bytes_received: self.bytes_received.load(Ordering::SeqCst),
            manifests_seen: self.manifests_seen.load(Ordering::SeqCst),
            exposure_completes_seen: self.exposure_completes_seen.load(Ordering::SeqCst),
            window: self.window.load(Ordering::SeqCst) as u32,
        }
    }
}

/// Point-in-time copy of a reception's counters.
#[derive(Debug, Default, Copy, Clone)]
pub struct ReceptionStats {
    pub requests_sent: u64,
    pub retransmits: u64,
    pub chunks_received: u64,
    pub duplicate_chunks: u64,
    pub checksum_failures: u64,
    pub malformed_chunks: u64,
    pub blocks_decoded: u64,
    pub bytes_received: u64,
    pub manifests_seen: u64,
    pub exposure_completes_seen: u64,
    pub window: u32,
}
