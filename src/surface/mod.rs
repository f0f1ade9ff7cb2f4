
pub(crate) mod parity_cache;
pub(crate) mod pressure;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::config::TransportConfig;
use crate::digest::{payload_digest, DigestKind};
use crate::error::{Error, Result};
use crate::exposure_id::ExposureId;
use crate::fec::{self, ChunkLayout};
use crate::packet::manifest::Manifest;
use crate::packet::Packet;
use crate::pacer::EmitPacer;
use crate::stats::{to_milli, SurfaceCounters};
use parity_cache::ParityCache;
use pressure::DecayingCounter;

/// Duplicate pull requests for the same chunk from the same peer within this
/// window get a single response.
pub(crate) const COALESCE_WINDOW: Duration = Duration::from_millis(100);
/// Bound on the per-peer tracking map; the least recently seen peer is
/// evicted beyond this.
pub(crate) const MAX_TRACKED_PEERS: usize = 64;

#[derive(Debug)]
struct PeerState {
    pressure: DecayingCounter,
    /// Chunk ids answered recently, for duplicate coalescing.
    recent: HashMap<u32, Instant>,
    last_seen: Instant,
}

/// Bounded per-peer pull tracking: decayed per-peer pressure plus the
/// coalescing window state.
#[derive(Debug)]
struct PeerTracker {
    peers: HashMap<SocketAddr, PeerState>,
}

impl PeerTracker {
    fn new() -> Self {
        PeerTracker {
            peers: HashMap::new(),
        }
    }

    /// Records a pull from `peer` and reports whether the response should be
    /// coalesced away as a duplicate.
    fn observe(&mut self, peer: SocketAddr, chunk_id: u32, now: Instant) -> bool {
        if !self.peers.contains_key(&peer) && self.peers.len() >= MAX_TRACKED_PEERS {
            if let Some((&oldest, _)) = self.peers.iter().min_by_key(|(_, s)| s.last_seen) {
                self.peers.remove(&oldest);
            }
        }
        let state = self.peers.entry(peer).or_insert_with(|| PeerState {
            pressure: DecayingCounter::new(now),
            recent: HashMap::new(),
            last_seen: now,
        });
        state.last_seen = now;
        state.pressure.record(now);
        state
            .recent
            .retain(|_, &mut answered| now.saturating_duration_since(answered) < COALESCE_WINDOW);
        if state.recent.contains_key(&chunk_id) {
            return true;
        }
        state.recent.insert(chunk_id, now);
        false
    }
}

/// Surface holds one exposure on the sender: the immutable object and its
/// chunking parameters, the lazily built parity cache, pull-pressure
/// accounting, and the manifest timer. All mutation happens on the endpoint
/// driver; only counters move after creation.
pub(crate) struct Surface {
    name: String,
    pub(crate) exposure_id: ExposureId,
    pub(crate) layout: ChunkLayout,
    digest_kind: DigestKind,
    content_digest: u32,
    object: Bytes,
    coder: Option<Arc<ReedSolomon>>,
    parity_cache: ParityCache,
    pressure: DecayingCounter,
    peers: PeerTracker,
    pacer: EmitPacer,
    /// FIFO of pacer-gated chunk responses (peer, chunk id).
    pending: VecDeque<(SocketAddr, u32)>,
    manifest_addr: SocketAddr,
    manifest_interval: Duration,
    next_manifest_at: Instant,
    pub(crate) stats: Arc<SurfaceCounters>,
}

impl Surface {
    pub(crate) fn new(
        name: String,
        exposure_id: ExposureId,
        object: Bytes,
        manifest_addr: SocketAddr,
        config: &TransportConfig,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let layout = ChunkLayout::new(
            object.len() as u64,
            config.chunk_size(),
            config.fec_k(),
            config.fec_r(),
        )?;
        let coder = fec::new_block_coder(config.fec_k(), config.fec_r())?;
        let digest_kind = config.digest_kind();
        let content_digest = payload_digest(digest_kind, &object);

        log::debug!(
            "[{}] exposing {} as {} chunks ({} data, {} blocks)",
            name,
            exposure_id,
            layout.total_chunks,
            layout.data_chunks,
            layout.blocks
        );

        Ok(Surface {
            name,
            exposure_id,
            layout,
            digest_kind,
            content_digest,
            object,
            coder,
            parity_cache: ParityCache::new(config.parity_cache_chunks()),
            pressure: DecayingCounter::new(now),
            peers: PeerTracker::new(),
            pacer: EmitPacer::new(
                config.emit_rate_initial(),
                config.emit_rate_min(),
                config.emit_rate_max(),
                now,
            ),
            pending: VecDeque::new(),
            manifest_addr,
            manifest_interval: config.manifest_interval(),
            next_manifest_at: now,
            stats: Arc::new(SurfaceCounters::default()),
        })
    }

    pub(crate) fn manifest(&self) -> Manifest {
        Manifest {
            total_size: self.layout.total_size,
            chunk_size: self.layout.chunk_size,
            fec_k: self.layout.fec_k,
            fec_r: self.layout.fec_r,
            digest_kind: self.digest_kind,
            content_digest: self.content_digest,
        }
    }

    /// Inbound PULL_REQUEST. Out-of-bounds ids and coalesced duplicates are
    /// counted and produce no response; everything else is queued behind the
    /// emit pacer.
    pub(crate) fn handle_pull(&mut self, chunk_id: u32, peer: SocketAddr, now: Instant) {
        self.stats.pulls_received.fetch_add(1, Ordering::SeqCst);
        self.pressure.record(now);
        self.pacer.on_request();

        if chunk_id >= self.layout.total_chunks {
            self.stats.pulls_out_of_range.fetch_add(1, Ordering::SeqCst);
            log::trace!(
                "[{}] pull for out-of-range chunk {} of {}",
                self.name,
                chunk_id,
                self.exposure_id
            );
            return;
        }
        if self.peers.observe(peer, chunk_id, now) {
            self.stats.pulls_coalesced.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.pending.push_back((peer, chunk_id));
    }

    /// Serves manifest and pacer timers and drains the pending responses the
    /// token bucket allows. Responses keep the order requests arrived in.
    pub(crate) fn poll(&mut self, now: Instant) -> Result<Vec<(SocketAddr, Packet)>> {
        let mut out = Vec::new();

        if now >= self.next_manifest_at {
            out.push((
                self.manifest_addr,
                Packet::manifest(self.exposure_id, &self.manifest(), self.layout.total_chunks),
            ));
            self.stats.manifests_emitted.fetch_add(1, Ordering::SeqCst);
            self.next_manifest_at = now + self.manifest_interval;
        }

        let pressure = self.pressure.value(now);
        self.stats
            .pull_pressure_milli
            .store(to_milli(pressure), Ordering::SeqCst);
        if self.pacer.maybe_update(pressure, now) {
            self.stats.rate_adjustments.fetch_add(1, Ordering::SeqCst);
            log::debug!(
                "[{}] emit rate adjusted to {:.1} chunks/s (pressure {:.1})",
                self.name,
                self.pacer.rate(),
                pressure
            );
        }
        self.stats
            .emit_rate_milli
            .store(to_milli(self.pacer.rate()), Ordering::SeqCst);

        while let Some(&(peer, chunk_id)) = self.pending.front() {
            if !self.pacer.try_take(now) {
                break;
            }
            self.pending.pop_front();
            let payload = self.materialize(chunk_id)?;
            self.stats.chunks_emitted.fetch_add(1, Ordering::SeqCst);
            self.stats
                .bytes_emitted
                .fetch_add(payload.len() as u64, Ordering::SeqCst);
            out.push((
                peer,
                Packet::chunk_data(self.exposure_id, chunk_id, payload, self.digest_kind),
            ));
        }

        Ok(out)
    }

    /// Data chunks slice straight out of the object; parity chunks come from
    /// the cache, encoded on first request a block at a time.
    fn materialize(&mut self, chunk_id: u32) -> Result<Bytes> {
        if !self.layout.is_parity(chunk_id) {
            return Ok(fec::data_chunk(&self.object, &self.layout, chunk_id));
        }
        if let Some(chunk) = self.parity_cache.get(chunk_id) {
            return Ok(chunk);
        }

        let span = self.layout.block_span(self.layout.block_of(chunk_id));
        let coder = match self.coder.as_ref() {
            Some(c) => c.clone(),
            // Unreachable: a parity chunk id only exists when R > 0.
            None => return Err(Error::Other("parity requested with R = 0".to_owned())),
        };
        let data_shards: Vec<Vec<u8>> = (0..u32::from(self.layout.fec_k))
            .map(|i| fec::padded_data_shard(&self.object, &self.layout, span.first_data_index + i))
            .collect();
        let parity = fec::encode_block_parity(
            &coder,
            data_shards,
            self.layout.chunk_size,
            self.layout.fec_r,
        )?;
        self.stats
            .parity_chunks_encoded
            .fetch_add(parity.len() as u64, Ordering::SeqCst);

        let mut requested = None;
        for (j, shard) in parity.into_iter().enumerate() {
            let id = span.parity_start_id + j as u32;
            let chunk = Bytes::from(shard);
            if id == chunk_id {
                requested = Some(chunk.clone());
            }
            self.parity_cache.insert(id, chunk);
        }
        requested.ok_or_else(|| Error::Other("parity id outside its block".to_owned()))
    }

    /// Current decayed pull pressure.
    pub(crate) fn pull_pressure(&mut self, now: Instant) -> f64 {
        self.pressure.value(now)
    }

    pub(crate) fn rate_adjustments(&self) -> u64 {
        self.pacer.adjustments()
    }

    pub(crate) fn next_timeout(&mut self, now: Instant) -> Instant {
        let mut next = self.next_manifest_at.min(self.pacer.next_update_at());
        if !self.pending.is_empty() {
            if let Some(at) = self.pacer.next_token_at(now) {
                next = next.min(at);
            } else {
                next = now;
            }
        }
        next
    }

    /// Best-effort announcement emitted when the exposure is released.
    pub(crate) fn complete_packet(&self) -> (SocketAddr, Packet) {
        (
            self.manifest_addr,
            Packet::exposure_complete(self.exposure_id),
        )
    }
}
