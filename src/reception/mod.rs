#[cfg(test)]
mod reception_test;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::digest::DigestKind;
use crate::error::{Error, Result};
use crate::exposure_id::ExposureId;
use crate::fec::{self, ChunkLayout};
use crate::packet::manifest::Manifest;
use crate::packet::Packet;
use crate::pacer::WindowPacer;
use crate::stats::ReceptionCounters;
use crate::util::Bitmap;

/// Reception state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReceptionState {
    /// Waiting for the first valid manifest.
    Discovering = 0,
    /// Actively pulling chunks.
    Receiving = 1,
    /// Every block decoded; the object was delivered. Terminal.
    Complete = 2,
    /// Cancelled by the caller. Terminal.
    Cancelled = 3,
    /// Unrecoverable condition. Terminal.
    Failed = 4,
}

impl From<u8> for ReceptionState {
    fn from(v: u8) -> ReceptionState {
        match v {
            1 => ReceptionState::Receiving,
            2 => ReceptionState::Complete,
            3 => ReceptionState::Cancelled,
            4 => ReceptionState::Failed,
            _ => ReceptionState::Discovering,
        }
    }
}

impl fmt::Display for ReceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReceptionState::Discovering => "Discovering",
            ReceptionState::Receiving => "Receiving",
            ReceptionState::Complete => "Complete",
            ReceptionState::Cancelled => "Cancelled",
            ReceptionState::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Everything that exists only once a manifest has been adopted.
struct Assembly {
    layout: ChunkLayout,
    digest_kind: DigestKind,
    manifest: Manifest,
    coder: Option<Arc<ReedSolomon>>,
    /// Data area, padded to data_chunks * chunk_size; truncated on delivery.
    buffer: Vec<u8>,
    /// One bit per chunk id, set once the valid chunk has been stored.
    chunk_bitmap: Bitmap,
    /// One bit per FEC block, set once the block has been decoded.
    block_decoded: Bitmap,
    /// Verified parity chunks held until their block decodes.
    parity: HashMap<u32, Bytes>,
}

/// Reception accumulates one exposure on the receiver: it adopts the first
/// manifest, pulls missing chunks in a reconstruction-aware order, verifies
/// and stores them, decodes blocks as they reach their threshold, and hands
/// the reconstructed object to the caller in one atomic transition.
pub(crate) struct Reception {
    name: String,
    pub(crate) exposure_id: Option<ExposureId>,
    pub(crate) peer: SocketAddr,
    state: Arc<AtomicU8>,
    assembly: Option<Assembly>,
    window: WindowPacer,
    /// Outstanding requests: chunk id -> retransmit deadline.
    inflight: HashMap<u32, Instant>,
    /// Current retransmit timeout: doubled on each retransmit, capped,
    /// reset by any valid chunk from the peer.
    retry_timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
    idle_deadline: Duration,
    last_progress: Instant,
    completed_tx: Option<mpsc::Sender<Result<Bytes>>>,
    pub(crate) stats: Arc<ReceptionCounters>,
}

impl Reception {
    pub(crate) fn new(
        name: String,
        exposure_id: Option<ExposureId>,
        peer: SocketAddr,
        config: &TransportConfig,
        completed_tx: mpsc::Sender<Result<Bytes>>,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(ReceptionCounters::default());
        stats
            .window
            .store(u64::from(config.initial_window()), Ordering::SeqCst);
        Ok(Reception {
            name,
            exposure_id,
            peer,
            state: Arc::new(AtomicU8::new(ReceptionState::Discovering as u8)),
            assembly: None,
            window: WindowPacer::new(config.initial_window(), config.max_window(), now),
            inflight: HashMap::new(),
            retry_timeout: config.retry_initial(),
            retry_initial: config.retry_initial(),
            retry_max: config.retry_max(),
            idle_deadline: config.idle_deadline(),
            last_progress: now,
            completed_tx: Some(completed_tx),
            stats,
        })
    }

    pub(crate) fn shared_state(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.state)
    }

    pub(crate) fn state(&self) -> ReceptionState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: ReceptionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            ReceptionState::Complete | ReceptionState::Cancelled | ReceptionState::Failed
        )
    }

    fn deliver(&mut self, result: Result<Bytes>) {
        if let Some(tx) = self.completed_tx.take() {
            let _ = tx.try_send(result);
        }
    }

    fn fail(&mut self, err: Error) {
        log::warn!("[{}] reception failed: {}", self.name, err);
        self.set_state(ReceptionState::Failed);
        self.inflight.clear();
        self.assembly = None;
        self.deliver(Err(err));
    }

    /// Caller cancellation: immediate terminal state, buffer released, no
    /// further requests.
    pub(crate) fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        log::debug!("[{}] reception cancelled", self.name);
        self.set_state(ReceptionState::Cancelled);
        self.inflight.clear();
        self.assembly = None;
        self.deliver(Err(Error::ErrCancelled));
    }

    /// Endpoint driver death: terminal failure through the handle.
    pub(crate) fn fail_endpoint_closed(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.set_state(ReceptionState::Failed);
        self.inflight.clear();
        self.assembly = None;
        self.deliver(Err(Error::ErrEndpointClosed));
    }

    /// Inbound MANIFEST for this reception. The first one is adopted and
    /// moves the state machine to Receiving; every later one must agree with
    /// it or the reception fails with an inconsistent-manifest error.
    pub(crate) fn on_manifest(&mut self, pkt: &Packet, now: Instant) {
        if self.is_terminal() {
            return;
        }
        self.stats.manifests_seen.fetch_add(1, Ordering::SeqCst);

        let manifest = match Manifest::unmarshal(&pkt.payload) {
            Ok(m) => m,
            Err(_) => {
                self.stats.malformed_chunks.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        if let Some(assembly) = &self.assembly {
            // The idle deadline measures chunk progress, so a consistent
            // repeat manifest does not touch it.
            if assembly.manifest != manifest {
                self.fail(Error::ErrInconsistentManifest);
            }
            return;
        }

        let layout = match ChunkLayout::new(
            manifest.total_size,
            manifest.chunk_size,
            manifest.fec_k,
            manifest.fec_r,
        ) {
            Ok(l) => l,
            Err(err) => {
                log::warn!("[{}] ignoring manifest with bad parameters: {}", self.name, err);
                self.stats.malformed_chunks.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        if pkt.total_chunks != layout.total_chunks {
            log::warn!(
                "[{}] ignoring manifest advertising {} chunks, layout implies {}",
                self.name,
                pkt.total_chunks,
                layout.total_chunks
            );
            self.stats.malformed_chunks.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let coder = match fec::new_block_coder(manifest.fec_k, manifest.fec_r) {
            Ok(c) => c,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        let padded = layout.data_chunks as usize * layout.chunk_size as usize;
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(padded).is_err() {
            self.fail(Error::ErrResourceExhausted);
            return;
        }
        buffer.resize(padded, 0);

        log::debug!(
            "[{}] adopted manifest for {}: {} bytes, {} chunks, {} blocks",
            self.name,
            pkt.exposure_id,
            manifest.total_size,
            layout.total_chunks,
            layout.blocks
        );

        self.exposure_id = Some(pkt.exposure_id);
        self.assembly = Some(Assembly {
            digest_kind: manifest.digest_kind,
            manifest,
            coder,
            buffer,
            chunk_bitmap: Bitmap::new(layout.total_chunks),
            block_decoded: Bitmap::new(layout.blocks),
            parity: HashMap::new(),
            layout,
        });
        self.last_progress = now;
        self.set_state(ReceptionState::Receiving);
    }

    /// Inbound CHUNK_DATA. Verifies, stores, counts, and decodes the chunk's
    /// block when it crosses the reconstruction threshold.
    pub(crate) fn on_chunk_data(&mut self, pkt: &Packet, now: Instant) {
        if self.is_terminal() {
            return;
        }
        let assembly = match &mut self.assembly {
            Some(a) => a,
            // No manifest adopted yet; nothing to verify the chunk against.
            None => {
                self.stats.malformed_chunks.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        let chunk_id = pkt.chunk_id;
        if chunk_id >= assembly.layout.total_chunks
            || pkt.payload.len() != assembly.layout.chunk_len(chunk_id) as usize
        {
            self.stats.malformed_chunks.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if pkt.verify_payload(assembly.digest_kind).is_err() {
            self.stats.checksum_failures.fetch_add(1, Ordering::SeqCst);
            log::trace!("[{}] chunk {} failed its digest", self.name, chunk_id);
            return;
        }

        // Any valid chunk resets the retransmit backoff and the idle clock.
        self.retry_timeout = self.retry_initial;
        self.last_progress = now;

        let block = assembly.layout.block_of(chunk_id);
        if assembly.block_decoded.get(block) || assembly.chunk_bitmap.get(chunk_id) {
            self.stats.duplicate_chunks.fetch_add(1, Ordering::SeqCst);
            self.inflight.remove(&chunk_id);
            return;
        }

        if assembly.layout.is_parity(chunk_id) {
            assembly.parity.insert(chunk_id, pkt.payload.clone());
        } else {
            let (start, end) = assembly.layout.data_range(chunk_id);
            assembly.buffer[start as usize..end as usize].copy_from_slice(&pkt.payload);
        }
        assembly.chunk_bitmap.set(chunk_id);
        self.stats.chunks_received.fetch_add(1, Ordering::SeqCst);
        self.stats
            .bytes_received
            .fetch_add(pkt.payload.len() as u64, Ordering::SeqCst);
        self.inflight.remove(&chunk_id);
        self.window.on_received();

        let span = assembly.layout.block_span(block);
        let present = assembly
            .chunk_bitmap
            .count_range(span.data_start_id, span.end_id());
        if present >= span.decode_threshold() {
            self.decode_block(block);
        }
    }

    /// Runs the FEC decoder for a block that reached its threshold, writes
    /// the recovered data into the buffer, and cancels the block's
    /// outstanding requests. Completes the reception once every block is
    /// decoded.
    fn decode_block(&mut self, block: u32) {
        let decode_result = match &mut self.assembly {
            Some(assembly) => Self::reconstruct_into(assembly, block),
            None => return,
        };
        if let Err(err) = decode_result {
            self.fail(err);
            return;
        }

        let assembly = match &mut self.assembly {
            Some(a) => a,
            None => return,
        };
        let span = assembly.layout.block_span(block);
        for id in span.data_start_id..span.end_id() {
            self.inflight.remove(&id);
            assembly.parity.remove(&id);
        }
        assembly.block_decoded.set(block);
        let decoded = assembly.block_decoded.count_ones();
        let blocks = assembly.block_decoded.len();
        let complete = assembly.block_decoded.is_full();
        self.stats.blocks_decoded.fetch_add(1, Ordering::SeqCst);
        log::debug!("[{}] block {} decoded ({}/{})", self.name, block, decoded, blocks);

        if complete {
            let total_size = assembly.layout.total_size as usize;
            let mut delivered = std::mem::take(&mut assembly.buffer);
            delivered.truncate(total_size);
            let object = Bytes::from(delivered);
            self.set_state(ReceptionState::Complete);
            self.inflight.clear();
            self.assembly = None;
            log::debug!("[{}] reception complete: {} bytes", self.name, object.len());
            self.deliver(Ok(object));
        }
    }

    /// Rebuilds the block's missing data shards from whatever real chunks are
    /// stored, crediting the conceptual zero-pad shards of a short final
    /// block.
    fn reconstruct_into(assembly: &mut Assembly, block: u32) -> Result<()> {
        let coder = match assembly.coder.clone() {
            Some(c) => c,
            // With R = 0 the threshold equals the block's data count, so
            // every data chunk is already in the buffer.
            None => return Ok(()),
        };
        let span = assembly.layout.block_span(block);
        let chunk_size = assembly.layout.chunk_size as usize;
        let k = usize::from(assembly.layout.fec_k);
        let r = usize::from(assembly.layout.fec_r);

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(k + r);
        for i in 0..k as u32 {
            let data_index = span.first_data_index + i;
            if data_index >= assembly.layout.data_chunks {
                // Conceptual zero padding beyond the object.
                shards.push(Some(vec![0u8; chunk_size]));
                continue;
            }
            let id = span.data_start_id + i;
            if assembly.chunk_bitmap.get(id) {
                let start = data_index as usize * chunk_size;
                shards.push(Some(assembly.buffer[start..start + chunk_size].to_vec()));
            } else {
                shards.push(None);
            }
        }
        for j in 0..r as u32 {
            let id = span.parity_start_id + j;
            shards.push(assembly.parity.get(&id).map(|b| b.to_vec()));
        }

        fec::reconstruct_block_data(&coder, &mut shards)?;

        for i in 0..span.data_count {
            let id = span.data_start_id + i;
            if assembly.chunk_bitmap.get(id) {
                continue;
            }
            let data_index = (span.first_data_index + i) as usize;
            if let Some(shard) = &shards[i as usize] {
                let start = data_index * chunk_size;
                assembly.buffer[start..start + chunk_size].copy_from_slice(shard);
                assembly.chunk_bitmap.set(id);
            }
        }
        Ok(())
    }

    pub(crate) fn on_exposure_complete(&mut self) {
        // Best-effort courtesy from the sender; the idle deadline remains the
        // authoritative failure signal.
        self.stats
            .exposure_completes_seen
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Services timers and fills the in-flight window; returns the pull
    /// requests to emit toward the peer.
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<Packet> {
        if self.is_terminal() {
            return Vec::new();
        }
        if now.saturating_duration_since(self.last_progress) >= self.idle_deadline {
            self.fail(Error::ErrPeerUnresponsive);
            return Vec::new();
        }

        let exposure_id = match self.exposure_id {
            Some(id) => id,
            None => return Vec::new(),
        };
        if self.assembly.is_none() {
            return Vec::new();
        }

        let mut out = Vec::new();

        // Retransmit expired requests, backing off the shared retry timeout.
        let expired: Vec<u32> = self
            .inflight
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.stats.retransmits.fetch_add(1, Ordering::SeqCst);
            self.window.on_retransmit();
            self.retry_timeout = (self.retry_timeout * 2).min(self.retry_max);
            self.inflight.insert(id, now + self.retry_timeout);
            out.push(Packet::pull_request(exposure_id, id));
            log::trace!(
                "[{}] retransmit chunk {} (timeout {:?})",
                self.name,
                id,
                self.retry_timeout
            );
        }

        self.window.maybe_update(now);
        self.stats
            .window
            .store(u64::from(self.window.window()), Ordering::SeqCst);

        // Fill the window with new requests.
        while self.inflight.len() < self.window.window() as usize {
            let id = match self.next_chunk_to_request() {
                Some(id) => id,
                None => break,
            };
            self.inflight.insert(id, now + self.retry_timeout);
            self.stats.requests_sent.fetch_add(1, Ordering::SeqCst);
            out.push(Packet::pull_request(exposure_id, id));
        }

        out
    }

    /// Scheduling policy: among undecoded blocks with requestable chunks,
    /// prefer the one closest to its decode threshold; within it, ascending
    /// chunk id.
    fn next_chunk_to_request(&self) -> Option<u32> {
        let assembly = self.assembly.as_ref()?;
        let mut best: Option<(u32, u32)> = None; // (missing_to_threshold, block)
        for block in 0..assembly.layout.blocks {
            if assembly.block_decoded.get(block) {
                continue;
            }
            let span = assembly.layout.block_span(block);
            let present = assembly
                .chunk_bitmap
                .count_range(span.data_start_id, span.end_id());
            let candidate = (span.data_start_id..span.end_id()).find(|&id| {
                !assembly.chunk_bitmap.get(id) && !self.inflight.contains_key(&id)
            });
            if candidate.is_none() {
                continue;
            }
            let missing = span.decode_threshold().saturating_sub(present);
            match best {
                Some((best_missing, _)) if best_missing <= missing => {}
                _ => best = Some((missing, block)),
            }
        }
        let (_, block) = best?;
        let assembly = self.assembly.as_ref()?;
        let span = assembly.layout.block_span(block);
        (span.data_start_id..span.end_id())
            .find(|&id| !assembly.chunk_bitmap.get(id) && !self.inflight.contains_key(&id))
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }
        let mut next = self.last_progress + self.idle_deadline;
        if self.state() == ReceptionState::Receiving {
            next = next.min(self.window.next_update_at());
            if let Some(&deadline) = self.inflight.values().min() {
                next = next.min(deadline);
            }
        }
        Some(next)
    }
}
