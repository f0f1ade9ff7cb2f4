use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::digest::DigestKind;
use crate::error::{Error, Result};
use crate::exposure_id::{generate_exposure_id, ExposureId};
use crate::packet::packet_type::*;
use crate::packet::Packet;
use crate::reception::Reception;
use crate::stats::EndpointCounters;
use crate::surface::Surface;

/// All protocol state of one endpoint. Mutated only under the driver's lock,
/// so every Surface and Reception sees single-threaded cooperative access.
pub(crate) struct EndpointInternal {
    pub(crate) name: String,
    surfaces: HashMap<ExposureId, Surface>,
    receptions: HashMap<u64, Reception>,
    by_exposure: HashMap<ExposureId, u64>,
    next_reception_key: u64,
    /// Unpaced control packets (release announcements) awaiting the next poll.
    control: Vec<(SocketAddr, Packet)>,
    pub(crate) counters: Arc<EndpointCounters>,
    closed: bool,
}

impl EndpointInternal {
    pub(crate) fn new(name: String, counters: Arc<EndpointCounters>) -> Self {
        EndpointInternal {
            name,
            surfaces: HashMap::new(),
            receptions: HashMap::new(),
            by_exposure: HashMap::new(),
            next_reception_key: 0,
            control: Vec::new(),
            counters,
            closed: false,
        }
    }

    /// Creates a Surface for `object` and starts advertising it.
    pub(crate) fn expose(
        &mut self,
        object: Bytes,
        manifest_addr: SocketAddr,
        config: &TransportConfig,
        now: Instant,
    ) -> Result<(ExposureId, Arc<crate::stats::SurfaceCounters>)> {
        if self.closed {
            return Err(Error::ErrEndpointClosed);
        }
        let exposure_id = generate_exposure_id();
        let surface = Surface::new(
            format!("{}:{:.8}", self.name, exposure_id.to_string()),
            exposure_id,
            object,
            manifest_addr,
            config,
            now,
        )?;
        let stats = Arc::clone(&surface.stats);
        self.surfaces.insert(exposure_id, surface);
        Ok((exposure_id, stats))
    }

    /// Stops manifest emission and responses for an exposure, releasing its
    /// parity cache. A best-effort EXPOSURE_COMPLETE goes out once.
    pub(crate) fn release(&mut self, exposure_id: ExposureId) {
        if let Some(surface) = self.surfaces.remove(&exposure_id) {
            self.control.push(surface.complete_packet());
            log::debug!("[{}] released exposure {}", self.name, exposure_id);
        }
    }

    /// Registers a Reception. With an exposure id the reception waits for
    /// that exposure's manifest; without one it adopts the next manifest
    /// observed from `peer`.
    pub(crate) fn pull(
        &mut self,
        exposure_id: Option<ExposureId>,
        peer: SocketAddr,
        config: &TransportConfig,
        completed_tx: mpsc::Sender<Result<Bytes>>,
        now: Instant,
    ) -> Result<(u64, Arc<std::sync::atomic::AtomicU8>, Arc<crate::stats::ReceptionCounters>)>
    {
        if self.closed {
            return Err(Error::ErrEndpointClosed);
        }
        if let Some(id) = exposure_id {
            if self.by_exposure.contains_key(&id) {
                return Err(Error::ErrInvalidArgument("exposure already being pulled"));
            }
        }
        let key = self.next_reception_key;
        self.next_reception_key += 1;
        let reception = Reception::new(
            format!("{}:r{}", self.name, key),
            exposure_id,
            peer,
            config,
            completed_tx,
            now,
        )?;
        let state = reception.shared_state();
        let stats = Arc::clone(&reception.stats);
        if let Some(id) = exposure_id {
            self.by_exposure.insert(id, key);
        }
        self.receptions.insert(key, reception);
        Ok((key, state, stats))
    }

    pub(crate) fn cancel(&mut self, key: u64) {
        if let Some(reception) = self.receptions.get_mut(&key) {
            reception.cancel();
        }
    }

    pub(crate) fn reception_exposure_id(&self, key: u64) -> Option<ExposureId> {
        self.receptions.get(&key).and_then(|r| r.exposure_id)
    }

    /// Decodes and dispatches one inbound datagram. All failures are counted
    /// and dropped; nothing propagates.
    pub(crate) fn handle_inbound(&mut self, raw: Bytes, peer: SocketAddr, now: Instant) {
        let pkt = match Packet::unmarshal(&raw) {
            Ok(pkt) => pkt,
            Err(_) => {
                self.counters.malformed_drops.fetch_add(1, Ordering::SeqCst);
                log::trace!("[{}] dropping malformed datagram from {}", self.name, peer);
                return;
            }
        };

        match pkt.typ {
            PT_PULL_REQUEST => {
                if !pkt.payload.is_empty() || pkt.payload_checksum != 0 {
                    self.counters.malformed_drops.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                match self.surfaces.get_mut(&pkt.exposure_id) {
                    Some(surface) => surface.handle_pull(pkt.chunk_id, peer, now),
                    None => {
                        self.counters
                            .unknown_exposure_drops
                            .fetch_add(1, Ordering::SeqCst);
                        log::trace!(
                            "[{}] pull for unknown exposure {}",
                            self.name,
                            pkt.exposure_id
                        );
                    }
                }
            }
            PT_MANIFEST => {
                if pkt.verify_payload(DigestKind::Additive).is_err() {
                    self.counters.checksum_drops.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                let key = match self.by_exposure.get(&pkt.exposure_id) {
                    Some(&key) => Some(key),
                    // Discovery: the first manifest observed from the pulled
                    // address is adopted.
                    None => self
                        .receptions
                        .iter()
                        .filter(|(_, r)| r.exposure_id.is_none() && r.peer == peer)
                        .map(|(&key, _)| key)
                        .min(),
                };
                match key {
                    Some(key) => {
                        if let Some(reception) = self.receptions.get_mut(&key) {
                            reception.on_manifest(&pkt, now);
                            if let Some(id) = reception.exposure_id {
                                self.by_exposure.entry(id).or_insert(key);
                            }
                        }
                    }
                    None => {
                        self.counters
                            .unknown_exposure_drops
                            .fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            PT_CHUNK_DATA => match self.by_exposure.get(&pkt.exposure_id) {
                Some(&key) => {
                    if let Some(reception) = self.receptions.get_mut(&key) {
                        reception.on_chunk_data(&pkt, now);
                    }
                }
                None => {
                    self.counters
                        .unknown_exposure_drops
                        .fetch_add(1, Ordering::SeqCst);
                }
            },
            PT_EXPOSURE_COMPLETE => match self.by_exposure.get(&pkt.exposure_id) {
                _ if !pkt.payload.is_empty() || pkt.payload_checksum != 0 => {
                    self.counters.malformed_drops.fetch_add(1, Ordering::SeqCst);
                }
                Some(&key) => {
                    if let Some(reception) = self.receptions.get_mut(&key) {
                        reception.on_exposure_complete();
                    }
                }
                None => {
                    self.counters
                        .unknown_exposure_drops
                        .fetch_add(1, Ordering::SeqCst);
                }
            },
            _ => {
                // PING and unknown types are reserved.
                self.counters.unhandled_drops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Services every timer and drains everything ready to go on the wire.
    /// Terminal receptions are reaped here, one driver iteration after they
    /// finish.
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<(SocketAddr, Bytes)> {
        let mut out = Vec::new();

        for (peer, pkt) in self.control.drain(..) {
            match pkt.marshal() {
                Ok(raw) => out.push((peer, raw)),
                Err(err) => log::warn!("[{}] marshal failed: {}", self.name, err),
            }
        }

        for surface in self.surfaces.values_mut() {
            match surface.poll(now) {
                Ok(packets) => {
                    for (peer, pkt) in packets {
                        match pkt.marshal() {
                            Ok(raw) => out.push((peer, raw)),
                            Err(err) => log::warn!("[{}] marshal failed: {}", self.name, err),
                        }
                    }
                }
                Err(err) => {
                    log::warn!("[{}] surface poll failed: {}", self.name, err);
                }
            }
        }

        let mut finished = Vec::new();
        for (&key, reception) in self.receptions.iter_mut() {
            let peer = reception.peer;
            for pkt in reception.poll(now) {
                match pkt.marshal() {
                    Ok(raw) => out.push((peer, raw)),
                    Err(err) => log::warn!("[{}] marshal failed: {}", self.name, err),
                }
            }
            if reception.is_terminal() {
                finished.push(key);
            }
        }
        for key in finished {
            if let Some(reception) = self.receptions.remove(&key) {
                if let Some(id) = reception.exposure_id {
                    self.by_exposure.remove(&id);
                }
            }
        }

        out
    }

    /// Earliest pending timer across all surfaces and receptions.
    pub(crate) fn next_timeout(&mut self, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |at: Instant| {
            next = Some(match next {
                Some(cur) => cur.min(at),
                None => at,
            });
        };
        for surface in self.surfaces.values_mut() {
            fold(surface.next_timeout(now));
        }
        for reception in self.receptions.values() {
            if let Some(at) = reception.next_timeout() {
                fold(at);
            }
        }
        if !self.control.is_empty() {
            fold(now);
        }
        next
    }

    /// Driver death: every outstanding reception fails through its handle.
    pub(crate) fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for reception in self.receptions.values_mut() {
            reception.fail_endpoint_closed();
        }
        self.receptions.clear();
        self.by_exposure.clear();
        self.surfaces.clear();
    }
}
