use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::digest::payload_digest;
use crate::exposure_id::generate_exposure_id;
use crate::packet::packet_type::PT_PULL_REQUEST;

const PEER: &str = "127.0.0.1:9000";

struct Fixture {
    exposure_id: ExposureId,
    object: Bytes,
    layout: ChunkLayout,
    digest_kind: DigestKind,
    manifest: Manifest,
}

impl Fixture {
    fn new(object: Vec<u8>, chunk_size: u32, k: u8, r: u8) -> Self {
        let object = Bytes::from(object);
        let layout = ChunkLayout::new(object.len() as u64, chunk_size, k, r).unwrap();
        let digest_kind = DigestKind::Additive;
        let manifest = Manifest {
            total_size: layout.total_size,
            chunk_size: layout.chunk_size,
            fec_k: k,
            fec_r: r,
            digest_kind,
            content_digest: payload_digest(digest_kind, &object),
        };
        Fixture {
            exposure_id: generate_exposure_id(),
            object,
            layout,
            digest_kind,
            manifest,
        }
    }

    fn manifest_packet(&self) -> Packet {
        Packet::manifest(self.exposure_id, &self.manifest, self.layout.total_chunks)
    }

    fn chunk_packet(&self, chunk_id: u32) -> Packet {
        let payload = if self.layout.is_parity(chunk_id) {
            let span = self.layout.block_span(self.layout.block_of(chunk_id));
            let coder = fec::new_block_coder(self.layout.fec_k, self.layout.fec_r)
                .unwrap()
                .unwrap();
            let data: Vec<Vec<u8>> = (0..u32::from(self.layout.fec_k))
                .map(|i| {
                    fec::padded_data_shard(&self.object, &self.layout, span.first_data_index + i)
                })
                .collect();
            let parity =
                fec::encode_block_parity(&coder, data, self.layout.chunk_size, self.layout.fec_r)
                    .unwrap();
            Bytes::from(parity[(chunk_id - span.parity_start_id) as usize].clone())
        } else {
            fec::data_chunk(&self.object, &self.layout, chunk_id)
        };
        Packet::chunk_data(self.exposure_id, chunk_id, payload, self.digest_kind)
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 37 % 241) as u8).collect()
}

fn new_reception(
    config: &TransportConfig,
    now: Instant,
) -> (Reception, mpsc::Receiver<Result<Bytes>>) {
    let (tx, rx) = mpsc::channel(1);
    let r = Reception::new("test".to_owned(), None, PEER.parse().unwrap(), config, tx, now).unwrap();
    (r, rx)
}

fn small_config() -> TransportConfig {
    TransportConfig::default()
        .with_chunk_size(16)
        .unwrap()
        .with_fec(4, 2)
        .unwrap()
}

#[test]
fn test_manifest_adoption_starts_receiving() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);

    assert_eq!(r.state(), ReceptionState::Discovering);
    assert!(r.poll(t0).is_empty(), "nothing to request before a manifest");

    r.on_manifest(&fx.manifest_packet(), t0);
    assert_eq!(r.state(), ReceptionState::Receiving);
    assert_eq!(r.exposure_id, Some(fx.exposure_id));

    let requests = r.poll(t0);
    let ids: Vec<u32> = requests.iter().map(|p| p.chunk_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4], "window covers all 5 chunks, ascending");
    assert!(requests.iter().all(|p| p.typ == PT_PULL_REQUEST));
}

#[test]
fn test_completes_on_threshold_with_parity() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, mut rx) = new_reception(&small_config(), t0);

    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);

    // kb = 3 real data chunks; any 3 real chunks decode the block.
    r.on_chunk_data(&fx.chunk_packet(0), t0);
    r.on_chunk_data(&fx.chunk_packet(3), t0);
    assert_eq!(r.state(), ReceptionState::Receiving);
    r.on_chunk_data(&fx.chunk_packet(4), t0);

    assert_eq!(r.state(), ReceptionState::Complete);
    let delivered = rx.try_recv().unwrap().unwrap();
    assert_eq!(delivered, fx.object, "reconstructed object is byte-equal");
    assert_eq!(r.stats.snapshot().blocks_decoded, 1);
}

#[test]
fn test_completes_with_data_only() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, mut rx) = new_reception(&small_config(), t0);

    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);
    for id in 0..3 {
        r.on_chunk_data(&fx.chunk_packet(id), t0);
    }
    assert_eq!(r.state(), ReceptionState::Complete);
    assert_eq!(rx.try_recv().unwrap().unwrap(), fx.object);
}

#[test]
fn test_corrupted_chunk_never_stored() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);
    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);

    let mut pkt = fx.chunk_packet(0);
    let mut corrupted = pkt.payload.to_vec();
    corrupted[5] ^= 0x01;
    pkt.payload = Bytes::from(corrupted);
    r.on_chunk_data(&pkt, t0);

    let stats = r.stats.snapshot();
    assert_eq!(stats.checksum_failures, 1);
    assert_eq!(stats.chunks_received, 0);
}

#[test]
fn test_wrong_length_chunk_rejected() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);
    r.on_manifest(&fx.manifest_packet(), t0);

    // Chunk 2 is the short final data chunk (8 bytes); send 16 instead.
    let pkt = Packet::chunk_data(
        fx.exposure_id,
        2,
        Bytes::from(vec![0u8; 16]),
        fx.digest_kind,
    );
    r.on_chunk_data(&pkt, t0);
    assert_eq!(r.stats.snapshot().malformed_chunks, 1);
    assert_eq!(r.stats.snapshot().chunks_received, 0);
}

#[test]
fn test_duplicate_chunk_counted_once() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);
    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);

    r.on_chunk_data(&fx.chunk_packet(0), t0);
    r.on_chunk_data(&fx.chunk_packet(0), t0);
    let stats = r.stats.snapshot();
    assert_eq!(stats.chunks_received, 1);
    assert_eq!(stats.duplicate_chunks, 1);
}

#[test]
fn test_repeat_manifest_is_idempotent() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);

    r.on_manifest(&fx.manifest_packet(), t0);
    r.on_chunk_data(&fx.chunk_packet(0), t0);
    r.on_manifest(&fx.manifest_packet(), t0 + Duration::from_millis(500));
    assert_eq!(r.state(), ReceptionState::Receiving);
    assert_eq!(r.stats.snapshot().chunks_received, 1);
    assert_eq!(r.stats.snapshot().manifests_seen, 2);
}

#[test]
fn test_inconsistent_manifest_fails_reception() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, mut rx) = new_reception(&small_config(), t0);
    r.on_manifest(&fx.manifest_packet(), t0);

    // Same exposure id, halved chunk size.
    let mut contradicting = fx.manifest;
    contradicting.chunk_size = 8;
    let layout = ChunkLayout::new(40, 8, 4, 2).unwrap();
    let pkt = Packet::manifest(fx.exposure_id, &contradicting, layout.total_chunks);
    r.on_manifest(&pkt, t0 + Duration::from_millis(100));

    assert_eq!(r.state(), ReceptionState::Failed);
    assert_eq!(
        rx.try_recv().unwrap().err(),
        Some(Error::ErrInconsistentManifest)
    );
    // Terminal: no further requests.
    assert!(r.poll(t0 + Duration::from_millis(200)).is_empty());
}

#[test]
fn test_idle_deadline_fails_with_peer_unresponsive() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let config = small_config()
        .with_idle_deadline(Duration::from_millis(500))
        .unwrap();
    let (mut r, mut rx) = new_reception(&config, t0);
    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);

    r.poll(t0 + Duration::from_millis(499));
    assert_eq!(r.state(), ReceptionState::Receiving);
    r.poll(t0 + Duration::from_millis(501));
    assert_eq!(r.state(), ReceptionState::Failed);
    assert_eq!(
        rx.try_recv().unwrap().err(),
        Some(Error::ErrPeerUnresponsive)
    );
}

#[test]
fn test_idle_deadline_applies_while_discovering() {
    let t0 = Instant::now();
    let config = small_config()
        .with_idle_deadline(Duration::from_millis(500))
        .unwrap();
    let (mut r, mut rx) = new_reception(&config, t0);
    r.poll(t0 + Duration::from_secs(1));
    assert_eq!(r.state(), ReceptionState::Failed);
    assert_eq!(
        rx.try_recv().unwrap().err(),
        Some(Error::ErrPeerUnresponsive)
    );
}

#[test]
fn test_cancellation_is_immediate_and_silent() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, mut rx) = new_reception(&small_config(), t0);
    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);

    r.cancel();
    assert_eq!(r.state(), ReceptionState::Cancelled);
    assert_eq!(rx.try_recv().unwrap().err(), Some(Error::ErrCancelled));
    assert!(r.poll(t0 + Duration::from_secs(1)).is_empty());
}

#[test]
fn test_retransmit_backoff_and_window_halving() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let config = small_config()
        .with_retry(Duration::from_millis(200), Duration::from_millis(5000))
        .unwrap();
    let (mut r, _rx) = new_reception(&config, t0);
    r.on_manifest(&fx.manifest_packet(), t0);

    let first = r.poll(t0);
    assert_eq!(first.len(), 5);

    // Nothing expires before the initial timeout.
    assert!(r.poll(t0 + Duration::from_millis(150)).is_empty());

    let retx = r.poll(t0 + Duration::from_millis(250));
    assert_eq!(retx.len(), 5, "all five outstanding requests expired");
    assert_eq!(r.stats.snapshot().retransmits, 5);
    assert_eq!(r.stats.snapshot().window, 2, "halving floors at 2");

    // A valid chunk resets the backoff.
    r.on_chunk_data(&fx.chunk_packet(0), t0 + Duration::from_millis(300));
    assert_eq!(r.retry_timeout, Duration::from_millis(200));
}

#[test]
fn test_scheduler_prefers_block_closest_to_threshold() {
    // 8 data chunks, K=4, R=2: two full blocks, ids 0..6 and 6..12.
    let fx = Fixture::new(sample(128), 16, 4, 2);
    assert_eq!(fx.layout.blocks, 2);
    let t0 = Instant::now();
    let config = small_config().with_initial_window(2).unwrap();
    let (mut r, _rx) = new_reception(&config, t0);
    r.on_manifest(&fx.manifest_packet(), t0);

    // Give block 1 three of its four needed chunks out of band.
    for id in [6u32, 7, 8] {
        r.on_chunk_data(&fx.chunk_packet(id), t0);
    }

    let requests = r.poll(t0);
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].chunk_id, 9,
        "block 1 is one chunk from decoding and must be preferred"
    );
}

#[test]
fn test_block_decode_cancels_outstanding_requests() {
    let fx = Fixture::new(sample(128), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);
    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0); // all 12 ids in flight

    // Complete block 0 with its data chunks; its parity requests must die.
    for id in 0..4 {
        r.on_chunk_data(&fx.chunk_packet(id), t0);
    }
    assert_eq!(r.stats.snapshot().blocks_decoded, 1);
    assert!(r.inflight.keys().all(|&id| id >= 6), "block 0 ids cleared");

    // Subsequent polls only ever touch block 1.
    let later = r.poll(t0 + Duration::from_millis(250));
    assert!(later.iter().all(|p| p.chunk_id >= 6));
}

#[test]
fn test_chunk_before_manifest_is_dropped() {
    let fx = Fixture::new(sample(40), 16, 4, 2);
    let t0 = Instant::now();
    let (mut r, _rx) = new_reception(&small_config(), t0);
    r.on_chunk_data(&fx.chunk_packet(0), t0);
    assert_eq!(r.stats.snapshot().chunks_received, 0);
    assert_eq!(r.stats.snapshot().malformed_chunks, 1);
}

#[test]
fn test_large_multi_block_reconstruction_with_parity_mix() {
    // 10 data chunks over 3 blocks (4, 4, 2), mixed data/parity recovery.
    let fx = Fixture::new(sample(10 * 8), 8, 4, 2);
    let t0 = Instant::now();
    let config = TransportConfig::default()
        .with_chunk_size(8)
        .unwrap()
        .with_fec(4, 2)
        .unwrap();
    let (mut r, mut rx) = new_reception(&config, t0);
    r.on_manifest(&fx.manifest_packet(), t0);
    r.poll(t0);

    // Block 0: drop data 1 and 3, use both parity chunks (ids 4, 5).
    for id in [0u32, 2, 4, 5] {
        r.on_chunk_data(&fx.chunk_packet(id), t0);
    }
    // Block 1 (data 6..10, parity 10..12): drop data 6, use parity 11.
    for id in [7u32, 8, 9, 11] {
        r.on_chunk_data(&fx.chunk_packet(id), t0);
    }
    // Block 2 (data 12..14, parity 14..16): kb = 2, one data + one parity.
    for id in [13u32, 14] {
        r.on_chunk_data(&fx.chunk_packet(id), t0);
    }

    assert_eq!(r.state(), ReceptionState::Complete);
    assert_eq!(rx.try_recv().unwrap().unwrap(), fx.object);
    assert_eq!(r.stats.snapshot().blocks_decoded, 3);
}
