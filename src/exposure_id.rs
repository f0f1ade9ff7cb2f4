use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lazy_static::lazy_static;

lazy_static! {
    /// Monotonic epoch shared by every id generated in this process.
    static ref PROCESS_EPOCH: Instant = Instant::now();
}

/// Last timestamp handed out, for strict in-process uniqueness of the high half.
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// 128-bit exposure identifier.
///
/// The high 64 bits are a monotonic nanosecond reading taken at creation, the
/// low 64 bits are random. Opaque on the wire: network byte order within each
/// half, equality and hashing only.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ExposureId(pub [u8; 16]);

impl ExposureId {
    pub(crate) fn from_parts(hi: u64, lo: u64) -> Self {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&hi.to_be_bytes());
        b[8..].copy_from_slice(&lo.to_be_bytes());
        ExposureId(b)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(b: [u8; 16]) -> Self {
        ExposureId(b)
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Source of exposure identifiers, overridable for tests or id-embedding
/// schemes.
pub trait ExposureIdGenerator {
    fn generate(&mut self) -> ExposureId;
}

/// Default generator: strictly increasing monotonic-ns high half, random low
/// half. Unique within the process, unique across processes with very high
/// probability.
#[derive(Debug, Default)]
pub struct MonotonicIdGenerator;

impl ExposureIdGenerator for MonotonicIdGenerator {
    fn generate(&mut self) -> ExposureId {
        generate_exposure_id()
    }
}

pub fn generate_exposure_id() -> ExposureId {
    let now_ns = PROCESS_EPOCH.elapsed().as_nanos() as u64;
    let stamp = LAST_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now_ns.max(last + 1))
        })
        .map(|last| now_ns.max(last + 1))
        .unwrap_or(now_ns);
    ExposureId::from_parts(stamp, rand::random::<u64>())
}
