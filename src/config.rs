use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use util::Conn;

use crate::digest::DigestKind;
use crate::error::{Error, Result};

pub(crate) const DEFAULT_CHUNK_SIZE: u32 = 65536;
/// Largest chunk the wire format will carry in one datagram.
pub(crate) const MAX_CHUNK_SIZE: u32 = 65536;
pub(crate) const DEFAULT_FEC_K: u8 = 223;
pub(crate) const DEFAULT_FEC_R: u8 = 32;
/// K + R may not exceed the GF(2^8) block size.
pub(crate) const MAX_FEC_SHARDS: u16 = 255;
pub(crate) const DEFAULT_MANIFEST_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_INITIAL_WINDOW: u32 = 16;
pub(crate) const DEFAULT_MAX_WINDOW: u32 = 256;
pub(crate) const DEFAULT_RETRY_INITIAL: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_RETRY_MAX: Duration = Duration::from_millis(5000);
pub(crate) const DEFAULT_EMIT_RATE_INITIAL: f64 = 1000.0;
pub(crate) const DEFAULT_EMIT_RATE_MIN: f64 = 10.0;
pub(crate) const DEFAULT_EMIT_RATE_MAX: f64 = 1e6;
pub(crate) const DEFAULT_PARITY_CACHE_CHUNKS: usize = 8192;
pub(crate) const DEFAULT_IDLE_DEADLINE: Duration = Duration::from_millis(30000);

/// Per-exposure / per-reception transport configuration.
///
/// Every option has a default; the `with_*` mutators validate their argument
/// and cross-field constraints are re-checked when the config is handed to
/// `expose` or `pull`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    chunk_size: u32,
    fec_k: u8,
    fec_r: u8,
    digest_kind: DigestKind,
    manifest_interval: Duration,
    initial_window: u32,
    max_window: u32,
    retry_initial: Duration,
    retry_max: Duration,
    emit_rate_initial: f64,
    emit_rate_min: f64,
    emit_rate_max: f64,
    parity_cache_chunks: usize,
    idle_deadline: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fec_k: DEFAULT_FEC_K,
            fec_r: DEFAULT_FEC_R,
            digest_kind: DigestKind::default(),
            manifest_interval: DEFAULT_MANIFEST_INTERVAL,
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_window: DEFAULT_MAX_WINDOW,
            retry_initial: DEFAULT_RETRY_INITIAL,
            retry_max: DEFAULT_RETRY_MAX,
            emit_rate_initial: DEFAULT_EMIT_RATE_INITIAL,
            emit_rate_min: DEFAULT_EMIT_RATE_MIN,
            emit_rate_max: DEFAULT_EMIT_RATE_MAX,
            parity_cache_chunks: DEFAULT_PARITY_CACHE_CHUNKS,
            idle_deadline: DEFAULT_IDLE_DEADLINE,
        }
    }
}

impl TransportConfig {
    pub fn with_chunk_size(mut self, value: u32) -> Result<Self> {
        if value == 0 || value > MAX_CHUNK_SIZE {
            return Err(Error::ErrInvalidArgument("chunk_size"));
        }
        self.chunk_size = value;
        Ok(self)
    }

    pub fn with_fec(mut self, k: u8, r: u8) -> Result<Self> {
        if k == 0 || u16::from(k) + u16::from(r) > MAX_FEC_SHARDS {
            return Err(Error::ErrInvalidArgument("fec parameters"));
        }
        self.fec_k = k;
        self.fec_r = r;
        Ok(self)
    }

    pub fn with_digest_kind(mut self, value: DigestKind) -> Result<Self> {
        self.digest_kind = value;
        Ok(self)
    }

    pub fn with_manifest_interval(mut self, value: Duration) -> Result<Self> {
        if value.is_zero() {
            return Err(Error::ErrInvalidArgument("manifest_interval"));
        }
        self.manifest_interval = value;
        Ok(self)
    }

    pub fn with_initial_window(mut self, value: u32) -> Result<Self> {
        if value == 0 {
            return Err(Error::ErrInvalidArgument("initial_window"));
        }
        self.initial_window = value;
        Ok(self)
    }

    pub fn with_max_window(mut self, value: u32) -> Result<Self> {
        if value == 0 {
            return Err(Error::ErrInvalidArgument("max_window"));
        }
        self.max_window = value;
        Ok(self)
    }

    pub fn with_retry(mut self, initial: Duration, max: Duration) -> Result<Self> {
        if initial.is_zero() || max < initial {
            return Err(Error::ErrInvalidArgument("retry timeouts"));
        }
        self.retry_initial = initial;
        self.retry_max = max;
        Ok(self)
    }

    pub fn with_emit_rate(mut self, initial: f64, min: f64, max: f64) -> Result<Self> {
        if !(min > 0.0) || max < min || initial < min || initial > max {
            return Err(Error::ErrInvalidArgument("emit rates"));
        }
        self.emit_rate_initial = initial;
        self.emit_rate_min = min;
        self.emit_rate_max = max;
        Ok(self)
    }

    pub fn with_parity_cache_chunks(mut self, value: usize) -> Result<Self> {
        self.parity_cache_chunks = value;
        Ok(self)
    }

    pub fn with_idle_deadline(mut self, value: Duration) -> Result<Self> {
        if value.is_zero() {
            return Err(Error::ErrInvalidArgument("idle_deadline"));
        }
        self.idle_deadline = value;
        Ok(self)
    }

    /// Cross-field validation run when the config is put to use.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_window < self.initial_window {
            return Err(Error::ErrInvalidArgument("max_window < initial_window"));
        }
        Ok(())
    }

    pub(crate) fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub(crate) fn fec_k(&self) -> u8 {
        self.fec_k
    }

    pub(crate) fn fec_r(&self) -> u8 {
        self.fec_r
    }

    pub(crate) fn digest_kind(&self) -> DigestKind {
        self.digest_kind
    }

    pub(crate) fn manifest_interval(&self) -> Duration {
        self.manifest_interval
    }

    pub(crate) fn initial_window(&self) -> u32 {
        self.initial_window
    }

    pub(crate) fn max_window(&self) -> u32 {
        self.max_window
    }

    pub(crate) fn retry_initial(&self) -> Duration {
        self.retry_initial
    }

    pub(crate) fn retry_max(&self) -> Duration {
        self.retry_max
    }

    pub(crate) fn emit_rate_initial(&self) -> f64 {
        self.emit_rate_initial
    }

    pub(crate) fn emit_rate_min(&self) -> f64 {
        self.emit_rate_min
    }

    pub(crate) fn emit_rate_max(&self) -> f64 {
        self.emit_rate_max
    }

    pub(crate) fn parity_cache_chunks(&self) -> usize {
        self.parity_cache_chunks
    }

    pub(crate) fn idle_deadline(&self) -> Duration {
        self.idle_deadline
    }
}

/// Collects the arguments to `Endpoint` construction into a single structure.
pub struct EndpointConfig {
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub name: String,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("name", &self.name)
            .field("conn", &"[ elided ]")
            .finish()
    }
}
