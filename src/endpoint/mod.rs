
mod endpoint_internal;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use util::Conn;

use crate::config::{EndpointConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::exposure_id::ExposureId;
use crate::packet::PACKET_HEADER_SIZE;
use crate::reception::ReceptionState;
use crate::stats::{
    EndpointCounters, EndpointStats, ExposureStats, ReceptionCounters, ReceptionStats,
    SurfaceCounters,
};
use endpoint_internal::EndpointInternal;

/// Largest datagram the driver will receive: the common header plus a
/// maximum-size chunk.
pub(crate) const RECEIVE_MTU: usize = PACKET_HEADER_SIZE + 65536;

/// Idle sleep when no timer is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Endpoint owns one datagram conn and drives every Surface and Reception
/// registered on it from a single cooperative loop: receive with a
/// timer-derived timeout, dispatch, service timers, emit what the pacers
/// allow.
///
/// Multiple endpoints run independent drivers and share no state.
pub struct Endpoint {
    name: String,
    conn: Arc<dyn Conn + Send + Sync>,
    internal: Arc<Mutex<EndpointInternal>>,
    counters: Arc<EndpointCounters>,
    awake_tx: Arc<mpsc::Sender<()>>,
    close_tx: broadcast::Sender<()>,
}

impl Endpoint {
    /// Starts the driver task for `config.conn`.
    pub fn new(config: EndpointConfig) -> Self {
        let counters = Arc::new(EndpointCounters::default());
        let internal = Arc::new(Mutex::new(EndpointInternal::new(
            config.name.clone(),
            Arc::clone(&counters),
        )));
        let (awake_tx, awake_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = broadcast::channel(1);

        let endpoint = Endpoint {
            name: config.name,
            conn: config.conn,
            internal: Arc::clone(&internal),
            counters: Arc::clone(&counters),
            awake_tx: Arc::new(awake_tx),
            close_tx,
        };

        let name = endpoint.name.clone();
        let conn = Arc::clone(&endpoint.conn);
        tokio::spawn(async move {
            Endpoint::run_loop(name, conn, internal, counters, awake_rx, close_rx).await;
        });

        endpoint
    }

    /// Exposes `object` on this endpoint. Manifests are re-emitted to
    /// `manifest_addr` until the exposure is released; pull requests are
    /// answered from any peer.
    pub async fn expose(
        &self,
        object: Bytes,
        manifest_addr: SocketAddr,
        config: TransportConfig,
    ) -> Result<ExposureHandle> {
        let (exposure_id, stats) = {
            let mut internal = self.internal.lock().await;
            internal.expose(object, manifest_addr, &config, Instant::now())?
        };
        self.awake();
        Ok(ExposureHandle {
            exposure_id,
            stats,
            internal: Arc::clone(&self.internal),
            awake_tx: Arc::clone(&self.awake_tx),
        })
    }

    /// Starts pulling an exposure from `peer`. With `exposure_id` absent the
    /// reception adopts the next exposure discovered at that address.
    pub async fn pull(
        &self,
        exposure_id: Option<ExposureId>,
        peer: SocketAddr,
        config: TransportConfig,
    ) -> Result<ReceptionHandle> {
        let (completed_tx, completed_rx) = mpsc::channel(1);
        let (key, state, stats) = {
            let mut internal = self.internal.lock().await;
            internal.pull(exposure_id, peer, &config, completed_tx, Instant::now())?
        };
        self.awake();
        Ok(ReceptionHandle {
            key,
            state,
            stats,
            internal: Arc::clone(&self.internal),
            awake_tx: Arc::clone(&self.awake_tx),
            completed_rx: Mutex::new(completed_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.conn
            .local_addr()
            .map_err(|e| Error::Other(e.to_string()))
    }

    /// Counters only; never mutates state.
    pub fn snapshot_stats(&self) -> EndpointStats {
        self.counters.snapshot()
    }

    /// Stops the driver, fails outstanding receptions, and closes the conn.
    pub async fn close(&self) -> Result<()> {
        log::debug!("[{}] closing endpoint..", self.name);
        let _ = self.close_tx.send(());
        {
            let mut internal = self.internal.lock().await;
            internal.shutdown();
        }
        let _ = self.conn.close().await;
        Ok(())
    }

    fn awake(&self) {
        let _ = self.awake_tx.try_send(());
    }

    async fn run_loop(
        name: String,
        conn: Arc<dyn Conn + Send + Sync>,
        internal: Arc<Mutex<EndpointInternal>>,
        counters: Arc<EndpointCounters>,
        mut awake_rx: mpsc::Receiver<()>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            let (transmits, next_timeout) = {
                let mut internal = internal.lock().await;
                let now = Instant::now();
                let transmits = internal.poll(now);
                (transmits, internal.next_timeout(now))
            };

            for (peer, raw) in transmits {
                match conn.send_to(&raw, peer).await {
                    Ok(n) => {
                        counters.packets_sent.fetch_add(1, Ordering::SeqCst);
                        counters.bytes_sent.fetch_add(n as u64, Ordering::SeqCst);
                    }
                    Err(err) => {
                        log::warn!("[{}] send_to {} failed: {}", name, peer, err);
                    }
                }
            }

            let deadline = next_timeout.unwrap_or_else(|| Instant::now() + IDLE_TICK);
            tokio::select! {
                _ = close_rx.recv() => {
                    break;
                }
                _ = awake_rx.recv() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                result = conn.recv_from(&mut buf) => {
                    match result {
                        Ok((n, peer)) => {
                            counters.packets_received.fetch_add(1, Ordering::SeqCst);
                            counters.bytes_received.fetch_add(n as u64, Ordering::SeqCst);
                            let raw = Bytes::copy_from_slice(&buf[..n]);
                            let mut internal = internal.lock().await;
                            internal.handle_inbound(raw, peer, Instant::now());
                        }
                        Err(err) => {
                            log::warn!("[{}] conn died: {}", name, err);
                            break;
                        }
                    }
                }
            }
        }

        let mut internal = internal.lock().await;
        internal.shutdown();
        log::debug!("[{}] driver stopped", name);
    }
}

/// Sender-side handle to an exposure: its id, a read-only view of its
/// counters, and release.
pub struct ExposureHandle {
    exposure_id: ExposureId,
    stats: Arc<SurfaceCounters>,
    internal: Arc<Mutex<EndpointInternal>>,
    awake_tx: Arc<mpsc::Sender<()>>,
}

impl ExposureHandle {
    pub fn exposure_id(&self) -> ExposureId {
        self.exposure_id
    }

    /// Counters only; never mutates state.
    pub fn snapshot_stats(&self) -> ExposureStats {
        self.stats.snapshot()
    }

    /// Stops manifest emission and responses; in-flight emissions already
    /// handed to the OS may still go out.
    pub async fn release(&self) {
        {
            let mut internal = self.internal.lock().await;
            internal.release(self.exposure_id);
        }
        let _ = self.awake_tx.try_send(());
    }
}

/// Receiver-side handle to a reception.
pub struct ReceptionHandle {
    key: u64,
    state: Arc<AtomicU8>,
    stats: Arc<ReceptionCounters>,
    internal: Arc<Mutex<EndpointInternal>>,
    awake_tx: Arc<mpsc::Sender<()>>,
    completed_rx: Mutex<mpsc::Receiver<Result<Bytes>>>,
}

impl ReceptionHandle {
    pub fn state(&self) -> ReceptionState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// The exposure id, once known (immediately when `pull` named one,
    /// after discovery otherwise).
    pub async fn exposure_id(&self) -> Option<ExposureId> {
        let internal = self.internal.lock().await;
        internal.reception_exposure_id(self.key)
    }

    /// Waits for the terminal transition and returns the reconstructed
    /// object, byte-equal to the sender's.
    pub async fn wait_complete(&self) -> Result<Bytes> {
        let mut completed_rx = self.completed_rx.lock().await;
        match completed_rx.recv().await {
            Some(result) => result,
            None => Err(Error::ErrEndpointClosed),
        }
    }

    /// Counters only; never mutates state.
    pub fn snapshot_stats(&self) -> ReceptionStats {
        self.stats.snapshot()
    }

    /// Immediate cancellation: the buffer is released on the next driver
    /// iteration and no further requests are emitted.
    pub async fn cancel(&self) {
        {
            let mut internal = self.internal.lock().await;
            internal.cancel(self.key);
        }
        let _ = self.awake_tx.try_send(());
    }
}
