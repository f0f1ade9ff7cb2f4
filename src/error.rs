use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds surfaced by the protocol core.
///
/// Per-packet failures (malformed datagrams, checksum mismatches, requests
/// for unknown exposures) are counted and dropped inside the endpoint driver
/// and never reach the caller; the remaining kinds are delivered through the
/// exposure and reception handles.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    ErrInvalidArgument(&'static str),
    #[error("object exceeds the addressable chunk-id space")]
    ErrObjectTooLarge,
    #[error("datagram failed wire-format decoding")]
    ErrMalformedPacket,
    #[error("payload digest mismatch")]
    ErrChecksumMismatch,
    #[error("no exposure held under this id")]
    ErrUnknownExposure,
    #[error("manifest contradicts parameters previously seen under this id")]
    ErrInconsistentManifest,
    #[error("peer produced no valid chunk within the idle deadline")]
    ErrPeerUnresponsive,
    #[error("fewer than K valid chunks available for a block")]
    ErrFecDecodeFailed,
    #[error("buffer or cache allocation failed")]
    ErrResourceExhausted,
    #[error("cancelled by caller")]
    ErrCancelled,
    #[error("endpoint closed")]
    ErrEndpointClosed,

    #[error("{0}")]
    Other(String),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrInvalidArgument(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            e @ Error::ErrCancelled => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
            e @ Error::ErrEndpointClosed => {
                io::Error::new(io::ErrorKind::NotConnected, e.to_string())
            }
            e @ Error::ErrPeerUnresponsive => {
                io::Error::new(io::ErrorKind::TimedOut, e.to_string())
            }
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
