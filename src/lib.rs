//! Exposure Transport Protocol (ETP) support for Tokio
//!
//! ETP is a connectionless Layer-4 transport for finite data objects. A
//! sender *exposes* an object on a datagram endpoint, splitting it into
//! fixed-size chunks grouped into Reed-Solomon FEC blocks and periodically
//! re-broadcasting a manifest; any number of independent receivers *pull*
//! chunks by id with stateless request/response datagrams, reconstructing
//! the object once every block reaches its decode threshold. There is no
//! handshake and no per-receiver state on the sender: a receiver that keeps
//! pulling eventually reconstructs, whatever the packet loss.
//!
//! The crate provides the wire codec, the chunk/FEC codec, the sender-side
//! Surface and receiver-side Reception state machines, the adaptive pacers
//! coupling them, and the endpoint driver that runs all of it over one
//! `Conn`-backed datagram socket.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

mod config;
mod digest;
mod endpoint;
mod error;
mod exposure_id;
mod fec;
mod packet;
mod pacer;
mod reception;
mod stats;
mod surface;
mod util;

pub use crate::config::{EndpointConfig, TransportConfig};
pub use crate::digest::DigestKind;
pub use crate::endpoint::{Endpoint, ExposureHandle, ReceptionHandle};
pub use crate::error::{Error, Result};
pub use crate::exposure_id::{generate_exposure_id, ExposureId, ExposureIdGenerator, MonotonicIdGenerator};
pub use crate::reception::ReceptionState;
pub use crate::stats::{EndpointStats, ExposureStats, ReceptionStats};
