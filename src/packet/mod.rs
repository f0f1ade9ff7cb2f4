
pub(crate) mod manifest;
pub(crate) mod packet_type;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::digest::{payload_digest, DigestKind};
use crate::error::{Error, Result};
use crate::exposure_id::ExposureId;
use manifest::Manifest;
use packet_type::*;

/// Packet represents one ETP datagram: the fixed common header plus an
/// optional payload.
///
///ETP Common Header Format
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|    Version    |     Type      |            Flags              |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                                                               |
///|                         Exposure Id                           |
///|                          (16 bytes)                           |
///|                                                               |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           Chunk Id                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                         Payload Size                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                         Total Chunks                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                       Payload Checksum                        |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                                                               |
///|                            Payload                            |
///|                                                               |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// All multi-byte fields are network byte order. `chunk_id` is meaningful for
/// CHUNK_DATA and PULL_REQUEST and zero otherwise; `total_chunks` is set by
/// the sender on MANIFEST and zero otherwise. The payload checksum MUST be
/// zero for packets without payload.
#[derive(Debug, Clone)]
pub(crate) struct Packet {
    pub(crate) typ: PacketType,
    pub(crate) flags: u16,
    pub(crate) exposure_id: ExposureId,
    pub(crate) chunk_id: u32,
    pub(crate) total_chunks: u32,
    pub(crate) payload_checksum: u32,
    pub(crate) payload: Bytes,
}

pub(crate) const PACKET_HEADER_SIZE: usize = 36;
pub(crate) const PROTOCOL_VERSION: u8 = 1;

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet {} exposure_id: {} chunk_id: {} payload: {} bytes",
            self.typ,
            self.exposure_id,
            self.chunk_id,
            self.payload.len(),
        )
    }
}

impl Packet {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrMalformedPacket);
        }

        let reader = &mut raw.clone();

        let version = reader.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::ErrMalformedPacket);
        }

        let typ = PacketType(reader.get_u8());
        let flags = reader.get_u16();

        let mut id = [0u8; 16];
        reader.copy_to_slice(&mut id);
        let exposure_id = ExposureId::from_bytes(id);

        let chunk_id = reader.get_u32();
        let payload_size = reader.get_u32();
        let total_chunks = reader.get_u32();
        let payload_checksum = reader.get_u32();

        if payload_size as usize != raw.len() - PACKET_HEADER_SIZE {
            return Err(Error::ErrMalformedPacket);
        }

        Ok(Packet {
            typ,
            flags,
            exposure_id,
            chunk_id,
            total_chunks,
            payload_checksum,
            payload: raw.slice(PACKET_HEADER_SIZE..),
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        writer.put_u8(PROTOCOL_VERSION);
        writer.put_u8(self.typ.0);
        writer.put_u16(self.flags);
        writer.put_slice(self.exposure_id.as_bytes());
        writer.put_u32(self.chunk_id);
        writer.put_u32(self.payload.len() as u32);
        writer.put_u32(self.total_chunks);
        writer.put_u32(self.payload_checksum);
        writer.put_slice(&self.payload);
        Ok(writer.len())
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Verifies the payload checksum under the given digest kind.
    pub(crate) fn verify_payload(&self, kind: DigestKind) -> Result<()> {
        if payload_digest(kind, &self.payload) != self.payload_checksum {
            return Err(Error::ErrChecksumMismatch);
        }
        Ok(())
    }

    pub(crate) fn manifest(exposure_id: ExposureId, m: &Manifest, total_chunks: u32) -> Self {
        let payload = m.marshal();
        // Manifests are the negotiation bootstrap and always digest additively.
        let payload_checksum = payload_digest(DigestKind::Additive, &payload);
        Packet {
            typ: PT_MANIFEST,
            flags: 0,
            exposure_id,
            chunk_id: 0,
            total_chunks,
            payload_checksum,
            payload,
        }
    }

    pub(crate) fn pull_request(exposure_id: ExposureId, chunk_id: u32) -> Self {
        Packet {
            typ: PT_PULL_REQUEST,
            flags: 0,
            exposure_id,
            chunk_id,
            total_chunks: 0,
            payload_checksum: 0,
            payload: Bytes::new(),
        }
    }

    pub(crate) fn chunk_data(
        exposure_id: ExposureId,
        chunk_id: u32,
        payload: Bytes,
        kind: DigestKind,
    ) -> Self {
        let payload_checksum = payload_digest(kind, &payload);
        Packet {
            typ: PT_CHUNK_DATA,
            flags: 0,
            exposure_id,
            chunk_id,
            total_chunks: 0,
            payload_checksum,
            payload,
        }
    }

    pub(crate) fn exposure_complete(exposure_id: ExposureId) -> Self {
        Packet {
            typ: PT_EXPOSURE_COMPLETE,
            flags: 0,
            exposure_id,
            chunk_id: 0,
            total_chunks: 0,
            payload_checksum: 0,
            payload: Bytes::new(),
        }
    }
}
