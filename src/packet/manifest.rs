use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::digest::DigestKind;
use crate::error::{Error, Result};

pub(crate) const MANIFEST_PAYLOAD_SIZE: usize = 20;

///Manifest is the payload of a MANIFEST packet, periodically re-emitted so
///late receivers can discover an exposure and size their buffers.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Total Size                           |
///|                                                               |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Chunk Size                           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|     FEC K     |     FEC R     |  Digest Kind  |   Reserved    |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                        Content Digest                         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The digest kind selects the algorithm used for CHUNK_DATA payload
/// checksums; the manifest payload itself is always digested additively.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Manifest {
    pub(crate) total_size: u64,
    pub(crate) chunk_size: u32,
    pub(crate) fec_k: u8,
    pub(crate) fec_r: u8,
    pub(crate) digest_kind: DigestKind,
    pub(crate) content_digest: u32,
}

impl Manifest {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < MANIFEST_PAYLOAD_SIZE {
            return Err(Error::ErrMalformedPacket);
        }

        let reader = &mut raw.clone();

        let total_size = reader.get_u64();
        let chunk_size = reader.get_u32();
        let fec_k = reader.get_u8();
        let fec_r = reader.get_u8();
        let digest_kind =
            DigestKind::from_u8(reader.get_u8()).ok_or(Error::ErrMalformedPacket)?;
        let _reserved = reader.get_u8();
        let content_digest = reader.get_u32();

        Ok(Manifest {
            total_size,
            chunk_size,
            fec_k,
            fec_r,
            digest_kind,
            content_digest,
        })
    }

    pub(crate) fn marshal(&self) -> Bytes {
        let mut writer = BytesMut::with_capacity(MANIFEST_PAYLOAD_SIZE);
        writer.put_u64(self.total_size);
        writer.put_u32(self.chunk_size);
        writer.put_u8(self.fec_k);
        writer.put_u8(self.fec_r);
        writer.put_u8(self.digest_kind.to_u8());
        writer.put_u8(0);
        writer.put_u32(self.content_digest);
        writer.freeze()
    }
}
