use std::fmt;

use crc::{Crc, CRC_32_ISCSI};

pub(crate) const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Per-chunk payload digest algorithm.
///
/// The sender picks a kind at expose time and advertises it in the manifest;
/// receivers verify every CHUNK_DATA payload with the advertised kind.
/// Manifest payloads are always digested additively so that discovery needs
/// no prior state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DigestKind {
    /// Additive 32-bit checksum, the protocol minimum.
    #[default]
    Additive,
    /// CRC-32C (iSCSI polynomial).
    Crc32c,
}

impl DigestKind {
    pub(crate) fn from_u8(v: u8) -> Option<DigestKind> {
        match v {
            0 => Some(DigestKind::Additive),
            1 => Some(DigestKind::Crc32c),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DigestKind::Additive => 0,
            DigestKind::Crc32c => 1,
        }
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DigestKind::Additive => "additive",
            DigestKind::Crc32c => "crc32c",
        };
        write!(f, "{s}")
    }
}

/// Digests a payload with the given kind. Zero-length payloads digest to 0
/// under both kinds, matching the wire rule that packets without payload
/// carry a zero checksum.
pub(crate) fn payload_digest(kind: DigestKind, data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    match kind {
        DigestKind::Additive => data
            .iter()
            .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b))),
        DigestKind::Crc32c => {
            let mut digest = ISCSI_CRC.digest();
            digest.update(data);
            digest.finalize()
        }
    }
}
