use std::fmt;

/// PacketType is the Type field of the common ETP header.
/// It identifies what the datagram carries and how the payload is laid out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) struct PacketType(pub(crate) u8);

pub(crate) const PT_MANIFEST: PacketType = PacketType(1);
pub(crate) const PT_PULL_REQUEST: PacketType = PacketType(2);
pub(crate) const PT_CHUNK_DATA: PacketType = PacketType(3);
pub(crate) const PT_EXPOSURE_COMPLETE: PacketType = PacketType(4);
/// Reserved control/ping type; dropped on receipt.
pub(crate) const PT_PING: PacketType = PacketType(5);

impl PacketType {
    pub(crate) fn is_known(&self) -> bool {
        matches!(
            *self,
            PT_MANIFEST | PT_PULL_REQUEST | PT_CHUNK_DATA | PT_EXPOSURE_COMPLETE | PT_PING
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("Unknown PacketType: {}", self.0);
        let s = match *self {
            PT_MANIFEST => "MANIFEST",
            PT_PULL_REQUEST => "PULL-REQUEST",
            PT_CHUNK_DATA => "CHUNK-DATA",
            PT_EXPOSURE_COMPLETE => "EXPOSURE-COMPLETE",
            PT_PING => "PING",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}
