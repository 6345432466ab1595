use bytes::{Bytes, BytesMut};

use crate::headers::{ConnId, UnicastHeader};
use crate::seqno::Seqno;

/// Flags carried next to a message by the enclosing stack's envelope. They are
/// not part of the unicast header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgFlags {
    /// Out-of-band: may be delivered ahead of its predecessors, exactly once.
    pub oob: bool,
    /// Bypass the reliability layer entirely.
    pub no_reliability: bool,
}

impl MsgFlags {
    pub const OOB: MsgFlags = MsgFlags { oob: true, no_reliability: false };
    pub const NO_RELIABILITY: MsgFlags = MsgFlags { oob: false, no_reliability: true };
}

/// A DATA message as stored in a retransmission window: the stamped header
/// fields plus the application payload.
///
/// Cloning is cheap (`Bytes` is reference counted), so a retransmit never
/// copies payload bytes, and re-stamping `first` for a replay builds a fresh
/// header without touching the stored original.
#[derive(Clone, Debug, PartialEq)]
pub struct DataMessage {
    pub seqno: Seqno,
    pub conn_id: ConnId,
    pub first: bool,
    pub oob: bool,
    pub payload: Bytes,
}

impl DataMessage {
    pub fn header(&self) -> UnicastHeader {
        UnicastHeader::Data {
            seqno: self.seqno,
            conn_id: self.conn_id,
            first: self.first,
        }
    }

    pub fn flags(&self) -> MsgFlags {
        MsgFlags {
            oob: self.oob,
            no_reliability: false,
        }
    }

    /// Serializes header plus payload into a single wire frame.
    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header().serialized_len() + self.payload.len());
        self.header().ser(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// A copy of this message with the `first` flag forced, for replaying the
    /// start of a connection. The stored original stays untouched in the
    /// retransmit buffer.
    pub fn restamped_as_first(&self) -> DataMessage {
        DataMessage {
            first: true,
            ..self.clone()
        }
    }
}
