use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::fmt::{Display, Formatter};

use crate::seqno::Seqno;

/// Sender incarnation tag, allocated per process by the conn-id allocator.
/// A change observed by a receiver means the sender restarted.
pub type ConnId = u16;

const TYPE_DATA: u8 = 0;
const TYPE_ACK: u8 = 1;
const TYPE_SEND_FIRST_SEQNO: u8 = 2;
const TYPE_XMIT_REQ: u8 = 3;

/// The per-message control header of the unicast layer.
///
/// Wire layout: one type byte, then a type-specific body (big-endian):
///
/// ```ascii
/// DATA             | seqno (varlong) | conn_id (u16) | first (u8, 0/1) |
/// ACK              | seqno (varlong) | conn_id (u16) |
/// SEND_FIRST_SEQNO | seqno (varlong) |
/// XMIT_REQ         | (empty - the missing-seqno list is the message payload)
/// ```
///
/// `varlong` is the compact long encoding shared by the whole stack: a length
/// byte holding the number of significant bytes (0-8), followed by exactly
/// that many bytes, most significant first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnicastHeader {
    Data {
        seqno: Seqno,
        conn_id: ConnId,
        first: bool,
    },
    Ack {
        seqno: Seqno,
        conn_id: ConnId,
    },
    SendFirstSeqno {
        seqno: Seqno,
    },
    XmitReq,
}

impl UnicastHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        match *self {
            UnicastHeader::Data { seqno, conn_id, first } => {
                buf.put_u8(TYPE_DATA);
                put_varlong(buf, seqno.to_raw());
                buf.put_u16(conn_id);
                buf.put_u8(first as u8);
            }
            UnicastHeader::Ack { seqno, conn_id } => {
                buf.put_u8(TYPE_ACK);
                put_varlong(buf, seqno.to_raw());
                buf.put_u16(conn_id);
            }
            UnicastHeader::SendFirstSeqno { seqno } => {
                buf.put_u8(TYPE_SEND_FIRST_SEQNO);
                put_varlong(buf, seqno.to_raw());
            }
            UnicastHeader::XmitReq => {
                buf.put_u8(TYPE_XMIT_REQ);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<UnicastHeader> {
        let header_type = buf.try_get_u8()?;
        match header_type {
            TYPE_DATA => {
                let seqno = Seqno::from_raw(get_varlong(buf)?);
                let conn_id = buf.try_get_u16()?;
                let first = buf.try_get_u8()? != 0;
                Ok(UnicastHeader::Data { seqno, conn_id, first })
            }
            TYPE_ACK => {
                let seqno = Seqno::from_raw(get_varlong(buf)?);
                let conn_id = buf.try_get_u16()?;
                Ok(UnicastHeader::Ack { seqno, conn_id })
            }
            TYPE_SEND_FIRST_SEQNO => {
                let seqno = Seqno::from_raw(get_varlong(buf)?);
                Ok(UnicastHeader::SendFirstSeqno { seqno })
            }
            TYPE_XMIT_REQ => Ok(UnicastHeader::XmitReq),
            t => bail!("unknown unicast header type {}", t),
        }
    }

    pub fn serialized_len(&self) -> usize {
        match *self {
            UnicastHeader::Data { seqno, .. } => 1 + varlong_len(seqno.to_raw()) + 2 + 1,
            UnicastHeader::Ack { seqno, .. } => 1 + varlong_len(seqno.to_raw()) + 2,
            UnicastHeader::SendFirstSeqno { seqno } => 1 + varlong_len(seqno.to_raw()),
            UnicastHeader::XmitReq => 1,
        }
    }
}

impl Display for UnicastHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            UnicastHeader::Data { seqno, conn_id, first } => {
                write!(f, "DATA, seqno={}", seqno)?;
                if conn_id != 0 {
                    write!(f, ", conn_id={}", conn_id)?;
                }
                if first {
                    write!(f, ", first")?;
                }
                Ok(())
            }
            UnicastHeader::Ack { seqno, conn_id } => {
                write!(f, "ACK, seqno={}, conn_id={}", seqno, conn_id)
            }
            UnicastHeader::SendFirstSeqno { seqno } => {
                write!(f, "SEND_FIRST_SEQNO, seqno={}", seqno)
            }
            UnicastHeader::XmitReq => write!(f, "XMIT_REQ"),
        }
    }
}

/// Number of bytes the compact encoding of `value` occupies on the wire,
/// including the length byte.
pub fn varlong_len(value: u64) -> usize {
    1 + significant_bytes(value)
}

pub fn put_varlong(buf: &mut BytesMut, value: u64) {
    let num_bytes = significant_bytes(value);
    buf.put_u8(num_bytes as u8);
    for i in (0..num_bytes).rev() {
        buf.put_u8((value >> (i * 8)) as u8);
    }
}

pub fn get_varlong(buf: &mut impl Buf) -> anyhow::Result<u64> {
    let num_bytes = buf.try_get_u8()? as usize;
    if num_bytes > 8 {
        bail!("invalid varlong length prefix {}", num_bytes);
    }
    if buf.remaining() < num_bytes {
        bail!(
            "truncated varlong: {} bytes announced, {} available",
            num_bytes,
            buf.remaining()
        );
    }
    let mut value = 0u64;
    for _ in 0..num_bytes {
        value = (value << 8) | buf.get_u8() as u64;
    }
    Ok(value)
}

fn significant_bytes(value: u64) -> usize {
    ((64 - value.leading_zeros() as usize) + 7) / 8
}
