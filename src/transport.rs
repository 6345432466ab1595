use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;

use crate::message::MsgFlags;

/// Downcall seam to the layer below: hands a serialized frame (unicast header
/// plus payload) to the unreliable transport, together with the envelope
/// flags of the enclosing stack.
///
/// Sends are fire-and-forget from the layer's point of view; a transport
/// failure leaves the message in the send window, where the retransmit sweep
/// picks it up.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn do_send(&self, to: SocketAddr, flags: MsgFlags, frame: Bytes);
}
