use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;

/// Upcall seam to the layer above.
///
/// `on_batch` receives messages from one sender in seqno order with no gaps
/// and no duplicates. `on_message` delivers a single out-of-band message ahead
/// of its predecessors; such a message never appears in a later batch.
///
/// Errors are logged by the unicast layer and do not stop delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, from: SocketAddr, payload: Bytes) -> anyhow::Result<()>;

    async fn on_batch(&self, from: SocketAddr, batch: Vec<Bytes>) -> anyhow::Result<()>;
}
