use anyhow::bail;
use std::time::Duration;

/// Tuning knobs of the unicast layer.
///
/// The defaults are sized for a LAN-grade transport below: large windows so
/// the segmented tables rarely resize, a retransmit sweep at 500ms, and
/// connection reaping disabled (group membership usually tears connections
/// down first).
#[derive(Clone, Debug)]
pub struct UnicastConfig {
    /// Maximum number of messages drained from a receive window per delivery
    /// iteration. Must be at least 1.
    pub max_msg_batch_size: usize,

    /// Idle time after which an incoming or outgoing connection is reaped.
    /// The connection is re-established transparently when used again.
    /// `None` disables connection reaping.
    pub conn_expiry_timeout: Option<Duration>,

    /// Initial number of rows of each window matrix.
    pub xmit_table_num_rows: usize,

    /// Slots per row of each window matrix. The initial capacity of a window
    /// is `xmit_table_num_rows * xmit_table_msgs_per_row` messages.
    pub xmit_table_msgs_per_row: usize,

    /// Row-count growth factor when a window runs out of capacity.
    pub xmit_table_resize_factor: f64,

    /// A window matrix is compacted on purge at the latest after this much
    /// time has elapsed since its last compaction.
    pub xmit_table_max_compaction_time: Duration,

    /// Period of the retransmit sweep, which emits delayed ACKs, requests
    /// retransmission of missing messages and probes stalled send windows.
    pub xmit_interval: Duration,

    /// Whether to log retransmit requests for seqnos that are no longer in
    /// the send window (they may have been acked and purged legitimately).
    pub log_not_found_msgs: bool,

    /// Acknowledge a drained batch synchronously instead of arming the
    /// delayed-ACK flag for the next retransmit sweep.
    pub ack_batches_immediately: bool,

    /// How long to keep retrying delivery to a destination that is not a
    /// group member before tearing the connection down. `None` disables the
    /// age-out cache.
    pub max_retransmit_time: Option<Duration>,
}

impl Default for UnicastConfig {
    fn default() -> UnicastConfig {
        UnicastConfig {
            max_msg_batch_size: 500,
            conn_expiry_timeout: None,
            xmit_table_num_rows: 100,
            xmit_table_msgs_per_row: 1000,
            xmit_table_resize_factor: 1.2,
            xmit_table_max_compaction_time: Duration::from_secs(10 * 60),
            xmit_interval: Duration::from_millis(500),
            log_not_found_msgs: true,
            ack_batches_immediately: true,
            max_retransmit_time: Some(Duration::from_secs(60)),
        }
    }
}

impl UnicastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_msg_batch_size < 1 {
            bail!("max_msg_batch_size must be at least 1");
        }
        if self.xmit_table_num_rows == 0 || self.xmit_table_msgs_per_row == 0 {
            bail!("window matrix dimensions must be non-zero");
        }
        if self.xmit_table_resize_factor < 1.0 {
            bail!(
                "xmit_table_resize_factor must be at least 1.0, was {}",
                self.xmit_table_resize_factor
            );
        }
        if self.xmit_interval.is_zero() {
            bail!("xmit_interval must be non-zero");
        }
        if let Some(timeout) = self.conn_expiry_timeout {
            if timeout.is_zero() {
                bail!("conn_expiry_timeout must be non-zero when enabled");
            }
        }
        Ok(())
    }
}
