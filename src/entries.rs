use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::config::UnicastConfig;
use crate::headers::ConnId;
use crate::message::DataMessage;
use crate::seqno::{Seqno, FIRST_SEQNO};
use crate::window::Window;

/// Milliseconds on a process-wide monotonic clock, used for connection age
/// tracking and age-out deadlines.
pub(crate) fn uptime_millis() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Per-destination sender state: the outbox window of unacked messages, the
/// connection incarnation this process speaks with, and the seqno counter.
pub struct SenderEntry {
    pub sent_msgs: Window<DataMessage>,
    pub send_conn_id: ConnId,
    next_seqno: AtomicU64,
    /// `(highest_acked, highest_sent)` as of the last retransmit sweep; used
    /// by the stall probe.
    watermark: Mutex<(Seqno, Seqno)>,
    timestamp: AtomicU64,
}

impl SenderEntry {
    pub fn new(send_conn_id: ConnId, config: &UnicastConfig) -> SenderEntry {
        SenderEntry {
            sent_msgs: Window::new(
                config.xmit_table_num_rows,
                config.xmit_table_msgs_per_row,
                Seqno::ZERO,
                config.xmit_table_resize_factor,
                config.xmit_table_max_compaction_time,
            ),
            send_conn_id,
            next_seqno: AtomicU64::new(FIRST_SEQNO.to_raw()),
            watermark: Mutex::new((Seqno::ZERO, Seqno::ZERO)),
            timestamp: AtomicU64::new(uptime_millis()),
        }
    }

    /// Allocates the next seqno for this connection.
    pub fn next_seqno(&self) -> Seqno {
        Seqno::from_raw(self.next_seqno.fetch_add(1, Ordering::Relaxed))
    }

    pub fn update(&self) {
        self.timestamp.store(uptime_millis(), Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(uptime_millis().saturating_sub(self.timestamp.load(Ordering::Relaxed)))
    }

    pub fn watermark(&self) -> (Seqno, Seqno) {
        *self.watermark.lock().unwrap()
    }

    pub fn set_watermark(&self, highest_acked: Seqno, highest_sent: Seqno) {
        *self.watermark.lock().unwrap() = (highest_acked, highest_sent);
    }
}

impl Display for SenderEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, send_conn_id={} ({} ms old)",
            self.sent_msgs,
            self.send_conn_id,
            self.age().as_millis()
        )
    }
}

/// Per-source receiver state: the inbox window, the sender incarnation it was
/// created for, and the delayed-ACK flag consumed by the retransmit sweep.
pub struct ReceiverEntry {
    pub received_msgs: Window<DataMessage>,
    pub recv_conn_id: ConnId,
    send_ack: AtomicBool,
    timestamp: AtomicU64,
}

impl ReceiverEntry {
    /// `offset` is the seqno just below the first expected message, i.e.
    /// `first_seqno - 1`.
    pub fn new(recv_conn_id: ConnId, offset: Seqno, config: &UnicastConfig) -> ReceiverEntry {
        ReceiverEntry {
            received_msgs: Window::new(
                config.xmit_table_num_rows,
                config.xmit_table_msgs_per_row,
                offset,
                config.xmit_table_resize_factor,
                config.xmit_table_max_compaction_time,
            ),
            recv_conn_id,
            send_ack: AtomicBool::new(false),
            timestamp: AtomicU64::new(uptime_millis()),
        }
    }

    /// Arms the delayed-ACK flag; the next retransmit sweep will emit the ACK.
    pub fn arm_ack(&self) {
        self.send_ack.store(true, Ordering::Relaxed);
    }

    /// Consumes the delayed-ACK flag.
    pub fn take_ack(&self) -> bool {
        self.send_ack.swap(false, Ordering::Relaxed)
    }

    pub fn update(&self) {
        self.timestamp.store(uptime_millis(), Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(uptime_millis().saturating_sub(self.timestamp.load(Ordering::Relaxed)))
    }
}

impl Display for ReceiverEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, recv_conn_id={} ({} ms old)",
            self.received_msgs,
            self.recv_conn_id,
            self.age().as_millis()
        )?;
        if self.send_ack.load(Ordering::Relaxed) {
            write!(f, " [ack pending]")?;
        }
        Ok(())
    }
}
