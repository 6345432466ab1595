//! Reliable point-to-point delivery layer for a group-communication stack.
//!
//! This crate sits between an unreliable unicast transport below (messages may
//! be dropped, reordered or duplicated) and the application-facing layers
//! above, and turns that service into an in-order, exactly-once, gap-free
//! stream of messages between every pair of endpoints.
//!
//! ## Design
//!
//! * **No explicit connection setup.** A sender tags every DATA message with a
//!   locally allocated 16-bit connection id and flags the message carrying the
//!   first seqno. The receiver creates its window state from that first
//!   message; a changed conn-id signals a sender restart and resets the
//!   window. A receiver that missed the start of a stream asks for it with a
//!   SEND_FIRST_SEQNO probe instead of locking onto a mid-stream offset.
//! * **Mixed positive/negative acknowledgement.** Cumulative ACKs are emitted
//!   lazily by a periodic sweep (with immediate ACKs on the connection
//!   handshake and after batch drains), while gaps detected at the receiver
//!   are closed by explicit XMIT_REQ retransmit requests. The sweep waits one
//!   interval before NAK'ing a gap, giving plain reordering a chance to
//!   resolve itself, and probes stalled send windows by resending the highest
//!   sent message.
//! * **Segmented retransmission tables.** Both sides buffer messages in a
//!   matrix-backed, seqno-indexed window with amortized O(1) insert, purge and
//!   lookup, lazy row allocation, append-only resize and online compaction of
//!   purged head rows.
//! * **Per-sender delivery serialization.** Each receive window carries a
//!   single-consumer "processing" latch. The thread that wins the latch drains
//!   the window batch-by-batch and hands the batches up; the latch is released
//!   atomically with the empty pull that ends the drain. Distinct senders are
//!   delivered in parallel; messages of one sender stay FIFO. Out-of-band
//!   messages skip the queue (delivered immediately, exactly once).
//!
//! The layer talks to its neighbours through two narrow seams: [`Transport`]
//! below and [`MessageDispatcher`] above. Membership and local identity are
//! pushed in via [`ReliableUnicast::view_change`] and
//! [`ReliableUnicast::set_local_address`].

mod age_out_cache;
mod atomic_map;
mod entries;

pub mod config;
pub mod dispatcher;
pub mod headers;
pub mod layer;
pub mod message;
pub mod seqno;
pub mod seqno_list;
pub mod stats;
pub mod transport;
pub mod window;

pub use config::UnicastConfig;
pub use dispatcher::MessageDispatcher;
pub use headers::{ConnId, UnicastHeader};
pub use layer::ReliableUnicast;
pub use message::{DataMessage, MsgFlags};
pub use seqno::{Seqno, FIRST_SEQNO};
pub use seqno_list::SeqnoList;
pub use stats::StatsSnapshot;
pub use transport::Transport;
pub use window::{Window, WindowMetrics};
