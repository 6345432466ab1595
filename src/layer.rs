use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::age_out_cache::AgeOutCache;
use crate::atomic_map::AtomicMap;
use crate::config::UnicastConfig;
use crate::dispatcher::MessageDispatcher;
use crate::entries::{uptime_millis, ReceiverEntry, SenderEntry};
use crate::headers::{ConnId, UnicastHeader};
use crate::message::{DataMessage, MsgFlags};
use crate::seqno::{Seqno, FIRST_SEQNO};
use crate::seqno_list::SeqnoList;
use crate::stats::{StatsSnapshot, UnicastStats};
use crate::transport::Transport;

/// Reliable unicast layer: turns the unreliable, reordering, duplicating
/// message service below into an in-order, exactly-once, gap-free stream per
/// sender.
///
/// There is no connection handshake. Each sender tags its DATA with a locally
/// allocated connection id and marks the message with seqno [`FIRST_SEQNO`] as
/// `first`; a receiver seeing an unknown or changed conn-id resets its window
/// state, asking the sender to replay from the start (SEND_FIRST_SEQNO) if the
/// stream's beginning never arrived.
///
/// Acknowledgement is mixed: cumulative ACKs ride on the periodic retransmit
/// sweep (delayed), handshake and batch paths ACK immediately, and gaps are
/// closed by explicit XMIT_REQ retransmit requests from the receiver.
///
/// Delivery is serialized per sender by the receive window's processing latch,
/// so distinct senders are delivered in parallel while each sender's stream
/// stays FIFO.
pub struct ReliableUnicast {
    config: UnicastConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn MessageDispatcher>,

    local_addr: OnceLock<SocketAddr>,
    members: RwLock<Vec<SocketAddr>>,

    send_table: AtomicMap<SocketAddr, Arc<SenderEntry>>,
    recv_table: AtomicMap<SocketAddr, Arc<ReceiverEntry>>,
    /// serializes the create/replace decision for receiver entries; the
    /// lookup fast path never takes it
    recv_table_lock: Mutex<()>,

    last_conn_id: Mutex<ConnId>,
    running: AtomicBool,
    stats: UnicastStats,
    cache: Option<AgeOutCache<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableUnicast {
    pub fn new(
        config: UnicastConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<ReliableUnicast> {
        config.validate()?;

        let cache = config.max_retransmit_time.map(AgeOutCache::new);
        Ok(ReliableUnicast {
            config,
            transport,
            dispatcher,
            local_addr: OnceLock::new(),
            members: RwLock::new(Vec::new()),
            send_table: AtomicMap::new(),
            recv_table: AtomicMap::new(),
            recv_table_lock: Mutex::new(()),
            last_conn_id: Mutex::new(1),
            running: AtomicBool::new(false),
            stats: UnicastStats::default(),
            cache,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the periodic tasks. The retransmit sweep runs every
    /// `xmit_interval` and also polls the age-out cache; the connection reaper
    /// runs every `conn_expiry_timeout` when enabled.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Release);
        let mut tasks = self.tasks.lock().unwrap();

        let layer = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut xmit_task_map: FxHashMap<SocketAddr, Seqno> = FxHashMap::default();
            let mut ticker = interval(layer.config.xmit_interval);
            loop {
                ticker.tick().await;
                if !layer.running.load(Ordering::Acquire) {
                    return;
                }
                layer.trigger_xmit(&mut xmit_task_map).await;
                layer.expire_aged_out();
            }
        }));

        if let Some(expiry) = self.config.conn_expiry_timeout {
            let layer = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(expiry);
                ticker.tick().await; // first tick of an interval fires immediately
                loop {
                    ticker.tick().await;
                    if !layer.running.load(Ordering::Acquire) {
                        return;
                    }
                    layer.reap_idle_connections();
                }
            }));
        }
    }

    /// Stops the periodic tasks and tears down all connections. In-flight
    /// send retries exit on their next check; an in-flight delivery drains
    /// naturally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.send_table.clear();
        self.recv_table.clear();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Supplies the local identity, once; later calls are ignored.
    pub fn set_local_address(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    /// Installs the current member list. Connections to peers that are no
    /// longer members are torn down; members are dropped from the age-out
    /// cache (membership supersedes the deadline).
    pub fn view_change(&self, new_members: Vec<SocketAddr>) {
        let send_snapshot = self.send_table.load();
        let recv_snapshot = self.recv_table.load();
        let mut non_members: Vec<SocketAddr> = send_snapshot
            .keys()
            .chain(recv_snapshot.keys())
            .copied()
            .filter(|addr| !new_members.contains(addr))
            .collect();
        non_members.sort_unstable();
        non_members.dedup();

        if let Some(cache) = &self.cache {
            cache.remove_all(&new_members);
        }
        *self.members.write().unwrap() = new_members;

        if !non_members.is_empty() {
            trace!("{}: removing non members {:?}", self.local(), non_members);
            for addr in &non_members {
                self.remove_connection(addr);
            }
        }
    }

    // ------------------------------------------------------------------
    //  down pipeline
    // ------------------------------------------------------------------

    /// Sends a message to `dst`. The message is stamped with a DATA header,
    /// recorded in the send window for retransmission, and handed to the
    /// transport. Messages flagged NO_RELIABILITY bypass the layer.
    pub async fn send(&self, dst: SocketAddr, flags: MsgFlags, payload: Bytes) {
        if flags.no_reliability {
            self.transport.do_send(dst, flags, payload).await;
            return;
        }
        if !self.is_running() {
            trace!("{}: discarded message to {}, layer is not running", self.local(), dst);
            return;
        }

        let entry = self.get_or_create_sender_entry(dst);
        let seqno = entry.next_seqno();
        let msg = DataMessage {
            seqno,
            conn_id: entry.send_conn_id,
            first: seqno == FIRST_SEQNO,
            oob: flags.oob,
            payload,
        };

        let mut backoff = Duration::from_millis(10);
        while self.is_running() {
            if entry.sent_msgs.add(seqno, msg.clone()) {
                break;
            }
            // transient window contention: back off and try again
            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
        if self.config.conn_expiry_timeout.is_some() {
            entry.update();
        }

        trace!(
            "{} --> DATA({}: {}, conn_id={}{})",
            self.local(),
            dst,
            seqno,
            msg.conn_id,
            if msg.first { ", first" } else { "" }
        );
        UnicastStats::incr(&self.stats.num_msgs_sent);
        self.transport.do_send(dst, msg.flags(), msg.to_frame()).await;
    }

    fn get_or_create_sender_entry(&self, dst: SocketAddr) -> Arc<SenderEntry> {
        if let Some(entry) = self.send_table.get(&dst) {
            return entry;
        }

        let candidate = Arc::new(SenderEntry::new(self.new_conn_id(), &self.config));
        let (entry, created) = self.send_table.insert_if_absent(dst, candidate);
        if created {
            trace!(
                "{}: created sender window for {} (conn-id={})",
                self.local(),
                dst,
                entry.send_conn_id
            );
            if let Some(cache) = &self.cache {
                if !self.members.read().unwrap().contains(&dst) {
                    cache.add(dst, uptime_millis());
                }
            }
        }
        entry
    }

    /// Allocates the next connection id. Wraps to 0 past the signed 16-bit
    /// maximum; 0 is a valid id (a receiver detects restarts by inequality,
    /// not by any distinguished value).
    fn new_conn_id(&self) -> ConnId {
        let mut last = self.last_conn_id.lock().unwrap();
        let conn_id = *last;
        if *last >= i16::MAX as ConnId {
            *last = 0;
        } else {
            *last += 1;
        }
        conn_id
    }

    // ------------------------------------------------------------------
    //  up pipeline
    // ------------------------------------------------------------------

    /// Entry point for a single frame arriving from the transport.
    pub async fn on_frame(&self, from: SocketAddr, flags: MsgFlags, frame: Bytes) {
        if flags.no_reliability {
            if let Err(e) = self.dispatcher.on_message(from, frame).await {
                error!("{}: failed to deliver unreliable message: {:#}", self.local(), e);
            }
            return;
        }

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "unicast_frame", ?correlation_id);
        self.handle_frame(from, flags, frame).instrument(span).await
    }

    async fn handle_frame(&self, from: SocketAddr, flags: MsgFlags, mut frame: Bytes) {
        let header = match UnicastHeader::deser(&mut frame) {
            Ok(header) => header,
            Err(e) => {
                error!("{}: dropping frame from {} with invalid header: {:#}", self.local(), from, e);
                return;
            }
        };

        match header {
            UnicastHeader::Data { seqno, conn_id, first } => {
                self.handle_data_received(from, seqno, conn_id, first, flags.oob, frame)
                    .await
            }
            _ => self.handle_up_event(from, header, frame).await,
        }
    }

    /// Non-DATA control traffic, shared by the single and batch paths.
    async fn handle_up_event(&self, from: SocketAddr, header: UnicastHeader, mut payload: Bytes) {
        match header {
            UnicastHeader::Data { .. } => {
                unreachable!("DATA is handled by the data path, not as a control event")
            }
            UnicastHeader::Ack { seqno, conn_id } => self.handle_ack_received(from, seqno, conn_id),
            UnicastHeader::SendFirstSeqno { seqno } => {
                self.handle_resending_of_first_message(from, seqno).await
            }
            UnicastHeader::XmitReq => match SeqnoList::deser(&mut payload) {
                Ok(missing) => self.handle_xmit_request(from, missing).await,
                Err(e) => {
                    warn!("{}: dropping unparseable XMIT_REQ from {}: {:#}", self.local(), from, e)
                }
            },
        }
    }

    /// Entry point for a batch of frames from one sender, arriving in
    /// transport order. DATA frames are grouped by conn-id (preserving arrival
    /// order within a group) so the receiver entry is resolved once per group.
    pub async fn on_frame_batch(&self, from: SocketAddr, frames: Vec<(MsgFlags, Bytes)>) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "unicast_batch", ?correlation_id);
        self.handle_frame_batch(from, frames).instrument(span).await
    }

    async fn handle_frame_batch(&self, from: SocketAddr, frames: Vec<(MsgFlags, Bytes)>) {
        let mut data_by_conn: BTreeMap<ConnId, Vec<DataMessage>> = BTreeMap::new();

        for (flags, mut frame) in frames {
            if flags.no_reliability {
                if let Err(e) = self.dispatcher.on_message(from, frame).await {
                    error!("{}: failed to deliver unreliable message: {:#}", self.local(), e);
                }
                continue;
            }
            let header = match UnicastHeader::deser(&mut frame) {
                Ok(header) => header,
                Err(e) => {
                    error!("{}: dropping frame from {} with invalid header: {:#}", self.local(), from, e);
                    continue;
                }
            };
            match header {
                UnicastHeader::Data { seqno, conn_id, first } => {
                    data_by_conn.entry(conn_id).or_default().push(DataMessage {
                        seqno,
                        conn_id,
                        first,
                        oob: flags.oob,
                        payload: frame,
                    });
                }
                other => self.handle_up_event(from, other, frame).await,
            }
        }

        if !data_by_conn.is_empty() {
            self.handle_batch_received(from, data_by_conn).await;
        }
    }

    // ------------------------------------------------------------------
    //  DATA reception and delivery pump
    // ------------------------------------------------------------------

    async fn handle_data_received(
        &self,
        sender: SocketAddr,
        seqno: Seqno,
        conn_id: ConnId,
        first: bool,
        oob: bool,
        payload: Bytes,
    ) {
        trace!(
            "{} <-- DATA({}: {}, conn_id={}{})",
            self.local(),
            sender,
            seqno,
            conn_id,
            if first { ", first" } else { "" }
        );

        let Some(entry) = self.get_receiver_entry(sender, seqno, first, conn_id).await else {
            return;
        };
        if self.config.conn_expiry_timeout.is_some() {
            entry.update();
        }

        let msg = DataMessage { seqno, conn_id, first, oob, payload };
        let win = &entry.received_msgs;
        let added = win.add(seqno, msg.clone());
        UnicastStats::incr(&self.stats.num_msgs_received);

        // an OOB message is passed up immediately; the delivery pump discards
        // it from the drained batch later so it is not delivered twice
        if oob && added {
            if let Err(e) = self.dispatcher.on_message(sender, msg.payload.clone()).await {
                error!("{}: couldn't deliver OOB message {}: {:#}", self.local(), seqno, e);
            }
        }

        if win.try_acquire_processing() {
            self.remove_and_deliver(&entry, sender).await;
            entry.arm_ack(); // sent delayed, on the next retransmit sweep
        }
    }

    async fn handle_batch_received(&self, sender: SocketAddr, map: BTreeMap<ConnId, Vec<DataMessage>>) {
        for (conn_id, msgs) in map {
            if let (Some(first_msg), Some(last_msg)) = (msgs.first(), msgs.last()) {
                trace!(
                    "{} <-- DATA({}: {} - {}, conn_id={})",
                    self.local(),
                    sender,
                    first_msg.seqno,
                    last_msg.seqno,
                    conn_id
                );
            }

            let mut entry: Option<Arc<ReceiverEntry>> = None;
            for msg in msgs {
                if entry.is_none() {
                    entry = self.get_receiver_entry(sender, msg.seqno, msg.first, conn_id).await;
                }
                let Some(entry) = &entry else {
                    continue;
                };

                let added = entry.received_msgs.add(msg.seqno, msg.clone());
                UnicastStats::incr(&self.stats.num_msgs_received);

                // ack the first message of a connection immediately so the
                // sender gets handshake confirmation without waiting a sweep
                if msg.first && added {
                    self.send_ack(sender, msg.seqno, conn_id).await;
                }
                if msg.oob && added {
                    if let Err(e) = self.dispatcher.on_message(sender, msg.payload.clone()).await {
                        error!("{}: couldn't deliver OOB message {}: {:#}", self.local(), msg.seqno, e);
                    }
                }
            }
            if let Some(entry) = &entry {
                if self.config.conn_expiry_timeout.is_some() {
                    entry.update();
                }
            }
        }

        let Some(entry) = self.recv_table.get(&sender) else {
            return;
        };
        let win = &entry.received_msgs;
        if win.try_acquire_processing() {
            if self.config.ack_batches_immediately {
                self.send_ack(sender, win.highest_deliverable(), entry.recv_conn_id).await;
            } else {
                entry.arm_ack();
            }
            self.remove_and_deliver(&entry, sender).await;
        }
    }

    /// The delivery pump: drains the receive window in batches and passes them
    /// up, dropping OOB messages that were already fast-pathed. Runs in the
    /// one thread that won the window's processing latch; the latch is
    /// released by the empty `remove_many` pull that ends the loop, so there
    /// is no gap in which a concurrent add could strand a message.
    async fn remove_and_deliver(&self, entry: &ReceiverEntry, sender: SocketAddr) {
        let win = &entry.received_msgs;
        loop {
            let Some(batch) = win.remove_many(true, self.config.max_msg_batch_size) else {
                return;
            };

            let first_seqno = batch.first().map(|m| m.seqno);
            let last_seqno = batch.last().map(|m| m.seqno);
            let deliverable: Vec<Bytes> = batch
                .into_iter()
                .filter(|msg| !msg.oob) // already delivered via the fast path
                .map(|msg| msg.payload)
                .collect();
            if deliverable.is_empty() {
                continue;
            }

            if let (Some(first), Some(last)) = (first_seqno, last_seqno) {
                trace!(
                    "{}: delivering {} - {} ({} messages)",
                    self.local(),
                    first,
                    last,
                    deliverable.len()
                );
            }
            if let Err(e) = self.dispatcher.on_batch(sender, deliverable).await {
                error!("{}: failed to deliver batch from {}: {:#}", self.local(), sender, e);
            }
        }
    }

    /// Resolves the receiver entry for an arriving DATA message.
    ///
    /// Fast path: an entry with a matching conn-id, no lock taken. Otherwise
    /// the create/replace decision runs under `recv_table_lock`: a `first`
    /// message creates the entry (replacing one with a stale conn-id); a
    /// non-`first` message without a matching entry is dropped and a
    /// SEND_FIRST_SEQNO probe is sent - creating an entry mid-stream would
    /// lock onto the wrong offset and lose the stream prefix forever.
    async fn get_receiver_entry(
        &self,
        sender: SocketAddr,
        seqno: Seqno,
        first: bool,
        conn_id: ConnId,
    ) -> Option<Arc<ReceiverEntry>> {
        if let Some(entry) = self.recv_table.get(&sender) {
            if entry.recv_conn_id == conn_id {
                return Some(entry);
            }
        }

        let resolved = {
            let _guard = self.recv_table_lock.lock().unwrap();
            let existing = self.recv_table.get(&sender);
            if first {
                match existing {
                    None => Some(self.create_receiver_entry(sender, seqno, conn_id)),
                    Some(entry) if entry.recv_conn_id != conn_id => {
                        trace!(
                            "{}: conn_id={} != {}; resetting receiver window",
                            self.local(),
                            conn_id,
                            entry.recv_conn_id
                        );
                        self.recv_table.remove(&sender);
                        Some(self.create_receiver_entry(sender, seqno, conn_id))
                    }
                    Some(entry) => Some(entry),
                }
            } else {
                match existing {
                    Some(entry) if entry.recv_conn_id == conn_id => Some(entry),
                    Some(_) => {
                        // stale incarnation: the window is unusable, drop it
                        self.recv_table.remove(&sender);
                        None
                    }
                    None => None,
                }
            }
            // lock released here; the probe below must not run under it
        };

        if resolved.is_none() {
            self.send_request_for_first_seqno(sender, seqno).await;
        }
        resolved
    }

    fn create_receiver_entry(&self, sender: SocketAddr, seqno: Seqno, conn_id: ConnId) -> Arc<ReceiverEntry> {
        let offset = seqno.checked_minus(1).unwrap_or(Seqno::ZERO);
        let candidate = Arc::new(ReceiverEntry::new(conn_id, offset, &self.config));
        let (entry, created) = self.recv_table.insert_if_absent(sender, candidate);
        if created {
            trace!(
                "{}: created receiver window for {} at seqno={} for conn-id={}",
                self.local(),
                sender,
                seqno,
                conn_id
            );
        }
        entry
    }

    // ------------------------------------------------------------------
    //  control traffic
    // ------------------------------------------------------------------

    fn handle_ack_received(&self, sender: SocketAddr, seqno: Seqno, conn_id: ConnId) {
        trace!("{} <-- ACK({}: {}, conn-id={})", self.local(), sender, seqno, conn_id);

        let Some(entry) = self.send_table.get(&sender) else {
            return;
        };
        if entry.send_conn_id != conn_id {
            trace!(
                "{}: my conn_id ({}) != received conn_id ({}); discarding ACK",
                self.local(),
                entry.send_conn_id,
                conn_id
            );
            return;
        }
        entry.sent_msgs.purge(seqno, true);
        UnicastStats::incr(&self.stats.num_acks_received);
    }

    /// The receiver never saw the start of our stream: replay everything
    /// stored up to `seqno`, with the `first` flag forced onto the earliest
    /// replayed message so the receiver can establish its window. The stored
    /// originals stay untouched for regular retransmission.
    async fn handle_resending_of_first_message(&self, sender: SocketAddr, seqno: Seqno) {
        trace!("{} <-- SEND_FIRST_SEQNO({}, {})", self.local(), sender, seqno);

        let Some(entry) = self.send_table.get(&sender) else {
            warn!("{}: sender window for {} not found", self.local(), sender);
            return;
        };
        let win = &entry.sent_msgs;

        let mut first_sent = false;
        let mut s = win.low().next();
        while s <= seqno {
            if let Some(msg) = win.get(s) {
                if first_sent {
                    self.transport.do_send(sender, msg.flags(), msg.to_frame()).await;
                } else {
                    first_sent = true;
                    let copy = msg.restamped_as_first();
                    self.transport.do_send(sender, copy.flags(), copy.to_frame()).await;
                }
            }
            s = s.next();
        }
    }

    async fn handle_xmit_request(&self, sender: SocketAddr, missing: SeqnoList) {
        trace!("{} <-- XMIT({}: {})", self.local(), sender, missing);
        UnicastStats::add(&self.stats.xmit_reqs_received, missing.size());

        let Some(entry) = self.send_table.get(&sender) else {
            return;
        };
        let win = &entry.sent_msgs;
        for seqno in missing.iter() {
            match win.get(seqno) {
                Some(msg) => {
                    self.transport.do_send(sender, msg.flags(), msg.to_frame()).await;
                    UnicastStats::incr(&self.stats.xmit_rsps_sent);
                }
                None => {
                    if self.config.log_not_found_msgs && seqno > win.low() {
                        warn!(
                            "{}: (requester={}) message {} not found in retransmission table: {}",
                            self.local(),
                            sender,
                            seqno,
                            win
                        );
                    }
                }
            }
        }
    }

    async fn send_ack(&self, dst: SocketAddr, seqno: Seqno, conn_id: ConnId) {
        if !self.is_running() {
            // don't emit acks on a stopped layer
            return;
        }
        trace!("{} --> ACK({}: {})", self.local(), dst, seqno);

        let mut buf = bytes::BytesMut::new();
        UnicastHeader::Ack { seqno, conn_id }.ser(&mut buf);
        self.transport.do_send(dst, MsgFlags::default(), buf.freeze()).await;
        UnicastStats::incr(&self.stats.num_acks_sent);
    }

    async fn send_request_for_first_seqno(&self, dst: SocketAddr, seqno_received: Seqno) {
        trace!("{} --> SEND_FIRST_SEQNO({}, {})", self.local(), dst, seqno_received);

        let mut buf = bytes::BytesMut::new();
        UnicastHeader::SendFirstSeqno { seqno: seqno_received }.ser(&mut buf);
        self.transport.do_send(dst, MsgFlags::OOB, buf.freeze()).await;
    }

    /// Sends a retransmit request for `missing` to the given sender.
    async fn retransmit_request(&self, target: SocketAddr, missing: &SeqnoList) {
        trace!("{}: sending XMIT_REQ ({}) to {}", self.local(), missing, target);

        let mut buf = bytes::BytesMut::new();
        UnicastHeader::XmitReq.ser(&mut buf);
        missing.ser(&mut buf);
        self.transport.do_send(target, MsgFlags::OOB, buf.freeze()).await;
        UnicastStats::add(&self.stats.xmit_reqs_sent, missing.size());
    }

    /// Resends a message for which no ACK has been received yet.
    async fn retransmit(&self, dst: SocketAddr, msg: &DataMessage) {
        trace!("{} --> XMIT({}: {})", self.local(), dst, msg.seqno);
        self.transport.do_send(dst, msg.flags(), msg.to_frame()).await;
        UnicastStats::incr(&self.stats.num_xmits);
    }

    // ------------------------------------------------------------------
    //  periodic tasks
    // ------------------------------------------------------------------

    /// One retransmit sweep. Per receiver window: emit the pending delayed
    /// ACK, then request retransmission of gaps - but only gaps already seen
    /// by the previous sweep, giving reordered messages one interval to
    /// arrive. Per send window: if highest-acked/highest-sent made no progress
    /// since the last sweep and messages are outstanding, resend the highest
    /// sent message as a liveness probe.
    async fn trigger_xmit(&self, xmit_task_map: &mut FxHashMap<SocketAddr, Seqno>) {
        let recv_snapshot = self.recv_table.load();
        for (target, entry) in recv_snapshot.iter() {
            let win = &entry.received_msgs;

            if entry.take_ack() {
                self.send_ack(*target, win.highest_delivered(), entry.recv_conn_id).await;
            }

            if win.num_missing() > 0 {
                // num_missing is O(1); only build the list when there are gaps
                let Some(mut missing) = win.missing() else {
                    continue;
                };
                let Some(highest) = missing.last() else {
                    continue;
                };
                match xmit_task_map.get(target).copied() {
                    None => {
                        // newly seen gaps get one interval to arrive naturally
                        xmit_task_map.insert(*target, highest);
                    }
                    Some(prev) => {
                        missing.remove_higher_than(prev);
                        if highest > prev {
                            xmit_task_map.insert(*target, highest);
                        }
                        if !missing.is_empty() {
                            self.retransmit_request(*target, &missing).await;
                        }
                    }
                }
            } else {
                xmit_task_map.remove(target);
            }
        }
        // drop targets whose receive window is gone (peer left or was reaped)
        xmit_task_map.retain(|target, _| recv_snapshot.contains_key(target));

        for (dst, entry) in self.send_table.load().iter() {
            let win = &entry.sent_msgs;
            let highest_acked = win.highest_delivered();
            let highest_sent = win.highest_received();

            if highest_acked < highest_sent && entry.watermark() == (highest_acked, highest_sent) {
                // no progress since the last sweep: resend the tail message
                if let Some(msg) = win.get(highest_sent) {
                    self.retransmit(*dst, &msg).await;
                }
            } else {
                entry.set_watermark(highest_acked, highest_sent);
            }
        }
    }

    fn expire_aged_out(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        for addr in cache.take_expired(uptime_millis()) {
            debug!("{}: removing connection to {} because it expired", self.local(), addr);
            self.remove_connection(&addr);
        }
    }

    /// Removes connections that have been idle for `conn_expiry_timeout` or
    /// longer. A later message to/from the peer recreates them transparently.
    pub fn reap_idle_connections(&self) {
        let Some(timeout) = self.config.conn_expiry_timeout else {
            return;
        };

        for (addr, entry) in self.send_table.load().iter() {
            let age = entry.age();
            if age >= timeout {
                self.remove_send_connection(addr);
                debug!(
                    "{}: removed expired connection for {} ({} ms old) from send_table",
                    self.local(),
                    addr,
                    age.as_millis()
                );
            }
        }
        for (addr, entry) in self.recv_table.load().iter() {
            let age = entry.age();
            if age >= timeout {
                self.remove_receive_connection(addr);
                debug!(
                    "{}: removed expired connection for {} ({} ms old) from recv_table",
                    self.local(),
                    addr,
                    age.as_millis()
                );
            }
        }
    }

    // ------------------------------------------------------------------
    //  connection management
    // ------------------------------------------------------------------

    pub fn remove_connection(&self, addr: &SocketAddr) {
        self.remove_send_connection(addr);
        self.remove_receive_connection(addr);
    }

    pub fn remove_send_connection(&self, addr: &SocketAddr) {
        self.send_table.remove(addr);
    }

    pub fn remove_receive_connection(&self, addr: &SocketAddr) {
        self.recv_table.remove(addr);
    }

    pub fn remove_all_connections(&self) {
        self.send_table.clear();
        self.recv_table.clear();
    }

    // ------------------------------------------------------------------
    //  management surface
    // ------------------------------------------------------------------

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn members(&self) -> Vec<SocketAddr> {
        self.members.read().unwrap().clone()
    }

    pub fn num_send_connections(&self) -> usize {
        self.send_table.len()
    }

    pub fn num_receive_connections(&self) -> usize {
        self.recv_table.len()
    }

    pub fn num_connections(&self) -> usize {
        self.num_send_connections() + self.num_receive_connections()
    }

    /// Messages in all send windows that have not been acked yet.
    pub fn num_unacked_messages(&self) -> u64 {
        self.send_table.load().values().map(|e| e.sent_msgs.size()).sum()
    }

    /// Undelivered messages buffered in all receive windows.
    pub fn num_messages_in_recv_windows(&self) -> u64 {
        self.recv_table.load().values().map(|e| e.received_msgs.size()).sum()
    }

    /// Missing messages over all receive windows.
    pub fn num_missing_messages(&self) -> u64 {
        self.recv_table.load().values().map(|e| e.received_msgs.num_missing()).sum()
    }

    /// Sums of the window maintenance counters over all send and receive
    /// windows, in the order (compactions, moves, resizes, purges).
    pub fn window_metrics(&self) -> (u64, u64, u64, u64) {
        let mut totals = (0, 0, 0, 0);
        for metrics in self
            .send_table
            .load()
            .values()
            .map(|e| e.sent_msgs.metrics())
            .chain(self.recv_table.load().values().map(|e| e.received_msgs.metrics()))
        {
            totals.0 += metrics.num_compactions;
            totals.1 += metrics.num_moves;
            totals.2 += metrics.num_resizes;
            totals.3 += metrics.num_purges;
        }
        totals
    }

    pub fn age_out_cache_size(&self) -> usize {
        self.cache.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn print_connections(&self) -> String {
        let mut out = String::new();
        let send_snapshot = self.send_table.load();
        if !send_snapshot.is_empty() {
            out.push_str("\nsend connections:\n");
            for (addr, entry) in send_snapshot.iter() {
                out.push_str(&format!("{}: {}\n", addr, entry));
            }
        }
        let recv_snapshot = self.recv_table.load();
        if !recv_snapshot.is_empty() {
            out.push_str("\nreceive connections:\n");
            for (addr, entry) in recv_snapshot.iter() {
                out.push_str(&format!("{}: {}\n", addr, entry));
            }
        }
        out
    }

    fn local(&self) -> String {
        self.local_addr
            .get()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "?".to_string())
    }
}

impl Drop for ReliableUnicast {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockMessageDispatcher;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use mockall::predicate::eq;
    use rstest::rstest;

    // ------------------------------------------------------------------
    //  recording collaborators and a two-node harness
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<(SocketAddr, MsgFlags, Bytes)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn do_send(&self, to: SocketAddr, flags: MsgFlags, frame: Bytes) {
            self.frames.lock().unwrap().push((to, flags, frame));
        }
    }

    impl RecordingTransport {
        fn drain(&self) -> Vec<(SocketAddr, MsgFlags, Bytes)> {
            self.frames.lock().unwrap().drain(..).collect()
        }

        fn is_empty(&self) -> bool {
            self.frames.lock().unwrap().is_empty()
        }
    }

    #[derive(Debug, PartialEq)]
    enum Delivery {
        Single(Bytes),
        Batch(Vec<Bytes>),
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        deliveries: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn on_message(&self, _from: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
            self.deliveries.lock().unwrap().push(Delivery::Single(payload));
            Ok(())
        }

        async fn on_batch(&self, _from: SocketAddr, batch: Vec<Bytes>) -> anyhow::Result<()> {
            self.deliveries.lock().unwrap().push(Delivery::Batch(batch));
            Ok(())
        }
    }

    impl RecordingDispatcher {
        fn take(&self) -> Vec<Delivery> {
            self.deliveries.lock().unwrap().drain(..).collect()
        }

        /// all delivered payloads in delivery order, fast-path and batches alike
        fn flattened(&self) -> Vec<Bytes> {
            self.take()
                .into_iter()
                .flat_map(|delivery| match delivery {
                    Delivery::Single(payload) => vec![payload],
                    Delivery::Batch(batch) => batch,
                })
                .collect()
        }
    }

    struct Node {
        layer: Arc<ReliableUnicast>,
        transport: Arc<RecordingTransport>,
        dispatcher: Arc<RecordingDispatcher>,
        addr: SocketAddr,
    }

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn small_config() -> UnicastConfig {
        UnicastConfig {
            xmit_table_num_rows: 4,
            xmit_table_msgs_per_row: 8,
            ..UnicastConfig::default()
        }
    }

    fn node(port: u16, config: UnicastConfig) -> Node {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let layer = Arc::new(
            ReliableUnicast::new(config, transport.clone(), dispatcher.clone()).unwrap(),
        );
        layer.set_local_address(test_addr(port));
        // tests drive the periodic work by hand instead of spawning tasks
        layer.running.store(true, Ordering::Release);
        Node {
            layer,
            transport,
            dispatcher,
            addr: test_addr(port),
        }
    }

    fn payload(i: u64) -> Bytes {
        Bytes::from(format!("msg-{}", i))
    }

    fn data_frame(seqno: u64, conn_id: ConnId, first: bool, payload: &Bytes) -> Bytes {
        let mut buf = BytesMut::new();
        UnicastHeader::Data {
            seqno: Seqno::from_raw(seqno),
            conn_id,
            first,
        }
        .ser(&mut buf);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    /// moves all frames queued at `from` that are addressed to `to` into
    /// `to`'s up pipeline; frames for other destinations are dropped
    async fn transfer(from: &Node, to: &Node) {
        for (dst, flags, frame) in from.transport.drain() {
            if dst == to.addr {
                to.layer.on_frame(from.addr, flags, frame).await;
            }
        }
    }

    fn parse_header(frame: &Bytes) -> UnicastHeader {
        let mut read = frame.clone();
        UnicastHeader::deser(&mut read).unwrap()
    }

    // ------------------------------------------------------------------
    //  end-to-end scenarios
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_happy_path_in_order_delivery() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=10 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        assert_eq!(a.layer.num_unacked_messages(), 10);

        transfer(&a, &b).await;
        assert_eq!(
            b.dispatcher.flattened(),
            (1..=10).map(payload).collect::<Vec<_>>()
        );

        // the delayed ack goes out with the next sweep and empties the send window
        let mut xmit_task_map = FxHashMap::default();
        b.layer.trigger_xmit(&mut xmit_task_map).await;
        transfer(&b, &a).await;

        assert_eq!(a.layer.num_unacked_messages(), 0);
        assert_eq!(a.layer.stats().num_acks_received, 1);
        assert_eq!(b.layer.stats().num_acks_sent, 1);
    }

    #[tokio::test]
    async fn test_loss_recovery_via_xmit_req() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=10 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        // messages 4 and 7 are lost in transit
        for (i, (_, flags, frame)) in a.transport.drain().into_iter().enumerate() {
            if i == 3 || i == 6 {
                continue;
            }
            b.layer.on_frame(a.addr, flags, frame).await;
        }
        assert_eq!(b.layer.num_missing_messages(), 2);

        let mut xmit_task_map = FxHashMap::default();
        // first sweep: ack what was delivered, give the gaps one interval
        b.layer.trigger_xmit(&mut xmit_task_map).await;
        transfer(&b, &a).await;
        assert_eq!(a.layer.stats().xmit_reqs_received, 0);

        // second sweep: the gaps are still there, request retransmission
        b.layer.trigger_xmit(&mut xmit_task_map).await;
        transfer(&b, &a).await;
        assert_eq!(a.layer.stats().xmit_reqs_received, 2);
        assert_eq!(b.layer.stats().xmit_reqs_sent, 2);
        assert_eq!(a.layer.stats().xmit_rsps_sent, 2);

        transfer(&a, &b).await;
        assert_eq!(
            b.dispatcher.flattened(),
            (1..=10).map(payload).collect::<Vec<_>>()
        );
        assert_eq!(b.layer.num_missing_messages(), 0);
    }

    #[tokio::test]
    async fn test_oob_delivered_early_and_exactly_once() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=5 {
            let flags = if i == 3 { MsgFlags::OOB } else { MsgFlags::default() };
            a.layer.send(b.addr, flags, payload(i)).await;
        }

        // transport reorders: 1, 2, 4, 5 arrive first, then the OOB 3
        let frames = a.transport.drain();
        for i in [0usize, 1, 3, 4, 2] {
            let (_, flags, frame) = &frames[i];
            b.layer.on_frame(a.addr, *flags, frame.clone()).await;
        }

        assert_eq!(
            b.dispatcher.take(),
            vec![
                Delivery::Batch(vec![payload(1)]),
                Delivery::Batch(vec![payload(2)]),
                Delivery::Single(payload(3)), // fast path, ahead of 4 and 5
                Delivery::Batch(vec![payload(4), payload(5)]),
            ]
        );
    }

    #[tokio::test]
    async fn test_sender_restart_resets_receiver_window() {
        let a1 = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=3 {
            a1.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        transfer(&a1, &b).await;
        assert_eq!(b.dispatcher.flattened().len(), 3);

        // the sender restarts and comes back with a different conn id
        let a2 = node(1, small_config());
        a2.layer.new_conn_id();
        a2.layer.send(b.addr, MsgFlags::default(), payload(100)).await;
        transfer(&a2, &b).await;

        assert_eq!(b.dispatcher.flattened(), vec![payload(100)]);
        assert_eq!(b.layer.num_receive_connections(), 1);
        let entry = b.layer.recv_table.get(&a2.addr).unwrap();
        assert_eq!(entry.recv_conn_id, 2);
        assert_eq!(entry.received_msgs.highest_delivered(), FIRST_SEQNO);
    }

    #[tokio::test]
    async fn test_receiver_cold_start_triggers_first_seqno_replay() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=5 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        // only message 5 makes it to the receiver, which has no entry yet
        let frames = a.transport.drain();
        let (_, flags, frame) = &frames[4];
        b.layer.on_frame(a.addr, *flags, frame.clone()).await;

        assert!(b.dispatcher.take().is_empty());
        assert_eq!(b.layer.num_receive_connections(), 0);

        // the SEND_FIRST_SEQNO probe makes the sender replay 1..=5, with the
        // earliest replayed message re-flagged as first
        transfer(&b, &a).await;
        let replayed = a.transport.drain();
        assert_eq!(replayed.len(), 5);
        assert!(matches!(
            parse_header(&replayed[0].2),
            UnicastHeader::Data { first: true, .. }
        ));
        assert!(matches!(
            parse_header(&replayed[1].2),
            UnicastHeader::Data { first: false, .. }
        ));

        for (_, flags, frame) in replayed {
            b.layer.on_frame(a.addr, flags, frame).await;
        }
        assert_eq!(
            b.dispatcher.flattened(),
            (1..=5).map(payload).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_idle_connections_reaped_and_recreated() {
        let config = UnicastConfig {
            conn_expiry_timeout: Some(Duration::from_millis(100)),
            ..small_config()
        };
        let a = node(1, config.clone());
        let b = node(2, config);

        a.layer.send(b.addr, MsgFlags::default(), payload(1)).await;
        transfer(&a, &b).await;
        assert_eq!(b.dispatcher.flattened(), vec![payload(1)]);
        assert_eq!(a.layer.num_send_connections(), 1);
        assert_eq!(b.layer.num_receive_connections(), 1);

        std::thread::sleep(Duration::from_millis(120));
        a.layer.reap_idle_connections();
        b.layer.reap_idle_connections();
        assert_eq!(a.layer.num_send_connections(), 0);
        assert_eq!(b.layer.num_receive_connections(), 0);

        // the next send builds a fresh connection; the receiver resets to it
        a.layer.send(b.addr, MsgFlags::default(), payload(2)).await;
        transfer(&a, &b).await;
        assert_eq!(b.dispatcher.flattened(), vec![payload(2)]);

        let entry = a.layer.send_table.get(&b.addr).unwrap();
        assert_eq!(entry.send_conn_id, 2);
    }

    // ------------------------------------------------------------------
    //  pipelines and state machine
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_discarded_when_stopped() {
        let a = node(1, small_config());
        a.layer.stop();

        a.layer.send(test_addr(2), MsgFlags::default(), payload(1)).await;
        assert!(a.transport.is_empty());
        assert_eq!(a.layer.stats().num_msgs_sent, 0);
    }

    #[tokio::test]
    async fn test_no_reliability_bypasses_the_layer() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        a.layer.send(b.addr, MsgFlags::NO_RELIABILITY, payload(1)).await;
        assert_eq!(a.layer.num_send_connections(), 0);

        transfer(&a, &b).await;
        assert_eq!(b.dispatcher.take(), vec![Delivery::Single(payload(1))]);
        assert_eq!(b.layer.num_receive_connections(), 0);
    }

    #[tokio::test]
    async fn test_first_seqno_travels_with_first_flag() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        a.layer.send(b.addr, MsgFlags::default(), payload(1)).await;
        a.layer.send(b.addr, MsgFlags::default(), payload(2)).await;

        let frames = a.transport.drain();
        assert!(matches!(
            parse_header(&frames[0].2),
            UnicastHeader::Data { first: true, .. }
        ));
        assert!(matches!(
            parse_header(&frames[1].2),
            UnicastHeader::Data { first: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_data_not_redelivered() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        a.layer.send(b.addr, MsgFlags::default(), payload(1)).await;
        let frames = a.transport.drain();
        let (_, flags, frame) = &frames[0];

        b.layer.on_frame(a.addr, *flags, frame.clone()).await;
        b.layer.on_frame(a.addr, *flags, frame.clone()).await;

        assert_eq!(b.dispatcher.flattened(), vec![payload(1)]);
    }

    #[tokio::test]
    async fn test_ack_with_wrong_conn_id_discarded() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        a.layer.send(b.addr, MsgFlags::default(), payload(1)).await;
        a.transport.drain();

        let mut buf = BytesMut::new();
        UnicastHeader::Ack { seqno: Seqno::from_raw(1), conn_id: 99 }.ser(&mut buf);
        a.layer.on_frame(b.addr, MsgFlags::default(), buf.freeze()).await;
        assert_eq!(a.layer.num_unacked_messages(), 1);
        assert_eq!(a.layer.stats().num_acks_received, 0);

        let mut buf = BytesMut::new();
        UnicastHeader::Ack { seqno: Seqno::from_raw(1), conn_id: 1 }.ser(&mut buf);
        a.layer.on_frame(b.addr, MsgFlags::default(), buf.freeze()).await;
        assert_eq!(a.layer.num_unacked_messages(), 0);
        assert_eq!(a.layer.stats().num_acks_received, 1);
    }

    #[tokio::test]
    async fn test_unknown_header_type_dropped() {
        let b = node(2, small_config());
        b.layer
            .on_frame(test_addr(1), MsgFlags::default(), Bytes::from_static(&[42, 1, 2]))
            .await;

        assert!(b.dispatcher.take().is_empty());
        assert!(b.transport.is_empty());
    }

    #[tokio::test]
    async fn test_xmit_request_for_purged_seqno_skipped() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=3 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        a.transport.drain();

        // everything up to 3 was acked and purged
        let mut buf = BytesMut::new();
        UnicastHeader::Ack { seqno: Seqno::from_raw(3), conn_id: 1 }.ser(&mut buf);
        a.layer.on_frame(b.addr, MsgFlags::default(), buf.freeze()).await;

        let mut buf = BytesMut::new();
        UnicastHeader::XmitReq.ser(&mut buf);
        let mut missing = SeqnoList::new();
        for s in 1..=3 {
            missing.append(Seqno::from_raw(s));
        }
        missing.ser(&mut buf);
        a.layer.on_frame(b.addr, MsgFlags::OOB, buf.freeze()).await;

        assert!(a.transport.is_empty());
        assert_eq!(a.layer.stats().xmit_rsps_sent, 0);
        assert_eq!(a.layer.stats().xmit_reqs_received, 3);
    }

    #[rstest]
    #[case::immediate(true)]
    #[case::delayed(false)]
    #[tokio::test]
    async fn test_batch_path_acks(#[case] ack_batches_immediately: bool) {
        let config = UnicastConfig {
            ack_batches_immediately,
            ..small_config()
        };
        let a = node(1, small_config());
        let b = node(2, config);

        for i in 1..=3 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        let batch: Vec<(MsgFlags, Bytes)> = a
            .transport
            .drain()
            .into_iter()
            .map(|(_, flags, frame)| (flags, frame))
            .collect();
        b.layer.on_frame_batch(a.addr, batch).await;

        assert_eq!(b.dispatcher.take(), vec![Delivery::Batch(vec![payload(1), payload(2), payload(3)])]);

        let acks: Vec<UnicastHeader> = b
            .transport
            .drain()
            .iter()
            .map(|(_, _, frame)| parse_header(frame))
            .collect();
        if ack_batches_immediately {
            // handshake ack for the first message, then the batch-drain ack
            assert_eq!(
                acks,
                vec![
                    UnicastHeader::Ack { seqno: Seqno::from_raw(1), conn_id: 1 },
                    UnicastHeader::Ack { seqno: Seqno::from_raw(3), conn_id: 1 },
                ]
            );
        } else {
            assert_eq!(
                acks,
                vec![UnicastHeader::Ack { seqno: Seqno::from_raw(1), conn_id: 1 }]
            );
            // the drain ack is delayed until the next sweep
            let mut xmit_task_map = FxHashMap::default();
            b.layer.trigger_xmit(&mut xmit_task_map).await;
            let acks: Vec<UnicastHeader> = b
                .transport
                .drain()
                .iter()
                .map(|(_, _, frame)| parse_header(frame))
                .collect();
            assert_eq!(
                acks,
                vec![UnicastHeader::Ack { seqno: Seqno::from_raw(3), conn_id: 1 }]
            );
        }
    }

    #[tokio::test]
    async fn test_stall_probe_resends_highest_sent() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=3 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        a.transport.drain(); // all frames lost

        let mut xmit_task_map = FxHashMap::default();
        // first sweep records the watermark, no retransmission yet
        a.layer.trigger_xmit(&mut xmit_task_map).await;
        assert!(a.transport.is_empty());

        // second sweep sees no progress and probes with the highest sent message
        a.layer.trigger_xmit(&mut xmit_task_map).await;
        let frames = a.transport.drain();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            parse_header(&frames[0].2),
            UnicastHeader::Data { seqno, .. } if seqno == Seqno::from_raw(3)
        ));
        assert_eq!(a.layer.stats().num_xmits, 1);
    }

    #[tokio::test]
    async fn test_lost_ack_recovered_without_duplicate_delivery() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=3 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        transfer(&a, &b).await;
        assert_eq!(
            b.dispatcher.flattened(),
            (1..=3).map(payload).collect::<Vec<_>>()
        );

        // the receiver's delayed ack is lost in transit
        let mut b_map = FxHashMap::default();
        b.layer.trigger_xmit(&mut b_map).await;
        b.transport.drain();

        // the sender sees no progress for a sweep and probes with the tail
        let mut a_map = FxHashMap::default();
        a.layer.trigger_xmit(&mut a_map).await;
        a.layer.trigger_xmit(&mut a_map).await;
        transfer(&a, &b).await;

        // the duplicate is not delivered again, but it re-arms the ack
        assert!(b.dispatcher.flattened().is_empty());
        b.layer.trigger_xmit(&mut b_map).await;
        transfer(&b, &a).await;
        assert_eq!(a.layer.num_unacked_messages(), 0);
    }

    #[tokio::test]
    async fn test_send_first_seqno_replay_restamps_only_earliest() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        for i in 1..=3 {
            a.layer.send(b.addr, MsgFlags::default(), payload(i)).await;
        }
        a.transport.drain();

        // seqno 1 was acked and purged; the receiver then asks for the start
        let mut buf = BytesMut::new();
        UnicastHeader::Ack { seqno: Seqno::from_raw(1), conn_id: 1 }.ser(&mut buf);
        a.layer.on_frame(b.addr, MsgFlags::default(), buf.freeze()).await;

        let mut buf = BytesMut::new();
        UnicastHeader::SendFirstSeqno { seqno: Seqno::from_raw(3) }.ser(&mut buf);
        a.layer.on_frame(b.addr, MsgFlags::OOB, buf.freeze()).await;

        let replayed: Vec<UnicastHeader> = a
            .transport
            .drain()
            .iter()
            .map(|(_, _, frame)| parse_header(frame))
            .collect();
        assert_eq!(
            replayed,
            vec![
                UnicastHeader::Data { seqno: Seqno::from_raw(2), conn_id: 1, first: true },
                UnicastHeader::Data { seqno: Seqno::from_raw(3), conn_id: 1, first: false },
            ]
        );

        // the restamp worked on a copy; the stored message is unchanged
        let entry = a.layer.send_table.get(&b.addr).unwrap();
        assert!(!entry.sent_msgs.get(Seqno::from_raw(2)).unwrap().first);
    }

    #[tokio::test]
    async fn test_view_change_removes_departed_peers() {
        let a = node(1, small_config());
        let b = test_addr(2);
        let c = test_addr(3);

        a.layer.send(b, MsgFlags::default(), payload(1)).await;
        a.layer.send(c, MsgFlags::default(), payload(2)).await;
        assert_eq!(a.layer.num_send_connections(), 2);

        a.layer.view_change(vec![a.addr, b]);
        assert_eq!(a.layer.num_send_connections(), 1);
        assert!(a.layer.send_table.get(&b).is_some());
        assert!(a.layer.send_table.get(&c).is_none());
    }

    #[tokio::test]
    async fn test_age_out_expires_non_member_destination() {
        let config = UnicastConfig {
            max_retransmit_time: Some(Duration::from_millis(50)),
            ..small_config()
        };
        let a = node(1, config);
        let b = test_addr(2);

        a.layer.send(b, MsgFlags::default(), payload(1)).await;
        assert_eq!(a.layer.age_out_cache_size(), 1);

        std::thread::sleep(Duration::from_millis(60));
        a.layer.expire_aged_out();
        assert_eq!(a.layer.num_send_connections(), 0);
        assert_eq!(a.layer.age_out_cache_size(), 0);
    }

    #[tokio::test]
    async fn test_member_destination_not_age_out_tracked() {
        let a = node(1, small_config());
        let b = test_addr(2);

        a.layer.view_change(vec![a.addr, b]);
        a.layer.send(b, MsgFlags::default(), payload(1)).await;
        assert_eq!(a.layer.age_out_cache_size(), 0);
    }

    #[test]
    fn test_conn_id_allocator_wraps_past_short_max() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let layer =
            ReliableUnicast::new(small_config(), transport, dispatcher).unwrap();

        assert_eq!(layer.new_conn_id(), 1);
        assert_eq!(layer.new_conn_id(), 2);

        *layer.last_conn_id.lock().unwrap() = i16::MAX as ConnId;
        assert_eq!(layer.new_conn_id(), i16::MAX as ConnId);
        assert_eq!(layer.new_conn_id(), 0);
        assert_eq!(layer.new_conn_id(), 1);
    }

    #[tokio::test]
    async fn test_restart_onto_conn_id_zero_still_detected() {
        let b = node(2, small_config());
        let sender = test_addr(1);

        // connection established with conn id 0 (valid after allocator wrap)
        b.layer.on_frame(sender, MsgFlags::default(), data_frame(1, 0, true, &payload(1))).await;
        assert_eq!(b.dispatcher.flattened(), vec![payload(1)]);

        // restarted sender speaks with conn id 1: reset, not a duplicate
        b.layer.on_frame(sender, MsgFlags::default(), data_frame(1, 1, true, &payload(2))).await;
        assert_eq!(b.dispatcher.flattened(), vec![payload(2)]);
        assert_eq!(b.layer.recv_table.get(&sender).unwrap().recv_conn_id, 1);
    }

    #[tokio::test]
    async fn test_non_first_data_with_stale_conn_id_drops_entry() {
        let b = node(2, small_config());
        let sender = test_addr(1);

        b.layer.on_frame(sender, MsgFlags::default(), data_frame(1, 5, true, &payload(1))).await;
        assert_eq!(b.layer.num_receive_connections(), 1);
        b.transport.drain();

        // mid-stream message from a different incarnation: the stale entry is
        // dropped and the sender is probed for its first seqno
        b.layer.on_frame(sender, MsgFlags::default(), data_frame(7, 6, false, &payload(7))).await;
        assert_eq!(b.dispatcher.flattened(), vec![payload(1)]);
        assert_eq!(b.layer.num_receive_connections(), 0);

        let probes: Vec<UnicastHeader> = b
            .transport
            .drain()
            .iter()
            .map(|(_, _, frame)| parse_header(frame))
            .collect();
        assert_eq!(
            probes,
            vec![UnicastHeader::SendFirstSeqno { seqno: Seqno::from_raw(7) }]
        );
    }

    #[tokio::test]
    async fn test_stop_tears_down_connections() {
        let a = node(1, small_config());
        let b = node(2, small_config());

        a.layer.send(b.addr, MsgFlags::default(), payload(1)).await;
        transfer(&a, &b).await;
        assert_eq!(a.layer.num_connections(), 1);
        assert_eq!(b.layer.num_connections(), 1);

        a.layer.stop();
        b.layer.stop();
        assert_eq!(a.layer.num_connections(), 0);
        assert_eq!(b.layer.num_connections(), 0);
        assert!(!a.layer.is_running());
    }

    // ------------------------------------------------------------------
    //  collaborator contracts (mocked)
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_stamps_header_and_hands_frame_to_transport() {
        let dst = test_addr(2);
        let mut transport = MockTransport::new();
        transport
            .expect_do_send()
            .once()
            .with(
                eq(dst),
                eq(MsgFlags::default()),
                eq(Bytes::from_static(&[0, 1, 1, 0, 1, 1, b'h', b'i'])),
            )
            .return_const(());

        let layer = ReliableUnicast::new(
            small_config(),
            Arc::new(transport),
            Arc::new(MockMessageDispatcher::new()),
        )
        .unwrap();
        layer.running.store(true, Ordering::Release);

        layer.send(dst, MsgFlags::default(), Bytes::from_static(b"hi")).await;
        assert_eq!(layer.stats().num_msgs_sent, 1);
    }

    #[tokio::test]
    async fn test_oob_message_uses_single_delivery_only() {
        let sender = test_addr(1);
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher
            .expect_on_message()
            .once()
            .with(eq(sender), eq(payload(1)))
            .returning(|_, _| Ok(()));
        // no on_batch expectation: a batch delivery would fail the test

        let layer = ReliableUnicast::new(
            small_config(),
            Arc::new(RecordingTransport::default()),
            Arc::new(dispatcher),
        )
        .unwrap();
        layer.running.store(true, Ordering::Release);

        layer
            .on_frame(sender, MsgFlags::OOB, data_frame(1, 3, true, &payload(1)))
            .await;
    }
}
