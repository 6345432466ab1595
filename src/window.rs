use std::cmp::min;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::seqno::Seqno;
use crate::seqno_list::SeqnoList;

/// A seqno-indexed retransmission table: the send window of unacked messages
/// on the sender side, the reorder buffer on the receiver side.
///
/// The store is a matrix of `rows x msgs_per_row` slots with a logical base
/// `offset` (the seqno just below the first slot). Seqno `s` lives at
/// `row = (s - offset - 1) / msgs_per_row`, `col = (s - offset - 1) %
/// msgs_per_row`. Rows are allocated lazily, appended on resize, and
/// left-shifted by compaction once purging empties them, so insert, purge and
/// lookup stay amortized O(1) over the life of a connection.
///
/// Watermarks (receive-side reading; a send window reads `highest_delivered`
/// as highest *acked* and `highest_received` as highest *sent*):
/// * `low`: lowest seqno still stored or reserved; everything at or below it
///   is purged
/// * `highest_delivered`: largest seqno handed to the consumer
/// * `highest_received`: largest seqno ever inserted
///
/// Invariant: `offset <= low <= highest_delivered <= highest_received`.
///
/// All operations lock the window-internal mutex; none of them calls out while
/// holding it. The `processing` latch is the single-consumer delivery guard:
/// it is acquired with a CAS by the thread that becomes the deliverer and is
/// released *inside the window lock* by [`Window::remove_many`] when it finds
/// nothing deliverable, which makes "observed empty" and "released the
/// delivery right" one atomic step.
pub struct Window<T> {
    msgs_per_row: usize,
    resize_factor: f64,
    max_compaction_time: Duration,
    processing: AtomicBool,
    inner: Mutex<WindowInner<T>>,
}

struct WindowInner<T> {
    matrix: Vec<Option<Vec<Option<T>>>>,
    msgs_per_row: usize,
    offset: u64,
    low: u64,
    highest_delivered: u64,
    highest_received: u64,
    /// number of occupied slots in `(highest_delivered, highest_received]`
    size: u64,
    last_compaction: Instant,
    num_compactions: u64,
    num_moves: u64,
    num_resizes: u64,
    num_purges: u64,
}

/// Snapshot of a window's maintenance counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowMetrics {
    pub num_compactions: u64,
    pub num_moves: u64,
    pub num_resizes: u64,
    pub num_purges: u64,
}

impl<T: Clone> Window<T> {
    pub fn new(
        num_rows: usize,
        msgs_per_row: usize,
        offset: Seqno,
        resize_factor: f64,
        max_compaction_time: Duration,
    ) -> Window<T> {
        assert!(num_rows > 0 && msgs_per_row > 0);
        let offset = offset.to_raw();

        Window {
            msgs_per_row,
            resize_factor,
            max_compaction_time,
            processing: AtomicBool::new(false),
            inner: Mutex::new(WindowInner {
                matrix: std::iter::repeat_with(|| None).take(num_rows).collect(),
                msgs_per_row,
                offset,
                low: offset,
                highest_delivered: offset,
                highest_received: offset,
                size: 0,
                last_compaction: Instant::now(),
                num_compactions: 0,
                num_moves: 0,
                num_resizes: 0,
                num_purges: 0,
            }),
        }
    }

    /// Inserts `element` at `seqno`. Returns false without storing anything if
    /// the seqno was already delivered or the slot is occupied (duplicate).
    /// Grows the matrix as needed.
    pub fn add(&self, seqno: Seqno, element: T) -> bool {
        let s = seqno.to_raw();
        let mut inner = self.inner.lock().unwrap();

        if s <= inner.highest_delivered {
            return false;
        }

        inner.ensure_capacity(s, self.resize_factor);
        let (row, col) = inner.slot_of(s);
        let msgs_per_row = self.msgs_per_row;
        let row_slots = inner.matrix[row].get_or_insert_with(|| empty_row(msgs_per_row));
        if row_slots[col].is_some() {
            return false;
        }
        row_slots[col] = Some(element);
        inner.size += 1;
        if s > inner.highest_received {
            inner.highest_received = s;
        }
        true
    }

    /// Removes and returns up to `max` contiguous elements starting right
    /// above `highest_delivered`.
    ///
    /// Returns `None` - and atomically releases the processing latch while
    /// still holding the window lock - when nothing is deliverable (next slot
    /// empty, or `max == 0`). On a non-empty return the latch stays with the
    /// caller, which must keep pulling until `None`.
    ///
    /// With `nullify`, drained slots are cleared and `low` advances with
    /// `highest_delivered`, making the rows eligible for compaction.
    pub fn remove_many(&self, nullify: bool, max: usize) -> Option<Vec<T>> {
        let mut inner = self.inner.lock().unwrap();

        let mut result = Vec::new();
        let mut next = inner.highest_delivered + 1;
        while result.len() < max && next <= inner.highest_received {
            let (row, col) = inner.slot_of(next);
            let slot = match &mut inner.matrix[row] {
                Some(row_slots) => &mut row_slots[col],
                None => break,
            };
            let element = if nullify { slot.take() } else { slot.clone() };
            match element {
                Some(element) => {
                    result.push(element);
                    next += 1;
                }
                None => break,
            }
        }

        if result.is_empty() {
            // release-on-empty: done under the window lock so no add() can
            // slip between "observed empty" and "released the delivery right"
            self.processing.store(false, Ordering::Release);
            return None;
        }

        inner.size -= result.len() as u64;
        inner.highest_delivered = next - 1;
        if nullify {
            inner.low = inner.highest_delivered;
        }
        Some(result)
    }

    /// Discards all slots at or below `seqno` and raises `low`. A forced purge
    /// also drags `highest_delivered` up to the purge point (the ACK semantics
    /// of a send window). May compact the matrix when head rows emptied out or
    /// the compaction interval elapsed.
    pub fn purge(&self, seqno: Seqno, force: bool) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let mut target = min(seqno.to_raw(), inner.highest_received);
        if !force {
            target = min(target, inner.highest_delivered);
        }

        if target > inner.low {
            let highest_delivered = inner.highest_delivered;
            for s in inner.low + 1..=target {
                let (row, col) = inner.slot_of(s);
                if let Some(row_slots) = &mut inner.matrix[row] {
                    if row_slots[col].take().is_some() && s > highest_delivered {
                        inner.size -= 1;
                    }
                }
            }
            inner.low = target;
            if force && target > inner.highest_delivered {
                inner.highest_delivered = target;
            }
            inner.num_purges += 1;
        }

        let removable_rows = ((inner.low - inner.offset) as usize) / inner.msgs_per_row;
        if removable_rows > 0 || inner.last_compaction.elapsed() >= self.max_compaction_time {
            inner.compact();
        }
    }

    /// Direct indexed lookup; `None` below `low` (purged) or above
    /// `highest_received`.
    pub fn get(&self, seqno: Seqno) -> Option<T> {
        let s = seqno.to_raw();
        let inner = self.inner.lock().unwrap();
        if s <= inner.low || s > inner.highest_received {
            return None;
        }
        let (row, col) = inner.slot_of(s);
        inner.matrix[row].as_ref().and_then(|row_slots| row_slots[col].clone())
    }

    /// The ordered list of gaps in `(highest_delivered, highest_received]`,
    /// or `None` if there are no gaps.
    pub fn missing(&self) -> Option<SeqnoList> {
        let inner = self.inner.lock().unwrap();
        let mut list = SeqnoList::new();
        for s in inner.highest_delivered + 1..=inner.highest_received {
            let (row, col) = inner.slot_of(s);
            let occupied = inner.matrix[row]
                .as_ref()
                .map(|row_slots| row_slots[col].is_some())
                .unwrap_or(false);
            if !occupied {
                list.append(Seqno::from_raw(s));
            }
        }
        if list.is_empty() {
            None
        } else {
            Some(list)
        }
    }

    /// Number of gaps in `(highest_delivered, highest_received]`. O(1): the
    /// occupied-slot count is maintained incrementally.
    pub fn num_missing(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.highest_received - inner.highest_delivered - inner.size
    }

    /// The largest seqno reachable contiguously above `highest_delivered`,
    /// i.e. what a cumulative ACK may acknowledge right now.
    pub fn highest_deliverable(&self) -> Seqno {
        let inner = self.inner.lock().unwrap();
        let mut s = inner.highest_delivered;
        while s + 1 <= inner.highest_received {
            let (row, col) = inner.slot_of(s + 1);
            let occupied = inner.matrix[row]
                .as_ref()
                .map(|row_slots| row_slots[col].is_some())
                .unwrap_or(false);
            if !occupied {
                break;
            }
            s += 1;
        }
        Seqno::from_raw(s)
    }

    pub fn highest_delivered(&self) -> Seqno {
        Seqno::from_raw(self.inner.lock().unwrap().highest_delivered)
    }

    pub fn highest_received(&self) -> Seqno {
        Seqno::from_raw(self.inner.lock().unwrap().highest_received)
    }

    pub fn low(&self) -> Seqno {
        Seqno::from_raw(self.inner.lock().unwrap().low)
    }

    /// Number of elements currently stored above `highest_delivered`.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total slot capacity of the matrix in its current shape.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().matrix.len() * self.msgs_per_row
    }

    pub fn metrics(&self) -> WindowMetrics {
        let inner = self.inner.lock().unwrap();
        WindowMetrics {
            num_compactions: inner.num_compactions,
            num_moves: inner.num_moves,
            num_resizes: inner.num_resizes,
            num_purges: inner.num_purges,
        }
    }

    /// Tries to become the single deliverer of this window. True means the
    /// caller now owns the delivery right until a `remove_many` pull comes
    /// back empty (or it calls [`Window::release_processing`]).
    pub fn try_acquire_processing(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Second line of defense for delivery loops that bail out early;
    /// the regular release happens inside `remove_many`.
    pub fn release_processing(&self) {
        self.processing.store(false, Ordering::Release);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }
}

impl<T: Clone> Display for Window<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(
            f,
            "[#{} | #{} | #{}] ({} elements, {} missing)",
            inner.low,
            inner.highest_delivered,
            inner.highest_received,
            inner.size,
            inner.highest_received - inner.highest_delivered - inner.size,
        )
    }
}

impl<T> WindowInner<T> {
    fn slot_of(&self, seqno: u64) -> (usize, usize) {
        let index = (seqno - self.offset - 1) as usize;
        (index / self.msgs_per_row, index % self.msgs_per_row)
    }

    fn ensure_capacity(&mut self, seqno: u64, resize_factor: f64) {
        let needed_rows = ((seqno - self.offset - 1) as usize) / self.msgs_per_row + 1;
        if needed_rows <= self.matrix.len() {
            return;
        }
        let grown = (self.matrix.len() as f64 * resize_factor).ceil() as usize;
        let new_rows = needed_rows.max(grown);
        self.matrix.resize_with(new_rows, || None);
        self.num_resizes += 1;
    }

    /// Drops the fully-purged rows below `low` from the head of the matrix,
    /// shifting the rest left and raising `offset`. Capacity is kept by
    /// appending fresh empty rows at the tail.
    fn compact(&mut self) {
        let removable = ((self.low - self.offset) as usize) / self.msgs_per_row;
        if removable > 0 {
            self.matrix.drain(..removable);
            let moved = self.matrix.iter().filter(|row| row.is_some()).count() as u64;
            self.matrix.resize_with(self.matrix.len() + removable, || None);
            self.offset += (removable * self.msgs_per_row) as u64;
            self.num_moves += moved;
            self.num_compactions += 1;
        }
        self.last_compaction = Instant::now();
    }
}

fn empty_row<T>(len: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn window(offset: u64) -> Window<u64> {
        Window::new(
            3,
            5,
            Seqno::from_raw(offset),
            1.2,
            Duration::from_secs(600),
        )
    }

    fn add_all(win: &Window<u64>, seqnos: &[u64]) {
        for &s in seqnos {
            assert!(win.add(Seqno::from_raw(s), s), "add of #{} failed", s);
        }
    }

    #[test]
    fn test_add_and_accessors() {
        let win = window(0);
        add_all(&win, &[1, 2, 4]);

        assert_eq!(win.low(), Seqno::ZERO);
        assert_eq!(win.highest_delivered(), Seqno::ZERO);
        assert_eq!(win.highest_received(), Seqno::from_raw(4));
        assert_eq!(win.size(), 3);
        assert_eq!(win.num_missing(), 1);
        assert_eq!(win.get(Seqno::from_raw(2)), Some(2));
        assert_eq!(win.get(Seqno::from_raw(3)), None);
        assert_eq!(win.get(Seqno::from_raw(5)), None);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let win = window(0);
        add_all(&win, &[1]);
        assert!(!win.add(Seqno::from_raw(1), 11));
        assert_eq!(win.get(Seqno::from_raw(1)), Some(1));
        assert_eq!(win.size(), 1);
    }

    #[test]
    fn test_stale_add_rejected() {
        let win = window(0);
        add_all(&win, &[1, 2]);
        win.remove_many(true, 10);
        assert!(!win.add(Seqno::from_raw(2), 2));
        assert!(!win.add(Seqno::from_raw(1), 1));
    }

    #[test]
    fn test_add_respects_offset() {
        let win = window(4);
        assert!(!win.add(Seqno::from_raw(4), 4));
        assert!(win.add(Seqno::from_raw(5), 5));
        assert_eq!(win.get(Seqno::from_raw(5)), Some(5));
    }

    #[rstest]
    #[case::all(10, vec![1, 2, 3], vec![1, 2, 3])]
    #[case::bounded(2, vec![1, 2, 3], vec![1, 2])]
    #[case::stops_at_gap(10, vec![1, 2, 4], vec![1, 2])]
    fn test_remove_many(#[case] max: usize, #[case] seqnos: Vec<u64>, #[case] expected: Vec<u64>) {
        let win = window(0);
        add_all(&win, &seqnos);
        assert!(win.try_acquire_processing());

        assert_eq!(win.remove_many(true, max), Some(expected.clone()));
        assert_eq!(win.highest_delivered(), Seqno::from_raw(*expected.last().unwrap()));
        assert!(win.is_processing(), "latch must stay on a non-empty pull");
    }

    #[test]
    fn test_remove_many_releases_latch_when_empty() {
        let win = window(0);
        assert!(win.try_acquire_processing());
        assert!(!win.try_acquire_processing());

        assert_eq!(win.remove_many(true, 10), None);
        assert!(!win.is_processing());
        assert!(win.try_acquire_processing());
    }

    #[test]
    fn test_remove_many_max_zero_releases_latch() {
        let win = window(0);
        add_all(&win, &[1]);
        assert!(win.try_acquire_processing());
        assert_eq!(win.remove_many(true, 0), None);
        assert!(!win.is_processing());
    }

    #[test]
    fn test_purge_then_get_returns_none() {
        let win = window(0);
        add_all(&win, &[1, 2, 3, 4]);
        win.remove_many(true, 10);
        win.purge(Seqno::from_raw(3), false);

        for s in 1..=3 {
            assert_eq!(win.get(Seqno::from_raw(s)), None);
        }
        assert_eq!(win.get(Seqno::from_raw(4)), None); // nullified by remove_many
    }

    #[test]
    fn test_forced_purge_bumps_highest_delivered() {
        let win = window(0);
        add_all(&win, &[1, 2, 3, 4, 5]);

        win.purge(Seqno::from_raw(3), true);
        assert_eq!(win.highest_delivered(), Seqno::from_raw(3));
        assert_eq!(win.low(), Seqno::from_raw(3));
        assert_eq!(win.size(), 2);
        assert_eq!(win.get(Seqno::from_raw(3)), None);
        assert_eq!(win.get(Seqno::from_raw(4)), Some(4));
    }

    #[test]
    fn test_unforced_purge_stops_at_highest_delivered() {
        let win = window(0);
        add_all(&win, &[1, 2, 3]);
        win.remove_many(true, 2); // hd = 2

        win.purge(Seqno::from_raw(3), false);
        assert_eq!(win.highest_delivered(), Seqno::from_raw(2));
        assert_eq!(win.get(Seqno::from_raw(3)), Some(3));
    }

    #[test]
    fn test_resize_keeps_prior_values_readable() {
        let win = window(0);
        let capacity = win.capacity() as u64; // 15
        add_all(&win, &(1..=capacity).collect::<Vec<_>>());

        assert!(win.add(Seqno::from_raw(capacity + 1), capacity + 1));
        assert!(win.capacity() > capacity as usize);
        assert_eq!(win.metrics().num_resizes, 1);
        for s in 1..=capacity + 1 {
            assert_eq!(win.get(Seqno::from_raw(s)), Some(s));
        }
    }

    #[test]
    fn test_compaction_after_purge() {
        let win = window(0);
        add_all(&win, &(1..=12).collect::<Vec<_>>());

        win.purge(Seqno::from_raw(10), true); // two full rows (1-5, 6-10) purgeable
        let metrics = win.metrics();
        assert_eq!(metrics.num_purges, 1);
        assert_eq!(metrics.num_compactions, 1);

        // remaining values readable after the shift, and the window keeps working
        assert_eq!(win.get(Seqno::from_raw(11)), Some(11));
        assert_eq!(win.get(Seqno::from_raw(12)), Some(12));
        assert_eq!(win.get(Seqno::from_raw(7)), None);
        assert!(win.add(Seqno::from_raw(13), 13));
        assert_eq!(win.get(Seqno::from_raw(13)), Some(13));
        assert_eq!(win.capacity(), 15);
    }

    #[test]
    fn test_missing_list() {
        let win = window(0);
        add_all(&win, &[1, 3, 4, 7]);

        let missing = win.missing().unwrap();
        assert_eq!(
            missing.iter().map(|s| s.to_raw()).collect::<Vec<_>>(),
            vec![2, 5, 6]
        );
        assert_eq!(win.num_missing(), 3);
    }

    #[test]
    fn test_no_missing() {
        let win = window(0);
        add_all(&win, &[1, 2]);
        assert!(win.missing().is_none());
        assert_eq!(win.num_missing(), 0);
    }

    #[rstest]
    #[case::contiguous(vec![1, 2, 3], 3)]
    #[case::gap(vec![1, 2, 4], 2)]
    #[case::leading_gap(vec![2, 3], 0)]
    #[case::empty(vec![], 0)]
    fn test_highest_deliverable(#[case] seqnos: Vec<u64>, #[case] expected: u64) {
        let win = window(0);
        add_all(&win, &seqnos);
        assert_eq!(win.highest_deliverable(), Seqno::from_raw(expected));
    }

    #[test]
    fn test_highest_delivered_never_exceeds_highest_received() {
        let win = window(0);
        add_all(&win, &[1, 2, 3]);
        win.remove_many(true, 10);
        win.purge(Seqno::from_raw(99), true);
        assert!(win.highest_delivered() <= win.highest_received());
    }

    #[test]
    fn test_num_missing_matches_gap_count_after_churn() {
        let win = window(0);
        add_all(&win, &[1, 4, 5, 9]);
        assert_eq!(win.num_missing(), 5); // 2, 3, 6, 7, 8

        add_all(&win, &[2, 3]);
        assert_eq!(win.num_missing(), 3);

        win.remove_many(true, 10); // delivers 1..=5
        assert_eq!(win.num_missing(), 3);

        add_all(&win, &[6, 7, 8]);
        assert_eq!(win.num_missing(), 0);
    }
}
