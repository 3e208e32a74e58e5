//! # Transmit Train Scheduler
//!
//! Per-destination batching of outbound payloads under debounce/retention
//! constraints. One `TrainScheduler` is owned per destination: a
//! connected client endpoint owns exactly one, a server endpoint owns one
//! per remote peer.
//!
//! This module is transport-agnostic: it only manipulates byte buffers and
//! timestamps. The endpoint layer is responsible for actually writing
//! `SendQueue` entries to a socket and calling back into `on_write_complete`
//! to keep pacing state current.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TimingRequirement;
use crate::wire;

/// A single queued-for-write unit: an already-serialized buffer plus the
/// separation time that must elapse before the next send to the same
/// destination.
#[derive(Debug, Clone)]
pub struct SendQueueEntry {
    pub buffer: Arc<Vec<u8>>,
    pub separation_time_us: u32,
}

/// A passenger identity: the `(service, method)` pair admitted into a train.
pub type Passenger = (u16, u16);

/// Staging object per destination.
#[derive(Debug)]
struct Train {
    buffer: Vec<u8>,
    passengers: HashSet<Passenger>,
    minimal_debounce_time: Duration,
    minimal_max_retention_time: Duration,
    departure: Instant,
}

impl Train {
    fn new(departure: Instant) -> Self {
        Self {
            buffer: Vec::new(),
            passengers: HashSet::new(),
            minimal_debounce_time: Duration::MAX,
            minimal_max_retention_time: Duration::MAX,
            departure,
        }
    }

    fn has_passenger(&self, passenger: Passenger) -> bool {
        self.passengers.contains(&passenger)
    }
}

/// Total order over (departure instant, FIFO sequence); this is what makes
/// "ties broken FIFO" a structural property rather than an
/// incidental one, since two `Instant`s taken microseconds apart could
/// otherwise compare equal on coarse clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DepartureKey(Instant, u64);

/// Outcome of a `submit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Payload admitted into the current (or a freshly opened) train.
    Admitted,
    /// Payload admitted as a standalone, immediately-dispatched TP segment.
    AdmittedAsSegment,
    /// Queue limit would be exceeded; no side effects occurred.
    QueueLimitExceeded,
    /// Oversize payload and TP is not configured for it.
    MessageTooBig,
    /// `prepare_stop` is in effect for this payload's service.
    Stopping,
}

/// Per-destination transmit scheduler.
pub struct TrainScheduler {
    queue_limit: usize,
    current: Option<Train>,
    dispatched: BTreeMap<DepartureKey, Train>,
    next_seq: u64,
    send_queue: VecDeque<SendQueueEntry>,
    queue_size: usize,
    last_departure: Option<Instant>,
    last_sent: Option<Instant>,
    pending_separation_us: u32,
    stopping_all: bool,
    stopping_services: HashSet<u16>,
}

impl TrainScheduler {
    pub fn new(queue_limit: usize) -> Self {
        Self {
            queue_limit,
            current: None,
            dispatched: BTreeMap::new(),
            next_seq: 0,
            send_queue: VecDeque::new(),
            queue_size: 0,
            last_departure: None,
            last_sent: None,
            pending_separation_us: 0,
            stopping_all: false,
            stopping_services: HashSet::new(),
        }
    }

    /// Sum of bytes already on the send queue, still staged in the current
    /// train, and held in dispatched-but-undrained trains. This is the
    /// quantity the queue-limit check is evaluated against.
    pub fn pending_bytes(&self) -> usize {
        let train_bytes: usize = self.current.as_ref().map_or(0, |t| t.buffer.len());
        let dispatched_bytes: usize = self.dispatched.values().map(|t| t.buffer.len()).sum();
        self.queue_size + train_bytes + dispatched_bytes
    }

    fn would_exceed_queue_limit(&self, additional: usize) -> bool {
        self.queue_limit != 0 && self.pending_bytes() + additional > self.queue_limit
    }

    /// Implements `prepare_stop`. `service = None` stops admission for every
    /// service (`prepare_stop(ANY)`).
    pub fn prepare_stop(&mut self, service: Option<u16>) {
        match service {
            Some(s) => {
                self.stopping_services.insert(s);
            }
            None => self.stopping_all = true,
        }
    }

    /// True once no queued buffer's header names `service` (or, for
    /// `service = None`, once the queue is entirely empty). The caller
    /// invokes its completion handler when this flips to `true`.
    pub fn drain_complete(&self, service: Option<u16>) -> bool {
        match service {
            None => self.send_queue.is_empty() && self.current.is_none() && self.dispatched.is_empty(),
            Some(s) => {
                let queue_clear = self
                    .send_queue
                    .iter()
                    .all(|e| wire::service_id(&e.buffer) != Some(s));
                let train_clear = self
                    .current
                    .as_ref()
                    .map_or(true, |t| !t.passengers.iter().any(|(svc, _)| *svc == s));
                let dispatched_clear = self
                    .dispatched
                    .values()
                    .all(|t| !t.passengers.iter().any(|(svc, _)| *svc == s));
                queue_clear && train_clear && dispatched_clear
            }
        }
    }

    /// Admits a normal (non-oversize) payload into the current or a freshly
    /// opened train (TP segments are handled separately by
    /// `submit_segment`).
    pub fn submit(&mut self, payload: Vec<u8>, timing: TimingRequirement, max_message_size: usize, now: Instant) -> SubmitOutcome {
        let service = match wire::service_id(&payload) {
            Some(s) => s,
            None => return SubmitOutcome::MessageTooBig,
        };
        let method = wire::method_id(&payload).unwrap_or(0);
        let passenger = (service, method);

        if self.stopping_all || self.stopping_services.contains(&service) {
            return SubmitOutcome::Stopping;
        }

        if self.would_exceed_queue_limit(payload.len()) {
            return SubmitOutcome::QueueLimitExceeded;
        }

        if payload.len() > max_message_size {
            return SubmitOutcome::MessageTooBig;
        }

        // Decide whether the current train must depart before this payload
        // can be admitted at all.
        let must_depart = match &self.current {
            None => false,
            Some(train) => {
                train.has_passenger(passenger)
                    || train.buffer.len() + payload.len() > max_message_size
                    || timing.debounce_time > train.minimal_max_retention_time
                    || now + timing.debounce_time > train.departure
                    || timing.max_retention_time < train.minimal_debounce_time
            }
        };

        if must_depart {
            self.finalize_current_train(now);
        }

        let train = self.current.get_or_insert_with(|| Train::new(now + timing.max_retention_time));

        if !must_depart {
            // Shrink departure toward now + max_retention if that's earlier.
            let candidate = now + timing.max_retention_time;
            if candidate < train.departure {
                train.departure = candidate;
            }
        }

        train.buffer.extend_from_slice(&payload);
        train.passengers.insert(passenger);
        train.minimal_debounce_time = train.minimal_debounce_time.min(timing.debounce_time);
        train.minimal_max_retention_time = train.minimal_max_retention_time.min(timing.max_retention_time);

        SubmitOutcome::Admitted
    }

    /// Admits a pre-built TP segment (the "bypass batching entirely"
    /// branch): segments bypass batching entirely and become their own
    /// single-passenger train that departs immediately.
    pub fn submit_segment(&mut self, bytes: Vec<u8>, separation_time_us: u32, now: Instant) -> SubmitOutcome {
        let service = match wire::service_id(&bytes) {
            Some(s) => s,
            None => return SubmitOutcome::MessageTooBig,
        };
        if self.stopping_all || self.stopping_services.contains(&service) {
            return SubmitOutcome::Stopping;
        }
        if self.would_exceed_queue_limit(bytes.len()) {
            return SubmitOutcome::QueueLimitExceeded;
        }

        self.queue_size += bytes.len();
        self.send_queue.push_back(SendQueueEntry {
            buffer: Arc::new(bytes),
            separation_time_us,
        });
        SubmitOutcome::AdmittedAsSegment
    }

    /// Moves the current train onto the dispatched-trains map, applying the
    /// debounce-between-trains clamp and updating `last_departure` for the
    /// *next* train (debounce enforcement between trains).
    fn finalize_current_train(&mut self, _now: Instant) {
        if let Some(mut train) = self.current.take() {
            if let Some(last) = self.last_departure {
                let floor = last + train.minimal_debounce_time;
                if floor > train.departure {
                    train.departure = floor;
                }
            }
            self.last_departure = Some(train.departure);
            let key = DepartureKey(train.departure, self.next_seq);
            self.next_seq += 1;
            self.dispatched.insert(key, train);
        }
    }

    /// Earliest departure among the current train and all dispatched
    /// trains; the endpoint layer uses this to (re)arm its dispatch timer
    /// (the endpoint layer's dispatch timer).
    pub fn next_wakeup(&self) -> Option<Instant> {
        let dispatched_min = self.dispatched.keys().next().map(|k| k.0);
        let current_min = self.current.as_ref().map(|t| t.departure);
        match (dispatched_min, current_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Promotes every train (current included) whose departure is `<= now`
    /// onto the send queue, in departure order with FIFO tie-breaking
    /// (departure order with FIFO tie-breaking).
    pub fn dispatch(&mut self, now: Instant) {
        if let Some(train) = &self.current {
            if train.departure <= now {
                self.finalize_current_train(now);
            }
        }

        let ready_keys: Vec<DepartureKey> = self
            .dispatched
            .range(..=DepartureKey(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();

        for key in ready_keys {
            if let Some(train) = self.dispatched.remove(&key) {
                self.queue_size += train.buffer.len();
                self.send_queue.push_back(SendQueueEntry {
                    buffer: Arc::new(train.buffer),
                    separation_time_us: 0,
                });
            }
        }
    }

    /// Pops the next entry ready to be written, honoring the TP pacing
    /// delay left over from the previous send (pacing for TP
    /// segments). Returns `None` if the queue is empty or the pacing
    /// window hasn't elapsed yet.
    pub fn pop_ready(&mut self, now: Instant) -> Option<SendQueueEntry> {
        if let (Some(last_sent), sep) = (self.last_sent, self.pending_separation_us) {
            if sep > 0 {
                let ready_at = last_sent + Duration::from_micros(sep as u64);
                if now < ready_at {
                    return None;
                }
            }
        }
        let entry = self.send_queue.pop_front()?;
        self.queue_size -= entry.buffer.len();
        Some(entry)
    }

    /// Recorded by the endpoint once the popped entry has actually been
    /// written to the socket, arming the pacing window for the next pop.
    pub fn on_write_complete(&mut self, entry: &SendQueueEntry, at: Instant) {
        self.last_sent = Some(at);
        self.pending_separation_us = entry.separation_time_us;
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(service: u16, method: u16, extra: usize) -> Vec<u8> {
        let mut buf = vec![0u8; wire::HEADER_LENGTH + extra];
        buf[0..2].copy_from_slice(&service.to_be_bytes());
        buf[2..4].copy_from_slice(&method.to_be_bytes());
        let length = (wire::HEADER_LENGTH - 8 + extra) as u32;
        buf[4..8].copy_from_slice(&length.to_be_bytes());
        buf
    }

    #[test]
    fn queue_size_tracks_sum_of_buffers() {
        let mut sched = TrainScheduler::new(0);
        let now = Instant::now();
        let timing = TimingRequirement {
            debounce_time: Duration::from_millis(0),
            max_retention_time: Duration::from_millis(0),
        };
        sched.submit(payload(1, 1, 10), timing, 1 << 20, now);
        sched.dispatch(now + Duration::from_millis(1));
        assert_eq!(sched.queue_size(), wire::HEADER_LENGTH + 10);
        sched.pop_ready(now + Duration::from_millis(2));
        assert_eq!(sched.queue_size(), 0);
    }

    #[test]
    fn debounce_batches_two_payloads_into_one_train() {
        // Two distinct passengers sharing the same debounce/retention class
        // get concatenated into a single departure. A second occurrence of
        // the *same* passenger is covered separately below, since that case
        // forces an early split rather than batching.
        let mut sched = TrainScheduler::new(0);
        let now = Instant::now();
        let timing = TimingRequirement {
            debounce_time: Duration::from_millis(50),
            max_retention_time: Duration::from_millis(200),
        };

        sched.submit(payload(7, 1, 4), timing, 1 << 20, now);
        sched.submit(
            payload(7, 2, 4),
            timing,
            1 << 20,
            now + Duration::from_millis(10),
        );

        // Not yet departed at t=40ms.
        sched.dispatch(now + Duration::from_millis(40));
        assert!(!sched.has_pending_send());

        // By t=210ms (>= max_retention from the first submit) it must have departed.
        sched.dispatch(now + Duration::from_millis(210));
        assert!(sched.has_pending_send());
        let entry = sched.pop_ready(now + Duration::from_millis(210)).unwrap();
        // Two payloads of (header + 4 bytes) concatenated.
        assert_eq!(entry.buffer.len(), 2 * (wire::HEADER_LENGTH + 4));
    }

    #[test]
    fn same_passenger_twice_splits_into_two_trains() {
        // A second occurrence of an already-admitted passenger cannot join
        // the same train; it starts a fresh train instead. Neither train's
        // own retention deadline is accelerated by the split — each still
        // departs on its own schedule, so the two payloads are delivered as
        // two separate sends rather than concatenated into one.
        let mut sched = TrainScheduler::new(0);
        let now = Instant::now();
        let timing = TimingRequirement {
            debounce_time: Duration::from_millis(5),
            max_retention_time: Duration::from_millis(10),
        };

        sched.submit(payload(9, 2, 0), timing, 1 << 20, now);
        sched.submit(payload(9, 2, 0), timing, 1 << 20, now);

        // Nothing is due yet.
        sched.dispatch(now);
        assert!(!sched.has_pending_send());

        // Once both trains' retention deadlines pass, both are promoted.
        let later = now + Duration::from_millis(20);
        sched.dispatch(later);
        let first = sched.pop_ready(later).expect("first train ready");
        let second = sched.pop_ready(later).expect("second train ready");
        assert_eq!(first.buffer.len(), wire::HEADER_LENGTH);
        assert_eq!(second.buffer.len(), wire::HEADER_LENGTH);
    }

    #[test]
    fn queue_limit_boundary() {
        let entry_len = wire::HEADER_LENGTH;
        let mut sched = TrainScheduler::new(entry_len);
        let now = Instant::now();
        let timing = TimingRequirement {
            debounce_time: Duration::from_millis(0),
            max_retention_time: Duration::from_millis(0),
        };
        assert_eq!(
            sched.submit(payload(1, 1, 0), timing, 1 << 20, now),
            SubmitOutcome::Admitted
        );
        sched.dispatch(now);
        // A second payload would put total pending bytes over the limit.
        assert_eq!(
            sched.submit(payload(1, 1, 0), timing, 1 << 20, now),
            SubmitOutcome::QueueLimitExceeded
        );
    }

    #[test]
    fn prepare_stop_rejects_named_service() {
        let mut sched = TrainScheduler::new(0);
        let now = Instant::now();
        let timing = TimingRequirement {
            debounce_time: Duration::from_millis(0),
            max_retention_time: Duration::from_millis(0),
        };
        sched.prepare_stop(Some(5));
        assert_eq!(
            sched.submit(payload(5, 1, 0), timing, 1 << 20, now),
            SubmitOutcome::Stopping
        );
        assert_eq!(
            sched.submit(payload(6, 1, 0), timing, 1 << 20, now),
            SubmitOutcome::Admitted
        );
    }

    #[test]
    fn segment_pacing_delays_next_pop() {
        let mut sched = TrainScheduler::new(0);
        let now = Instant::now();
        sched.submit_segment(payload(1, 1, 0), 1000, now);
        sched.submit_segment(payload(1, 1, 0), 1000, now);

        let first = sched.pop_ready(now).unwrap();
        sched.on_write_complete(&first, now);

        // Immediately after, pacing should block the next pop.
        assert!(sched.pop_ready(now).is_none());
        assert!(sched
            .pop_ready(now + Duration::from_micros(1000))
            .is_some());
    }
}
