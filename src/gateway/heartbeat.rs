//! Heartbeat scheduling and acknowledgement watching.

use std::time::Duration;
use tokio::time::Instant;

/// Schedules keepalive beats and watches for their acknowledgements.
///
/// At most one beat is in flight at a time. A beat left unacknowledged for
/// a full interval marks the connection as dead; the connection task reads
/// [`ack_deadline`] to know when to give up on the socket.
///
/// [`ack_deadline`]: Heartbeat::ack_deadline
pub(crate) struct Heartbeat {
    interval: Duration,
    next_beat: Instant,
    ack_deadline: Option<Instant>,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl Heartbeat {
    /// Starts a schedule for the interval the gateway announced.
    ///
    /// The first beat lands at a random point within one interval, so that
    /// clients reconnecting en masse do not beat in lockstep.
    pub(crate) fn new(interval: Duration) -> Self {
        let jitter = interval.mul_f64(rand::random::<f64>());

        Self {
            interval,
            next_beat: Instant::now() + jitter,
            ack_deadline: None,
            last_sent: None,
            latency: None,
        }
    }

    /// Deadline of the next scheduled beat.
    pub(crate) fn next_beat(&self) -> Instant {
        self.next_beat
    }

    /// Deadline by which the outstanding beat must be acknowledged, if one
    /// is in flight.
    pub(crate) fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    /// Marks the scheduled beat as due.
    ///
    /// Returns whether a beat should actually be sent. While an earlier
    /// beat is still unacknowledged the slot is skipped, leaving the ack
    /// deadline to decide the connection's fate.
    pub(crate) fn fire(&mut self) -> bool {
        let now = Instant::now();
        self.next_beat = now + self.interval;

        if self.ack_deadline.is_some() {
            return false;
        }

        self.last_sent = Some(now);
        self.ack_deadline = Some(now + self.interval);
        true
    }

    /// Records a beat sent outside the schedule, as when the gateway asks
    /// for one directly. The regular schedule is left untouched.
    pub(crate) fn fire_forced(&mut self) {
        if self.ack_deadline.is_none() {
            let now = Instant::now();
            self.last_sent = Some(now);
            self.ack_deadline = Some(now + self.interval);
        }
    }

    /// Processes an acknowledgement, returning the measured round-trip
    /// latency. An acknowledgement with no beat in flight is ignored.
    pub(crate) fn ack(&mut self) -> Option<Duration> {
        self.ack_deadline.take()?;

        let latency = self.last_sent.map(|sent| sent.elapsed());
        if latency.is_some() {
            self.latency = latency;
        }

        latency
    }

    /// Latency measured on the most recently acknowledged beat.
    pub(crate) fn latency(&self) -> Option<Duration> {
        self.latency
    }
}
