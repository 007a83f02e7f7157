//! Outbound payload budgeting.

use crate::{constants::GATEWAY_SEND_LIMIT, gateway::frame::GatewayFrame};
use std::collections::VecDeque;
use tracing::debug;

/// Budgets outbound frames to stay under the gateway's per-window cap.
///
/// The gateway tears down connections which exceed its payload cap, so
/// ordinary traffic is deferred once the window's budget is spent.
/// Heartbeats and handshake frames skip the check but still count, keeping
/// the tally honest against the server's own accounting.
///
/// The owning connection task drives the window clock; this type only
/// keeps the tally and the deferred queue.
pub(crate) struct PayloadLimiter {
    sent: usize,
    deferred: VecDeque<GatewayFrame>,
}

impl PayloadLimiter {
    pub(crate) fn new() -> Self {
        Self {
            sent: 0,
            deferred: VecDeque::new(),
        }
    }

    /// Admits a frame for sending now, or defers it to the next window.
    pub(crate) fn admit(&mut self, frame: GatewayFrame, forced: bool) -> Option<GatewayFrame> {
        if forced || self.sent < GATEWAY_SEND_LIMIT {
            self.sent += 1;
            Some(frame)
        } else {
            debug!("Payload budget exhausted; deferring {} frame.", frame.op);
            self.deferred.push_back(frame);
            None
        }
    }

    /// Opens a fresh window, releasing as many deferred frames as now fit.
    ///
    /// Frames are released oldest-first; any beyond the fresh budget stay
    /// deferred for the window after.
    pub(crate) fn on_reset(&mut self) -> Vec<GatewayFrame> {
        self.sent = 0;

        let mut released = Vec::new();
        while self.sent < GATEWAY_SEND_LIMIT {
            match self.deferred.pop_front() {
                Some(frame) => {
                    self.sent += 1;
                    released.push(frame);
                },
                None => break,
            }
        }

        released
    }

    /// Discards all budgeting state. Used when the socket is replaced.
    pub(crate) fn clear(&mut self) {
        self.sent = 0;
        self.deferred.clear();
    }

    #[cfg(test)]
    fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}
