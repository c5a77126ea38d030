/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Deadline-based keep alive primitives.  Nothing here spawns timers; the protocol state polls
these values during service passes and asks for the earliest deadline when computing how long
the containing event loop may sleep.
 */

use std::time::{Duration, Instant};

/// Outcome of a pinger service tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PingerEvent {

    /// Nothing to do yet
    None,

    /// The interval elapsed after a reset; a PINGREQ should be sent to provoke broker activity
    SendPingreq,

    /// The interval elapsed twice with no reset in between; the broker is presumed dead
    TimedOut,
}

/// Tracks one direction of keep alive liveness.
///
/// `reset` must be called at least once per keep alive interval (from any successful transport
/// activity in the tracked direction) or the next tick after an un-reset expiry is interpreted
/// as a dead peer.
pub(crate) struct Pinger {
    interval: Option<Duration>,
    is_reset: bool,
    deadline: Option<Instant>,
}

impl Pinger {

    /// Creates a new pinger.  A zero keep alive interval disables it entirely.
    pub fn new(keep_alive_interval_seconds: u16) -> Self {
        let interval =
            if keep_alive_interval_seconds > 0 {
                Some(Duration::from_secs(keep_alive_interval_seconds as u64))
            } else {
                None
            };

        Pinger {
            interval,
            is_reset: false,
            deadline: None,
        }
    }

    /// Marks activity and re-arms the interval deadline.  Safe to call at any time.
    pub fn reset(&mut self, now: Instant) {
        self.is_reset = true;
        self.deadline = self.interval.map(|interval| now + interval);
    }

    /// Disarms the pinger without rescheduling.  Safe to call repeatedly and after expiry.
    pub fn cancel(&mut self) {
        self.is_reset = false;
        self.deadline = None;
    }

    /// Checks the pinger against the current time, advancing its internal state when the
    /// deadline has been reached.
    pub fn tick(&mut self, now: Instant) -> PingerEvent {
        let Some(deadline) = self.deadline else {
            return PingerEvent::None;
        };

        if now < deadline {
            return PingerEvent::None;
        }

        if !self.is_reset {
            return PingerEvent::TimedOut;
        }

        self.is_reset = false;
        self.deadline = self.interval.map(|interval| now + interval);

        PingerEvent::SendPingreq
    }

    /// Earliest point in time the pinger needs to be ticked again, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// One-shot cancellable deadline used to bound the CONNECT handshake.
pub(crate) struct Timeout {
    deadline: Option<Instant>,
}

impl Timeout {

    pub fn new_unarmed() -> Self {
        Timeout {
            deadline: None,
        }
    }

    /// Arms the timeout at the given deadline, replacing any previous one.
    pub fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Disarms the timeout.  Safe to call repeatedly and after expiry.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinger_sends_pingreq_on_expiry_after_reset() {
        let start = Instant::now();
        let mut pinger = Pinger::new(10);

        pinger.reset(start);
        assert_eq!(PingerEvent::None, pinger.tick(start));
        assert_eq!(PingerEvent::None, pinger.tick(start + Duration::from_secs(9)));

        assert_eq!(PingerEvent::SendPingreq, pinger.tick(start + Duration::from_secs(10)));
    }

    #[test]
    fn pinger_times_out_on_second_expiry_without_reset() {
        let start = Instant::now();
        let mut pinger = Pinger::new(10);

        pinger.reset(start);
        assert_eq!(PingerEvent::SendPingreq, pinger.tick(start + Duration::from_secs(10)));

        // no reset arrives before the next interval elapses
        assert_eq!(PingerEvent::None, pinger.tick(start + Duration::from_secs(15)));
        assert_eq!(PingerEvent::TimedOut, pinger.tick(start + Duration::from_secs(20)));
    }

    #[test]
    fn pinger_reset_between_expiries_stays_alive() {
        let start = Instant::now();
        let mut pinger = Pinger::new(10);

        pinger.reset(start);
        assert_eq!(PingerEvent::SendPingreq, pinger.tick(start + Duration::from_secs(10)));

        // pingresp (or any inbound activity) resets before the next expiry
        pinger.reset(start + Duration::from_secs(11));

        assert_eq!(PingerEvent::None, pinger.tick(start + Duration::from_secs(20)));
        assert_eq!(PingerEvent::SendPingreq, pinger.tick(start + Duration::from_secs(21)));
    }

    #[test]
    fn pinger_zero_interval_never_fires() {
        let start = Instant::now();
        let mut pinger = Pinger::new(0);

        pinger.reset(start);
        assert_eq!(None, pinger.next_deadline());
        assert_eq!(PingerEvent::None, pinger.tick(start + Duration::from_secs(1000000)));
    }

    #[test]
    fn pinger_cancel_is_idempotent() {
        let start = Instant::now();
        let mut pinger = Pinger::new(10);

        pinger.reset(start);
        pinger.cancel();
        pinger.cancel();

        assert_eq!(None, pinger.next_deadline());
        assert_eq!(PingerEvent::None, pinger.tick(start + Duration::from_secs(100)));
    }

    #[test]
    fn timeout_expiry_and_cancel() {
        let start = Instant::now();
        let mut timeout = Timeout::new_unarmed();

        assert!(!timeout.expired(start + Duration::from_secs(1000)));

        timeout.arm(start + Duration::from_secs(30));
        assert!(!timeout.expired(start + Duration::from_secs(29)));
        assert!(timeout.expired(start + Duration::from_secs(30)));

        // cancel after expiry is safe and disarms
        timeout.cancel();
        timeout.cancel();
        assert!(!timeout.expired(start + Duration::from_secs(1000)));
    }
}
