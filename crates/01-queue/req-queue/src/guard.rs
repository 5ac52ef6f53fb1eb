//! Remove-lock style lifecycle gate.
//!
//! The guard packs an in-flight counter and a draining flag into one atomic
//! word:
//!
//! ```text
//! bit 31        bits 0..31
//! [draining]    [active token count]
//! ```
//!
//! Any number of [`GuardToken`]s may be outstanding while the flag is clear.
//! Once a drain is requested the flag is set before anything else, so no new
//! token can be issued, and the drainer parks on the word until the count
//! reaches zero. The flag is never cleared: a drained guard stays closed and a
//! new session builds a new guard.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use crate::wait::{wait_u32, wake_all};

const DRAINING: u32 = 1 << 31;
const COUNT_MASK: u32 = DRAINING - 1;

/// Returned by [`LifecycleGuard::try_enter`] once a drain has begun.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejected;

pub struct LifecycleGuard {
    state: AtomicU32,
    max_in_flight: u32,
}

impl LifecycleGuard {
    /// Creates an open guard with no outstanding tokens.
    ///
    /// `max_in_flight` is raised to at least one token.
    pub fn new(max_in_flight: u32) -> Self {
        Self {
            state: AtomicU32::new(0),
            max_in_flight: max_in_flight.clamp(1, COUNT_MASK),
        }
    }

    /// Creates an open guard that already carries one long-lived token.
    ///
    /// The returned [`SessionHold`] represents "the session is servicing
    /// requests" and is what [`LifecycleGuard::release_and_wait`] gives back.
    /// The hold does not count against `max_in_flight`.
    pub fn armed(max_in_flight: u32) -> (Self, SessionHold) {
        let guard = Self {
            state: AtomicU32::new(1),
            max_in_flight: max_in_flight.clamp(1, COUNT_MASK - 1) + 1,
        };
        (guard, SessionHold { _private: () })
    }

    /// Issues a token unless a drain is in progress. Never blocks.
    pub fn try_enter(&self) -> Result<GuardToken<'_>, Rejected> {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current & DRAINING != 0 {
                return Err(Rejected);
            }
            debug_assert!(
                current & COUNT_MASK < self.max_in_flight,
                "lifecycle guard exceeded {} in-flight tokens",
                self.max_in_flight
            );
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(GuardToken { guard: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Closes the guard and blocks until every outstanding token is gone.
    ///
    /// Supported once per guard.
    pub fn begin_drain_and_wait(&self) {
        self.close();
        self.wait_idle();
    }

    /// Closes the guard, gives back the session's own token and waits for the
    /// remaining tokens to drain.
    pub fn release_and_wait(&self, hold: SessionHold) {
        self.close();
        let SessionHold { _private: () } = hold;
        self.exit();
        self.wait_idle();
    }

    /// Number of tokens currently outstanding.
    pub fn active(&self) -> u32 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    pub fn is_draining(&self) -> bool {
        self.state.load(Ordering::Acquire) & DRAINING != 0
    }

    fn close(&self) {
        let prev = self.state.fetch_or(DRAINING, Ordering::AcqRel);
        debug_assert!(prev & DRAINING == 0, "lifecycle guard drained twice");
    }

    fn exit(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & COUNT_MASK != 0, "lifecycle guard token underflow");
        if prev == DRAINING | 1 {
            wake_all(&self.state);
        }
    }

    fn wait_idle(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current & COUNT_MASK == 0 {
                return;
            }
            wait_u32(&self.state, current);
        }
    }
}

/// Proof of one in-flight operation. Dropping it exits the guard.
#[must_use = "dropping the token exits the guard immediately"]
pub struct GuardToken<'a> {
    guard: &'a LifecycleGuard,
}

impl GuardToken<'_> {
    /// Exits the guard explicitly; equivalent to dropping the token.
    pub fn exit(self) {}
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.exit();
    }
}

/// The long-lived token a connected session keeps on its guard.
///
/// It can only be handed back through [`LifecycleGuard::release_and_wait`];
/// forgetting it leaves the guard impossible to drain.
#[must_use = "a session hold must be released with `release_and_wait`"]
#[derive(Debug)]
pub struct SessionHold {
    _private: (),
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tokens_count_in_and_out() {
        let guard = LifecycleGuard::new(8);
        let a = guard.try_enter().expect("open");
        let b = guard.try_enter().expect("open");
        assert_eq!(guard.active(), 2);
        a.exit();
        drop(b);
        assert_eq!(guard.active(), 0);
    }

    #[test]
    fn session_hold_does_not_consume_in_flight_budget() {
        let (guard, hold) = LifecycleGuard::armed(1);
        let token = guard.try_enter().expect("one operation fits beside the hold");
        assert_eq!(guard.active(), 2);
        drop(token);
        guard.release_and_wait(hold);
        assert_eq!(guard.active(), 0);
    }

    #[test]
    fn zero_budget_still_admits_one_token() {
        let guard = LifecycleGuard::new(0);
        let token = guard.try_enter().expect("open");
        assert_eq!(guard.active(), 1);
        token.exit();
    }

    #[test]
    fn drain_on_idle_guard_returns_and_closes() {
        let guard = LifecycleGuard::new(8);
        guard.begin_drain_and_wait();
        assert!(guard.is_draining());
        assert_eq!(guard.try_enter().err(), Some(Rejected));
    }

    #[test]
    fn drain_waits_for_outstanding_token() {
        let (guard, hold) = LifecycleGuard::armed(8);
        let guard = Arc::new(guard);
        let entered = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicBool::new(false));

        let worker = {
            let guard = Arc::clone(&guard);
            let entered = Arc::clone(&entered);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let token = guard.try_enter().expect("guard open");
                entered.wait();
                thread::sleep(Duration::from_millis(50));
                released.store(true, std::sync::atomic::Ordering::SeqCst);
                drop(token);
            })
        };

        entered.wait();
        guard.release_and_wait(hold);
        assert!(
            released.load(std::sync::atomic::Ordering::SeqCst),
            "drain returned before the in-flight token exited"
        );
        assert_eq!(guard.active(), 0);
        assert!(guard.try_enter().is_err());
        worker.join().expect("worker");
    }

    #[test]
    fn no_token_issued_once_draining() {
        let guard = Arc::new(LifecycleGuard::new(u32::MAX));
        let token = guard.try_enter().expect("open");

        let drainer = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || guard.begin_drain_and_wait())
        };

        while !guard.is_draining() {
            thread::yield_now();
        }
        assert!(guard.try_enter().is_err());
        drop(token);
        drainer.join().expect("drainer");
        assert_eq!(guard.active(), 0);
    }
}
