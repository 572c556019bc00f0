//! # DisposableRequest engine module
//!
//! This module implements the retry/backoff/poll state machine for
//! `DisposableRequest`: a resource that issues a single http call, retries
//! it up to a configurable limit (or forever, when looping infinitely)
//! until the response satisfies its up-to-date check, then either stops or
//! keeps polling on an interval.

use chrono::{DateTime, Duration, Utc};

use crate::svc::capabilities::RollbackAware;

// -----------------------------------------------------------------------------
// Outcome enumeration

/// what the engine decided to do this reconciliation cycle
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Outcome {
    /// issue the configured request and evaluate its response
    Send,
    /// already synced and not looping: nothing to do until the spec changes
    Idle,
    /// already synced and looping infinitely, but the poll interval has not
    /// elapsed yet: reschedule without sending
    Wait(Duration),
    /// retries exhausted without looping infinitely: give up
    RolledBack,
}

// -----------------------------------------------------------------------------
// Decision function

/// decides what to do this cycle, given the resource's current sync state.
/// `failed` is the number of consecutive failed attempts recorded so far;
/// a resource configured to loop infinitely never rolls back regardless of
/// `failed`.
pub fn decide<T>(
    obj: &T,
    synced: bool,
    failed: u32,
    last_reconcile_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_next_reconcile: Duration,
) -> Outcome
where
    T: RollbackAware,
{
    if !synced {
        if !obj.should_loop_infinitely() {
            if let Some(limit) = obj.rollback_retries_limit() {
                if failed >= limit {
                    return Outcome::RolledBack;
                }
            }
        }

        return Outcome::Send;
    }

    if !obj.should_loop_infinitely() {
        return Outcome::Idle;
    }

    let interval = obj.next_reconcile().unwrap_or(default_next_reconcile);
    match last_reconcile_time {
        Some(last) if now - last < interval => Outcome::Wait(interval - (now - last)),
        _ => Outcome::Send,
    }
}

/// translates an [`Outcome`] into the delay before the next reconciliation
/// pass, for outcomes that do not themselves send a request
pub fn requeue_after(outcome: &Outcome, default_next_reconcile: Duration) -> Duration {
    match outcome {
        Outcome::Wait(remaining) => *remaining,
        _ => default_next_reconcile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Policy {
        loop_infinitely: bool,
        retries_limit: Option<u32>,
        next_reconcile: Option<Duration>,
    }

    impl RollbackAware for Policy {
        fn should_loop_infinitely(&self) -> bool {
            self.loop_infinitely
        }
        fn rollback_retries_limit(&self) -> Option<u32> {
            self.retries_limit
        }
        fn next_reconcile(&self) -> Option<Duration> {
            self.next_reconcile
        }
    }

    fn policy(loop_infinitely: bool, retries_limit: Option<u32>) -> Policy {
        Policy {
            loop_infinitely,
            retries_limit,
            next_reconcile: None,
        }
    }

    #[test]
    fn sends_while_under_retry_limit() {
        let p = policy(false, Some(3));
        let now = Utc::now();

        assert_eq!(
            decide(&p, false, 1, None, now, Duration::seconds(30)),
            Outcome::Send
        );
    }

    #[test]
    fn rolls_back_once_limit_exceeded() {
        let p = policy(false, Some(3));
        let now = Utc::now();

        assert_eq!(
            decide(&p, false, 4, None, now, Duration::seconds(30)),
            Outcome::RolledBack
        );
    }

    #[test]
    fn rolls_back_at_limit() {
        let p = policy(false, Some(3));
        let now = Utc::now();

        assert_eq!(
            decide(&p, false, 3, None, now, Duration::seconds(30)),
            Outcome::RolledBack
        );
    }

    #[test]
    fn infinite_loop_never_rolls_back() {
        let p = policy(true, Some(1));
        let now = Utc::now();

        assert_eq!(
            decide(&p, false, 100, None, now, Duration::seconds(30)),
            Outcome::Send
        );
    }

    #[test]
    fn idle_once_synced_without_looping() {
        let p = policy(false, None);
        let now = Utc::now();

        assert_eq!(
            decide(&p, true, 0, Some(now), now, Duration::seconds(30)),
            Outcome::Idle
        );
    }

    #[test]
    fn waits_until_poll_interval_elapses() {
        let p = policy(true, None);
        let now = Utc::now();
        let last = now - Duration::seconds(5);

        assert_eq!(
            decide(&p, true, 0, Some(last), now, Duration::seconds(30)),
            Outcome::Wait(Duration::seconds(25))
        );
    }

    #[test]
    fn sends_again_once_poll_interval_elapses() {
        let p = policy(true, None);
        let now = Utc::now();
        let last = now - Duration::seconds(31);

        assert_eq!(
            decide(&p, true, 0, Some(last), now, Duration::seconds(30)),
            Outcome::Send
        );
    }
}
