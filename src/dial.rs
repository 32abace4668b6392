//! # Staggered Dial Racing
//!
//! A peer usually has several addresses. [`race_dials`] tries all of them
//! concurrently, starting attempt *i* after `i × stagger`, and returns the
//! first success. Outstanding attempts are cancelled by dropping their
//! futures. If every attempt fails, the caller receives
//! [`DialError::AllDialsFailed`] with one reason per address.
//!
//! Which success wins when several complete close together is a policy
//! choice, not a correctness rule, and is exposed as [`TieBreak`].

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;
use tracing::trace;

use crate::error::DialError;
use crate::multiaddr::Multiaddr;

/// Upper bound on addresses raced per dial.
pub const MAX_DIAL_ADDRS: usize = 8;

/// How to choose between successful attempts that complete close together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    /// Take whichever attempt completes first.
    FirstToComplete,
    /// When a lower-ranked address wins first, wait up to `grace` for a
    /// better-ranked attempt that is still in flight.
    PreferRanked { grace: Duration },
}

#[derive(Clone, Debug)]
pub struct DialPolicy {
    /// Delay between the start of consecutive attempts.
    pub stagger: Duration,
    pub tie_break: TieBreak,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(250),
            tie_break: TieBreak::FirstToComplete,
        }
    }
}

/// Result of a race with at least one success.
#[derive(Debug)]
pub struct DialOutcome<T> {
    pub winner: T,
    pub addr: Multiaddr,
    /// Attempts that completed with an error before the race ended.
    pub failures: Vec<(Multiaddr, DialError)>,
}

/// Race `dial` over `addrs` in order; earlier addresses are better ranked.
///
/// A winning connection replaced under [`TieBreak::PreferRanked`] is simply
/// dropped, so `T` should release its resources on drop.
pub async fn race_dials<T, F, Fut>(
    addrs: Vec<Multiaddr>,
    policy: &DialPolicy,
    dial: F,
) -> Result<DialOutcome<T>, DialError>
where
    F: Fn(Multiaddr) -> Fut,
    Fut: Future<Output = Result<T, DialError>>,
{
    let dial = &dial;
    let mut pending = FuturesUnordered::new();
    let mut unfinished = BTreeSet::new();

    for (index, addr) in addrs.into_iter().take(MAX_DIAL_ADDRS).enumerate() {
        let delay = policy.stagger * index as u32;
        unfinished.insert(index);
        pending.push(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = dial(addr.clone()).await;
            (index, addr, result)
        });
    }

    let mut failures = Vec::new();
    let mut best: Option<(usize, Multiaddr, T)> = None;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let next = match grace_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(next) => next,
                Err(_) => break,
            },
            None => pending.next().await,
        };
        let Some((index, addr, result)) = next else {
            break;
        };
        unfinished.remove(&index);

        match result {
            Ok(conn) => {
                let better = best.as_ref().is_none_or(|(b, _, _)| index < *b);
                if better {
                    trace!(addr = %addr, index, "dial attempt succeeded");
                    best = Some((index, addr, conn));
                }
            }
            Err(e) => {
                trace!(addr = %addr, error = %e, "dial attempt failed");
                failures.push((addr, e));
            }
        }

        let Some((best_index, _, _)) = best.as_ref() else {
            continue;
        };
        let better_in_flight = unfinished.iter().any(|i| i < best_index);
        match policy.tie_break {
            TieBreak::FirstToComplete => break,
            TieBreak::PreferRanked { grace } => {
                if !better_in_flight {
                    break;
                }
                if grace_deadline.is_none() {
                    grace_deadline = Some(Instant::now() + grace);
                }
            }
        }
    }

    drop(pending);

    match best {
        Some((_, addr, winner)) => Ok(DialOutcome {
            winner,
            addr,
            failures,
        }),
        None => Err(DialError::AllDialsFailed(failures)),
    }
}
