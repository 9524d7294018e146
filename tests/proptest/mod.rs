// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for the poll engine and catalog matching
//!
//! Each poll case runs on its own paused-clock runtime, so time-based
//! properties are exact and cost no wall time:
//! 1. A check that turns true on call k is invoked exactly k times
//! 2. A check that never matches is invoked floor(timeout / interval) times
//!    and fails exactly at the deadline
//! 3. A check error ends the loop on the call that raised it
//! 4. Catalog matching is substring containment

use std::cell::Cell;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use index_verifier::{Error, PollSpec, catalog_contains, poll_until};

// =============================================================================
// Helpers
// =============================================================================

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

/// Interval and timeout in whole milliseconds with timeout >= interval
fn cadence() -> impl Strategy<Value = (u64, u64)> {
    (1u64..500).prop_flat_map(|interval| (Just(interval), interval..interval * 40))
}

fn spec((interval_ms, timeout_ms): (u64, u64)) -> PollSpec {
    PollSpec::new(
        Duration::from_millis(interval_ms),
        Duration::from_millis(timeout_ms),
        true,
    )
    .unwrap()
}

struct Outcome {
    result: index_verifier::Result<()>,
    calls: u64,
    elapsed: Duration,
}

/// Run `poll_until` with a check that answers `answer(call_number)`
fn run_poll<F>(spec: PollSpec, answer: F) -> Outcome
where
    F: Fn(u64) -> index_verifier::Result<bool>,
{
    paused_runtime().block_on(async {
        let calls = Cell::new(0u64);
        let start = Instant::now();
        let result = poll_until("property", &spec, || {
            calls.set(calls.get() + 1);
            std::future::ready(answer(calls.get()))
        })
        .await;
        Outcome {
            result,
            calls: calls.get(),
            elapsed: start.elapsed(),
        }
    })
}

fn index_name() -> impl Strategy<Value = String> {
    "[a-z]{1,8}-[a-z]{1,8}-[0-9]{6}"
}

// =============================================================================
// Poll engine
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: success on call k within the deadline takes exactly k calls
    #[test]
    fn prop_success_on_kth_call((interval, timeout) in cadence(), k in 1u64..40) {
        prop_assume!(k * interval <= timeout);

        let outcome = run_poll(spec((interval, timeout)), |n| Ok(n >= k));

        prop_assert!(outcome.result.is_ok());
        prop_assert_eq!(outcome.calls, k);
        prop_assert_eq!(outcome.elapsed, Duration::from_millis(k * interval));
    }

    /// Property: a never-matching check is called floor(timeout / interval)
    /// times and the loop ends exactly at the deadline
    #[test]
    fn prop_deadline_bounds_calls((interval, timeout) in cadence()) {
        let outcome = run_poll(spec((interval, timeout)), |_| Ok(false));

        let err = outcome.result.unwrap_err();
        prop_assert!(err.is_deadline());
        prop_assert_eq!(outcome.calls, timeout / interval);
        prop_assert_eq!(outcome.elapsed, Duration::from_millis(timeout));
    }

    /// Property: an error on call k stops the loop with that error
    #[test]
    fn prop_error_stops_loop((interval, timeout) in cadence(), k in 1u64..40) {
        prop_assume!(k * interval <= timeout);

        let outcome = run_poll(spec((interval, timeout)), |n| {
            if n == k {
                Err(Error::QueryTransportError {
                    url: "http://localhost:1/_cat/indices".to_string(),
                    reason: format!("call {}", n),
                })
            } else {
                Ok(false)
            }
        });

        match outcome.result {
            Err(Error::QueryTransportError { reason, .. }) => {
                prop_assert_eq!(reason, format!("call {}", k));
            }
            other => prop_assert!(false, "unexpected result: {:?}", other),
        }
        prop_assert_eq!(outcome.calls, k);
    }

    /// Property: specs with a timeout shorter than the interval are rejected
    #[test]
    fn prop_short_timeout_rejected(
        (interval, timeout) in (1u64..10_000).prop_flat_map(|i| (Just(i), 0..i))
    ) {
        let result = PollSpec::new(
            Duration::from_millis(interval),
            Duration::from_millis(timeout),
            true,
        );
        prop_assert!(result.unwrap_err().is_config());
    }
}

// =============================================================================
// Catalog matching
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: every listed index matches its own prefix
    #[test]
    fn prop_listed_index_found(names in prop::collection::vec(index_name(), 1..10), pick in any::<prop::sample::Index>()) {
        let body: String = names
            .iter()
            .map(|name| format!("green open {} uuid 1 1 0 0 1kb 1kb\n", name))
            .collect();
        let name = pick.get(&names);
        let prefix = &name[..name.find('-').unwrap() + 1];

        prop_assert!(catalog_contains(&body, prefix));
    }

    /// Property: matching agrees with substring containment
    #[test]
    fn prop_matches_substring(body in ".{0,200}", prefix in ".{1,10}") {
        prop_assert_eq!(catalog_contains(&body, &prefix), body.contains(prefix.as_str()));
    }
}
