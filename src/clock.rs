//! Process-wide Lamport clock.
//!
//! Every RPC carries the sender's clock in its header. The server bumps the
//! counter once per authenticated request and stamps the result into the
//! response header; callers absorb the response clock with [`bump`]. This is
//! the only cross-node ordering the system provides.

use std::sync::atomic::{AtomicU64, Ordering};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Current value without advancing.
pub fn get() -> u64 {
    CLOCK.load(Ordering::SeqCst)
}

/// Merge a remote clock value: `local = max(local, other) + 1`.
///
/// Returns the new local value. Safe under concurrent bumps; the counter
/// never moves backwards.
pub fn bump(other: u64) -> u64 {
    let mut current = CLOCK.load(Ordering::SeqCst);
    loop {
        let next = current.max(other) + 1;
        match CLOCK.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}
