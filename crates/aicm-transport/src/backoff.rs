// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry backoff schedules.
//!
//! Two schedules live here: the in-call HTTP schedule (short, capped at
//! 30 s, used between attempts of one `send_batch`) and the durable-queue
//! reschedule curve (longer, capped at 300 s, used for `next_attempt_at`).

use std::time::Duration;

use rand::Rng;

const HTTP_BASE: Duration = Duration::from_millis(500);
const HTTP_CAP: Duration = Duration::from_secs(30);
const QUEUE_BASE: Duration = Duration::from_secs(1);
const QUEUE_CAP: Duration = Duration::from_secs(300);

/// Delay before HTTP attempt `attempt + 1` (zero-based failed attempts).
///
/// `0.5s * 2^attempt`, capped at 30 s, jittered +/-20%.
pub fn http_backoff(attempt: u32) -> Duration {
    jitter(exponential(HTTP_BASE, attempt, HTTP_CAP), 0.2)
}

/// Reschedule delay for a queue entry on its `attempt_count`-th failure
/// (one-based).
///
/// `1s * 2^(n-1)`, capped at 300 s, jittered within 0.8..1.2.
pub fn queue_backoff(attempt_count: u32) -> Duration {
    jitter(
        exponential(QUEUE_BASE, attempt_count.saturating_sub(1), QUEUE_CAP),
        0.2,
    )
}

fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

fn jitter(duration: Duration, fraction: f64) -> Duration {
    let scale = rand::thread_rng().gen_range(1.0 - fraction..1.0 + fraction);
    duration.mul_f64(scale)
}
