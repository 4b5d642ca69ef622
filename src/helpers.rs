use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::Rng;

pub const KIBI: usize = 1024;
pub const MEBI: usize = KIBI * KIBI;

/// Lowest value the counter may ever hold
pub const MIN_COUNTER_VALUE: i64 = 0;

/// Highest value the counter may ever hold
pub const MAX_COUNTER_VALUE: i64 = 1_000_000_000;

/// Key of the singleton counter record
pub const COUNTER_ITEM_ID: &str = "global";

/// Conflicts tolerated by a single update before giving up
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Backoff unit; attempt `n` waits `BASE_DELAY * 2^n` plus up to 30% jitter
pub const BASE_DELAY: Duration = Duration::from_millis(50);

pub const DATA_DIR: &str = "./tally-data";
pub const TABLE_NAME: &str = "counter-table";

/// Backoff before the retry that follows conflict number `attempt` (zero-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
    let ceiling = exponential.as_secs_f64() * 0.3;
    let jitter = if ceiling > 0.0 { rand::thread_rng().gen_range(0.0..ceiling) } else { 0.0 };
    exponential + Duration::from_secs_f64(jitter)
}

/// Current UTC time as RFC 3339 with millisecond precision
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format with `,` between thousands, e.g. `1,000,000,000`
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
