//! Shared rate-limit backoff policy for provider adapters.
//!
//! Every adapter classifies its transport failure into a
//! [`RetryableError`] and drives it through [`with_retries`], so the
//! exponential-backoff-with-`Retry-After`-honoring policy lives in one
//! place instead of being re-implemented per provider.

use std::future::Future;
use std::time::Duration;

use crate::error::ProviderError;

/// Starting delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_millis(1500);
/// Upper bound on any single retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(40);
/// Default number of attempts (including the initial request) before
/// giving up and surfacing [`ProviderError::RateLimited`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Delay before retry number `attempt` (0-indexed: the first retry is
/// `attempt == 0`). Doubles each time, capped at [`MAX_DELAY`].
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(10);
    let scaled = BASE_DELAY.saturating_mul(1u32 << shift);
    scaled.min(MAX_DELAY)
}

/// Outcome an adapter reports back to [`with_retries`] for one attempt.
pub enum RetryOutcome<T> {
    /// The attempt succeeded.
    Done(T),
    /// The backend signaled a rate limit; retry after the given delay
    /// (or the default backoff schedule if `None`).
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// A non-retryable failure.
    Fatal(ProviderError),
}

/// Drives `attempt` through the shared backoff policy up to
/// `max_attempts` times, logging each retry at `warn`.
pub async fn with_retries<F, Fut, T>(max_attempts: u32, mut attempt: F) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryOutcome<T>>,
{
    let mut tries = 0u32;
    loop {
        match attempt(tries).await {
            RetryOutcome::Done(value) => return Ok(value),
            RetryOutcome::Fatal(err) => return Err(err),
            RetryOutcome::RateLimited {
                retry_after,
                message,
            } => {
                tries += 1;
                if tries >= max_attempts {
                    return Err(ProviderError::RateLimited {
                        attempts: tries,
                        source: message,
                        retry_after,
                    });
                }

                let delay = retry_after.unwrap_or_else(|| backoff_delay(tries - 1));
                log::warn!(
                    "provider rate limited, retrying in {delay:?} (attempt {tries}/{max_attempts}): {message}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Parses a `Retry-After` header value: either a non-negative integer
/// number of seconds, or an HTTP-date (RFC 7231 §7.1.1.1, e.g.
/// `Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let target = parse_http_date(value)?;
    let now = std::time::SystemTime::now();
    target.duration_since(now).ok()
}

/// Minimal RFC 7231 HTTP-date parser (`<day-name>, DD <month> YYYY
/// HH:MM:SS GMT`). No chrono/time dependency is introduced for this;
/// the format is fixed-width and GMT-only.
fn parse_http_date(value: &str) -> Option<std::time::SystemTime> {
    let rest = value.split_once(", ").map(|(_, rest)| rest).unwrap_or(value);
    let mut parts = rest.split_whitespace();
    let day = parts.next()?.parse::<u64>().ok()?;
    let month = month_number(parts.next()?)?;
    let year = parts.next()?.parse::<i64>().ok()?;
    let time = parts.next()?;
    let mut time_parts = time.split(':');
    let hour = time_parts.next()?.parse::<u64>().ok()?;
    let minute = time_parts.next()?.parse::<u64>().ok()?;
    let second = time_parts.next()?.parse::<u64>().ok()?;

    let days = days_since_epoch(year, month, day);
    let epoch_seconds = days * 86_400 + hour * 3600 + minute * 60 + second;
    Some(std::time::UNIX_EPOCH + Duration::from_secs(epoch_seconds.max(0) as u64))
}

fn month_number(name: &str) -> Option<u64> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name))
        .map(|index| index as u64 + 1)
}

/// Howard Hinnant's `days_from_civil`, adapted for u64 epoch-day math.
fn days_since_epoch(year: i64, month: u64, day: u64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}
