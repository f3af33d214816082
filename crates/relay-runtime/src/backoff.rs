//! Default retry backoff for inbox handler failures (§4.4).

use rand::Rng;

/// `delay = min(60s, 0.25s * 2^min(attempt,10)) + rand(0,250ms)`, rounded up to the
/// nearest whole second since `relay_db`'s abandon/fail take an integer delay.
pub fn default_backoff_seconds(attempt: i32) -> i64 {
    let capped_attempt = attempt.clamp(0, 10) as i32;
    let base_ms = (0.25_f64 * 2f64.powi(capped_attempt) * 1000.0).min(60_000.0);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..250);
    let total_ms = base_ms as i64 + jitter_ms as i64;
    (total_ms + 999) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_sixty_seconds_for_large_attempt_counts() {
        for attempt in [10, 11, 50, 1000] {
            let delay = default_backoff_seconds(attempt);
            assert!(delay <= 61, "attempt={attempt} produced delay={delay}");
        }
    }

    #[test]
    fn backoff_grows_monotonically_with_attempt_until_the_cap() {
        // Stays below the attempt where successive bases both saturate at 60s — near
        // that boundary jitter alone can make consecutive draws non-monotonic.
        let mut prev = default_backoff_seconds(0);
        for attempt in 1..=7 {
            let next = default_backoff_seconds(attempt);
            assert!(next >= prev, "attempt={attempt} delay={next} < previous={prev}");
            prev = next;
        }
    }
}
