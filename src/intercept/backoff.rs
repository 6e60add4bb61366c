//! Exponential backoff with jitter for stream reconnection.
//!
//! Base 1 s, factor 2, cap 60 s; resets to base once a stream has
//! survived longer than 60 s, so a long-lived connection that eventually
//! drops doesn't inherit a stale long delay from an earlier flapping
//! period.

use std::time::Duration;

const BASE: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(60);
const RESET_AFTER: Duration = Duration::from_secs(60);

pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff { current: BASE }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay to sleep before the next reconnect attempt, with up to
    /// 20% jitter applied, then doubles (capped) for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current);
        self.current = (self.current * 2).min(CAP);
        delay
    }

    /// Called after a stream closes; `survived` is how long it stayed up.
    /// A long-lived stream earns back the base delay.
    pub fn record_stream_duration(&mut self, survived: Duration) {
        if survived >= RESET_AFTER {
            self.current = BASE;
        }
    }
}

fn jittered(d: Duration) -> Duration {
    // A cheap, dependency-free jitter: perturb by up to 20% using the
    // wall clock's sub-second nanoseconds at call time as an ad-hoc seed.
    // `d` itself is always a whole number of seconds, so it can't be the
    // seed - only the current instant actually varies from call to call.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|t| t.subsec_nanos())
        .unwrap_or(0) as u64;
    let jitter_frac = (nanos % 1000) as f64 / 1000.0 * 0.2;
    let scale = 1.0 - 0.1 + jitter_frac;
    Duration::from_secs_f64((d.as_secs_f64() * scale).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut b = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d <= CAP + Duration::from_secs(1));
            last = d;
        }
        let _ = last;
    }

    #[test]
    fn resets_after_long_lived_stream() {
        let mut b = Backoff::new();
        for _ in 0..5 {
            b.next_delay();
        }
        assert!(b.current > BASE);
        b.record_stream_duration(Duration::from_secs(61));
        assert_eq!(b.current, BASE);
    }

    #[test]
    fn short_lived_stream_does_not_reset() {
        let mut b = Backoff::new();
        for _ in 0..3 {
            b.next_delay();
        }
        let before = b.current;
        b.record_stream_duration(Duration::from_secs(2));
        assert_eq!(b.current, before);
    }
}
