//! Clock abstractions used by the admission engines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe millisecond time source.
///
/// Implementers must document whether the origin is wall-clock (UNIX epoch)
/// or an arbitrary test epoch. The return value is milliseconds since that
/// origin. Calls must be safe concurrently (`Send + Sync`). Engines take the
/// clock through this trait rather than reading time directly, so tests can
/// advance time deterministically.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds relative to the implementer's origin.
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `SystemTime`, reporting milliseconds since the UNIX
/// epoch. This is the production time source: reset timestamps derived from
/// it are meaningful to clients as epoch seconds.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    /// Returns milliseconds since the UNIX epoch. A clock set before 1970
    /// reads as 0 rather than panicking.
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Starts at 0 (or a chosen instant) and only moves when told to. Clones
/// share the same underlying instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: std::sync::Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at 0 ms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock frozen at `millis`.
    pub fn at(millis: u64) -> Self {
        let clock = Self::new();
        clock.set(millis);
        clock
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Render an epoch-millisecond instant as `YYYY-MM-DD HH:MM:SS` in the
/// server's local time zone.
pub(crate) fn format_epoch_ms(millis: u64) -> String {
    use chrono::TimeZone;
    chrono::Local
        .timestamp_millis_opt(i64::try_from(millis).unwrap_or(i64::MAX))
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "invalid-time".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn system_clock_non_decreasing() {
        let clock = SystemClock::new();
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_starts_frozen() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_millis(), 0);
        assert_eq!(clock.now_millis(), 0);
    }

    #[test]
    fn manual_clock_advances_and_jumps() {
        let clock = ManualClock::new();
        clock.advance(250);
        assert_eq!(clock.now_millis(), 250);
        clock.set(10_000);
        assert_eq!(clock.now_millis(), 10_000);
    }

    #[test]
    fn manual_clones_share_instant() {
        let clock = ManualClock::at(5);
        let clone = clock.clone();
        clock.advance(5);
        assert_eq!(clone.now_millis(), 10);
    }

    #[test]
    fn trait_object_usage() {
        let clock: Box<dyn Clock> = Box::new(ManualClock::new());
        assert_eq!(clock.now_millis(), 0);
    }

    #[test]
    fn send_sync_across_threads() {
        let clock = Arc::new(ManualClock::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let c = clock.clone();
            handles.push(thread::spawn(move || {
                c.advance(1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(clock.now_millis(), 4);
    }

    #[test]
    fn formats_epoch_instants() {
        let formatted = format_epoch_ms(0);
        // Local-zone dependent, but always the fixed layout.
        assert_eq!(formatted.len(), 19);
        assert_eq!(&formatted[4..5], "-");
        assert_eq!(&formatted[13..14], ":");
    }
}
