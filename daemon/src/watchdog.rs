/// Detects a supervised process whose window is gone.
///
/// A browser can survive the user closing its last window (background apps,
/// crash recovery dialogs). The watchdog reports such a process as expired
/// once it has been windowless for a full grace period, so the supervisor can
/// kill it and let the scheduler relaunch.
use std::time::{Duration, Instant};
use tracing::debug;

use crate::inspector::WindowInspector;

/// How long a process may run without ever showing a window before it is
/// considered stuck.
pub const STARTUP_ALLOWANCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// No process to watch.
    Idle,
    Healthy,
    /// Window state cannot be observed right now; nothing is concluded.
    Unknown,
    /// Still starting up, no window seen yet.
    Starting,
    /// Window gone since the given instant, grace not yet spent.
    Missing(Instant),
    Expired,
}

#[derive(Debug)]
pub struct WindowWatchdog {
    grace: Duration,
    tracked: Option<Tracked>,
}

#[derive(Debug)]
struct Tracked {
    pid: u32,
    since: Instant,
    window_seen: bool,
    missing_since: Option<Instant>,
}

impl WindowWatchdog {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            tracked: None,
        }
    }

    pub fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    pub fn check(
        &mut self,
        now: Instant,
        pid: Option<u32>,
        inspector: &dyn WindowInspector,
    ) -> WatchdogVerdict {
        let Some(pid) = pid else {
            self.tracked = None;
            return WatchdogVerdict::Idle;
        };
        if self.tracked.as_ref().map_or(true, |t| t.pid != pid) {
            self.tracked = Some(Tracked {
                pid,
                since: now,
                window_seen: false,
                missing_since: None,
            });
        }
        let Some(tracked) = self.tracked.as_mut() else {
            return WatchdogVerdict::Idle;
        };

        let windows = match inspector.find_visible_windows(pid) {
            Ok(w) => w,
            Err(e) => {
                debug!(pid, "Window state unavailable: {e}");
                return WatchdogVerdict::Unknown;
            }
        };
        if !windows.is_empty() {
            tracked.window_seen = true;
            tracked.missing_since = None;
            return WatchdogVerdict::Healthy;
        }

        if !tracked.window_seen && now.saturating_duration_since(tracked.since) < STARTUP_ALLOWANCE {
            return WatchdogVerdict::Starting;
        }
        let missing_since = *tracked.missing_since.get_or_insert(now);
        if now.saturating_duration_since(missing_since) >= self.grace {
            self.tracked = None;
            WatchdogVerdict::Expired
        } else {
            WatchdogVerdict::Missing(missing_since)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOs;
    use std::path::Path;

    fn ms(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn window_returning_within_grace_resets() {
        let os = FakeOs::new();
        let pid = os.spawn_external(Path::new("/p"), 1);
        let mut dog = WindowWatchdog::new(Duration::from_millis(2_000));
        let t0 = Instant::now();

        assert_eq!(dog.check(t0, Some(pid), &os), WatchdogVerdict::Healthy);
        os.set_windows(pid, 0);
        assert_eq!(dog.check(ms(t0, 500), Some(pid), &os), WatchdogVerdict::Missing(ms(t0, 500)));
        assert_eq!(dog.check(ms(t0, 1_500), Some(pid), &os), WatchdogVerdict::Missing(ms(t0, 500)));
        os.set_windows(pid, 1);
        assert_eq!(dog.check(ms(t0, 2_000), Some(pid), &os), WatchdogVerdict::Healthy);
        os.set_windows(pid, 0);
        // The grace period starts over.
        assert_eq!(dog.check(ms(t0, 3_000), Some(pid), &os), WatchdogVerdict::Missing(ms(t0, 3_000)));
        assert_eq!(dog.check(ms(t0, 4_999), Some(pid), &os), WatchdogVerdict::Missing(ms(t0, 3_000)));
    }

    #[test]
    fn window_missing_for_grace_expires() {
        let os = FakeOs::new();
        let pid = os.spawn_external(Path::new("/p"), 1);
        let mut dog = WindowWatchdog::new(Duration::from_millis(2_000));
        let t0 = Instant::now();

        dog.check(t0, Some(pid), &os);
        os.set_windows(pid, 0);
        dog.check(ms(t0, 100), Some(pid), &os);
        assert_eq!(dog.check(ms(t0, 2_100), Some(pid), &os), WatchdogVerdict::Expired);
    }

    #[test]
    fn startup_without_window_is_allowed_then_expires() {
        let os = FakeOs::new();
        let pid = os.spawn_external(Path::new("/p"), 0);
        let mut dog = WindowWatchdog::new(Duration::from_millis(2_000));
        let t0 = Instant::now();

        assert_eq!(dog.check(t0, Some(pid), &os), WatchdogVerdict::Starting);
        assert_eq!(dog.check(ms(t0, 10_000), Some(pid), &os), WatchdogVerdict::Starting);
        let after = t0 + STARTUP_ALLOWANCE;
        assert_eq!(dog.check(after, Some(pid), &os), WatchdogVerdict::Missing(after));
        assert_eq!(
            dog.check(after + Duration::from_millis(2_000), Some(pid), &os),
            WatchdogVerdict::Expired
        );
    }

    #[test]
    fn new_pid_starts_fresh() {
        let os = FakeOs::new();
        let a = os.spawn_external(Path::new("/p"), 1);
        let b = os.spawn_external(Path::new("/p"), 0);
        let mut dog = WindowWatchdog::new(Duration::from_millis(2_000));
        let t0 = Instant::now();

        dog.check(t0, Some(a), &os);
        assert_eq!(dog.check(ms(t0, 100), Some(b), &os), WatchdogVerdict::Starting);
        assert_eq!(dog.check(ms(t0, 200), None, &os), WatchdogVerdict::Idle);
    }

    #[test]
    fn unobservable_windows_never_expire() {
        let os = FakeOs::new();
        os.windows_supported.set(false);
        let pid = os.spawn_external(Path::new("/p"), 0);
        let mut dog = WindowWatchdog::new(Duration::ZERO);
        let t0 = Instant::now();
        for s in 0..100 {
            assert_eq!(
                dog.check(t0 + Duration::from_secs(s), Some(pid), &os),
                WatchdogVerdict::Unknown
            );
        }
    }
}
