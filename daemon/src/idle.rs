/// User-idle detection for the screensaver.
///
/// The screensaver is a two-state machine with a dead zone between the two
/// thresholds: it shows once idle time reaches `idle_to_show`, hides once idle
/// time drops to `active_threshold` or below, and holds its state anywhere in
/// between. That gap is what stops it from flickering at a boundary.
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::{secs, SaverConfig};

/// Time since the last keyboard or mouse input, system-wide.
pub trait IdleSource {
    fn idle_duration(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaverState {
    Hidden,
    Visible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub idle_to_show: Duration,
    pub active_threshold: Duration,
}

impl Thresholds {
    pub fn from_config(config: &SaverConfig) -> Self {
        Self {
            idle_to_show: secs(config.idle_to_show_sec),
            active_threshold: secs(config.active_threshold_sec),
        }
    }
}

pub fn next_state(current: SaverState, idle: Duration, thresholds: Thresholds) -> SaverState {
    match current {
        SaverState::Hidden if idle >= thresholds.idle_to_show => SaverState::Visible,
        SaverState::Visible if idle <= thresholds.active_threshold => SaverState::Hidden,
        state => state,
    }
}

/// Drives [`SaverState`] from idle samples, honoring the enable switch and
/// the start delay.
#[derive(Debug)]
pub struct IdleMonitor {
    state: SaverState,
    started_at: Instant,
}

impl IdleMonitor {
    pub fn new(started_at: Instant) -> Self {
        Self {
            state: SaverState::Hidden,
            started_at,
        }
    }

    pub fn state(&self) -> SaverState {
        self.state
    }

    /// Feeds one idle sample. Returns the new state when it changed.
    pub fn tick(&mut self, now: Instant, config: &SaverConfig, idle: Duration) -> Option<SaverState> {
        let next = if !config.enabled {
            SaverState::Hidden
        } else if now.saturating_duration_since(self.started_at) < secs(config.start_delay_sec) {
            self.state
        } else {
            next_state(self.state, idle, Thresholds::from_config(config))
        };
        if next == self.state {
            return None;
        }
        info!(?idle, from = ?self.state, to = ?next, "Screensaver state changed");
        self.state = next;
        Some(next)
    }
}

/// Reads the OS input clock.
#[derive(Debug, Default)]
pub struct SystemIdleSource;

impl IdleSource for SystemIdleSource {
    fn idle_duration(&self) -> Duration {
        imp::idle_duration()
    }
}

#[cfg(windows)]
mod imp {
    use std::time::Duration;
    use windows::Win32::System::SystemInformation::GetTickCount;
    use windows::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};

    pub fn idle_duration() -> Duration {
        let mut info = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };
        // SAFETY: `info` is a properly sized LASTINPUTINFO owned by this frame.
        let ok = unsafe { GetLastInputInfo(&mut info) }.as_bool();
        if !ok {
            return Duration::ZERO;
        }
        // SAFETY: no preconditions.
        let now = unsafe { GetTickCount() };
        // Both counters wrap after ~49.7 days.
        Duration::from_millis(u64::from(now.wrapping_sub(info.dwTime)))
    }
}

#[cfg(not(windows))]
mod imp {
    use std::time::Duration;

    /// No portable input clock; report an always-active user.
    pub fn idle_duration() -> Duration {
        Duration::ZERO
    }
}
