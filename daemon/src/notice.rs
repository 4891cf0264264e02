/// Notice overlay arbitration.
///
/// The notice competes with the settings UI and the screensaver for the
/// foreground. Every tick, [`decide`] picks one outcome with fixed priority:
///
/// 1. an interactive UI is up: the notice steps aside and never holds the lock
/// 2. the screensaver is up: the notice hides
/// 3. the notice is wanted and not dismissed: show it, locked once settled
/// 4. otherwise hide it
///
/// [`NoticeCoordinator`] adds the timing around that rule: a quiet period
/// after the UI or screensaver flips, a delay before the lock engages, and
/// the dismissal bookkeeping shared through the coordination files.
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{secs, ConfigSnapshot, NoticeConfig};
use crate::coordination::CoordinationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeDecision {
    Show { locked: bool },
    /// Stay visible but give up topmost and the lock.
    DropBehind,
    Hide,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoticeInputs {
    pub enabled: bool,
    pub ui_active: bool,
    pub saver_active: bool,
    pub dismissed: bool,
    pub in_transition_hold: bool,
    /// The notice has been visible long enough to take the lock.
    pub lock_ready: bool,
    pub visible: bool,
}

pub fn decide(inputs: &NoticeInputs) -> NoticeDecision {
    if inputs.ui_active {
        return if inputs.visible {
            NoticeDecision::DropBehind
        } else {
            NoticeDecision::Hide
        };
    }
    if inputs.saver_active {
        return NoticeDecision::Hide;
    }
    if inputs.enabled && !inputs.dismissed && !inputs.in_transition_hold {
        return NoticeDecision::Show {
            locked: inputs.lock_ready,
        };
    }
    NoticeDecision::Hide
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoticeContent {
    pub title: String,
    pub message: String,
    pub footer: String,
}

impl From<&NoticeConfig> for NoticeContent {
    fn from(config: &NoticeConfig) -> Self {
        Self {
            title: config.title.clone(),
            message: config.message.clone(),
            footer: config.footer.clone(),
        }
    }
}

/// What the notice overlay should look like after a tick.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoticeWindowState {
    pub visible: bool,
    pub interaction_locked: bool,
    pub content: NoticeContent,
}

#[derive(Debug)]
pub struct NoticeCoordinator {
    dismissed: bool,
    seen_trigger_at: i64,
    seen_dismissed_at: i64,
    last_flags: Option<(bool, bool)>,
    last_flip_at: Option<Instant>,
    visible_since: Option<Instant>,
    window: NoticeWindowState,
}

impl NoticeCoordinator {
    /// A dismissal survives restarts unless the screensaver has triggered
    /// since.
    pub fn new(state: &CoordinationState) -> Self {
        let dismissed =
            state.notice_dismissed_at > 0 && state.notice_dismissed_at >= state.saver_trigger_at;
        Self {
            dismissed,
            seen_trigger_at: state.saver_trigger_at,
            seen_dismissed_at: state.notice_dismissed_at,
            last_flags: None,
            last_flip_at: None,
            visible_since: None,
            window: NoticeWindowState::default(),
        }
    }

    pub fn is_dismissed(&self) -> bool {
        self.dismissed
    }

    pub fn window(&self) -> &NoticeWindowState {
        &self.window
    }

    /// Local dismissal (the user closed the overlay). The caller persists
    /// `now_ms` so other processes see it.
    pub fn dismiss(&mut self, now_ms: i64) {
        info!("Notice dismissed");
        self.dismissed = true;
        self.seen_dismissed_at = self.seen_dismissed_at.max(now_ms);
        self.window.visible = false;
        self.window.interaction_locked = false;
        self.visible_since = None;
    }

    pub fn tick(
        &mut self,
        now: Instant,
        now_ms: i64,
        config: &ConfigSnapshot,
        state: &CoordinationState,
    ) -> NoticeDecision {
        let flags = (state.ui_active(), state.saver_active);
        if self.last_flags.is_some_and(|last| last != flags) {
            debug!(ui = flags.0, saver = flags.1, "Foreground owner changed");
            self.last_flip_at = Some(now);
        }
        self.last_flags = Some(flags);

        self.observe_shared_state(state);
        self.apply_repeat(now_ms, config);

        let hold = Duration::from_millis(config.notice.transition_hold_ms);
        let lock_delay = Duration::from_millis(config.notice.lock_delay_ms);
        let inputs = NoticeInputs {
            enabled: config.notice_active(),
            ui_active: flags.0,
            saver_active: flags.1,
            dismissed: self.dismissed,
            in_transition_hold: self
                .last_flip_at
                .is_some_and(|at| now.saturating_duration_since(at) < hold),
            lock_ready: self
                .visible_since
                .is_some_and(|at| now.saturating_duration_since(at) >= lock_delay),
            visible: self.window.visible,
        };
        let decision = decide(&inputs);

        match decision {
            NoticeDecision::Show { locked } => {
                if !self.window.visible {
                    self.visible_since = Some(now);
                }
                self.window.visible = true;
                self.window.interaction_locked = locked;
            }
            NoticeDecision::DropBehind => self.window.interaction_locked = false,
            NoticeDecision::Hide => {
                self.window.visible = false;
                self.window.interaction_locked = false;
                self.visible_since = None;
            }
        }
        self.window.content = NoticeContent::from(&config.notice);
        decision
    }

    /// Applies dismissals and screensaver triggers written by other processes.
    /// When both advanced since the last look, the later one wins.
    fn observe_shared_state(&mut self, state: &CoordinationState) {
        if state.notice_dismissed_at > self.seen_dismissed_at {
            self.seen_dismissed_at = state.notice_dismissed_at;
            if !self.dismissed {
                info!("Notice dismissed externally");
            }
            self.dismissed = true;
        }
        if state.saver_trigger_at > self.seen_trigger_at {
            self.seen_trigger_at = state.saver_trigger_at;
            if state.saver_trigger_at >= self.seen_dismissed_at && self.dismissed {
                info!("Screensaver triggered, notice re-armed");
                self.dismissed = false;
            }
        }
    }

    /// Without a screensaver to re-arm it, an optional timer re-shows the
    /// notice.
    fn apply_repeat(&mut self, now_ms: i64, config: &ConfigSnapshot) {
        if !self.dismissed || !config.notice.repeat_enabled || config.saver.enabled {
            return;
        }
        let interval = secs(config.notice.repeat_interval_sec);
        let elapsed_ms = now_ms.saturating_sub(self.seen_dismissed_at).max(0);
        if u128::from(elapsed_ms.unsigned_abs()) >= interval.as_millis() {
            info!("Notice repeat interval elapsed");
            self.dismissed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    fn state(ui: u32, saver: bool) -> CoordinationState {
        CoordinationState {
            ui_active_ref_count: ui,
            saver_active: saver,
            ..CoordinationState::default()
        }
    }

    // ── decide ────────────────────────────────────────────────────────────────

    #[test]
    fn ui_active_never_locks() {
        for bits in 0..64u8 {
            let inputs = NoticeInputs {
                enabled: bits & 1 != 0,
                ui_active: true,
                saver_active: bits & 2 != 0,
                dismissed: bits & 4 != 0,
                in_transition_hold: bits & 8 != 0,
                lock_ready: bits & 16 != 0,
                visible: bits & 32 != 0,
            };
            let d = decide(&inputs);
            assert!(!matches!(d, NoticeDecision::Show { .. }), "{inputs:?}");
            assert_eq!(d == NoticeDecision::DropBehind, inputs.visible);
        }
    }

    #[test]
    fn saver_hides_notice() {
        let inputs = NoticeInputs {
            enabled: true,
            saver_active: true,
            lock_ready: true,
            visible: true,
            ..NoticeInputs::default()
        };
        assert_eq!(decide(&inputs), NoticeDecision::Hide);
    }

    #[test]
    fn show_requires_enabled_undismissed_and_settled() {
        let base = NoticeInputs {
            enabled: true,
            ..NoticeInputs::default()
        };
        assert_eq!(decide(&base), NoticeDecision::Show { locked: false });
        assert_eq!(
            decide(&NoticeInputs { lock_ready: true, ..base }),
            NoticeDecision::Show { locked: true }
        );
        assert_eq!(decide(&NoticeInputs { dismissed: true, ..base }), NoticeDecision::Hide);
        assert_eq!(
            decide(&NoticeInputs { in_transition_hold: true, ..base }),
            NoticeDecision::Hide
        );
        assert_eq!(decide(&NoticeInputs { enabled: false, ..base }), NoticeDecision::Hide);
    }

    // ── coordinator ───────────────────────────────────────────────────────────

    #[test]
    fn lock_engages_after_delay() {
        let cfg = ConfigSnapshot::default();
        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        let t0 = Instant::now();
        let s = state(0, false);

        assert_eq!(notice.tick(t0, 0, &cfg, &s), NoticeDecision::Show { locked: false });
        assert!(notice.window().visible);
        assert_eq!(notice.tick(ms(t0, 499), 0, &cfg, &s), NoticeDecision::Show { locked: false });
        assert_eq!(notice.tick(ms(t0, 500), 0, &cfg, &s), NoticeDecision::Show { locked: true });
        assert!(notice.window().interaction_locked);
        assert_eq!(notice.window().content.title, cfg.notice.title);
    }

    #[test]
    fn ui_flip_drops_lock_and_holds_after_leave() {
        let cfg = ConfigSnapshot::default();
        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        let t0 = Instant::now();

        notice.tick(t0, 0, &cfg, &state(0, false));
        notice.tick(ms(t0, 600), 0, &cfg, &state(0, false));
        assert!(notice.window().interaction_locked);

        assert_eq!(notice.tick(ms(t0, 700), 0, &cfg, &state(1, false)), NoticeDecision::DropBehind);
        assert!(notice.window().visible);
        assert!(!notice.window().interaction_locked);

        // UI closes: quiet period before the notice comes back.
        assert_eq!(notice.tick(ms(t0, 1_000), 0, &cfg, &state(0, false)), NoticeDecision::Hide);
        assert_eq!(notice.tick(ms(t0, 1_799), 0, &cfg, &state(0, false)), NoticeDecision::Hide);
        assert_eq!(
            notice.tick(ms(t0, 1_800), 0, &cfg, &state(0, false)),
            NoticeDecision::Show { locked: false }
        );
        assert_eq!(
            notice.tick(ms(t0, 2_300), 0, &cfg, &state(0, false)),
            NoticeDecision::Show { locked: true }
        );
    }

    #[test]
    fn never_locked_while_ui_active() {
        let cfg = ConfigSnapshot::default();
        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        let t0 = Instant::now();
        for step in 0..100u64 {
            let ui = u32::from(step % 7 < 3);
            let saver = step % 11 == 0;
            notice.tick(ms(t0, step * 150), 0, &cfg, &state(ui, saver));
            if ui > 0 || saver {
                assert!(!notice.window().interaction_locked, "step {step}");
            }
        }
    }

    #[test]
    fn dismissal_sticks_until_saver_triggers() {
        let cfg = ConfigSnapshot::default();
        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        let t0 = Instant::now();

        notice.tick(t0, 1_000, &cfg, &state(0, false));
        notice.dismiss(1_000);
        assert_eq!(notice.tick(ms(t0, 100), 1_100, &cfg, &state(0, false)), NoticeDecision::Hide);

        // Saver shows, then hides again.
        let mut s = state(0, true);
        s.saver_trigger_at = 5_000;
        s.notice_dismissed_at = 1_000;
        notice.tick(ms(t0, 200), 5_000, &cfg, &s);
        assert!(!notice.is_dismissed());
        s.saver_active = false;
        assert_eq!(notice.tick(ms(t0, 300), 6_000, &cfg, &s), NoticeDecision::Hide);
        assert!(matches!(
            notice.tick(ms(t0, 1_100), 6_800, &cfg, &s),
            NoticeDecision::Show { .. }
        ));
    }

    #[test]
    fn external_dismissal_is_observed() {
        let cfg = ConfigSnapshot::default();
        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        let t0 = Instant::now();
        assert!(matches!(
            notice.tick(t0, 0, &cfg, &state(0, false)),
            NoticeDecision::Show { .. }
        ));

        let mut s = state(0, false);
        s.notice_dismissed_at = 9_000;
        assert_eq!(notice.tick(ms(t0, 100), 9_100, &cfg, &s), NoticeDecision::Hide);
        assert!(notice.is_dismissed());
    }

    #[test]
    fn dismissal_restored_on_start() {
        let mut s = CoordinationState::default();
        s.notice_dismissed_at = 2_000;
        s.saver_trigger_at = 1_000;
        assert!(NoticeCoordinator::new(&s).is_dismissed());

        s.saver_trigger_at = 3_000;
        assert!(!NoticeCoordinator::new(&s).is_dismissed());
        assert!(!NoticeCoordinator::new(&CoordinationState::default()).is_dismissed());
    }

    #[test]
    fn repeat_reshows_only_without_saver() {
        let mut cfg = ConfigSnapshot::default();
        cfg.notice.repeat_enabled = true;
        cfg.notice.repeat_interval_sec = 60.0;
        let t0 = Instant::now();
        let s = state(0, false);

        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        notice.dismiss(10_000);
        notice.tick(t0, 80_000, &cfg, &s);
        assert!(notice.is_dismissed(), "saver enabled blocks repeat");

        cfg.saver.enabled = false;
        notice.tick(t0, 69_999, &cfg, &s);
        assert!(notice.is_dismissed());
        notice.tick(t0, 70_000, &cfg, &s);
        assert!(!notice.is_dismissed());
    }

    #[test]
    fn disabled_notice_hides() {
        let mut cfg = ConfigSnapshot::default();
        cfg.target.enabled = false;
        let mut notice = NoticeCoordinator::new(&CoordinationState::default());
        assert_eq!(
            notice.tick(Instant::now(), 0, &cfg, &state(0, false)),
            NoticeDecision::Hide
        );
    }
}
