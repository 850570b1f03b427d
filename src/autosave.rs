//! Auto-save manager with debouncing and a periodic deadline.
//!
//! Two independent triggers decide when unsaved changes get persisted:
//! 1. **Debounce**: every change restarts a quiet-period timer; saving
//!    happens once no change has arrived for `debounce_delay`.
//! 2. **Interval**: once changes are pending, a save is forced no later than
//!    `save_interval` after the first unsaved change, even while edits keep
//!    arriving.
//!
//! The manager only answers whether a save is due; it never saves on its
//! own. A failed save is not retried: the changes stay pending and the same
//! triggers make them due again on a later poll, no sooner than one
//! debounce period after the failure.
//!
//! All time-dependent methods have an `*_at(now)` form so callers and tests
//! can inject the clock.

use std::time::Duration;
use web_time::Instant;

use crate::config::AutoSaveSettings;

/// Which trigger made a save due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    /// The quiet period after the last change elapsed
    Debounce,
    /// Changes have been pending for the whole save interval
    Interval,
}

#[derive(Debug)]
pub struct AutoSaveManager {
    /// Longest time changes may stay unsaved.
    save_interval: Duration,

    /// Quiet period after the last change before saving.
    debounce_delay: Duration,

    /// Time of last successful save.
    last_save: Option<Instant>,

    /// Time of the most recent unsaved change.
    last_change: Option<Instant>,

    /// Time of the first change since the last save.
    dirty_since: Option<Instant>,

    /// After a failed save, nothing is due before this instant.
    held_until: Option<Instant>,

    enabled: bool,
}

impl AutoSaveManager {
    pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        Self {
            save_interval: Self::DEFAULT_SAVE_INTERVAL,
            debounce_delay: Self::DEFAULT_DEBOUNCE_DELAY,
            last_save: None,
            last_change: None,
            dirty_since: None,
            held_until: None,
            enabled: true,
        }
    }

    /// Manager configured from the engine's autosave settings.
    pub fn from_settings(settings: &AutoSaveSettings) -> Self {
        let mut manager = Self::new()
            .with_debounce_delay(Duration::from_millis(settings.debounce_ms))
            .with_save_interval(Duration::from_millis(settings.interval_ms));
        manager.enabled = settings.enabled;
        manager
    }

    pub fn disabled() -> Self {
        let mut manager = Self::new();
        manager.enabled = false;
        manager
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_debounce_delay(mut self, delay: Duration) -> Self {
        self.debounce_delay = delay;
        self
    }

    /// Mark that a change occurred that needs saving.
    pub fn mark_dirty(&mut self) {
        self.mark_dirty_at(Instant::now());
    }

    pub fn mark_dirty_at(&mut self, now: Instant) {
        self.last_change = Some(now);
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
        log::trace!("Auto-save: marked dirty");
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    pub fn should_save(&self) -> bool {
        self.due_at(Instant::now()).is_some()
    }

    pub fn should_save_at(&self, now: Instant) -> bool {
        self.due_at(now).is_some()
    }

    /// Which trigger, if any, makes a save due at `now`.
    pub fn due_at(&self, now: Instant) -> Option<SaveReason> {
        if !self.enabled {
            return None;
        }
        let dirty_since = self.dirty_since?;
        let last_change = self.last_change?;
        if self.held_until.is_some_and(|held| now < held) {
            return None;
        }

        if now.saturating_duration_since(dirty_since) >= self.save_interval {
            Some(SaveReason::Interval)
        } else if now.saturating_duration_since(last_change) >= self.debounce_delay {
            Some(SaveReason::Debounce)
        } else {
            None
        }
    }

    /// Earliest instant at which a save may become due, for scheduling a
    /// wake-up. `None` when nothing is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.enabled {
            return None;
        }
        let debounce = self.last_change? + self.debounce_delay;
        let interval = self.dirty_since? + self.save_interval;
        let deadline = debounce.min(interval);
        Some(match self.held_until {
            Some(held) => deadline.max(held),
            None => deadline,
        })
    }

    pub fn mark_saved(&mut self) {
        self.mark_saved_at(Instant::now());
    }

    pub fn mark_saved_at(&mut self, now: Instant) {
        self.last_save = Some(now);
        self.last_change = None;
        self.dirty_since = None;
        self.held_until = None;
        log::trace!("Auto-save: marked saved");
    }

    /// Keep the changes pending but report nothing due for one debounce
    /// period. The caller decides whether to save again when a later poll
    /// finds the changes due.
    pub fn mark_save_failed_at(&mut self, now: Instant) {
        self.held_until = Some(now + self.debounce_delay);
        log::trace!("Auto-save: marked save failed");
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        log::debug!("Auto-save: enabled = {}", enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn time_since_last_save(&self) -> Option<Duration> {
        self.last_save.map(|t| t.elapsed())
    }

    /// Reset all timing state.
    pub fn reset(&mut self) {
        self.last_save = None;
        self.last_change = None;
        self.dirty_since = None;
        self.held_until = None;
    }
}

impl Default for AutoSaveManager {
    fn default() -> Self {
        Self::new()
    }
}
