//! Query debouncing.
//!
//! [`Debouncer`] is the pure half: it decides whether a query mutation arms a
//! fetch and which generation a timer belongs to. [`TimerSlot`] is the async
//! half that actually sleeps and reports back.

use std::time::Duration;

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tracing::trace;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_TRIGGER_THRESHOLD: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub delay: Duration,
    /// Minimum trimmed query length, in characters, before anything is armed.
    pub trigger_threshold: usize,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DEBOUNCE,
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debounce {
    Arm { generation: u64, delay: Duration },
    Disarm,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    settings: DebounceSettings,
    generation: u64,
    armed: Option<u64>,
}

impl Debouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            settings,
            generation: 0,
            armed: None,
        }
    }

    pub fn settings(&self) -> DebounceSettings {
        self.settings
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn meets_threshold(&self, query: &str) -> bool {
        query.trim().chars().count() >= self.settings.trigger_threshold
    }

    /// Every mutation starts a new generation, invalidating older timers and
    /// fetches.
    pub fn on_query_changed(&mut self, query: &str) -> Debounce {
        self.generation += 1;
        if self.meets_threshold(query) {
            self.armed = Some(self.generation);
            Debounce::Arm {
                generation: self.generation,
                delay: self.settings.delay,
            }
        } else {
            self.armed = None;
            Debounce::Disarm
        }
    }

    /// Returns `true` when the fire belongs to the armed generation. The timer
    /// is consumed either way.
    pub fn on_timer_fired(&mut self, generation: u64) -> bool {
        if self.armed == Some(generation) {
            self.armed = None;
            true
        } else {
            trace!(
                target: "kawai_session",
                generation,
                current = self.generation,
                "ignoring stale timer"
            );
            false
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn cancel(&mut self) {
        self.armed = None;
    }
}

/// Holds at most one pending timer task.
#[derive(Debug, Default)]
pub struct TimerSlot {
    pending: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the previous timer, then sleeps `delay` and sends
    /// `on_fire(generation)`.
    pub fn arm<E, F>(
        &mut self,
        generation: u64,
        delay: Duration,
        events: UnboundedSender<E>,
        on_fire: F,
    ) where
        E: Send + 'static,
        F: FnOnce(u64) -> E + Send + 'static,
    {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(on_fire(generation));
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
