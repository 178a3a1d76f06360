//! Single-slot cancellable timers.
//!
//! Arming a slot cancels whatever it held before. Each arm gets an id so the
//! fired task can check, under the registry lock, that it is still the
//! current occupant before acting.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// At most one pending timer.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    current: Option<(u64, CancellationToken)>,
}

impl TimerSlot {
    /// Arms the slot. `f` receives the timer id and runs after `delay`
    /// unless the slot is cancelled or re-armed first.
    pub(crate) fn arm<F, Fut>(&mut self, delay: Duration, f: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => f(id).await,
            }
        });
        self.current = Some((id, token));
        id
    }

    pub(crate) fn cancel(&mut self) {
        if let Some((_, token)) = self.current.take() {
            token.cancel();
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.current.is_some()
    }

    /// Empties the slot if `id` is its occupant. Called by the fired task.
    pub(crate) fn clear_if(&mut self, id: u64) -> bool {
        if self.current.as_ref().is_some_and(|(cur, _)| *cur == id) {
            self.current = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One [`TimerSlot`] per key.
#[derive(Debug)]
pub(crate) struct TimerSlots<K> {
    slots: HashMap<K, TimerSlot>,
}

impl<K> Default for TimerSlots<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> TimerSlots<K> {
    pub(crate) fn arm<F, Fut>(&mut self, key: K, delay: Duration, f: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.slots.entry(key).or_default().arm(delay, f)
    }

    pub(crate) fn cancel(&mut self, key: &K) {
        // Dropping the slot cancels it.
        self.slots.remove(key);
    }

    pub(crate) fn cancel_all(&mut self) {
        self.slots.clear();
    }

    pub(crate) fn is_armed(&self, key: &K) -> bool {
        self.slots.get(key).is_some_and(TimerSlot::is_armed)
    }

    pub(crate) fn clear_if(&mut self, key: &K, id: u64) -> bool {
        let cleared = self.slots.get_mut(key).is_some_and(|s| s.clear_if(id));
        if cleared {
            self.slots.remove(key);
        }
        cleared
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
