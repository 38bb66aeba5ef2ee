//! Deadline scheduler registry.
//!
//! A registry of "fire no sooner than every `interval`" callbacks, evaluated
//! by an external pump calling [`Scheduler::run_once`].
//!
//! All mutation and the due-scan inside `run_once` are serialized on one
//! mutex. Callbacks are cloned out of the registry and run with that mutex
//! released, so a callback may call back into the scheduler (add, change,
//! reset or remove any cookie, its own included) without deadlocking.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use super::clock::{Clock, SystemClock};
use crate::core::SCHEDULER_EPSILON;

/// Handle identifying one registered task.
///
/// Cookies are allocated from a monotonic counter starting at 1 and are never
/// reused, so a stale cookie can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(NonZeroU64);

impl Cookie {
    /// Raw cookie value (never zero).
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type TaskCallback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    callback: TaskCallback,
    interval: Duration,
    added_at: Instant,
    /// `None` until the first fire: the entry counts as back-dated by
    /// `interval + ε`, so it is due on the next tick.
    last_fired: Option<Instant>,
}

impl Entry {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_fired {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        }
    }

    /// Advance by exactly one interval so repeated firing keeps its phase.
    fn advance(&mut self) {
        let next = match self.last_fired {
            None => self
                .added_at
                .checked_sub(SCHEDULER_EPSILON)
                .unwrap_or(self.added_at),
            Some(last) => last + self.interval,
        };
        self.last_fired = Some(next);
    }
}

struct Registry {
    entries: BTreeMap<Cookie, Entry>,
    next_cookie: NonZeroU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_cookie: NonZeroU64::MIN,
        }
    }
}

impl Registry {
    fn insert(&mut self, entry: Entry) -> Cookie {
        let cookie = Cookie(self.next_cookie);
        self.next_cookie = self.next_cookie.saturating_add(1);
        self.entries.insert(cookie, entry);
        cookie
    }
}

/// Concurrency-safe registry of periodic callbacks.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
}

impl Scheduler {
    /// Create a scheduler reading time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a scheduler reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// The clock this scheduler reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `callback` to run every `interval`, starting on the next tick.
    pub fn add<F>(&self, callback: F, interval: Duration) -> Cookie
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(Arc::new(callback), interval, None)
    }

    /// Register `callback` to run every `interval`, starting one interval
    /// from now.
    ///
    /// This is the timeout-style arming used after a first attempt has
    /// already been made by the caller.
    pub fn add_deferred<F>(&self, callback: F, interval: Duration) -> Cookie
    where
        F: Fn() + Send + Sync + 'static,
    {
        let now = self.clock.now();
        self.insert(Arc::new(callback), interval, Some(now))
    }

    fn insert(
        &self,
        callback: TaskCallback,
        interval: Duration,
        last_fired: Option<Instant>,
    ) -> Cookie {
        let entry = Entry {
            callback,
            interval,
            added_at: self.clock.now(),
            last_fired,
        };
        let cookie = self.lock().insert(entry);
        trace!(%cookie, ?interval, "scheduler task added");
        cookie
    }

    /// Change the interval of a live task. Unknown cookies are ignored.
    pub fn change(&self, cookie: Cookie, interval: Duration) {
        if let Some(entry) = self.lock().entries.get_mut(&cookie) {
            entry.interval = interval;
        }
    }

    /// Restart the wait of a live task from now. Unknown cookies are ignored.
    pub fn reset(&self, cookie: Cookie) {
        let now = self.clock.now();
        if let Some(entry) = self.lock().entries.get_mut(&cookie) {
            entry.last_fired = Some(now);
        }
    }

    /// Remove a task. Unknown cookies are ignored.
    ///
    /// Safe to call from inside any callback, including the one registered
    /// under `cookie`.
    pub fn remove(&self, cookie: Cookie) {
        if self.lock().entries.remove(&cookie).is_some() {
            trace!(%cookie, "scheduler task removed");
        }
    }

    /// Whether `cookie` refers to a live task.
    pub fn contains(&self, cookie: Cookie) -> bool {
        self.lock().entries.contains_key(&cookie)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no task is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Fire every task whose interval has elapsed.
    ///
    /// Returns the number of callbacks invoked. A task removed by an earlier
    /// callback of the same pass is skipped; no task fires twice per pass.
    pub fn run_once(&self) -> usize {
        let now = self.clock.now();

        let due: Vec<(Cookie, TaskCallback)> = {
            let mut registry = self.lock();
            registry
                .entries
                .iter_mut()
                .filter(|(_, entry)| entry.is_due(now))
                .map(|(cookie, entry)| {
                    entry.advance();
                    (*cookie, Arc::clone(&entry.callback))
                })
                .collect()
        };

        let mut fired = 0;
        for (cookie, callback) in due {
            if !self.contains(cookie) {
                trace!(%cookie, "skipping task removed during this pass");
                continue;
            }
            callback();
            fired += 1;
        }
        fired
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("clock", &self.clock)
            .field("tasks", &self.len())
            .finish()
    }
}
