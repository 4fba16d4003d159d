// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

use super::{LoopContext, Service};

/// Identity of a timer registration.
///
/// Invoking again with a key that is still registered replaces the previous
/// timer, so a key never has more than one active timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

pub type TimerCallback<S> = Box<dyn FnMut(&mut S, &mut LoopContext<S>) + Send>;

struct TimerEntry<S: Service> {
    due: Instant,
    period: Option<Duration>,
    generation: u64,
    // None while the callback is running
    callback: Option<TimerCallback<S>>,
}

pub(crate) struct DueTimer<S: Service> {
    pub(crate) key: TimerKey,
    pub(crate) generation: u64,
    pub(crate) period: Option<Duration>,
    pub(crate) callback: TimerCallback<S>,
}

/// One-shot and repeating timers, advanced by the event loop on every tick.
pub struct TimerRegistry<S: Service> {
    timers: HashMap<TimerKey, TimerEntry<S>>,
    next_key: u64,
    next_generation: u64,
}

impl<S: Service> Default for TimerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Service> TimerRegistry<S> {
    pub fn new() -> Self {
        TimerRegistry {
            timers: HashMap::new(),
            next_key: 1,
            next_generation: 1,
        }
    }

    /// Allocates a key for later `invoke`/`cancel` calls. Nothing is scheduled yet.
    pub fn new_key(&mut self) -> TimerKey {
        let key = TimerKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Fires `callback` once after `delay`, replacing whatever `key` had scheduled.
    pub fn invoke<F>(&mut self, key: TimerKey, delay: Duration, callback: F)
    where
        F: FnMut(&mut S, &mut LoopContext<S>) + Send + 'static,
    {
        self.insert(key, delay, None, Box::new(callback));
    }

    /// Fires `callback` after `delay` and then every `period` until cancelled.
    pub fn invoke_repeating<F>(&mut self, key: TimerKey, delay: Duration, period: Duration, callback: F)
    where
        F: FnMut(&mut S, &mut LoopContext<S>) + Send + 'static,
    {
        self.insert(key, delay, Some(period), Box::new(callback));
    }

    pub fn schedule<F>(&mut self, delay: Duration, callback: F) -> TimerKey
    where
        F: FnMut(&mut S, &mut LoopContext<S>) + Send + 'static,
    {
        let key = self.new_key();
        self.invoke(key, delay, callback);
        key
    }

    pub fn schedule_repeating<F>(&mut self, delay: Duration, period: Duration, callback: F) -> TimerKey
    where
        F: FnMut(&mut S, &mut LoopContext<S>) + Send + 'static,
    {
        let key = self.new_key();
        self.invoke_repeating(key, delay, period, callback);
        key
    }

    /// Returns whether a registration was removed. Unknown keys are ignored.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        let removed = self.timers.remove(&key).is_some();
        if removed {
            trace!("{} cancelled", key);
        }
        removed
    }

    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.timers.is_empty() {
            trace!("clear {} timers", self.timers.len());
        }
        self.timers.clear();
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.timers.values().map(|entry| entry.due).min()
    }

    fn insert(
        &mut self,
        key: TimerKey,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback<S>,
    ) {
        if self.timers.remove(&key).is_some() {
            trace!("{} re-registered, previous registration cancelled", key);
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timers.insert(
            key,
            TimerEntry {
                due: Instant::now() + delay,
                period,
                generation,
                callback: Some(callback),
            },
        );
    }

    /// Keys due at `now`, earliest first.
    pub(crate) fn due_keys(&self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(Instant, TimerKey)> = self
            .timers
            .iter()
            .filter(|(_, entry)| entry.callback.is_some() && entry.due <= now)
            .map(|(key, entry)| (entry.due, *key))
            .collect();
        due.sort();
        due.into_iter().map(|(_, key)| key).collect()
    }

    /// Takes the callback of a due timer out for firing. One-shot timers leave
    /// the registry here; repeating ones stay registered and wait for `rearm`.
    pub(crate) fn take(&mut self, key: TimerKey, now: Instant) -> Option<DueTimer<S>> {
        let entry = self.timers.get_mut(&key)?;
        if entry.due > now {
            return None;
        }
        let period = entry.period;
        match period {
            Some(period) => {
                let callback = entry.callback.take()?;
                Some(DueTimer {
                    key,
                    generation: entry.generation,
                    period: Some(period),
                    callback,
                })
            }
            None => {
                let entry = self.timers.remove(&key)?;
                Some(DueTimer {
                    key,
                    generation: entry.generation,
                    period: None,
                    callback: entry.callback?,
                })
            }
        }
    }

    /// Puts a fired repeating timer back with its next due time at `now + period`.
    /// Dropped if the callback cancelled or replaced its own registration.
    pub(crate) fn rearm(&mut self, timer: DueTimer<S>, now: Instant) {
        let Some(period) = timer.period else {
            return;
        };
        if let Some(entry) = self.timers.get_mut(&timer.key) {
            if entry.generation == timer.generation {
                entry.due = now + period;
                entry.callback = Some(timer.callback);
            }
        }
    }
}
