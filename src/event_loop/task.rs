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

//! Cooperative tasks polled by the event loop.
//!
//! A task is a stack of [`Steppable`]s. Every loop tick the top of the stack is
//! stepped once: `More` keeps it on top for the next tick, `Await` pushes a
//! sub-task that runs first, `Done` pops it and immediately resumes the one
//! below, `Failed` (or a panic) ends the whole task.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use super::{panic_message, LoopContext, Service, TimerKey};
use crate::AppError;

pub enum Step<S: Service> {
    /// Not finished, step again next tick.
    More,
    /// Run the sub-task to completion before stepping this one again.
    Await(Box<dyn Steppable<S>>),
    Done,
    Failed(AppError),
}

impl<S: Service> Step<S> {
    pub fn wait_for<T: Steppable<S> + 'static>(task: T) -> Step<S> {
        Step::Await(Box::new(task))
    }
}

impl<S: Service> fmt::Debug for Step<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::More => write!(f, "More"),
            Step::Await(_) => write!(f, "Await(..)"),
            Step::Done => write!(f, "Done"),
            Step::Failed(e) => write!(f, "Failed({})", e),
        }
    }
}

pub trait Steppable<S: Service>: Send {
    fn step(&mut self, service: &mut S, ctx: &mut LoopContext<S>) -> Step<S>;
}

impl<S, F> Steppable<S> for F
where
    S: Service,
    F: FnMut(&mut S, &mut LoopContext<S>) -> Step<S> + Send,
{
    fn step(&mut self, service: &mut S, ctx: &mut LoopContext<S>) -> Step<S> {
        self(service, ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

pub struct CoTask<S: Service> {
    id: TaskId,
    stack: Vec<Box<dyn Steppable<S>>>,
    completed: bool,
}

impl<S: Service> CoTask<S> {
    fn new(id: TaskId, root: Box<dyn Steppable<S>>) -> Self {
        CoTask {
            id,
            stack: vec![root],
            completed: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn complete(&mut self) {
        self.completed = true;
        self.stack.clear();
    }

    /// Steps the task once. Returns false once it has completed; a completed
    /// task is never stepped again.
    pub(crate) fn update(&mut self, service: &mut S, ctx: &mut LoopContext<S>) -> bool {
        if self.completed {
            return false;
        }
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.complete();
                return false;
            };
            let step = panic::catch_unwind(AssertUnwindSafe(|| top.step(service, ctx)));
            match step {
                Ok(Step::More) => return true,
                Ok(Step::Await(sub)) => {
                    self.stack.push(sub);
                    return true;
                }
                Ok(Step::Done) => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        trace!("{} completed", self.id);
                        self.complete();
                        return false;
                    }
                    // the awaiting step resumes in this same update
                }
                Ok(Step::Failed(e)) => {
                    error!("{} failed: {}", self.id, e);
                    self.complete();
                    return false;
                }
                Err(payload) => {
                    error!("{} panicked: {}", self.id, panic_message(&payload));
                    self.complete();
                    return false;
                }
            }
        }
    }
}

/// Tasks in three buckets so starting or stopping a task during an update only
/// takes effect at the start of the next one.
pub struct TaskRunner<S: Service> {
    next_id: u64,
    active: Vec<CoTask<S>>,
    incoming: Vec<CoTask<S>>,
    finished: Vec<TaskId>,
}

impl<S: Service> Default for TaskRunner<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Service> TaskRunner<S> {
    pub fn new() -> Self {
        TaskRunner {
            next_id: 1,
            active: Vec::new(),
            incoming: Vec::new(),
            finished: Vec::new(),
        }
    }

    pub fn start<T: Steppable<S> + 'static>(&mut self, task: T) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.incoming.push(CoTask::new(id, Box::new(task)));
        id
    }

    pub fn stop(&mut self, id: TaskId) {
        self.finished.push(id);
    }

    /// Started and not yet finished tasks, including those waiting for the next update.
    pub fn len(&self) -> usize {
        self.active.len() + self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        !self.finished.contains(&id)
            && self
                .active
                .iter()
                .chain(self.incoming.iter())
                .any(|task| task.id == id)
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.incoming.clear();
        self.finished.clear();
    }

    /// Applies pending stops and starts, then hands the active set to the loop.
    pub(crate) fn begin_update(&mut self) -> Vec<CoTask<S>> {
        if !self.finished.is_empty() {
            let finished = mem::take(&mut self.finished);
            self.active.retain(|task| !finished.contains(&task.id));
            self.incoming.retain(|task| !finished.contains(&task.id));
        }
        self.active.append(&mut self.incoming);
        mem::take(&mut self.active)
    }

    pub(crate) fn finish(&mut self, id: TaskId) {
        self.finished.push(id);
    }

    pub(crate) fn end_update(&mut self, mut still_running: Vec<CoTask<S>>) {
        still_running.append(&mut self.active);
        self.active = still_running;
    }
}

/// Cooperative sleep: completes once a one-shot timer of `period` has fired.
pub struct Wait {
    period: Duration,
    fired: Arc<AtomicBool>,
    timer: Option<TimerKey>,
}

impl Wait {
    pub fn new(period: Duration) -> Self {
        Wait {
            period,
            fired: Arc::new(AtomicBool::new(false)),
            timer: None,
        }
    }
}

impl<S: Service> Steppable<S> for Wait {
    fn step(&mut self, _service: &mut S, ctx: &mut LoopContext<S>) -> Step<S> {
        if self.timer.is_none() {
            let fired = self.fired.clone();
            let key = ctx
                .timers()
                .schedule(self.period, move |_, _| fired.store(true, Ordering::Release));
            self.timer = Some(key);
            return Step::More;
        }
        if self.fired.load(Ordering::Acquire) {
            Step::Done
        } else {
            Step::More
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::event_loop::EventLoop;
    use crate::LoopConfig;

    #[derive(Default)]
    struct Journal(Vec<&'static str>);

    impl Service for Journal {
        type Command = ();

        fn handle(&mut self, _command: (), _ctx: &mut LoopContext<Self>) {}
    }

    fn test_loop() -> EventLoop<Journal> {
        EventLoop::new(&LoopConfig {
            period_ms: 1,
            final_drain_factor: 1,
        })
    }

    fn sub_task() -> impl Steppable<Journal> {
        let mut steps = 0;
        move |journal: &mut Journal, _: &mut LoopContext<Journal>| {
            steps += 1;
            journal.0.push("inner");
            if steps == 2 {
                Step::Done
            } else {
                Step::More
            }
        }
    }

    #[test]
    fn test_nested_task_runs_depth_first() {
        let mut event_loop = test_loop();
        let mut journal = Journal::default();
        let mut stage = 0;
        event_loop.context().tasks().start(move |journal: &mut Journal, _: &mut LoopContext<Journal>| {
            stage += 1;
            match stage {
                1 => {
                    journal.0.push("outer-start");
                    Step::wait_for(sub_task())
                }
                _ => {
                    journal.0.push("outer-end");
                    Step::Done
                }
            }
        });

        for _ in 0..5 {
            event_loop.tick(&mut journal);
        }

        assert_eq!(journal.0, vec!["outer-start", "inner", "inner", "outer-end"]);
        assert!(event_loop.context().tasks().is_empty());
    }

    #[test]
    fn test_failed_task_never_resumes() {
        let mut event_loop = test_loop();
        let mut journal = Journal::default();
        event_loop
            .context()
            .tasks()
            .start(|journal: &mut Journal, _: &mut LoopContext<Journal>| {
                journal.0.push("step");
                Step::Failed(AppError::TaskFailed("boom".to_string()))
            });

        event_loop.tick(&mut journal);
        event_loop.tick(&mut journal);

        assert_eq!(journal.0, vec!["step"]);
    }

    #[test]
    fn test_panicking_task_is_completed() {
        let mut event_loop = test_loop();
        let mut journal = Journal::default();
        let id = event_loop
            .context()
            .tasks()
            .start(|_: &mut Journal, _: &mut LoopContext<Journal>| -> Step<Journal> {
                panic!("task exploded")
            });

        event_loop.tick(&mut journal);

        assert!(!event_loop.context().tasks().is_running(id));
        // the loop itself keeps going
        event_loop.tick(&mut journal);
    }

    #[test]
    fn test_stop_during_update_applies_next_update() {
        let mut event_loop = test_loop();
        let mut journal = Journal::default();
        let victim = event_loop
            .context()
            .tasks()
            .start(|journal: &mut Journal, _: &mut LoopContext<Journal>| {
                journal.0.push("victim");
                Step::More
            });
        let mut stopped = false;
        event_loop
            .context()
            .tasks()
            .start(move |_: &mut Journal, ctx: &mut LoopContext<Journal>| {
                if !stopped {
                    ctx.tasks().stop(victim);
                    stopped = true;
                }
                Step::More
            });

        event_loop.tick(&mut journal);
        event_loop.tick(&mut journal);
        event_loop.tick(&mut journal);

        // ran once in the tick the stop was requested, never after
        assert_eq!(journal.0, vec!["victim"]);
        assert_eq!(event_loop.context().tasks().len(), 1);
    }

    #[test]
    fn test_wait_sleeps_without_blocking_the_loop() {
        let mut event_loop = test_loop();
        let mut journal = Journal::default();
        let mut waited = false;
        event_loop
            .context()
            .tasks()
            .start(move |journal: &mut Journal, _: &mut LoopContext<Journal>| {
                if !waited {
                    waited = true;
                    return Step::wait_for(Wait::new(Duration::from_millis(20)));
                }
                journal.0.push("woke");
                Step::Done
            });

        let start = Instant::now();
        while journal.0.is_empty() && start.elapsed() < Duration::from_secs(2) {
            event_loop.tick(&mut journal);
        }

        assert_eq!(journal.0, vec!["woke"]);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
