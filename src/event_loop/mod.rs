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

//! Event Loop Implementation
//!
//! Turns work produced on many threads (socket completions, timers, callers)
//! into ordered execution on the single thread that calls [`EventLoop::run`].
//!
//! # Architecture
//!
//! - A [`Service`] owns all state that must only be touched by the loop thread.
//! - Any thread enqueues [`WorkItem`]s through a cloneable [`LoopHandle`]: either a
//!   tagged command of the service or a boxed job.
//! - Every tick the loop fires due timers, steps the cooperative tasks once, and
//!   then drains the queue until the tick period is used up. Pending items are
//!   carried to the next tick, so a flooded queue cannot starve timers or tasks.
//!
//! # Failure handling
//!
//! A panic escaping a work item, a timer callback or a task step is caught and
//! logged; the loop keeps running.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, trace};

use crate::{AppError, AppResult, LoopConfig};

pub use task::{CoTask, Step, Steppable, TaskId, TaskRunner, Wait};
pub use timer::{TimerCallback, TimerKey, TimerRegistry};

mod task;
mod timer;

/// State owned by the loop thread together with the commands it understands.
pub trait Service: Send + Sized + 'static {
    type Command: Send + 'static;

    fn handle(&mut self, command: Self::Command, ctx: &mut LoopContext<Self>);

    fn on_start(&mut self, _ctx: &mut LoopContext<Self>) {}

    /// Called once the loop has been asked to stop, before the final drain.
    fn on_stop(&mut self, _ctx: &mut LoopContext<Self>) {}
}

pub type Job<S> = Box<dyn FnOnce(&mut S, &mut LoopContext<S>) + Send>;

pub enum WorkItem<S: Service> {
    Command(S::Command),
    Job(Job<S>),
}

pub struct LoopHandle<S: Service> {
    sender: Sender<WorkItem<S>>,
    quit: Arc<AtomicBool>,
}

impl<S: Service> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        LoopHandle {
            sender: self.sender.clone(),
            quit: self.quit.clone(),
        }
    }
}

impl<S: Service> LoopHandle<S> {
    /// Enqueues a command for the loop thread. Never blocks.
    pub fn perform(&self, command: S::Command) -> AppResult<()> {
        self.enqueue(WorkItem::Command(command))
    }

    pub fn perform_job<F>(&self, job: F) -> AppResult<()>
    where
        F: FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    {
        self.enqueue(WorkItem::Job(Box::new(job)))
    }

    fn enqueue(&self, item: WorkItem<S>) -> AppResult<()> {
        self.sender
            .send(item)
            .map_err(|_| AppError::ChannelSendError("event loop is gone".to_string()))
    }

    /// Asks the loop to quit; observed at the top of the next tick.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Work items waiting in the queue.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoopStats {
    pub ticks: u64,
    pub executed: u64,
    /// Time spent on queued work during the last tick.
    pub work_elapsed: Duration,
    /// Time spent on timers and tasks during the last tick.
    pub idle_elapsed: Duration,
}

pub struct LoopContext<S: Service> {
    timers: TimerRegistry<S>,
    tasks: TaskRunner<S>,
    handle: LoopHandle<S>,
    started: Instant,
    stats: LoopStats,
}

impl<S: Service> LoopContext<S> {
    pub fn timers(&mut self) -> &mut TimerRegistry<S> {
        &mut self.timers
    }

    pub fn tasks(&mut self) -> &mut TaskRunner<S> {
        &mut self.tasks
    }

    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }

    /// Time since the loop was constructed.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn stop(&self) {
        self.handle.stop();
    }
}

pub struct EventLoop<S: Service> {
    receiver: Receiver<WorkItem<S>>,
    ctx: LoopContext<S>,
    period: Duration,
    final_drain: Duration,
}

impl<S: Service> EventLoop<S> {
    pub fn new(config: &LoopConfig) -> Self {
        let (sender, receiver) = channel::unbounded();
        let handle = LoopHandle {
            sender,
            quit: Arc::new(AtomicBool::new(false)),
        };
        EventLoop {
            receiver,
            ctx: LoopContext {
                timers: TimerRegistry::new(),
                tasks: TaskRunner::new(),
                handle,
                started: Instant::now(),
                stats: LoopStats::default(),
            },
            period: config.period(),
            final_drain: config.final_drain(),
        }
    }

    pub fn handle(&self) -> LoopHandle<S> {
        self.ctx.handle.clone()
    }

    /// Access to timers and tasks before `run`, e.g. to register startup timers.
    pub fn context(&mut self) -> &mut LoopContext<S> {
        &mut self.ctx
    }

    #[cfg(test)]
    pub(crate) fn receiver(&self) -> &Receiver<WorkItem<S>> {
        &self.receiver
    }

    /// Blocks the calling thread until `stop` is requested, then performs one
    /// bounded drain of the queue so in-flight completions are not dropped.
    pub fn run(&mut self, service: &mut S) {
        info!("event loop started with period {:?}", self.period);
        let ctx = &mut self.ctx;
        guard("service start", || service.on_start(ctx));

        while !self.ctx.handle.is_stopping() {
            self.tick(service);
        }

        debug!("event loop quitting after {} ticks", self.ctx.stats.ticks);
        let ctx = &mut self.ctx;
        guard("service stop", || service.on_stop(ctx));
        self.ctx.timers.clear();
        self.ctx.tasks.clear();

        let drained = self.drain_remaining(service);
        info!("event loop stopped, {} work items drained on exit", drained);
    }

    /// One iteration: timers, tasks, then queued work for up to one period.
    pub fn tick(&mut self, service: &mut S) {
        let tick_start = Instant::now();
        self.fire_timers(service, tick_start);
        self.update_tasks(service);

        // the work budget starts after timers and tasks, so slow steps cannot starve the queue
        let work_start = Instant::now();
        let deadline = work_start + self.period;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(item) => self.execute(service, item),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.ctx.stats.ticks += 1;
        self.ctx.stats.idle_elapsed = work_start - tick_start;
        self.ctx.stats.work_elapsed = work_start.elapsed();
    }

    fn fire_timers(&mut self, service: &mut S, now: Instant) {
        for key in self.ctx.timers.due_keys(now) {
            // an earlier callback of this tick may have cancelled it
            let Some(mut timer) = self.ctx.timers.take(key, now) else {
                continue;
            };
            trace!("{} fired", key);
            let ctx = &mut self.ctx;
            let callback = &mut timer.callback;
            guard("timer callback", || callback(service, ctx));
            self.ctx.timers.rearm(timer, now);
        }
    }

    fn update_tasks(&mut self, service: &mut S) {
        let mut active = self.ctx.tasks.begin_update();
        if active.is_empty() {
            self.ctx.tasks.end_update(active);
            return;
        }
        let ctx = &mut self.ctx;
        active.retain_mut(|task| {
            let more = task.update(service, ctx);
            if !more {
                ctx.tasks.finish(task.id());
            }
            more
        });
        self.ctx.tasks.end_update(active);
    }

    fn execute(&mut self, service: &mut S, item: WorkItem<S>) {
        let ctx = &mut self.ctx;
        guard("work item", || match item {
            WorkItem::Command(command) => service.handle(command, ctx),
            WorkItem::Job(job) => job(service, ctx),
        });
        self.ctx.stats.executed += 1;
    }

    fn drain_remaining(&mut self, service: &mut S) -> usize {
        let deadline = Instant::now() + self.final_drain;
        let mut drained = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(item) => {
                    self.execute(service, item);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }
}

/// Runs `f`, logging instead of unwinding if it panics. Returns false on panic.
pub(crate) fn guard<F: FnOnce()>(what: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!("{} panicked with message: {}", what, panic_message(&payload));
            false
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
