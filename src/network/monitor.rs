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

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

use crate::event_loop::LoopStats;

/// Frame and byte counters bumped by the socket tasks.
#[derive(Debug, Default)]
pub struct Monitor {
    frames_read: AtomicU64,
    frames_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub frames_read: u64,
    pub frames_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Monitor {
    pub fn record_read(&self, frames: usize, bytes: usize) {
        self.frames_read.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, frames: usize, bytes: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Logs the throughput between two snapshots. The `monotonic_counter.`
    /// fields are picked up as counters by the metrics layer when it is enabled.
    pub fn report(
        &self,
        last: &MonitorSnapshot,
        current: &MonitorSnapshot,
        interval: Duration,
        loop_stats: &LoopStats,
        queued_jobs: usize,
        sessions: usize,
    ) {
        let delta = current.delta(last);
        let seconds = interval.as_secs_f64().max(f64::EPSILON);
        info!(
            monotonic_counter.frames_read = delta.frames_read,
            monotonic_counter.frames_written = delta.frames_written,
            monotonic_counter.bytes_read = delta.bytes_read,
            monotonic_counter.bytes_written = delta.bytes_written,
            "read/s {:.1} write/s {:.1} queued jobs {} sessions {} last tick work {:?} idle {:?}",
            delta.frames_read as f64 / seconds,
            delta.frames_written as f64 / seconds,
            queued_jobs,
            sessions,
            loop_stats.work_elapsed,
            loop_stats.idle_elapsed
        );
    }
}

impl MonitorSnapshot {
    pub fn delta(&self, earlier: &MonitorSnapshot) -> MonitorSnapshot {
        MonitorSnapshot {
            frames_read: self.frames_read.saturating_sub(earlier.frames_read),
            frames_written: self.frames_written.saturating_sub(earlier.frames_written),
            bytes_read: self.bytes_read.saturating_sub(earlier.bytes_read),
            bytes_written: self.bytes_written.saturating_sub(earlier.bytes_written),
        }
    }
}
