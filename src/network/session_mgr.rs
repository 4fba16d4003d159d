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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::session::{CloseReason, SessionId, SessionLink};

/// Live connections, reachable from any thread.
#[derive(Debug, Default)]
pub struct SessionManager {
    links: DashMap<SessionId, Arc<SessionLink>>,
    next_id: AtomicU32,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link under a fresh id. Ids are never 0 and never shared by
    /// two live sessions, even after the counter wraps.
    pub fn allocate<F>(&self, make: F) -> Arc<SessionLink>
    where
        F: FnOnce(SessionId) -> SessionLink,
    {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if raw == 0 {
                continue;
            }
            let id = SessionId(raw);
            if let Entry::Vacant(vacant) = self.links.entry(id) {
                let link = Arc::new(make(id));
                vacant.insert(link.clone());
                trace!("{} registered", id);
                return link;
            }
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionLink>> {
        self.links.get(&id).map(|link| link.value().clone())
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionLink>> {
        self.links.remove(&id).map(|(_, link)| link)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Closes every link accepted by `filter`; returns how many closes this call performed.
    pub fn close_where<P>(&self, reason: CloseReason, filter: P) -> usize
    where
        P: Fn(&SessionLink) -> bool,
    {
        // collect first, closing queues work while the map shard would still be locked
        let links: Vec<Arc<SessionLink>> = self
            .links
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        links.iter().filter(|link| link.close(reason)).count()
    }

    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.close_where(reason, |_| true)
    }
}
