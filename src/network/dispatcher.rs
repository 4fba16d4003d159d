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
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::client::{self, ClientId};
use super::connection::Transport;
use super::frame::Frame;
use super::message::{NetError, RpcResult};
use super::monitor::MonitorSnapshot;
use super::session::{CloseReason, KeepAlive, Origin, Outgoing, Session, SessionId, SessionLink};
use crate::event_loop::{guard, LoopContext, Service, TimerKey};
use crate::{AppError, AppResult, ClientConfig, MonitorConfig, SessionConfig};

/// Application callbacks, always invoked on the event loop thread.
///
/// Every method has a default that only logs, so a handler overrides just what
/// it serves.
pub trait Handler: Send {
    fn on_open(&mut self, session: &mut Session) {
        debug!("{} opened with {}", session.id(), session.peer());
    }

    fn on_push(&mut self, session: &mut Session, data: Bytes) -> AppResult<()> {
        warn!(
            "{} dropped a push of {} bytes, you should override on_push",
            session.id(),
            data.len()
        );
        Ok(())
    }

    fn on_request(&mut self, session: &mut Session, data: Bytes) -> AppResult<RpcResult> {
        warn!(
            "{} has no request handler for {} bytes, you should override on_request",
            session.id(),
            data.len()
        );
        Ok(RpcResult::error(NetError::NoHandler))
    }

    fn on_close(&mut self, session: &mut Session, reason: CloseReason) {
        debug!("{} closed, reason {:?}", session.id(), reason);
    }

    /// A connection attempt to `peer` failed.
    fn on_error(&mut self, peer: &str, error: &AppError) {
        warn!("connect to {} failed: {}", peer, error);
    }

    fn on_subscribe(&mut self, session: &mut Session, subject: &str) {
        warn!("{} subscribe {} ignored", session.id(), subject);
    }

    fn on_unsubscribe(&mut self, session: &mut Session, subject: &str) {
        warn!("{} unsubscribe {} ignored", session.id(), subject);
    }

    fn on_publish(&mut self, session: &mut Session, subject: &str, data: Bytes) {
        warn!(
            "{} publish of {} bytes on {} ignored",
            session.id(),
            data.len(),
            subject
        );
    }
}

/// Everything a new connection hands over to the loop.
pub struct SessionSeed {
    pub(crate) link: Arc<SessionLink>,
    pub(crate) outbound: mpsc::UnboundedSender<Outgoing>,
    pub(crate) keep_alive: Option<KeepAlive>,
}

/// Events produced by the socket tasks, executed in order on the loop thread.
pub enum SessionCommand {
    Open(SessionSeed),
    Frames { id: SessionId, frames: Vec<Frame> },
    SendCompleted { id: SessionId, token: u64, ok: bool },
    Closed { id: SessionId, reason: CloseReason },
    ConnectFailed { client: ClientId, error: AppError },
}

struct ClientEntry {
    config: ClientConfig,
    session: Option<SessionId>,
    reconnect_timer: TimerKey,
}

/// The loop-side owner of every session.
pub struct Dispatcher {
    handler: Box<dyn Handler>,
    sessions: HashMap<SessionId, Session>,
    keep_alive_timers: HashMap<SessionId, TimerKey>,
    clients: HashMap<ClientId, ClientEntry>,
    transport: Transport,
    session_config: SessionConfig,
    monitor_interval: Duration,
    last_snapshot: MonitorSnapshot,
}

impl Dispatcher {
    pub fn new<H: Handler + 'static>(
        handler: H,
        transport: Transport,
        session_config: SessionConfig,
        monitor_config: &MonitorConfig,
    ) -> Self {
        Dispatcher {
            handler: Box::new(handler),
            sessions: HashMap::new(),
            keep_alive_timers: HashMap::new(),
            clients: HashMap::new(),
            transport,
            session_config,
            monitor_interval: Duration::from_millis(monitor_config.interval_ms),
            last_snapshot: MonitorSnapshot::default(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The live session of a client, if it is connected.
    pub fn client_session_mut(&mut self, client: ClientId) -> Option<&mut Session> {
        let id = self.clients.get(&client)?.session?;
        self.sessions.get_mut(&id)
    }

    fn open(&mut self, seed: SessionSeed, ctx: &mut LoopContext<Self>) {
        let id = seed.link.id();
        let session = Session::new(
            seed.link,
            seed.outbound,
            self.transport.config().max_frame_size,
            seed.keep_alive,
        );

        if let Origin::Client(client) = session.origin() {
            match self.clients.get_mut(&client) {
                Some(entry) => {
                    if let Some(previous) = entry.session.replace(id) {
                        if let Some(old) = self.sessions.get(&previous) {
                            old.close(CloseReason::Replaced);
                        }
                    }
                }
                None => {
                    debug!("{} belongs to stopped {}, closing", id, client);
                    session.close(CloseReason::Stop);
                }
            }
        }

        if let Some(keep_alive) = seed.keep_alive {
            let key = ctx.timers().schedule_repeating(
                keep_alive.interval,
                keep_alive.interval,
                move |dispatcher: &mut Dispatcher, _: &mut LoopContext<Dispatcher>| {
                    if let Some(session) = dispatcher.sessions.get_mut(&id) {
                        session.on_keep_alive();
                    }
                },
            );
            self.keep_alive_timers.insert(id, key);
        }

        info!("{} opened with {} ({:?})", id, session.peer(), session.origin());
        let session = self.sessions.entry(id).or_insert(session);
        let handler = &mut self.handler;
        guard("open handler", || handler.on_open(session));
    }

    fn closed(&mut self, id: SessionId, reason: CloseReason, ctx: &mut LoopContext<Self>) {
        self.transport.session_mgr().remove(id);
        if let Some(key) = self.keep_alive_timers.remove(&id) {
            ctx.timers().cancel(key);
        }
        let Some(mut session) = self.sessions.remove(&id) else {
            debug!("{} close notification for unknown session", id);
            return;
        };
        info!("{} with {} closed, reason {:?}", id, session.peer(), reason);

        session.resolve_pending();
        let handler = &mut self.handler;
        guard("close handler", || handler.on_close(&mut session, reason));

        if let Origin::Client(client) = session.origin() {
            let reconnect = match self.clients.get_mut(&client) {
                Some(entry) if entry.session == Some(id) => {
                    entry.session = None;
                    true
                }
                _ => false,
            };
            if reconnect {
                self.schedule_reconnect(client, ctx);
            }
        }
    }

    pub(crate) fn add_client(&mut self, id: ClientId, config: ClientConfig, ctx: &mut LoopContext<Self>) {
        info!("{} connecting to {}", id, config.name());
        let entry = ClientEntry {
            config,
            session: None,
            reconnect_timer: ctx.timers().new_key(),
        };
        self.clients.insert(id, entry);
        self.connect_client(id);
    }

    fn connect_client(&mut self, id: ClientId) {
        if let Some(entry) = self.clients.get(&id) {
            client::connect(&self.transport, id, &entry.config);
        }
    }

    fn schedule_reconnect(&mut self, id: ClientId, ctx: &mut LoopContext<Self>) {
        let Some(entry) = self.clients.get(&id) else {
            return;
        };
        if !entry.config.auto_reconnect {
            debug!("{} auto reconnect disabled", id);
            return;
        }
        let delay = entry.config.reconnect_delay();
        debug!("{} reconnects to {} in {:?}", id, entry.config.name(), delay);
        ctx.timers().invoke(
            entry.reconnect_timer,
            delay,
            move |dispatcher: &mut Dispatcher, _: &mut LoopContext<Dispatcher>| {
                dispatcher.connect_client(id)
            },
        );
    }

    pub(crate) fn stop_client(&mut self, id: ClientId, ctx: &mut LoopContext<Self>) {
        let Some(entry) = self.clients.remove(&id) else {
            return;
        };
        info!("{} to {} stopped", id, entry.config.name());
        ctx.timers().cancel(entry.reconnect_timer);
        if let Some(session) = entry.session.and_then(|s| self.sessions.get(&s)) {
            session.close(CloseReason::Stop);
        }
    }

    fn connect_failed(&mut self, id: ClientId, error: AppError, ctx: &mut LoopContext<Self>) {
        let Some(entry) = self.clients.get(&id) else {
            debug!("{} stopped, connect failure ignored: {}", id, error);
            return;
        };
        let peer = entry.config.name();
        let handler = &mut self.handler;
        guard("error handler", || handler.on_error(&peer, &error));
        self.schedule_reconnect(id, ctx);
    }

    fn expire_requests(&mut self, timeout: Duration) {
        let expired: usize = self
            .sessions
            .values_mut()
            .map(|session| session.expire_requests(timeout))
            .sum();
        if expired > 0 {
            debug!("{} requests timed out", expired);
        }
    }

    fn report(&mut self, ctx: &mut LoopContext<Self>) {
        let snapshot = self.transport.monitor().snapshot();
        self.transport.monitor().report(
            &self.last_snapshot,
            &snapshot,
            self.monitor_interval,
            &ctx.stats(),
            ctx.handle().pending(),
            self.sessions.len(),
        );
        self.last_snapshot = snapshot;
    }
}

impl Service for Dispatcher {
    type Command = SessionCommand;

    fn handle(&mut self, command: SessionCommand, ctx: &mut LoopContext<Self>) {
        match command {
            SessionCommand::Open(seed) => self.open(seed, ctx),
            SessionCommand::Frames { id, frames } => match self.sessions.get_mut(&id) {
                Some(session) => session.on_frames(frames, self.handler.as_mut()),
                None => trace!("{} gone, {} frames dropped", id, frames.len()),
            },
            SessionCommand::SendCompleted { id, token, ok } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.on_send_completed(token, ok);
                }
            }
            SessionCommand::Closed { id, reason } => self.closed(id, reason, ctx),
            SessionCommand::ConnectFailed { client, error } => {
                self.connect_failed(client, error, ctx)
            }
        }
    }

    fn on_start(&mut self, ctx: &mut LoopContext<Self>) {
        if let Some(timeout) = self.session_config.request_timeout() {
            let sweep = Duration::from_millis(self.session_config.request_sweep_interval_ms);
            ctx.timers().schedule_repeating(
                sweep,
                sweep,
                move |dispatcher: &mut Dispatcher, _: &mut LoopContext<Dispatcher>| {
                    dispatcher.expire_requests(timeout)
                },
            );
        }
        if !self.monitor_interval.is_zero() {
            self.last_snapshot = self.transport.monitor().snapshot();
            ctx.timers().schedule_repeating(
                self.monitor_interval,
                self.monitor_interval,
                |dispatcher: &mut Dispatcher, ctx: &mut LoopContext<Dispatcher>| {
                    dispatcher.report(ctx)
                },
            );
        }
    }

    fn on_stop(&mut self, ctx: &mut LoopContext<Self>) {
        let clients: Vec<ClientId> = self.clients.keys().copied().collect();
        for client in clients {
            self.stop_client(client, ctx);
        }
        let closed = self.transport.session_mgr().close_all(CloseReason::Stop);
        info!(
            "dispatcher stopping, {} sessions closed, {} still open",
            closed,
            self.sessions.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use parking_lot::Mutex;
    use rstest::{fixture, rstest};
    use tokio::runtime::Runtime;

    use super::*;
    use crate::event_loop::EventLoop;
    use crate::network::message::{Message, Pattern};
    use crate::service::setup_local_tracing;
    use crate::{LoopConfig, NetworkConfig};

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Handler for Journal {
        fn on_open(&mut self, session: &mut Session) {
            self.0.lock().push(format!("open {}", session.id()));
        }

        fn on_close(&mut self, session: &mut Session, reason: CloseReason) {
            self.0.lock().push(format!("close {} {:?}", session.id(), reason));
        }

        fn on_push(&mut self, _session: &mut Session, data: Bytes) -> AppResult<()> {
            self.0
                .lock()
                .push(format!("push {}", String::from_utf8_lossy(&data)));
            Ok(())
        }
    }

    fn dispatcher_loop(runtime: &Runtime, journal: Journal) -> (EventLoop<Dispatcher>, Dispatcher) {
        let event_loop = EventLoop::<Dispatcher>::new(&LoopConfig {
            period_ms: 1,
            final_drain_factor: 10,
        });
        let transport = Transport::new(
            runtime.handle().clone(),
            event_loop.handle(),
            NetworkConfig::default(),
        );
        let dispatcher = Dispatcher::new(
            journal,
            transport,
            SessionConfig::default(),
            &MonitorConfig { interval_ms: 0 },
        );
        (event_loop, dispatcher)
    }

    fn seed(dispatcher: &Dispatcher, keep_alive: Option<KeepAlive>) -> (SessionSeed, mpsc::UnboundedReceiver<Outgoing>) {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = dispatcher.transport().loop_handle().clone();
        let link = dispatcher
            .transport()
            .session_mgr()
            .allocate(|id| SessionLink::new(id, peer, Origin::Server, handle));
        let (outbound, wire) = mpsc::unbounded_channel();
        (
            SessionSeed {
                link,
                outbound,
                keep_alive,
            },
            wire,
        )
    }

    #[rstest]
    fn test_open_frames_close_sequence(_setup: ()) {
        let runtime = Runtime::new().unwrap();
        let journal = Journal::default();
        let (mut event_loop, mut dispatcher) = dispatcher_loop(&runtime, journal.clone());
        let handle = event_loop.handle();

        let (seed, _wire) = seed(&dispatcher, None);
        let id = seed.link.id();
        let link = seed.link.clone();
        handle.perform(SessionCommand::Open(seed)).unwrap();
        handle
            .perform(SessionCommand::Frames {
                id,
                frames: vec![Frame {
                    segments_remaining: 1,
                    payload: Message::Push {
                        data: Bytes::from_static(b"hi"),
                    }
                    .encode(),
                }],
            })
            .unwrap();
        link.close(CloseReason::ClosedByRemotePeer);
        // a second close from another path is ignored
        link.close(CloseReason::ReadError);
        for _ in 0..3 {
            event_loop.tick(&mut dispatcher);
        }

        assert_eq!(
            *journal.0.lock(),
            vec![
                format!("open {}", id),
                "push hi".to_string(),
                format!("close {} ClosedByRemotePeer", id),
            ]
        );
        assert_eq!(dispatcher.session_count(), 0);
        assert!(dispatcher.transport().session_mgr().is_empty());
    }

    #[rstest]
    fn test_keep_alive_timer_closes_dead_peer(_setup: ()) {
        let runtime = Runtime::new().unwrap();
        let journal = Journal::default();
        let (mut event_loop, mut dispatcher) = dispatcher_loop(&runtime, journal.clone());
        let (seed, mut wire) = seed(
            &dispatcher,
            Some(KeepAlive {
                interval: Duration::from_millis(2),
                count_dead_line: 1,
            }),
        );
        let id = seed.link.id();
        event_loop.handle().perform(SessionCommand::Open(seed)).unwrap();

        let start = std::time::Instant::now();
        while dispatcher.session(id).is_some() && start.elapsed() < Duration::from_secs(2) {
            event_loop.tick(&mut dispatcher);
        }

        assert!(dispatcher.session(id).is_none());
        assert_eq!(
            journal.0.lock().last(),
            Some(&format!("close {} ClosedByRemotePeer", id))
        );
        let mut pings = 0;
        while let Ok(outgoing) = wire.try_recv() {
            if outgoing.frames[0][3] == Pattern::Ping as u8 {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);
    }

    #[rstest]
    fn test_stop_closes_every_session(_setup: ()) {
        let runtime = Runtime::new().unwrap();
        let journal = Journal::default();
        let (mut event_loop, mut dispatcher) = dispatcher_loop(&runtime, journal.clone());
        let handle = event_loop.handle();
        for _ in 0..3 {
            let (seed, _wire) = seed(&dispatcher, None);
            handle.perform(SessionCommand::Open(seed)).unwrap();
        }
        handle.stop();
        event_loop.run(&mut dispatcher);

        let closes = journal
            .0
            .lock()
            .iter()
            .filter(|line| line.starts_with("close") && line.ends_with("Stop"))
            .count();
        assert_eq!(closes, 3);
        assert_eq!(dispatcher.session_count(), 0);
    }
}
