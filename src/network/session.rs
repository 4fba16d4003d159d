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

//! Per-connection protocol engine.
//!
//! A connection is split in two:
//! - [`SessionLink`] is shared with the socket tasks: identity, the one-way
//!   closed flag and the cancellation token of the I/O tasks.
//! - [`Session`] is owned by the [`Dispatcher`](super::Dispatcher) on the event
//!   loop thread: reassembly, the request and ping tables, keepalive counters.
//!   Nothing in it is locked because nothing else ever touches it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::client::ClientId;
use super::dispatcher::{Dispatcher, Handler, SessionCommand};
use super::frame::{fragment, Frame};
use super::message::{Message, NetError, RpcResult};
use crate::event_loop::{guard, panic_message, LoopHandle};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally.
    Stop,
    ClosedByRemotePeer,
    ReadError,
    WriteError,
    /// Oversized or malformed frame or envelope.
    PackError,
    Replaced,
}

/// Which side created the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Server,
    Client(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Idle time after which a ping is sent; also the check period.
    pub interval: Duration,
    /// Unanswered pings tolerated before the peer is considered dead.
    pub count_dead_line: u32,
}

pub struct SessionLink {
    id: SessionId,
    peer: SocketAddr,
    origin: Origin,
    closed: AtomicBool,
    cancel: CancellationToken,
    loop_handle: LoopHandle<Dispatcher>,
}

impl fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("origin", &self.origin)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionLink {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        origin: Origin,
        loop_handle: LoopHandle<Dispatcher>,
    ) -> Self {
        SessionLink {
            id,
            peer,
            origin,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            loop_handle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Closes the connection from any thread. Only the first caller wins: it
    /// stops the socket tasks and queues the close notification on the loop.
    /// Returns whether this call performed the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("{} to {} closing, reason {:?}", self.id, self.peer, reason);
        self.cancel.cancel();
        if let Err(e) = self.loop_handle.perform(SessionCommand::Closed {
            id: self.id,
            reason,
        }) {
            warn!("{} close notification lost: {}", self.id, e);
        }
        true
    }
}

/// One send: the encoded frames of a message and the token of its completion
/// callback, if any.
#[derive(Debug)]
pub struct Outgoing {
    pub frames: Vec<Bytes>,
    pub token: Option<u64>,
}

pub type RequestCallback = Box<dyn FnOnce(&mut Session, RpcResult) + Send>;
pub type PingCallback = Box<dyn FnOnce(&mut Session, Option<Duration>) + Send>;
pub type SendCallback = Box<dyn FnOnce(&mut Session, bool) + Send>;

struct PendingRequest {
    issued: Instant,
    callback: RequestCallback,
}

struct PendingPing {
    sent: Instant,
    callback: PingCallback,
}

pub struct Session {
    link: Arc<SessionLink>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    max_frame_size: u16,
    keep_alive: Option<KeepAlive>,

    // reassembly of one segmented message at a time
    slices: Vec<Bytes>,
    expected_segments: Option<u8>,

    requests: HashMap<u16, PendingRequest>,
    request_seed: u16,
    pings: HashMap<u8, PendingPing>,
    ping_seed: u8,
    keep_alive_counter: u32,
    last_response: Instant,

    send_callbacks: HashMap<u64, SendCallback>,
    next_send_token: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("pending_requests", &self.requests.len())
            .field("pending_pings", &self.pings.len())
            .field("keep_alive_counter", &self.keep_alive_counter)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        link: Arc<SessionLink>,
        outbound: mpsc::UnboundedSender<Outgoing>,
        max_frame_size: u16,
        keep_alive: Option<KeepAlive>,
    ) -> Self {
        Session {
            link,
            outbound,
            max_frame_size,
            keep_alive,
            slices: Vec::new(),
            expected_segments: None,
            requests: HashMap::new(),
            request_seed: 0,
            pings: HashMap::new(),
            ping_seed: 0,
            keep_alive_counter: 0,
            last_response: Instant::now(),
            send_callbacks: HashMap::new(),
            next_send_token: 1,
        }
    }

    pub fn id(&self) -> SessionId {
        self.link.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer
    }

    pub fn origin(&self) -> Origin {
        self.link.origin
    }

    pub fn link(&self) -> &Arc<SessionLink> {
        &self.link
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    pub fn keep_alive(&self) -> Option<KeepAlive> {
        self.keep_alive
    }

    pub fn keep_alive_counter(&self) -> u32 {
        self.keep_alive_counter
    }

    pub fn elapsed_since_last_response(&self) -> Duration {
        self.last_response.elapsed()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    pub fn close(&self, reason: CloseReason) -> bool {
        self.link.close(reason)
    }

    pub fn push(&mut self, data: impl Into<Bytes>) -> AppResult<()> {
        self.send_message(&Message::Push { data: data.into() }, None)
    }

    /// Like [`Session::push`], `on_sent` learns whether the bytes reached the socket.
    /// It is called with `false` right away when the push cannot be queued.
    pub fn push_notify<F>(&mut self, data: impl Into<Bytes>, on_sent: F) -> AppResult<()>
    where
        F: FnOnce(&mut Session, bool) + Send + 'static,
    {
        let on_sent: SendCallback = Box::new(on_sent);
        let token = self.next_send_token;
        self.next_send_token += 1;
        self.send_callbacks.insert(token, on_sent);
        let message = Message::Push { data: data.into() };
        if let Err(e) = self.send_message(&message, Some(token)) {
            if let Some(callback) = self.send_callbacks.remove(&token) {
                guard("send callback", || callback(self, false));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sends a request and returns its serial. `callback` runs exactly once: with
    /// the peer's response, or with an error code if the request fails, times
    /// out or the session closes first. On immediate failure it runs before this
    /// returns `Err`.
    pub fn request<F>(&mut self, data: impl Into<Bytes>, callback: F) -> AppResult<u16>
    where
        F: FnOnce(&mut Session, RpcResult) + Send + 'static,
    {
        let callback: RequestCallback = Box::new(callback);
        match self.send_request(data.into()) {
            Ok(serial) => {
                self.requests.insert(
                    serial,
                    PendingRequest {
                        issued: Instant::now(),
                        callback,
                    },
                );
                Ok(serial)
            }
            Err(e) => {
                debug!("{} request failed: {}", self.id(), e);
                let result = RpcResult::error(e.net_error());
                guard("request callback", || callback(self, result));
                Err(e)
            }
        }
    }

    fn send_request(&mut self, data: Bytes) -> AppResult<u16> {
        if data.is_empty() {
            return Err(AppError::RequestDataIsEmpty);
        }
        if self.is_closed() {
            return Err(AppError::SessionClosed(self.id()));
        }
        self.request_seed = self.request_seed.wrapping_add(1);
        let serial = self.request_seed;
        if self.requests.contains_key(&serial) {
            return Err(AppError::SerialConflict(serial));
        }
        self.send_message(&Message::Request { serial, data }, None)?;
        Ok(serial)
    }

    /// Sends a ping; `callback` gets the round trip time, or `None` if the pong
    /// never arrives before the session closes.
    pub fn ping<F>(&mut self, callback: F) -> AppResult<u8>
    where
        F: FnOnce(&mut Session, Option<Duration>) + Send + 'static,
    {
        self.ping_seed = self.ping_seed.wrapping_add(1);
        let serial = self.ping_seed;
        self.send_message(&Message::Ping { serial }, None)?;
        let previous = self.pings.insert(
            serial,
            PendingPing {
                sent: Instant::now(),
                callback: Box::new(callback),
            },
        );
        if let Some(previous) = previous {
            // the serial space wrapped around an unanswered ping
            guard("ping callback", || (previous.callback)(self, None));
        }
        self.keep_alive_counter += 1;
        Ok(serial)
    }

    pub fn subscribe(&mut self, subject: &str) -> AppResult<()> {
        check_subject(subject)?;
        self.send_message(
            &Message::Sub {
                subject: subject.to_string(),
            },
            None,
        )
    }

    pub fn unsubscribe(&mut self, subject: &str) -> AppResult<()> {
        check_subject(subject)?;
        self.send_message(
            &Message::Unsub {
                subject: subject.to_string(),
            },
            None,
        )
    }

    pub fn publish(&mut self, subject: &str, data: impl Into<Bytes>) -> AppResult<()> {
        check_subject(subject)?;
        self.send_message(
            &Message::Pub {
                subject: subject.to_string(),
                data: data.into(),
            },
            None,
        )
    }

    fn send_message(&mut self, message: &Message, token: Option<u64>) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::SessionClosed(self.id()));
        }
        let frames = fragment(&message.encode(), self.max_frame_size)?;
        trace!(
            "{} sends {:?} in {} frames",
            self.id(),
            message.pattern(),
            frames.len()
        );
        self.outbound
            .send(Outgoing { frames, token })
            .map_err(|_| AppError::SessionClosed(self.id()))
    }

    /// Feeds frames decoded from the socket, in order. A sequencing or envelope
    /// error closes the session with `PackError` and drops the rest.
    pub fn on_frames(&mut self, frames: Vec<Frame>, handler: &mut dyn Handler) {
        for frame in frames {
            if self.is_closed() {
                trace!("{} closed, frames dropped", self.id());
                return;
            }
            self.last_response = Instant::now();
            let message = match self.reassemble(frame) {
                Ok(Some(raw)) => Message::decode(raw),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match message {
                Ok(message) => self.dispatch(message, handler),
                Err(e) => {
                    warn!("{} protocol error: {}", self.id(), e);
                    self.close(CloseReason::PackError);
                    return;
                }
            }
        }
    }

    fn reassemble(&mut self, frame: Frame) -> AppResult<Option<Bytes>> {
        if let Some(expected) = self.expected_segments {
            if frame.segments_remaining != expected {
                self.slices.clear();
                self.expected_segments = None;
                return Err(AppError::MalformedProtocol(format!(
                    "expected segment count {}, got {}",
                    expected, frame.segments_remaining
                )));
            }
        }
        if !frame.is_last() {
            self.expected_segments = Some(frame.segments_remaining - 1);
            self.slices.push(frame.payload);
            return Ok(None);
        }

        self.expected_segments = None;
        if self.slices.is_empty() {
            return Ok(Some(frame.payload));
        }
        let total = self.slices.iter().map(Bytes::len).sum::<usize>() + frame.payload.len();
        let mut message = BytesMut::with_capacity(total);
        for slice in self.slices.drain(..) {
            message.extend_from_slice(&slice);
        }
        message.extend_from_slice(&frame.payload);
        Ok(Some(message.freeze()))
    }

    fn dispatch(&mut self, message: Message, handler: &mut dyn Handler) {
        match message {
            Message::Push { data } => {
                guard("push handler", || {
                    if let Err(e) = handler.on_push(self, data) {
                        warn!("{} push handler failed: {}", self.id(), e);
                    }
                });
            }
            Message::Request { serial, data } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(self, data)));
                let result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        warn!("{} request {} handler failed: {}", self.id(), serial, e);
                        RpcResult::error(NetError::ExceptionCatched)
                    }
                    Err(payload) => {
                        error!(
                            "{} request {} handler panicked: {}",
                            self.id(),
                            serial,
                            panic_message(&payload)
                        );
                        RpcResult::error(NetError::ExceptionCatched)
                    }
                };
                let response = Message::Response {
                    serial,
                    error_code: result.error_code,
                    data: result.data,
                };
                match self.send_message(&response, None) {
                    Ok(()) => {}
                    Err(e @ AppError::SessionClosed(_)) => {
                        debug!("{} response {} not sent: {}", self.id(), serial, e);
                    }
                    Err(e) => {
                        // the requester still gets an answer when the real one cannot be framed
                        warn!("{} response {} not sent: {}", self.id(), serial, e);
                        let fallback = Message::Response {
                            serial,
                            error_code: NetError::ExceptionCatched.code(),
                            data: Bytes::new(),
                        };
                        if let Err(e) = self.send_message(&fallback, None) {
                            debug!("{} fallback response {} not sent: {}", self.id(), serial, e);
                        }
                    }
                }
            }
            Message::Response {
                serial,
                error_code,
                data,
            } => match self.requests.remove(&serial) {
                Some(pending) => {
                    let result = RpcResult { error_code, data };
                    guard("request callback", || (pending.callback)(self, result));
                }
                None => debug!("{} response {} has no pending request", self.id(), serial),
            },
            Message::Ping { serial } => {
                if let Err(e) = self.send_message(&Message::Pong { serial }, None) {
                    debug!("{} pong not sent: {}", self.id(), e);
                }
            }
            Message::Pong { serial } => match self.pings.remove(&serial) {
                Some(ping) => {
                    self.keep_alive_counter = self.keep_alive_counter.saturating_sub(1);
                    let rtt = ping.sent.elapsed();
                    guard("ping callback", || (ping.callback)(self, Some(rtt)));
                }
                None => debug!("{} pong {} has no pending ping", self.id(), serial),
            },
            Message::Sub { subject } => {
                guard("subscribe handler", || handler.on_subscribe(self, &subject));
            }
            Message::Unsub { subject } => {
                guard("unsubscribe handler", || handler.on_unsubscribe(self, &subject));
            }
            Message::Pub { subject, data } => {
                guard("publish handler", || handler.on_publish(self, &subject, data));
            }
        }
    }

    pub(crate) fn on_send_completed(&mut self, token: u64, ok: bool) {
        if let Some(callback) = self.send_callbacks.remove(&token) {
            guard("send callback", || callback(self, ok));
        }
    }

    /// Periodic keepalive check. Closes the session once too many pings went
    /// unanswered, otherwise pings when nothing arrived for an interval.
    pub(crate) fn on_keep_alive(&mut self) {
        let Some(keep_alive) = self.keep_alive else {
            return;
        };
        if self.is_closed() {
            return;
        }
        if self.keep_alive_counter > keep_alive.count_dead_line {
            warn!(
                "{} missed {} pings, peer {} considered dead",
                self.id(),
                self.keep_alive_counter,
                self.peer()
            );
            self.close(CloseReason::ClosedByRemotePeer);
            return;
        }
        if self.last_response.elapsed() >= keep_alive.interval {
            if let Err(e) = self.ping(|_, _| {}) {
                debug!("{} keepalive ping not sent: {}", self.id(), e);
            }
        }
    }

    /// Fails requests older than `timeout` with `Timeout`. Returns how many expired.
    pub(crate) fn expire_requests(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .requests
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.issued) >= timeout)
            .map(|(serial, _)| *serial)
            .collect();
        for serial in &expired {
            if let Some(pending) = self.requests.remove(serial) {
                debug!("{} request {} timed out", self.id(), serial);
                let result = RpcResult::error(NetError::Timeout);
                guard("request callback", || (pending.callback)(self, result));
            }
        }
        expired.len()
    }

    /// Resolves every callback still waiting once the session is closed.
    pub(crate) fn resolve_pending(&mut self) {
        let requests: Vec<_> = self.requests.drain().collect();
        let pings: Vec<_> = self.pings.drain().collect();
        let sends: Vec<_> = self.send_callbacks.drain().collect();
        if !requests.is_empty() {
            debug!("{} fails {} pending requests", self.id(), requests.len());
        }
        for (_, pending) in requests {
            let result = RpcResult::error(NetError::SessionClosed);
            guard("request callback", || (pending.callback)(self, result));
        }
        for (_, ping) in pings {
            guard("ping callback", || (ping.callback)(self, None));
        }
        for (_, callback) in sends {
            guard("send callback", || callback(self, false));
        }
        self.slices.clear();
        self.expected_segments = None;
    }
}

fn check_subject(subject: &str) -> AppResult<()> {
    if subject.is_empty() || subject.contains('\0') {
        return Err(AppError::InvalidValue(format!(
            "subject {:?} must be non-empty and without NUL",
            subject
        )));
    }
    Ok(())
}
