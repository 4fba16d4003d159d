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

//! Socket tasks of a connection.
//!
//! Every attached socket gets a reader and a writer task on the tokio runtime.
//! They own the byte-level state (ring buffer, frame decoder, write buffer) and
//! talk to the protocol engine only through the event loop:
//!
//! - the reader decodes frames and performs `Frames` on the loop;
//! - the writer drains the session's outbound queue and reports `SendCompleted`;
//! - either side ends the connection through [`SessionLink::close`], which
//!   cancels the other side.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, trace, warn};

use super::dispatcher::{Dispatcher, SessionCommand, SessionSeed};
use super::frame::FrameDecoder;
use super::monitor::Monitor;
use super::ring_buffer::{ByteRing, RingBuffer};
use super::send_pool::SendPool;
use super::session::{CloseReason, KeepAlive, Origin, Outgoing, SessionId, SessionLink};
use super::session_mgr::SessionManager;
use crate::event_loop::LoopHandle;
use crate::{AppResult, NetworkConfig};

/// Sends are coalesced into one write up to this many bytes.
const MAX_COALESCED_WRITE: usize = 64 * 1024;

/// Shared by the server, the clients and the dispatcher to attach sockets.
#[derive(Clone)]
pub struct Transport {
    runtime: Handle,
    loop_handle: LoopHandle<Dispatcher>,
    session_mgr: Arc<SessionManager>,
    monitor: Arc<Monitor>,
    pool: Arc<SendPool>,
    config: Arc<NetworkConfig>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("sessions", &self.session_mgr.len())
            .finish()
    }
}

impl Transport {
    pub fn new(runtime: Handle, loop_handle: LoopHandle<Dispatcher>, config: NetworkConfig) -> Self {
        let pool = SendPool::new(config.send_pool_capacity, config.max_frame_size as usize * 4);
        Transport {
            runtime,
            loop_handle,
            session_mgr: Arc::new(SessionManager::new()),
            monitor: Arc::new(Monitor::default()),
            pool: Arc::new(pool),
            config: Arc::new(config),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn loop_handle(&self) -> &LoopHandle<Dispatcher> {
        &self.loop_handle
    }

    pub fn session_mgr(&self) -> &Arc<SessionManager> {
        &self.session_mgr
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Registers `socket` as a new session and starts its I/O tasks. The loop
    /// sees `Open` before any frame of the session. `permit` is released when
    /// the reader ends.
    pub fn attach(
        &self,
        socket: TcpStream,
        origin: Origin,
        keep_alive: Option<KeepAlive>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> AppResult<SessionId> {
        let peer = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        let loop_handle = self.loop_handle.clone();
        let link = self
            .session_mgr
            .allocate(|id| SessionLink::new(id, peer, origin, loop_handle));
        let id = link.id();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let seed = SessionSeed {
            link: link.clone(),
            outbound,
            keep_alive,
        };
        if let Err(e) = self.loop_handle.perform(SessionCommand::Open(seed)) {
            self.session_mgr.remove(id);
            return Err(e);
        }

        let (reader, writer) = socket.into_split();
        let read_task = ReadTask {
            reader,
            link: link.clone(),
            loop_handle: self.loop_handle.clone(),
            monitor: self.monitor.clone(),
            ring: RingBuffer::new(self.config.receive_buffer_size),
            decoder: FrameDecoder::new(self.config.max_frame_size),
        };
        let write_task = WriteTask {
            writer,
            outbound: outbound_rx,
            link,
            loop_handle: self.loop_handle.clone(),
            monitor: self.monitor.clone(),
            pool: self.pool.clone(),
        };
        self.runtime.spawn(async move {
            read_task.run().await;
            drop(permit);
        });
        self.runtime.spawn(write_task.run());
        Ok(id)
    }
}

struct ReadTask {
    reader: OwnedReadHalf,
    link: Arc<SessionLink>,
    loop_handle: LoopHandle<Dispatcher>,
    monitor: Arc<Monitor>,
    ring: RingBuffer,
    decoder: FrameDecoder,
}

impl ReadTask {
    async fn run(mut self) {
        let id = self.link.id();
        let cancel = self.link.cancel_token().clone();
        let reason = loop {
            if self.ring.is_overloaded() {
                self.ring.arrange();
            }
            if self.ring.writable_size() == 0 {
                warn!("{} receive buffer exhausted", id);
                break Some(CloseReason::PackError);
            }
            let read = tokio::select! {
                _ = cancel.cancelled() => break None,
                read = self.reader.read(self.ring.writable()) => read,
            };
            match read {
                Ok(0) => break Some(CloseReason::ClosedByRemotePeer),
                Ok(n) => {
                    self.ring.move_by_write(n);
                    match self.decoder.process(&mut self.ring) {
                        Ok(0) => {}
                        Ok(count) => {
                            self.monitor.record_read(count, n);
                            let frames = self.decoder.drain();
                            if self
                                .loop_handle
                                .perform(SessionCommand::Frames { id, frames })
                                .is_err()
                            {
                                break Some(CloseReason::Stop);
                            }
                        }
                        Err(e) => {
                            warn!("{} decode failed: {}", id, e);
                            break Some(CloseReason::PackError);
                        }
                    }
                }
                Err(e) => {
                    debug!("{} read failed: {}", id, e);
                    break Some(CloseReason::ReadError);
                }
            }
        };
        if let Some(reason) = reason {
            self.link.close(reason);
        }
        trace!("{} reader exited", id);
    }
}

struct WriteTask {
    writer: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Outgoing>,
    link: Arc<SessionLink>,
    loop_handle: LoopHandle<Dispatcher>,
    monitor: Arc<Monitor>,
    pool: Arc<SendPool>,
}

impl WriteTask {
    async fn run(mut self) {
        let id = self.link.id();
        let cancel = self.link.cancel_token().clone();
        let mut tokens = Vec::new();
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.outbound.recv() => match next {
                    Some(outgoing) => outgoing,
                    None => break,
                },
            };

            let mut buf = self.pool.take();
            let mut frames = 0;
            tokens.clear();
            append(&mut buf, first, &mut frames, &mut tokens);
            while buf.len() < MAX_COALESCED_WRITE {
                match self.outbound.try_recv() {
                    Ok(more) => append(&mut buf, more, &mut frames, &mut tokens),
                    Err(_) => break,
                }
            }

            let written = tokio::select! {
                _ = cancel.cancelled() => break,
                written = self.writer.write_all(&buf) => written,
            };
            let bytes = buf.len();
            self.pool.give(buf);
            let ok = written.is_ok();
            for token in tokens.drain(..) {
                let _ = self
                    .loop_handle
                    .perform(SessionCommand::SendCompleted { id, token, ok });
            }
            match written {
                Ok(()) => self.monitor.record_write(frames, bytes),
                Err(e) => {
                    debug!("{} write failed: {}", id, e);
                    self.link.close(CloseReason::WriteError);
                    break;
                }
            }
        }
        if let Err(e) = self.writer.shutdown().await {
            trace!("{} shutdown: {}", id, e);
        }
        trace!("{} writer exited", id);
    }
}

fn append(buf: &mut BytesMut, outgoing: Outgoing, frames: &mut usize, tokens: &mut Vec<u64>) {
    for frame in &outgoing.frames {
        buf.extend_from_slice(frame);
    }
    *frames += outgoing.frames.len();
    if let Some(token) = outgoing.token {
        tokens.push(token);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::event_loop::{EventLoop, WorkItem};
    use crate::network::frame::fragment;
    use crate::LoopConfig;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn commands(event_loop: &EventLoop<Dispatcher>) -> Vec<SessionCommand> {
        event_loop
            .receiver()
            .try_iter()
            .filter_map(|item| match item {
                WorkItem::Command(command) => Some(command),
                WorkItem::Job(_) => None,
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reader_reports_frames_then_remote_close() {
        let event_loop = EventLoop::<Dispatcher>::new(&LoopConfig::default());
        let transport = Transport::new(
            Handle::current(),
            event_loop.handle(),
            NetworkConfig {
                max_frame_size: 16,
                ..NetworkConfig::default()
            },
        );
        let (mut peer, socket) = pair().await;
        let id = transport.attach(socket, Origin::Server, None, None).unwrap();

        for frame in fragment(b"hello segmented world", 16).unwrap() {
            peer.write_all(&frame).await.unwrap();
        }
        drop(peer);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let commands = commands(&event_loop);
        assert!(matches!(commands.first(), Some(SessionCommand::Open(_))));
        let frames: usize = commands
            .iter()
            .map(|c| match c {
                SessionCommand::Frames { frames, .. } => frames.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(frames, 2);
        assert!(matches!(
            commands.last(),
            Some(SessionCommand::Closed {
                id: closed,
                reason: CloseReason::ClosedByRemotePeer
            }) if *closed == id
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_frame_is_pack_error() {
        let event_loop = EventLoop::<Dispatcher>::new(&LoopConfig::default());
        let transport = Transport::new(
            Handle::current(),
            event_loop.handle(),
            NetworkConfig {
                max_frame_size: 16,
                ..NetworkConfig::default()
            },
        );
        let (mut peer, socket) = pair().await;
        transport.attach(socket, Origin::Server, None, None).unwrap();

        peer.write_all(&[200, 0, 1]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let commands = commands(&event_loop);
        assert!(matches!(
            commands.last(),
            Some(SessionCommand::Closed {
                reason: CloseReason::PackError,
                ..
            })
        ));
        // the socket is shut down on our side
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), peer.read_to_end(&mut rest)).await;
        assert!(matches!(read, Ok(Ok(0))));
    }
}
