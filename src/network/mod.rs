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

//! Network Module Implementation
//!
//! Message-oriented connections over TCP: framing, the session protocol
//! (request/response, push, ping/pong, sub/pub) and the socket plumbing.
//!
//! # Architecture
//!
//! - Socket tasks on the tokio runtime own the byte-level state: a
//!   [`RingBuffer`] and a [`FrameDecoder`] per reader, pooled buffers per writer.
//! - Decoded frames cross to the event loop as [`SessionCommand`]s. The
//!   [`Dispatcher`] owns every [`Session`] there and calls the application
//!   [`Handler`].
//! - Sending goes the other way: a session fragments the encoded [`Message`]
//!   into frames and queues them for its writer task.
//!
//! # Components
//!
//! - `Server`: accept loop with a connection limit
//! - `Client`: outgoing connection with keepalive and reconnect
//! - `SessionManager`: live connections reachable from any thread
//! - `Monitor`: frame throughput counters

pub use client::{resolve, Client, ClientId};
pub use connection::Transport;
pub use dispatcher::{Dispatcher, Handler, SessionCommand, SessionSeed};
pub use frame::{encode_frame, fragment, Frame, FrameDecoder, HEADER_SIZE, MAX_SEGMENTS};
pub use message::{Message, NetError, Pattern, RpcResult};
pub use monitor::{Monitor, MonitorSnapshot};
pub use ring_buffer::{ByteRing, RingBuffer};
pub use send_pool::SendPool;
pub use server::Server;
pub use session::{
    CloseReason, KeepAlive, Origin, Outgoing, PingCallback, RequestCallback, SendCallback,
    Session, SessionId, SessionLink,
};
pub use session_mgr::SessionManager;

mod client;
mod connection;
mod dispatcher;
mod frame;
mod message;
mod monitor;
mod ring_buffer;
mod send_pool;
mod server;
mod session;
mod session_mgr;
