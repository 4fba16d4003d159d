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

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, trace};

use super::connection::Transport;
use super::dispatcher::{Dispatcher, SessionCommand};
use super::session::{KeepAlive, Origin, Session, SessionId};
use crate::event_loop::{LoopContext, LoopHandle};
use crate::{AppError, AppResult, ClientConfig};

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u32);

impl ClientId {
    pub(crate) fn next() -> ClientId {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// An outgoing connection kept alive by the dispatcher.
///
/// Connection state lives on the loop thread; this handle only queues work
/// there. Failed connects and lost sessions are retried after
/// `reconnect_delay_ms` while `auto_reconnect` is set, until [`Client::stop`].
#[derive(Clone)]
pub struct Client {
    id: ClientId,
    name: String,
    loop_handle: LoopHandle<Dispatcher>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Client {
    pub fn start(loop_handle: &LoopHandle<Dispatcher>, config: ClientConfig) -> AppResult<Client> {
        let id = ClientId::next();
        let name = config.name();
        loop_handle.perform_job(move |dispatcher: &mut Dispatcher, ctx: &mut LoopContext<Dispatcher>| {
            dispatcher.add_client(id, config, ctx)
        })?;
        Ok(Client {
            id,
            name,
            loop_handle: loop_handle.clone(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` on the loop thread with the client's session, or `None` while
    /// it is not connected.
    pub fn with_session<F>(&self, f: F) -> AppResult<()>
    where
        F: FnOnce(Option<&mut Session>) + Send + 'static,
    {
        let id = self.id;
        self.loop_handle
            .perform_job(move |dispatcher: &mut Dispatcher, _: &mut LoopContext<Dispatcher>| {
                f(dispatcher.client_session_mut(id))
            })
    }

    /// Closes the session with `Stop` and cancels any pending reconnect.
    pub fn stop(&self) -> AppResult<()> {
        let id = self.id;
        self.loop_handle
            .perform_job(move |dispatcher: &mut Dispatcher, ctx: &mut LoopContext<Dispatcher>| {
                dispatcher.stop_client(id, ctx)
            })
    }
}

/// Starts one connection attempt on the runtime. The outcome reaches the loop
/// as `Open` on success or `ConnectFailed` otherwise.
pub(crate) fn connect(transport: &Transport, client: ClientId, config: &ClientConfig) {
    let transport = transport.clone();
    let host = config.host.clone();
    let port = config.port;
    let keep_alive = config.keep_alive();
    let runtime = transport.runtime().clone();
    runtime.spawn(async move {
        match attempt(&transport, client, &host, port, keep_alive).await {
            Ok(id) => debug!("{} connected as {}", client, id),
            Err(error) => {
                if let Err(e) = transport
                    .loop_handle()
                    .perform(SessionCommand::ConnectFailed { client, error })
                {
                    debug!("{} connect failure not reported: {}", client, e);
                }
            }
        }
    });
}

async fn attempt(
    transport: &Transport,
    client: ClientId,
    host: &str,
    port: u16,
    keep_alive: KeepAlive,
) -> AppResult<SessionId> {
    let addr = resolve(host, port).await?;
    trace!("{} connecting to {}", client, addr);
    let socket = TcpStream::connect(addr).await?;
    transport.attach(socket, Origin::Client(client), Some(keep_alive), None)
}

/// An IP literal is used as is; a host name resolves to its first IPv4
/// address, or the first address of any family.
pub async fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| AppError::DetailedIoError(format!("no address found for {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_and_localhost() {
        let literal = resolve("10.1.2.3", 80).await.unwrap();
        assert_eq!(literal, "10.1.2.3:80".parse::<SocketAddr>().unwrap());

        let v6 = resolve("::1", 80).await.unwrap();
        assert!(v6.is_ipv6());

        let localhost = resolve("localhost", 5002).await.unwrap();
        assert_eq!(localhost.port(), 5002);
        assert!(localhost.ip().is_loopback());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("client-"));
    }
}
