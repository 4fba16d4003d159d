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

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use super::connection::Transport;
use super::session::{CloseReason, Origin};
use crate::service::Shutdown;
use crate::{AppError, AppResult};

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    // subscribed at bind time so a stop before `run` is not lost
    shutdown: Mutex<Option<Shutdown>>,
    transport: Transport,
}

impl Server {
    /// Binds `network.ip:network.port` of the transport's configuration. Port 0
    /// picks a free port, see [`Server::local_addr`].
    pub async fn bind(transport: Transport) -> AppResult<Server> {
        let config = transport.config();
        let addr = format!("{}:{}", config.ip, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("bind {} failed: {}", addr, e)))?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let shutdown = Shutdown::subscribe(&notify_shutdown);
        info!("server listening on {}", listener.local_addr()?);
        Ok(Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(config.max_connection)),
            notify_shutdown,
            shutdown: Mutex::new(Some(shutdown)),
            transport,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until [`Server::stop`] is called. Each accepted
    /// socket holds a permit, so at most `network.max_connection` sessions are
    /// served at a time; further peers wait in the backlog.
    ///
    /// # Returns
    /// `Ok(())` after a stop, or the error that made accepting impossible.
    pub async fn run(&self) -> AppResult<()> {
        let mut shutdown = self
            .shutdown
            .lock()
            .take()
            .ok_or_else(|| AppError::InvalidOperation("server is already running".to_string()))?;

        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.limit_connections.clone().acquire_owned() => permit
                    .map_err(|e| AppError::IllegalStateError(format!("connection limiter closed: {}", e)))?,
            };

            let socket = tokio::select! {
                _ = shutdown.recv() => break,
                socket = self.accept() => socket?,
            };

            debug!("accept new connection");
            if let Err(e) = self
                .transport
                .attach(socket, Origin::Server, None, Some(permit))
            {
                error!("attach accepted connection failed: {}", e);
            }
        }
        info!("server stopped accepting");
        Ok(())
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(err.to_string()));
                    }
                    error!("accept failed, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    /// Stops accepting and closes every session this server accepted.
    pub fn stop(&self) -> usize {
        let _ = self.notify_shutdown.send(());
        let closed = self
            .transport
            .session_mgr()
            .close_where(CloseReason::Stop, |link| link.origin() == Origin::Server);
        info!("server stopped, {} sessions closed", closed);
        closed
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
