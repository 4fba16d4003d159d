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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::{KeepAlive, HEADER_SIZE};

/// Prefix of the environment variables that override file values,
/// e.g. `STONEWIRE__NETWORK__PORT=6000`.
pub const ENV_PREFIX: &str = "STONEWIRE";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Upper bound of a frame's length field: segment byte plus payload.
    pub max_frame_size: u16,
    pub receive_buffer_size: usize,
    /// Number of write buffers kept for reuse across all connections.
    pub send_pool_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 5002,
            max_connection: 1024,
            max_frame_size: 1024,
            receive_buffer_size: 1024,
            send_pool_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Tick period of the event loop.
    pub period_ms: u64,
    /// The final drain after stop waits at most `period * final_drain_factor`.
    pub final_drain_factor: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            period_ms: 10,
            final_drain_factor: 10,
        }
    }
}

impl LoopConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn final_drain(&self) -> Duration {
        self.period() * self.final_drain_factor
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A request without response after this long is failed with `Timeout`; 0 disables.
    pub request_timeout_ms: u64,
    pub request_sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            request_timeout_ms: 30_000,
            request_sweep_interval_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_delay_ms: u64,
    pub keep_alive_interval_ms: u64,
    /// Unanswered pings tolerated before the peer is considered dead.
    pub keep_alive_count_dead_line: u32,
    pub auto_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 5002,
            reconnect_delay_ms: 2_000,
            keep_alive_interval_ms: 10_000,
            keep_alive_count_dead_line: 5,
            auto_reconnect: true,
        }
    }
}

impl ClientConfig {
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive {
            interval: Duration::from_millis(self.keep_alive_interval_ms),
            count_dead_line: self.keep_alive_count_dead_line,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval of the throughput report; 0 disables it.
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig { interval_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub log_dir: String,
    pub file_prefix: String,
    /// Export spans and metrics over OTLP.
    pub otel_enabled: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            log_dir: "logs".to_string(),
            file_prefix: "stonewire.log".to_string(),
            otel_enabled: false,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoneWireConfig {
    pub network: NetworkConfig,
    pub event_loop: LoopConfig,
    pub session: SessionConfig,
    pub client: ClientConfig,
    pub monitor: MonitorConfig,
    pub tracing: TracingConfig,
}

impl StoneWireConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<StoneWireConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let server_config: StoneWireConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if (self.network.max_frame_size as usize) < HEADER_SIZE {
            return Err(AppError::InvalidValue(format!(
                "network.max_frame_size {} must be at least {}",
                self.network.max_frame_size, HEADER_SIZE
            )));
        }
        if self.network.receive_buffer_size < HEADER_SIZE {
            return Err(AppError::InvalidValue(format!(
                "network.receive_buffer_size {} cannot hold a frame header",
                self.network.receive_buffer_size
            )));
        }
        if self.event_loop.period_ms == 0 {
            return Err(AppError::InvalidValue(
                "event_loop.period_ms must be greater than 0".to_string(),
            ));
        }
        if self.client.keep_alive_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "client.keep_alive_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.session.request_timeout_ms > 0 && self.session.request_sweep_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "session.request_sweep_interval_ms must be greater than 0 when requests time out"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
