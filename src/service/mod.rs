pub use app_error::{AppError, AppResult};
pub use config::{
    ClientConfig, LoopConfig, MonitorConfig, NetworkConfig, SessionConfig, StoneWireConfig,
    TracingConfig, ENV_PREFIX,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, OtelGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
