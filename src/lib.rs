mod event_loop;
mod network;
mod service;

pub use event_loop::{
    CoTask, EventLoop, Job, LoopContext, LoopHandle, LoopStats, Service, Step, Steppable, TaskId,
    TaskRunner, TimerCallback, TimerKey, TimerRegistry, Wait, WorkItem,
};
pub use network::{
    encode_frame, fragment, resolve, ByteRing, Client, ClientId, CloseReason, Dispatcher, Frame,
    FrameDecoder, Handler, KeepAlive, Message, Monitor, MonitorSnapshot, NetError, Origin,
    Outgoing, Pattern, PingCallback, RequestCallback, RingBuffer, RpcResult, SendCallback,
    SendPool, Server, Session, SessionCommand, SessionId, SessionLink, SessionManager,
    SessionSeed, Transport, HEADER_SIZE, MAX_SEGMENTS,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, LoopConfig,
    MonitorConfig, NetworkConfig, OtelGuard, SessionConfig, Shutdown, StoneWireConfig,
    TracingConfig, ENV_PREFIX,
};
