use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use stonewire::{
    setup_tracing, AppResult, Client, ClientId, Dispatcher, EventLoop, Handler, LoopContext,
    RpcResult, Server, Session, Step, Steppable, StoneWireConfig, Transport, Wait,
};
use tokio::runtime;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// accept connections and echo every request
    Server,
    /// connect to `client.host:client.port` and send requests in a loop
    Client {
        /// stop after this many requests
        #[arg(short, long)]
        requests: Option<u64>,
        /// pause between two requests in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        interval: u64,
    },
    PrintConfig,
}

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_open(&mut self, session: &mut Session) {
        info!("{} connected from {}", session.id(), session.peer());
    }

    fn on_push(&mut self, session: &mut Session, data: Bytes) -> AppResult<()> {
        info!("{} pushed {} bytes", session.id(), data.len());
        session.push(Bytes::from_static(b"ack"))
    }

    fn on_request(&mut self, _session: &mut Session, data: Bytes) -> AppResult<RpcResult> {
        Ok(RpcResult::ok(data))
    }
}

struct ClientHandler;

impl Handler for ClientHandler {
    fn on_open(&mut self, session: &mut Session) {
        info!("{} connected to {}", session.id(), session.peer());
    }

    fn on_push(&mut self, session: &mut Session, data: Bytes) -> AppResult<()> {
        info!(
            "{} received push {:?}",
            session.id(),
            String::from_utf8_lossy(&data)
        );
        Ok(())
    }
}

/// Sends one request per interval on the client's session while it is connected.
struct RequestLoop {
    client: ClientId,
    interval: Duration,
    issued: u64,
    limit: Option<u64>,
}

impl Steppable<Dispatcher> for RequestLoop {
    fn step(&mut self, dispatcher: &mut Dispatcher, ctx: &mut LoopContext<Dispatcher>) -> Step<Dispatcher> {
        if self.limit.is_some_and(|limit| self.issued >= limit) {
            info!("{} requests issued, stopping", self.issued);
            ctx.stop();
            return Step::Done;
        }
        if let Some(session) = dispatcher.client_session_mut(self.client) {
            let serial = self.issued;
            let started = Instant::now();
            let payload = Bytes::from(format!("request {}", serial));
            let sent = session.request(payload, move |session, result| {
                if result.is_ok() {
                    info!(
                        "{} answered {:?} in {:?}",
                        session.id(),
                        String::from_utf8_lossy(&result.data),
                        started.elapsed()
                    );
                } else {
                    warn!("{} request {} failed with {}", session.id(), serial, result.error_code);
                }
            });
            if sent.is_ok() {
                self.issued += 1;
            }
        }
        Step::wait_for(Wait::new(self.interval))
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = StoneWireConfig::set_up_config(config_path)?;

    let command = match commandline.command {
        Some(Command::PrintConfig) => {
            println!("{:#?}", config);
            return Ok(());
        }
        Some(command) => command,
        None => Command::Server,
    };

    // socket I/O runs on the runtime, protocol work on this thread
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .thread_name("stonewire-io")
        .enable_all()
        .build()?;

    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _otel_guard = rt.block_on(setup_tracing(&config.tracing, level))?;

    let mut event_loop = EventLoop::<Dispatcher>::new(&config.event_loop);
    let loop_handle = event_loop.handle();
    let transport = Transport::new(rt.handle().clone(), loop_handle.clone(), config.network.clone());

    match command {
        Command::Server => {
            let mut dispatcher = Dispatcher::new(
                EchoHandler,
                transport.clone(),
                config.session.clone(),
                &config.monitor,
            );
            let server = Arc::new(rt.block_on(Server::bind(transport))?);

            let accepting = server.clone();
            let accept_stopped = loop_handle.clone();
            rt.spawn(async move {
                if let Err(e) = accepting.run().await {
                    error!("server failed: {}", e);
                    accept_stopped.stop();
                }
            });

            let stopping = server.clone();
            let handle = loop_handle.clone();
            rt.spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("listen for ctrl-c failed: {}", e);
                    return;
                }
                info!("ctrl-c received, stopping");
                stopping.stop();
                handle.stop();
            });

            event_loop.run(&mut dispatcher);
        }
        Command::Client { requests, interval } => {
            let mut dispatcher = Dispatcher::new(
                ClientHandler,
                transport,
                config.session.clone(),
                &config.monitor,
            );
            let client = Client::start(&loop_handle, config.client.clone())?;
            event_loop.context().tasks().start(RequestLoop {
                client: client.id(),
                interval: Duration::from_millis(interval),
                issued: 0,
                limit: requests,
            });

            let handle = loop_handle.clone();
            rt.spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("listen for ctrl-c failed: {}", e);
                    return;
                }
                info!("ctrl-c received, stopping");
                handle.stop();
            });

            event_loop.run(&mut dispatcher);
        }
        Command::PrintConfig => {}
    }

    info!("stonewire exited");
    Ok(())
}
