use std::net::TcpListener as StdListener;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rstest::{fixture, rstest};
use stonewire::{
    setup_local_tracing, AppError, AppResult, Client, CloseReason, Dispatcher, EventLoop, Handler,
    LoopContext, LoopHandle, NetError, RpcResult, Server, Session, StoneWireConfig, Transport,
};
use tokio::runtime::Runtime;

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

struct Echo;

impl Handler for Echo {
    fn on_push(&mut self, session: &mut Session, data: Bytes) -> AppResult<()> {
        let mut ack = b"ack ".to_vec();
        ack.extend_from_slice(&data);
        session.push(ack)
    }

    fn on_request(&mut self, _session: &mut Session, data: Bytes) -> AppResult<RpcResult> {
        Ok(RpcResult::ok(data))
    }
}

/// Client side handler reporting what happens to the test thread.
struct Recorder(Sender<String>);

impl Handler for Recorder {
    fn on_open(&mut self, _session: &mut Session) {
        let _ = self.0.send("open".to_string());
    }

    fn on_push(&mut self, _session: &mut Session, data: Bytes) -> AppResult<()> {
        let _ = self
            .0
            .send(format!("push {}", String::from_utf8_lossy(&data)));
        Ok(())
    }

    fn on_close(&mut self, _session: &mut Session, reason: CloseReason) {
        let _ = self.0.send(format!("close {:?}", reason));
    }

    fn on_error(&mut self, _peer: &str, _error: &AppError) {
        let _ = self.0.send("error".to_string());
    }
}

struct Node {
    handle: LoopHandle<Dispatcher>,
    thread: Option<JoinHandle<Dispatcher>>,
}

impl Node {
    fn start<H: Handler + 'static>(
        runtime: &Runtime,
        config: &StoneWireConfig,
        handler: H,
    ) -> (Node, Transport) {
        let mut event_loop = EventLoop::<Dispatcher>::new(&config.event_loop);
        let handle = event_loop.handle();
        let transport = Transport::new(
            runtime.handle().clone(),
            handle.clone(),
            config.network.clone(),
        );
        let mut dispatcher = Dispatcher::new(
            handler,
            transport.clone(),
            config.session.clone(),
            &config.monitor,
        );
        let thread = thread::spawn(move || {
            event_loop.run(&mut dispatcher);
            dispatcher
        });
        (
            Node {
                handle,
                thread: Some(thread),
            },
            transport,
        )
    }

    fn stop(&mut self) -> Option<Dispatcher> {
        self.handle.stop();
        self.thread.take().map(|thread| thread.join().unwrap())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

fn test_config(port: u16) -> StoneWireConfig {
    let mut config = StoneWireConfig::default();
    config.network.port = port;
    config.event_loop.period_ms = 5;
    config.client.port = port;
    config.client.reconnect_delay_ms = 50;
    config.monitor.interval_ms = 0;
    config
}

fn start_server(runtime: &Runtime, config: &StoneWireConfig) -> (Node, Arc<Server>, u16) {
    let (node, transport) = Node::start(runtime, config, Echo);
    let server = Arc::new(runtime.block_on(Server::bind(transport)).unwrap());
    let port = server.local_addr().unwrap().port();
    let accepting = server.clone();
    runtime.spawn(async move { accepting.run().await });
    (node, server, port)
}

fn wait_for(events: &Receiver<String>, wanted: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if event.starts_with(wanted) => return,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    panic!("no {:?} event within 5s", wanted);
}

/// Issues a request on the client's session and waits for its result.
fn call(client: &Client, data: Bytes) -> RpcResult {
    let (tx, rx) = mpsc::channel();
    client
        .with_session(move |session| {
            let session = session.expect("client is connected");
            let _ = session.request(data, move |_, result| {
                let _ = tx.send(result);
            });
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[rstest]
fn test_request_round_trip(_setup: ()) {
    let runtime = Runtime::new().unwrap();
    let (mut server_node, server, port) = start_server(&runtime, &test_config(0));

    let (events_tx, events) = mpsc::channel();
    let config = test_config(port);
    let (client_node, _) = Node::start(&runtime, &config, Recorder(events_tx));
    let client = Client::start(&client_node.handle, config.client.clone()).unwrap();
    wait_for(&events, "open");

    let result = call(&client, Bytes::from_static(b"ping"));
    assert_eq!(result, RpcResult::ok("ping"));

    // spans several frames of the default 1024 bytes
    let large = Bytes::from((0..5000).map(|i| (i % 256) as u8).collect::<Vec<u8>>());
    let result = call(&client, large.clone());
    assert!(result.is_ok());
    assert_eq!(result.data, large);

    server.stop();
    let dispatcher = server_node.stop().unwrap();
    assert_eq!(dispatcher.session_count(), 0);
}

#[rstest]
fn test_push_is_acknowledged(_setup: ()) {
    let runtime = Runtime::new().unwrap();
    let (_server_node, _server, port) = start_server(&runtime, &test_config(0));

    let (events_tx, events) = mpsc::channel();
    let config = test_config(port);
    let (client_node, _) = Node::start(&runtime, &config, Recorder(events_tx));
    let client = Client::start(&client_node.handle, config.client.clone()).unwrap();
    wait_for(&events, "open");

    let (sent_tx, sent_rx) = mpsc::channel();
    client
        .with_session(move |session| {
            let session = session.expect("client is connected");
            session
                .push_notify("hello", move |_, ok| {
                    let _ = sent_tx.send(ok);
                })
                .unwrap();
        })
        .unwrap();

    assert!(sent_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    wait_for(&events, "push ack hello");
}

#[rstest]
fn test_pending_request_fails_when_peer_goes_away(_setup: ()) {
    let runtime = Runtime::new().unwrap();
    let (server_node, server, port) = start_server(&runtime, &test_config(0));

    let (events_tx, events) = mpsc::channel();
    let mut config = test_config(port);
    config.client.auto_reconnect = false;
    let (client_node, _) = Node::start(&runtime, &config, Recorder(events_tx));
    let client = Client::start(&client_node.handle, config.client.clone()).unwrap();
    wait_for(&events, "open");

    // keep the server loop busy so the request is never answered
    server_node
        .handle
        .perform_job(|_: &mut Dispatcher, _: &mut LoopContext<Dispatcher>| {
            thread::sleep(Duration::from_millis(500))
        })
        .unwrap();

    let (issued_tx, issued_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();
    client
        .with_session(move |session| {
            let session = session.expect("client is connected");
            let serial = session.request("never answered", move |_, result| {
                let _ = result_tx.send(result);
            });
            let _ = issued_tx.send(serial.is_ok());
        })
        .unwrap();
    assert!(issued_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    // let the server reader pick the request up before the socket goes away
    thread::sleep(Duration::from_millis(100));

    server.stop();
    let result = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.net_error(), Some(NetError::SessionClosed));
    wait_for(&events, "close ");
}

#[rstest]
fn test_request_times_out(_setup: ()) {
    let runtime = Runtime::new().unwrap();
    let (server_node, _server, port) = start_server(&runtime, &test_config(0));

    let (events_tx, events) = mpsc::channel();
    let mut config = test_config(port);
    config.session.request_timeout_ms = 100;
    config.session.request_sweep_interval_ms = 10;
    let (client_node, _) = Node::start(&runtime, &config, Recorder(events_tx));
    let client = Client::start(&client_node.handle, config.client.clone()).unwrap();
    wait_for(&events, "open");

    server_node
        .handle
        .perform_job(|_: &mut Dispatcher, _: &mut LoopContext<Dispatcher>| {
            thread::sleep(Duration::from_millis(600))
        })
        .unwrap();

    let started = Instant::now();
    let result = call(&client, Bytes::from_static(b"slow"));
    assert_eq!(result.net_error(), Some(NetError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[rstest]
fn test_client_reconnects_until_server_is_up(_setup: ()) {
    let runtime = Runtime::new().unwrap();
    // reserve a port nobody listens on yet
    let port = {
        let probe = StdListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let (events_tx, events) = mpsc::channel();
    let config = test_config(port);
    let (client_node, _) = Node::start(&runtime, &config, Recorder(events_tx));
    let client = Client::start(&client_node.handle, config.client.clone()).unwrap();
    wait_for(&events, "error");

    let (_server_node, _server, _) = start_server(&runtime, &test_config(port));
    wait_for(&events, "open");
    assert!(call(&client, Bytes::from_static(b"late")).is_ok());

    client.stop().unwrap();
    wait_for(&events, "close Stop");
}
