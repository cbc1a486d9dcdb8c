use std::{future::Future, time::Duration};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rand::{rngs::StdRng, SeedableRng};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::Instant,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use telemetry_common::{
    identity::parse_mac, ConnectionState, DeviceId, RelaySession, RuntimeConfig, SensorReading,
    TransportKind, Vitals,
};

use crate::link::{FrameOutcome, Link, OutboundMessage, RelayLink};
use crate::node::{Board, ControlOutcome, Node};

const SIMULATED_MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0x00, 0x00, 0x01];
const SERVICE_TICK: Duration = Duration::from_millis(250);
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Restart,
    Shutdown,
}

enum MqttStep {
    Continue,
    Failed,
    Restart(Duration),
}

struct SimulatedBoard {
    started: Instant,
    tick: u64,
    fail_every: Option<u64>,
}

struct MqttLink {
    client: AsyncClient,
}

/// Brings the node onto the network. The host has no radio, so the real
/// implementation only checks that the broker name resolves.
trait Attach {
    async fn attach(&mut self, host: &str, port: u16) -> std::io::Result<()>;
}

/// Opens a WebSocket to the relay.
trait Dial {
    type Io: AsyncRead + AsyncWrite + Unpin;

    async fn dial(&mut self, url: &str) -> anyhow::Result<WebSocketStream<Self::Io>>;
}

struct DnsAttach;

struct WsDial;

impl Attach for DnsAttach {
    async fn attach(&mut self, host: &str, port: u16) -> std::io::Result<()> {
        let addr = tokio::net::lookup_host((host, port)).await?.next();
        debug!("broker {host}:{port} resolves to {addr:?}");
        Ok(())
    }
}

impl Dial for WsDial {
    type Io = MaybeTlsStream<TcpStream>;

    async fn dial(&mut self, url: &str) -> anyhow::Result<WebSocketStream<Self::Io>> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to open websocket to {url}"))?;
        Ok(ws)
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    let mac = std::env::var("DEVICE_MAC")
        .ok()
        .and_then(|value| parse_mac(&value))
        .unwrap_or(SIMULATED_MAC);

    loop {
        let id = DeviceId::from_mac(mac);
        match boot(&config, id, &mut DnsAttach, &mut WsDial).await? {
            Exit::Restart => info!("restarting node"),
            Exit::Shutdown => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    let mut config = match std::env::var("TELEMETRY_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            RuntimeConfig::from_json(&raw).with_context(|| format!("invalid config file {path}"))?
        }
        Err(_) => RuntimeConfig::default(),
    };

    if let Ok(transport) = std::env::var("TRANSPORT") {
        config.network.transport = TransportKind::parse(&transport)?;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.network.mqtt_user = user;
        config.network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(url) = std::env::var("RELAY_URL") {
        config.network.set_relay_url(&url)?;
    }
    if let Ok(location) = std::env::var("DEVICE_LOCATION") {
        config.device.location = location;
    }

    config.sanitize();
    Ok(config)
}

async fn boot<A: Attach, D: Dial>(
    config: &RuntimeConfig,
    id: DeviceId,
    attach: &mut A,
    dial: &mut D,
) -> anyhow::Result<Exit> {
    let mut node = Node::new(id, config);
    let mut board = SimulatedBoard::new();
    info!(
        "booting {} ({} transport, {} ms interval)",
        node.id(),
        config.network.transport.as_str(),
        node.interval_ms()
    );

    if !attach_network(config, &mut node, attach).await {
        return Ok(Exit::Restart);
    }

    let shutdown = tokio::signal::ctrl_c();
    match config.network.transport {
        TransportKind::Direct => run_direct(config, &mut node, &mut board, shutdown).await,
        TransportKind::Relay => run_relay(config, &mut node, &mut board, dial, shutdown).await,
    }
}

async fn attach_network<A: Attach>(
    config: &RuntimeConfig,
    node: &mut Node,
    attach: &mut A,
) -> bool {
    let network = &config.network;
    let (host, port) = match network.transport {
        TransportKind::Direct => (network.mqtt_host.as_str(), network.mqtt_port),
        TransportKind::Relay => (network.relay_host.as_str(), network.relay_port),
    };

    let mut attempts = config.wifi_retry.attempts();
    while let Some(attempt) = attempts.next_attempt() {
        match attach.attach(host, port).await {
            Ok(()) => {
                info!("network attached on attempt {attempt}");
                node.transition(ConnectionState::WifiOnly);
                return true;
            }
            Err(err) => warn!("network attach attempt {attempt} failed: {err}"),
        }

        if let Some(delay) = attempts.delay_after_failure() {
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        "network attachment failed after {} attempts; restarting",
        attempts.made()
    );
    false
}

async fn run_direct<F: Future>(
    config: &RuntimeConfig,
    node: &mut Node,
    board: &mut SimulatedBoard,
    shutdown: F,
) -> anyhow::Result<Exit> {
    let network = &config.network;
    let mut mqtt_options =
        MqttOptions::new(node.id().as_str(), network.mqtt_host.clone(), network.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(u64::from(network.keep_alive_secs)));
    mqtt_options.set_last_will(LastWill::new(
        node.topics().status(),
        node.offline_payload(),
        QoS::AtLeastOnce,
        true,
    ));
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);
    let mut link = MqttLink {
        client: client.clone(),
    };

    let mut tick = tokio::time::interval(SERVICE_TICK);
    tokio::pin!(shutdown);
    let mut retry_at: Option<Instant> = None;

    loop {
        let polling = retry_at.map_or(true, |at| Instant::now() >= at);

        tokio::select! {
            event = eventloop.poll(), if polling => {
                retry_at = None;
                match handle_mqtt_event(event, node, board, &mut link) {
                    MqttStep::Continue => {}
                    MqttStep::Failed => {
                        info!("rebuilding mqtt session in {} ms", config.session_retry.delay_ms);
                        retry_at = Some(Instant::now() + config.session_retry.delay());
                    }
                    MqttStep::Restart(delay) => {
                        flush_eventloop(&mut eventloop, delay).await;
                        let _ = client.try_disconnect();
                        flush_eventloop(&mut eventloop, SHUTDOWN_FLUSH).await;
                        return Ok(Exit::Restart);
                    }
                }
            }
            _ = tick.tick() => {
                let now_ms = board.uptime_ms();
                node.service(now_ms, board, &mut link);
            }
            _ = &mut shutdown => {
                let _ = client.try_publish(node.topics().status(), QoS::AtLeastOnce, true, node.offline_payload());
                let _ = client.try_disconnect();
                flush_eventloop(&mut eventloop, SHUTDOWN_FLUSH).await;
                return Ok(Exit::Shutdown);
            }
        }
    }
}

/// Keeps polling so queued publishes reach the broker before we drop it.
async fn flush_eventloop(eventloop: &mut EventLoop, budget: Duration) {
    let _ = tokio::time::timeout(budget, async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;
}

fn handle_mqtt_event(
    event: Result<Event, rumqttc::ConnectionError>,
    node: &mut Node,
    board: &mut SimulatedBoard,
    link: &mut MqttLink,
) -> MqttStep {
    match event {
        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
            node.transition(ConnectionState::TransportOpen);
            if ack.code != ConnectReturnCode::Success {
                warn!("broker refused session: {:?}", ack.code);
                node.connection_lost(ConnectionState::WifiOnly);
                return MqttStep::Failed;
            }

            for topic in node.topics().control_topics() {
                if let Err(err) = link.client.try_subscribe(topic, QoS::AtLeastOnce) {
                    warn!("failed to subscribe to {topic}: {err}");
                }
            }
            let online = node.online_message();
            if let Err(err) = link.publish(&online) {
                warn!("failed to publish online status: {err:#}");
            }
            node.transition(ConnectionState::SessionEstablished);
            MqttStep::Continue
        }
        Ok(Event::Incoming(Incoming::Publish(message))) => {
            if !node.topics().is_control_topic(&message.topic) {
                debug!("ignoring message on {}", message.topic);
                return MqttStep::Continue;
            }
            let payload = String::from_utf8_lossy(&message.payload).into_owned();
            let now_ms = board.uptime_ms();
            match node.handle_control(&payload, now_ms, board, link) {
                ControlOutcome::Restart(delay) => MqttStep::Restart(delay),
                _ => MqttStep::Continue,
            }
        }
        Ok(Event::Incoming(Incoming::Disconnect)) => {
            warn!("broker sent disconnect");
            node.connection_lost(ConnectionState::WifiOnly);
            MqttStep::Failed
        }
        Ok(_) => MqttStep::Continue,
        Err(err) => {
            warn!("mqtt connection error: {err}");
            node.connection_lost(ConnectionState::WifiOnly);
            MqttStep::Failed
        }
    }
}

async fn run_relay<D: Dial, F: Future>(
    config: &RuntimeConfig,
    node: &mut Node,
    board: &mut SimulatedBoard,
    dial: &mut D,
    shutdown: F,
) -> anyhow::Result<Exit> {
    let url = config.network.relay_url();
    let subscriptions = node
        .topics()
        .control_topics()
        .into_iter()
        .map(str::to_string)
        .collect();
    let session = RelaySession::new(
        node.id().as_str(),
        subscriptions,
        node.topics().status(),
        config.network.keep_alive_secs,
        StdRng::from_entropy(),
    );
    let mut link = RelayLink::new(session);

    let mut socket: Option<WebSocketStream<D::Io>> = None;
    let mut last_attempt_ms: Option<u64> = None;
    let mut tick = tokio::time::interval(SERVICE_TICK);
    tokio::pin!(shutdown);

    loop {
        let now_ms = board.uptime_ms();
        if socket.is_none() && config.session_retry.is_due(last_attempt_ms, now_ms) {
            last_attempt_ms = Some(now_ms);
            match open_relay(dial, &url, &mut link, node, now_ms).await {
                Ok(ws) => socket = Some(ws),
                Err(err) => {
                    warn!(
                        "relay connect failed: {err:#}; retrying in {} ms",
                        config.session_retry.delay_ms
                    );
                    node.connection_lost(ConnectionState::WifiOnly);
                }
            }
        }

        let mut outcome = FrameOutcome::Continue;

        tokio::select! {
            frame = next_frame(&mut socket) => match frame {
                Some(Ok(Message::Text(text))) => {
                    debug!("relay <- {text}");
                    outcome = link.on_frame(&text, node, board);
                }
                Some(Ok(Message::Close(reason))) => {
                    info!("relay closed the socket: {reason:?}");
                    outcome = FrameOutcome::Close;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("relay socket error: {err}");
                    outcome = FrameOutcome::Close;
                }
                None => outcome = FrameOutcome::Close,
            },
            _ = tick.tick() => {
                let now_ms = board.uptime_ms();
                if socket.is_some() {
                    outcome = link.check_handshake(now_ms, config.session_retry.delay());
                }
                link.poll_keep_alive(now_ms);
                node.service(now_ms, board, &mut link);
            }
            _ = &mut shutdown => {
                if let Some(mut ws) = socket.take() {
                    let _ = link.publish(&OutboundMessage::retained(node.topics().status(), node.offline_payload()));
                    for frame in link.drain() {
                        let _ = ws.send(Message::Text(frame)).await;
                    }
                    let _ = ws.close(None).await;
                }
                return Ok(Exit::Shutdown);
            }
        }

        if let Some(ws) = socket.as_mut() {
            for frame in link.drain() {
                if let Err(err) = ws.send(Message::Text(frame)).await {
                    warn!("relay send failed: {err}");
                    outcome = FrameOutcome::Close;
                    break;
                }
            }
        }

        match outcome {
            FrameOutcome::Continue => {}
            FrameOutcome::Close => {
                if let Some(mut ws) = socket.take() {
                    let _ = ws.close(None).await;
                }
                link.reset();
                node.connection_lost(ConnectionState::WifiOnly);
            }
            FrameOutcome::Restart(delay) => {
                tokio::time::sleep(delay).await;
                if let Some(mut ws) = socket.take() {
                    let _ = ws.close(None).await;
                }
                return Ok(Exit::Restart);
            }
        }
    }
}

async fn open_relay<D: Dial>(
    dial: &mut D,
    url: &str,
    link: &mut RelayLink<StdRng>,
    node: &mut Node,
    now_ms: u64,
) -> anyhow::Result<WebSocketStream<D::Io>> {
    info!("connecting to relay {url}");
    let mut ws = dial.dial(url).await?;
    node.transition(ConnectionState::TransportOpen);

    let connect = link.open(now_ms)?;
    debug!("relay -> {connect}");
    ws.send(Message::Text(connect))
        .await
        .context("failed to send connect envelope")?;
    Ok(ws)
}

async fn next_frame<S: AsyncRead + AsyncWrite + Unpin>(
    socket: &mut Option<WebSocketStream<S>>,
) -> Option<Result<Message, WsError>> {
    match socket.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

impl SimulatedBoard {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            tick: 0,
            fail_every: std::env::var("SIMULATE_SENSOR_FAILURE_EVERY")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|n| *n > 0),
        }
    }
}

impl Board for SimulatedBoard {
    fn read_sensor(&mut self) -> SensorReading {
        self.tick = self.tick.saturating_add(1);

        if matches!(self.fail_every, Some(n) if self.tick % n == 0) {
            return SensorReading::INVALID;
        }

        // Slow sawtooth so dashboards show movement.
        let temperature_c = 21.0 + ((self.tick % 8) as f32 * 0.3);
        let humidity = 45.0 + ((self.tick % 6) as f32 * 0.7);
        SensorReading::new(temperature_c, humidity)
    }

    fn vitals(&self) -> Vitals {
        Vitals {
            ip: None,
            rssi: None,
            free_heap: None,
            uptime_ms: self.uptime_ms(),
            timestamp: Some(chrono::Utc::now().timestamp()),
        }
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Link for MqttLink {
    fn publish(&mut self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.client
            .try_publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                message.retain,
                message.payload.clone(),
            )
            .with_context(|| format!("failed to queue publish on {}", message.topic))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;
    use telemetry_common::RetryPolicy;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    struct Unreachable {
        calls: u32,
    }

    impl Attach for Unreachable {
        async fn attach(&mut self, _host: &str, _port: u16) -> std::io::Result<()> {
            self.calls += 1;
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no route to broker",
            ))
        }
    }

    /// In-memory relay; each dial hands the node one end of a fresh pipe.
    struct LoopbackRelay {
        answer: bool,
        dials: usize,
        sessions: Arc<AtomicUsize>,
        held: Vec<WebSocketStream<DuplexStream>>,
    }

    impl LoopbackRelay {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                dials: 0,
                sessions: Arc::new(AtomicUsize::new(0)),
                held: Vec::new(),
            }
        }
    }

    impl Dial for LoopbackRelay {
        type Io = DuplexStream;

        async fn dial(&mut self, _url: &str) -> anyhow::Result<WebSocketStream<DuplexStream>> {
            self.dials += 1;
            let (client, server) = duplex(4096);
            let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
            if self.answer {
                tokio::spawn(accept_then_hang_up(server, Arc::clone(&self.sessions)));
            } else {
                self.held.push(server);
            }
            Ok(WebSocketStream::from_raw_socket(client, Role::Client, None).await)
        }
    }

    /// Accepts one handshake, waits for the first subscribe, then closes.
    async fn accept_then_hang_up(mut ws: WebSocketStream<DuplexStream>, sessions: Arc<AtomicUsize>) {
        if !matches!(ws.next().await, Some(Ok(Message::Text(_)))) {
            return;
        }
        let connack = r#"{"type":"connack","returnCode":0}"#.to_string();
        if ws.send(Message::Text(connack)).await.is_err() {
            return;
        }
        if let Some(Ok(Message::Text(frame))) = ws.next().await {
            if frame.contains(r#""type":"subscribe""#) {
                sessions.fetch_add(1, Ordering::SeqCst);
            }
        }
        let _ = ws.close(None).await;
    }

    fn relay_config(retry_ms: u64) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.network.transport = TransportKind::Relay;
        config.session_retry = RetryPolicy::unbounded(retry_ms);
        config
    }

    fn attached_node(config: &RuntimeConfig) -> Node {
        let mut node = Node::new(DeviceId::from_mac(SIMULATED_MAC), config);
        node.transition(ConnectionState::WifiOnly);
        node
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attachment_restarts() {
        let mut config = relay_config(500);
        config.wifi_retry = RetryPolicy::bounded(3, 500);
        let mut attach = Unreachable { calls: 0 };
        let mut relay = LoopbackRelay::new(true);
        let started = Instant::now();

        let exit = boot(&config, DeviceId::from_mac(SIMULATED_MAC), &mut attach, &mut relay)
            .await
            .unwrap();

        assert_eq!(exit, Exit::Restart);
        assert_eq!(attach.calls, 3);
        assert_eq!(relay.dials, 0);
        // Two waits between three attempts.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1_000), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1_500), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_connect_is_redialled_every_period() {
        let config = relay_config(500);
        let mut node = attached_node(&config);
        let mut board = SimulatedBoard::new();
        let mut relay = LoopbackRelay::new(false);

        let exit = run_relay(
            &config,
            &mut node,
            &mut board,
            &mut relay,
            tokio::time::sleep(Duration::from_millis(1_900)),
        )
        .await
        .unwrap();

        assert_eq!(exit, Exit::Shutdown);
        // Dials at 0, 500, 1000 and 1500 ms; each one times out waiting for connack.
        assert_eq!(relay.dials, 4);
        assert_eq!(node.connectivity().state(), ConnectionState::TransportOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_is_rebuilt_once_per_period() {
        let config = relay_config(500);
        let mut node = attached_node(&config);
        let mut board = SimulatedBoard::new();
        let mut relay = LoopbackRelay::new(true);

        let exit = run_relay(
            &config,
            &mut node,
            &mut board,
            &mut relay,
            tokio::time::sleep(Duration::from_millis(1_200)),
        )
        .await
        .unwrap();

        assert_eq!(exit, Exit::Shutdown);
        assert_eq!(relay.dials, 3);
        assert_eq!(relay.sessions.load(Ordering::SeqCst), 3);
        assert_eq!(node.connectivity().state(), ConnectionState::WifiOnly);
    }
}
