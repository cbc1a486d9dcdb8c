use core::convert::TryInto;
use std::{
    sync::mpsc::{self, Sender},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, dht22};
use embedded_svc::{
    mqtt::client::{EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pins, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    io::EspIOError,
    log::EspLogger,
    mqtt::client::{EspMqttClient, LwtConfiguration, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    sys::{self, EspError},
    wifi::{BlockingWifi, EspWifi},
    ws::{
        client::{
            EspWebSocketClient, EspWebSocketClientConfig, WebSocketEvent, WebSocketEventType,
        },
        FrameType,
    },
};
use log::{debug, info, warn};
use rand::{rngs::StdRng, SeedableRng};

use telemetry_common::{
    ConnectionState, DeviceId, RelaySession, RuntimeConfig, SensorModel, SensorReading,
    SocketEpoch, TransportKind, Vitals,
};

use crate::link::{FrameOutcome, Link, OutboundMessage, RelayLink};
use crate::node::{Board, ControlOutcome, Node};

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(90);
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const LOOP_TICK: Duration = Duration::from_millis(100);
const WS_TIMEOUT: Duration = Duration::from_secs(10);

/// Events forwarded from the platform callbacks to the main loop.
enum Inbound {
    Connected,
    Disconnected,
    Frame(String),
    Message { topic: String, payload: String },
}

/// Relay events carry the epoch of the socket that produced them.
type TaggedInbound = (u32, Inbound);

/// Task watchdog subscription for the loop thread.
struct Watchdog;

struct EspBoard {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    model: SensorModel,
    pin_number: i32,
    started: Instant,
    ip: Option<String>,
}

struct EspMqttLink {
    client: EspMqttClient<'static>,
}

struct EspRelayLink {
    inner: RelayLink<StdRng>,
    socket: Option<EspWebSocketClient<'static>>,
}

impl EspBoard {
    fn new(pins: Pins, pin_number: i32, model: SensorModel) -> anyhow::Result<Self> {
        let pin = dht_pin(pins, pin_number)?;
        let mut dht_pin = PinDriver::input_output_od(pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        info!("{model:?} sensor on GPIO{pin_number}");

        Ok(Self {
            dht_pin,
            delay: Ets,
            model,
            pin_number,
            started: Instant::now(),
            ip: None,
        })
    }
}

/// GPIOs that can drive the open-drain DHT data line on both supported chips.
fn dht_pin(pins: Pins, number: i32) -> anyhow::Result<AnyIOPin> {
    let pin = match number {
        4 => pins.gpio4.downgrade(),
        5 => pins.gpio5.downgrade(),
        16 => pins.gpio16.downgrade(),
        17 => pins.gpio17.downgrade(),
        18 => pins.gpio18.downgrade(),
        21 => pins.gpio21.downgrade(),
        other => return Err(anyhow!("GPIO{other} is not wired for the DHT sensor")),
    };
    Ok(pin)
}

impl Board for EspBoard {
    fn read_sensor(&mut self) -> SensorReading {
        if let Err(err) = self.dht_pin.set_high() {
            warn!("failed to set DHT line high before read: {err:?}");
            return SensorReading::INVALID;
        }

        let reading = match self.model {
            SensorModel::Dht11 => dht11::blocking::read(&mut self.delay, &mut self.dht_pin)
                .map(|r| SensorReading::new(f32::from(r.temperature), f32::from(r.relative_humidity)))
                .map_err(|err| format!("{err:?}")),
            SensorModel::Dht22 => dht22::blocking::read(&mut self.delay, &mut self.dht_pin)
                .map(|r| SensorReading::new(r.temperature, r.relative_humidity))
                .map_err(|err| format!("{err:?}")),
        };

        match reading {
            Ok(reading) => {
                info!(
                    "[DHT] {:.1}°C {:.1}%",
                    reading.temperature_c, reading.humidity
                );
                reading
            }
            Err(err) => {
                warn!("failed to read DHT on GPIO{}: {err}", self.pin_number);
                SensorReading::INVALID
            }
        }
    }

    fn vitals(&self) -> Vitals {
        Vitals {
            ip: self.ip.clone(),
            rssi: wifi_rssi(),
            free_heap: Some(unsafe { sys::esp_get_free_heap_size() }),
            uptime_ms: self.uptime_ms(),
            timestamp: None,
        }
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Link for EspMqttLink {
    fn publish(&mut self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.client
            .publish(
                &message.topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload.as_bytes(),
            )
            .map_err(|err| anyhow!("mqtt publish failed: {err:?}"))?;
        Ok(())
    }
}

impl Link for EspRelayLink {
    fn publish(&mut self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.inner.publish(message)
    }
}

impl EspRelayLink {
    fn flush(&mut self) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            self.inner.drain();
            return true;
        };

        for frame in self.inner.drain() {
            debug!("relay -> {frame}");
            if let Err(err) = socket.send(FrameType::Text(false), frame.as_bytes()) {
                warn!("relay send failed: {err:?}");
                return false;
            }
        }
        true
    }
}

impl Watchdog {
    /// Arms the task watchdog and subscribes the calling thread to it.
    fn arm(timeout: Duration) -> anyhow::Result<Self> {
        let config = sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        // ESP_ERR_INVALID_STATE: already armed or already subscribed.
        already_fine(unsafe { sys::esp_task_wdt_init(&config) })
            .context("task watchdog init failed")?;
        already_fine(unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) })
            .context("task watchdog subscribe failed")?;
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { sys::esp_task_wdt_reset() };
    }
}

fn already_fine(rc: sys::esp_err_t) -> Result<(), EspError> {
    if rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    EspError::convert(rc)
}

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let config = RuntimeConfig::default();
    info!(
        "telemetry node starting ({} transport, {} ms interval, {} baud console)",
        config.network.transport.as_str(),
        config.device.publish_interval_ms,
        config.device.serial_baud
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut board = EspBoard::new(pins, config.device.sensor_pin, config.device.sensor_model)
        .context("failed to initialize DHT sensor")?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config)?;
    let mac = wifi.sta_netif().get_mac()?;
    board.ip = wifi
        .sta_netif()
        .get_ip_info()
        .ok()
        .map(|info| info.ip.to_string());

    let mut node = Node::new(DeviceId::from_mac(mac), &config);
    node.transition(ConnectionState::WifiOnly);
    info!(
        "device id {} at {:?}, rssi {:?}, publishing every {} ms",
        node.id(),
        board.ip,
        wifi_rssi(),
        node.interval_ms()
    );

    let watchdog = Watchdog::arm(WATCHDOG_TIMEOUT)?;

    // Keep the driver alive for the program lifetime.
    let _wifi = wifi;

    match config.network.transport {
        TransportKind::Direct => run_direct(&config, &mut node, &mut board, &watchdog),
        TransportKind::Relay => run_relay(&config, &mut node, &mut board, &watchdog),
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &RuntimeConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let network = &config.network;
    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);
    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut attempts = config.wifi_retry.attempts();
    while let Some(attempt) = attempts.next_attempt() {
        info!("wifi connect attempt {attempt}/{:?}", attempts.limit());
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                disable_wifi_power_save();
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi attempt {attempt} failed: {err:#}"),
        }

        if let Some(delay) = attempts.delay_after_failure() {
            let _ = wifi.disconnect();
            thread::sleep(delay);
        }
    }

    warn!(
        "wifi unavailable after {} attempts; restarting device",
        attempts.made()
    );
    restart(Duration::from_millis(100))
}

fn run_direct(
    config: &RuntimeConfig,
    node: &mut Node,
    board: &mut EspBoard,
    watchdog: &Watchdog,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut link = EspMqttLink {
        client: create_mqtt_client(config, node, tx)?,
    };
    node.transition(ConnectionState::TransportOpen);

    let mut wifi_disconnected_since: Option<Instant> = None;

    loop {
        watchdog.feed();
        maintain_wifi_health(node, &mut wifi_disconnected_since);

        while let Ok(inbound) = rx.try_recv() {
            match inbound {
                Inbound::Connected => {
                    if node.connectivity().state() < ConnectionState::TransportOpen {
                        node.transition(ConnectionState::TransportOpen);
                    }
                    for topic in node.topics().control_topics() {
                        if let Err(err) = link.client.subscribe(topic, QoS::AtLeastOnce) {
                            warn!("failed to subscribe to {topic}: {err:?}");
                        }
                    }
                    if let Err(err) = link.publish(&node.online_message()) {
                        warn!("failed to publish online status: {err:#}");
                    }
                    node.transition(ConnectionState::SessionEstablished);
                }
                Inbound::Disconnected => {
                    // The ESP-IDF client reconnects by itself after its own delay.
                    node.connection_lost(ConnectionState::WifiOnly);
                }
                Inbound::Message { topic, payload } => {
                    if !node.topics().is_control_topic(&topic) {
                        continue;
                    }
                    let now_ms = board.uptime_ms();
                    if let ControlOutcome::Restart(delay) =
                        node.handle_control(&payload, now_ms, board, &mut link)
                    {
                        restart(delay);
                    }
                }
                Inbound::Frame(_) => {}
            }
        }

        let now_ms = board.uptime_ms();
        node.service(now_ms, board, &mut link);
        thread::sleep(LOOP_TICK);
    }
}

fn create_mqtt_client(
    config: &RuntimeConfig,
    node: &Node,
    tx: Sender<Inbound>,
) -> anyhow::Result<EspMqttClient<'static>> {
    let network = &config.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(node.id().as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(u64::from(network.keep_alive_secs))),
        reconnect_timeout: Some(config.session_retry.delay()),
        lwt: Some(LwtConfiguration {
            topic: node.topics().status(),
            payload: node.offline_payload().as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    let (client, mut conn) = EspMqttClient::new(&url, &conf)?;

    thread::Builder::new()
        .name("mqtt-events".to_string())
        .stack_size(6144)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                let inbound = match event.payload() {
                    EventPayload::Connected(_) => Inbound::Connected,
                    EventPayload::Disconnected => Inbound::Disconnected,
                    EventPayload::Received { topic, data, .. } => Inbound::Message {
                        topic: topic.unwrap_or_default().to_string(),
                        payload: String::from_utf8_lossy(data).into_owned(),
                    },
                    _ => continue,
                };
                if tx.send(inbound).is_err() {
                    break;
                }
            }
            warn!("mqtt event thread exiting");
        })?;

    Ok(client)
}

fn run_relay(
    config: &RuntimeConfig,
    node: &mut Node,
    board: &mut EspBoard,
    watchdog: &Watchdog,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel::<TaggedInbound>();
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
    let mut link = EspRelayLink {
        inner: RelayLink::new(session),
        socket: None,
    };

    let mut last_attempt_ms: Option<u64> = None;
    let mut epoch = SocketEpoch::default();
    let mut wifi_disconnected_since: Option<Instant> = None;

    loop {
        watchdog.feed();
        maintain_wifi_health(node, &mut wifi_disconnected_since);

        let now_ms = board.uptime_ms();
        if link.socket.is_none() && config.session_retry.is_due(last_attempt_ms, now_ms) {
            last_attempt_ms = Some(now_ms);
            info!("connecting to relay {url}");
            let tag = epoch.begin();
            match open_relay(&url, tag, tx.clone()) {
                Ok(socket) => link.socket = Some(socket),
                Err(err) => {
                    epoch.end();
                    warn!(
                        "relay connect failed: {err:#}; retrying in {} ms",
                        config.session_retry.delay_ms
                    );
                }
            }
        }

        let mut outcome = FrameOutcome::Continue;
        while let Ok((tag, inbound)) = rx.try_recv() {
            if !epoch.accepts(tag) {
                debug!("dropping event from closed relay socket #{tag}");
                continue;
            }
            outcome = match inbound {
                Inbound::Connected => {
                    node.transition(ConnectionState::TransportOpen);
                    match link.inner.open(board.uptime_ms()) {
                        Ok(frame) => {
                            if let Some(socket) = link.socket.as_mut() {
                                if let Err(err) = socket.send(FrameType::Text(false), frame.as_bytes()) {
                                    warn!("failed to send connect envelope: {err:?}");
                                }
                            }
                            FrameOutcome::Continue
                        }
                        Err(err) => {
                            warn!("failed to encode connect envelope: {err:#}");
                            FrameOutcome::Close
                        }
                    }
                }
                Inbound::Disconnected => FrameOutcome::Close,
                Inbound::Frame(text) => {
                    debug!("relay <- {text}");
                    link.inner.on_frame(&text, node, board)
                }
                Inbound::Message { .. } => FrameOutcome::Continue,
            };
            if outcome != FrameOutcome::Continue {
                break;
            }
        }

        let now_ms = board.uptime_ms();
        if outcome == FrameOutcome::Continue {
            outcome = link
                .inner
                .check_handshake(now_ms, config.session_retry.delay());
        }
        link.inner.poll_keep_alive(now_ms);
        node.service(now_ms, board, &mut link);

        if !link.flush() && outcome == FrameOutcome::Continue {
            outcome = FrameOutcome::Close;
        }

        match outcome {
            FrameOutcome::Continue => {}
            FrameOutcome::Close => {
                // Dropping the client closes the socket; its late events are stale.
                epoch.end();
                link.socket = None;
                link.inner.reset();
                node.connection_lost(ConnectionState::WifiOnly);
            }
            FrameOutcome::Restart(delay) => restart(delay),
        }

        thread::sleep(LOOP_TICK);
    }
}

fn open_relay(
    url: &str,
    tag: u32,
    tx: Sender<TaggedInbound>,
) -> anyhow::Result<EspWebSocketClient<'static>> {
    let ws_config = EspWebSocketClientConfig {
        crt_bundle_attach: Some(sys::esp_crt_bundle_attach),
        ..Default::default()
    };

    let client = EspWebSocketClient::new(url, &ws_config, WS_TIMEOUT, move |event| {
        forward_ws_event(&tx, tag, event)
    })
    .map_err(|err| anyhow!("failed to create websocket client: {err:?}"))?;
    Ok(client)
}

fn forward_ws_event(
    tx: &Sender<TaggedInbound>,
    tag: u32,
    event: &Result<WebSocketEvent, EspIOError>,
) {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!("websocket error: {err:?}");
            return;
        }
    };

    let inbound = match event.event_type {
        WebSocketEventType::Connected => Inbound::Connected,
        WebSocketEventType::Disconnected
        | WebSocketEventType::Close(_)
        | WebSocketEventType::Closed => Inbound::Disconnected,
        WebSocketEventType::Text(text) => Inbound::Frame(text.to_string()),
        _ => return,
    };
    let _ = tx.send((tag, inbound));
}

fn restart(delay: Duration) -> ! {
    warn!("restarting in {} ms", delay.as_millis());
    thread::sleep(delay);
    unsafe { sys::esp_restart() }
}

fn disable_wifi_power_save() {
    match EspError::convert(unsafe { sys::esp_wifi_set_ps(sys::wifi_ps_type_t_WIFI_PS_NONE) }) {
        Ok(()) => info!("wifi power save off"),
        Err(err) => warn!("wifi power save still on: {err}"),
    }
}

fn wifi_rssi() -> Option<i32> {
    let mut ap_info = sys::wifi_ap_record_t::default();
    let rc = unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == sys::ESP_OK).then_some(i32::from(ap_info.rssi))
}

fn maintain_wifi_health(node: &mut Node, wifi_disconnected_since: &mut Option<Instant>) {
    if wifi_rssi().is_some() {
        if wifi_disconnected_since.take().is_some() {
            node.transition(ConnectionState::WifiOnly);
        }
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            restart(Duration::from_millis(100));
        }
        Some(_) => {}
        None => {
            node.connection_lost(ConnectionState::Disconnected);
            *wifi_disconnected_since = Some(Instant::now());
        }
    }
}
