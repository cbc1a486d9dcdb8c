//! Loop body shared by the host and ESP32 builds.
//!
//! [`Node`] holds everything the control loop used to keep in globals. The
//! platform supplies a [`Board`] (sensor and vitals) and a [`Link`] (broker
//! session) on every call.

use std::time::Duration;

use log::{error, info, warn};

use telemetry_common::{
    alerts::{self, Alert},
    command::CommandError,
    decide_interval, AlertThresholds, ConnectionState, Connectivity, ControlCommand, DeviceId,
    DeviceStatus, IntervalDecision, RuntimeConfig, Sample, SensorFailurePolicy, SensorReading,
    StatusRecord, TelemetryRecord, Topics, TransportKind, Vitals,
};

use crate::link::{Link, OutboundMessage};

pub trait Board {
    fn read_sensor(&mut self) -> SensorReading;
    fn vitals(&self) -> Vitals;
    fn uptime_ms(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Status sent; the caller waits `delay` and restarts the device.
    Restart(Duration),
    StatusReported,
    IntervalAccepted(u64),
    IntervalRejected(Option<u64>),
    Ignored(String),
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Published { messages: usize, alerts: usize },
    SensorFailed { alerted: bool },
}

pub struct Node {
    id: DeviceId,
    topics: Topics,
    location: String,
    transport: TransportKind,
    interval_ms: u64,
    restart_delay_ms: u64,
    thresholds: AlertThresholds,
    failure_policy: SensorFailurePolicy,
    connectivity: Connectivity,
    last_publish_ms: Option<u64>,
}

impl Node {
    pub fn new(id: DeviceId, config: &RuntimeConfig) -> Self {
        let topics = Topics::new(config.network.topic_layout, &id);
        Self {
            id,
            topics,
            location: config.device.location.clone(),
            transport: config.network.transport,
            interval_ms: config.device.publish_interval_ms,
            restart_delay_ms: config.device.restart_delay_ms,
            thresholds: config.alerts,
            failure_policy: config.sensor_failure,
            connectivity: Connectivity::default(),
            last_publish_ms: None,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Moves the connection state, stepping forward or collapsing back.
    pub fn transition(&mut self, to: ConnectionState) {
        let from = self.connectivity.state();
        let result = if to > from {
            self.connectivity.advance(to)
        } else {
            self.connectivity.collapse(to)
        };

        match result {
            Ok(state) => info!("connection {} -> {}", from.as_str(), state.as_str()),
            Err(err) => warn!("ignored connection transition: {err}"),
        }
    }

    /// Collapses to `to` if the link was further along; used on every failure.
    pub fn connection_lost(&mut self, to: ConnectionState) {
        let from = self.connectivity.state();
        if self.connectivity.fall_back_to(to) {
            warn!("connection lost: {} -> {}", from.as_str(), to.as_str());
        }
    }

    pub fn online_message(&self) -> OutboundMessage {
        OutboundMessage::retained(self.topics.status(), DeviceStatus::Online.as_str())
    }

    pub fn offline_payload(&self) -> &'static str {
        DeviceStatus::Offline.as_str()
    }

    pub fn is_publish_due(&self, now_ms: u64) -> bool {
        match self.last_publish_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        }
    }

    /// Runs one telemetry cycle when the interval elapsed and the session is up.
    pub fn service<B: Board, L: Link>(
        &mut self,
        now_ms: u64,
        board: &mut B,
        link: &mut L,
    ) -> Option<CycleOutcome> {
        if !self.connectivity.is_established() || !self.is_publish_due(now_ms) {
            return None;
        }
        self.last_publish_ms = Some(now_ms);
        Some(self.run_cycle(board, link))
    }

    pub fn run_cycle<B: Board, L: Link>(&mut self, board: &mut B, link: &mut L) -> CycleOutcome {
        let raw = board.read_sensor();

        let reading = match raw.classify(&self.failure_policy) {
            Sample::Valid(reading) => reading,
            Sample::Substituted(reading) => {
                warn!(
                    "sensor read failed; substituting {:.1}°C / {:.1}%",
                    reading.temperature_c, reading.humidity
                );
                reading
            }
            Sample::Failed => {
                warn!("sensor read failed; skipping telemetry this cycle");
                let alerted = matches!(self.failure_policy, SensorFailurePolicy::Alert);
                if alerted {
                    let message = Alert::SensorFailure.message(self.id.as_str(), &self.location);
                    send(link, &OutboundMessage::new(self.topics.alerts(), message));
                }
                return CycleOutcome::SensorFailed { alerted };
            }
        };

        let vitals = board.vitals();
        let record = TelemetryRecord::new(self.id.as_str(), &self.location, reading, &vitals);
        let mut messages = 0;

        let scalars = [
            (self.topics.temperature(), format!("{:.1}", record.temperature)),
            (self.topics.humidity(), format!("{:.1}", record.humidity)),
        ];
        if self.topics.temperature() != self.topics.sensors() {
            for (topic, value) in scalars {
                messages += usize::from(send(link, &OutboundMessage::new(topic, value)));
            }
        }

        match serde_json::to_string(&record) {
            Ok(body) => {
                info!("telemetry: {body}");
                messages += usize::from(send(link, &OutboundMessage::new(self.topics.sensors(), body)));
            }
            Err(err) => error!("telemetry serialization failed: {err}"),
        }

        let breaches = alerts::evaluate(&reading, &self.thresholds);
        for alert in &breaches {
            let text = alert.message(self.id.as_str(), &self.location);
            warn!("{text}");
            for topic in self.topics.alert_topics() {
                send(link, &OutboundMessage::new(topic, text.clone()));
            }
        }

        CycleOutcome::Published {
            messages,
            alerts: breaches.len(),
        }
    }

    pub fn publish_status<B: Board, L: Link>(&self, status: DeviceStatus, board: &B, link: &mut L) {
        let vitals = board.vitals();
        let record = StatusRecord {
            device_id: self.id.to_string(),
            status,
            location: self.location.clone(),
            ip: vitals.ip,
            rssi: vitals.rssi,
            free_heap: vitals.free_heap,
            uptime_ms: vitals.uptime_ms,
            interval_ms: self.interval_ms,
            transport: self.transport.as_str().to_string(),
        };

        match serde_json::to_string(&record) {
            Ok(body) => {
                send(link, &OutboundMessage::new(self.topics.status(), body));
            }
            Err(err) => error!("status serialization failed: {err}"),
        }
    }

    pub fn handle_control<B: Board, L: Link>(
        &mut self,
        payload: &str,
        now_ms: u64,
        board: &mut B,
        link: &mut L,
    ) -> ControlOutcome {
        let command = match ControlCommand::parse(payload) {
            Ok(command) => command,
            Err(CommandError::Malformed(err)) => {
                warn!("discarding control payload (invalid json: {err})");
                return ControlOutcome::Discarded;
            }
            Err(err) => {
                warn!("discarding control payload: {err}");
                return ControlOutcome::Discarded;
            }
        };

        info!("control command: {command:?}");

        match command {
            ControlCommand::Restart => {
                self.publish_status(DeviceStatus::Restarting, board, link);
                ControlOutcome::Restart(Duration::from_millis(self.restart_delay_ms))
            }
            ControlCommand::Status => {
                self.publish_status(DeviceStatus::Online, board, link);
                self.last_publish_ms = Some(now_ms);
                self.run_cycle(board, link);
                ControlOutcome::StatusReported
            }
            ControlCommand::SetInterval(requested) => match decide_interval(requested) {
                IntervalDecision::AcceptedNotApplied(ms) => {
                    info!(
                        "interval {ms} ms accepted but not yet effective (running at {} ms)",
                        self.interval_ms
                    );
                    ControlOutcome::IntervalAccepted(ms)
                }
                IntervalDecision::Rejected(value) => {
                    warn!("set_interval rejected: {value:?} outside 1000..=300000 ms");
                    ControlOutcome::IntervalRejected(value)
                }
            },
            ControlCommand::Unknown(name) => {
                warn!("unknown control command `{name}`");
                ControlOutcome::Ignored(name)
            }
        }
    }
}

fn send<L: Link>(link: &mut L, message: &OutboundMessage) -> bool {
    match link.publish(message) {
        Ok(()) => true,
        Err(err) => {
            warn!("failed to publish on {}: {err:#}", message.topic);
            false
        }
    }
}
