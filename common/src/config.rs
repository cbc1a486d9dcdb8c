use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const MIN_PUBLISH_INTERVAL_MS: u64 = 1_000;
pub const MAX_PUBLISH_INTERVAL_MS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown transport `{0}` (expected `direct` or `relay`)")]
    UnknownTransport(String),
    #[error("invalid relay url `{0}`")]
    InvalidRelayUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Direct,
    Relay,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relay => "relay",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" | "mqtt" => Ok(Self::Direct),
            "relay" | "ws" | "websocket" => Ok(Self::Relay),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsScheme {
    Ws,
    Wss,
}

impl WsScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicLayout {
    PerDevice,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorModel {
    Dht11,
    Dht22,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SensorFailurePolicy {
    Skip,
    Alert,
    Substitute { temperature_c: f32, humidity: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub transport: TransportKind,
    pub topic_layout: TopicLayout,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub relay_scheme: WsScheme,
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_path: String,
    pub keep_alive_secs: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or_default().to_string(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
            transport: TransportKind::Relay,
            topic_layout: TopicLayout::PerDevice,
            mqtt_host: option_env!("MQTT_HOST")
                .unwrap_or("broker.emqx.io")
                .to_string(),
            mqtt_port: 1883,
            mqtt_user: option_env!("MQTT_USER").unwrap_or_default().to_string(),
            mqtt_pass: option_env!("MQTT_PASS").unwrap_or_default().to_string(),
            relay_scheme: WsScheme::Wss,
            relay_host: option_env!("RELAY_HOST")
                .unwrap_or("backend.diego-sarq.workers.dev")
                .to_string(),
            relay_port: 443,
            relay_path: "/mqtt".to_string(),
            keep_alive_secs: 60,
        }
    }
}

impl NetworkConfig {
    pub fn relay_url(&self) -> String {
        let path = if self.relay_path.starts_with('/') {
            self.relay_path.clone()
        } else {
            format!("/{}", self.relay_path)
        };
        format!(
            "{}://{}:{}{}",
            self.relay_scheme.as_str(),
            self.relay_host,
            self.relay_port,
            path
        )
    }

    /// Splits `ws[s]://host[:port][/path]` into the relay fields.
    pub fn set_relay_url(&mut self, url: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidRelayUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme {
            "ws" => WsScheme::Ws,
            "wss" => WsScheme::Wss,
            _ => return Err(invalid()),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(invalid());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (
                authority,
                match scheme {
                    WsScheme::Ws => 80,
                    WsScheme::Wss => 443,
                },
            ),
        };

        self.relay_scheme = scheme;
        self.relay_host = host.to_string();
        self.relay_port = port;
        self.relay_path = path.to_string();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub location: String,
    pub sensor_pin: i32,
    pub sensor_model: SensorModel,
    pub publish_interval_ms: u64,
    pub serial_baud: u32,
    pub restart_delay_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            location: option_env!("DEVICE_LOCATION")
                .unwrap_or("living-room")
                .to_string(),
            sensor_pin: 4,
            sensor_model: SensorModel::Dht22,
            publish_interval_ms: 5_000,
            serial_baud: 115_200,
            restart_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub temp_high_c: f32,
    pub temp_low_c: f32,
    pub humidity_high: f32,
    pub humidity_low: f32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            temp_high_c: 30.0,
            temp_low_c: 10.0,
            humidity_high: 80.0,
            humidity_low: 30.0,
        }
    }
}

impl AlertThresholds {
    pub fn sanitize(&mut self) {
        if self.temp_low_c > self.temp_high_c {
            std::mem::swap(&mut self.temp_low_c, &mut self.temp_high_c);
        }
        if self.humidity_low > self.humidity_high {
            std::mem::swap(&mut self.humidity_low, &mut self.humidity_high);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub alerts: AlertThresholds,
    pub sensor_failure: SensorFailurePolicy,
    pub wifi_retry: RetryPolicy,
    pub session_retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            device: DeviceConfig::default(),
            alerts: AlertThresholds::default(),
            sensor_failure: SensorFailurePolicy::Skip,
            wifi_retry: RetryPolicy::bounded(20, 500),
            session_retry: RetryPolicy::unbounded(5_000),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.device.publish_interval_ms = self
            .device
            .publish_interval_ms
            .clamp(MIN_PUBLISH_INTERVAL_MS, MAX_PUBLISH_INTERVAL_MS);
        self.alerts.sanitize();
        if self.network.keep_alive_secs == 0 {
            self.network.keep_alive_secs = 60;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_relay_url_matches_fields() {
        let network = NetworkConfig::default();
        assert_eq!(
            network.relay_url(),
            format!("wss://{}:443/mqtt", network.relay_host)
        );
    }

    #[test]
    fn parses_relay_url_with_and_without_port() {
        let mut network = NetworkConfig::default();

        network.set_relay_url("ws://127.0.0.1:8787/mqtt").unwrap();
        assert_eq!(network.relay_scheme, WsScheme::Ws);
        assert_eq!(network.relay_host, "127.0.0.1");
        assert_eq!(network.relay_port, 8787);
        assert_eq!(network.relay_path, "/mqtt");

        network.set_relay_url("wss://relay.example.com").unwrap();
        assert_eq!(network.relay_port, 443);
        assert_eq!(network.relay_path, "/");

        assert!(network.set_relay_url("http://relay.example.com").is_err());
        assert!(network.set_relay_url("ws://host:notaport/x").is_err());
    }

    #[test]
    fn sanitize_clamps_interval_and_repairs_bounds() {
        let mut config = RuntimeConfig::default();
        config.device.publish_interval_ms = 10;
        config.alerts.temp_high_c = 5.0;
        config.alerts.temp_low_c = 25.0;
        config.sanitize();

        assert_eq!(config.device.publish_interval_ms, MIN_PUBLISH_INTERVAL_MS);
        assert_eq!(config.alerts.temp_low_c, 5.0);
        assert_eq!(config.alerts.temp_high_c, 25.0);
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = RuntimeConfig::default();
        config.sensor_failure = SensorFailurePolicy::Substitute {
            temperature_c: 25.0,
            humidity: 50.0,
        };
        let raw = serde_json::to_string(&config).unwrap();
        let parsed = RuntimeConfig::from_json(&raw).unwrap();

        assert_eq!(parsed.sensor_failure, config.sensor_failure);
        assert_eq!(parsed.network.transport, TransportKind::Relay);
        assert_eq!(parsed.wifi_retry, config.wifi_retry);
    }

    #[test]
    fn transport_parse_accepts_aliases() {
        assert_eq!(TransportKind::parse("MQTT").unwrap(), TransportKind::Direct);
        assert_eq!(TransportKind::parse(" ws ").unwrap(), TransportKind::Relay);
        assert!(TransportKind::parse("carrier-pigeon").is_err());
    }
}
