use serde::{Deserialize, Serialize};

use crate::reading::{round1, SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Restarting,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Restarting => "restarting",
        }
    }
}

/// Board-level figures attached to telemetry and status records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vitals {
    pub ip: Option<String>,
    pub rssi: Option<i32>,
    pub free_heap: Option<u32>,
    pub uptime_ms: u64,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub location: String,
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "heatIndex")]
    pub heat_index: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i32>,
    #[serde(rename = "freeHeap", skip_serializing_if = "Option::is_none", default)]
    pub free_heap: Option<u32>,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<i64>,
}

impl TelemetryRecord {
    pub fn new(device_id: &str, location: &str, reading: SensorReading, vitals: &Vitals) -> Self {
        let rounded = reading.rounded();
        Self {
            device_id: device_id.to_string(),
            location: location.to_string(),
            temperature: rounded.temperature_c,
            humidity: rounded.humidity,
            heat_index: round1(reading.heat_index_c()),
            rssi: vitals.rssi,
            free_heap: vitals.free_heap,
            uptime_ms: vitals.uptime_ms,
            timestamp: vitals.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub status: DeviceStatus,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i32>,
    #[serde(rename = "freeHeap", skip_serializing_if = "Option::is_none", default)]
    pub free_heap: Option<u32>,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "intervalMs")]
    pub interval_ms: u64,
    pub transport: String,
}
