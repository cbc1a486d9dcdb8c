pub mod alerts;
pub mod command;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod identity;
pub mod reading;
pub mod relay;
pub mod retry;
pub mod topics;
pub mod types;

pub use alerts::Alert;
pub use command::{decide_interval, ControlCommand, IntervalDecision};
pub use config::{
    AlertThresholds, RuntimeConfig, SensorFailurePolicy, SensorModel, TopicLayout, TransportKind,
};
pub use connection::{ConnectionState, Connectivity, SocketEpoch};
pub use envelope::{InboundEnvelope, OutboundEnvelope};
pub use identity::DeviceId;
pub use reading::{Sample, SensorReading};
pub use relay::{RelayEvent, RelaySession};
pub use retry::RetryPolicy;
pub use topics::*;
pub use types::{DeviceStatus, StatusRecord, TelemetryRecord, Vitals};
