use crate::{config::TopicLayout, identity::DeviceId};

pub const TOPIC_ALERTS_SHARED: &str = "alerts/temperature";
pub const TOPIC_CONTROL_ALL: &str = "control/all";

pub const TOPIC_SENSOR_DATA: &str = "sensor_data";
pub const TOPIC_COMMANDS: &str = "commands";

/// Topic names for one device under a given layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    layout: TopicLayout,
    temperature: String,
    humidity: String,
    sensors: String,
    status: String,
    alerts: String,
    control: String,
}

impl Topics {
    pub fn new(layout: TopicLayout, id: &DeviceId) -> Self {
        match layout {
            TopicLayout::PerDevice => Self {
                layout,
                temperature: format!("temperature/{id}"),
                humidity: format!("humidity/{id}"),
                sensors: format!("sensors/{id}"),
                status: format!("status/{id}"),
                alerts: format!("alerts/{id}"),
                control: format!("control/{id}"),
            },
            TopicLayout::Shared => Self {
                layout,
                temperature: TOPIC_SENSOR_DATA.to_string(),
                humidity: TOPIC_SENSOR_DATA.to_string(),
                sensors: TOPIC_SENSOR_DATA.to_string(),
                status: TOPIC_SENSOR_DATA.to_string(),
                alerts: TOPIC_SENSOR_DATA.to_string(),
                control: TOPIC_COMMANDS.to_string(),
            },
        }
    }

    pub fn temperature(&self) -> &str {
        &self.temperature
    }

    pub fn humidity(&self) -> &str {
        &self.humidity
    }

    pub fn sensors(&self) -> &str {
        &self.sensors
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn alerts(&self) -> &str {
        &self.alerts
    }

    /// Topics the device subscribes to once the session is up.
    pub fn control_topics(&self) -> Vec<&str> {
        match self.layout {
            TopicLayout::PerDevice => vec![self.control.as_str(), TOPIC_CONTROL_ALL],
            TopicLayout::Shared => vec![self.control.as_str()],
        }
    }

    pub fn is_control_topic(&self, topic: &str) -> bool {
        self.control_topics().contains(&topic)
    }

    /// Alerts go to the device topic and, per-device, to the shared feed too.
    pub fn alert_topics(&self) -> Vec<&str> {
        match self.layout {
            TopicLayout::PerDevice => vec![self.alerts.as_str(), TOPIC_ALERTS_SHARED],
            TopicLayout::Shared => vec![self.alerts.as_str()],
        }
    }
}
