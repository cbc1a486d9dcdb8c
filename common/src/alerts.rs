use std::fmt;

use crate::{config::AlertThresholds, reading::SensorReading};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alert {
    TemperatureHigh { value: f32, limit: f32 },
    TemperatureLow { value: f32, limit: f32 },
    HumidityHigh { value: f32, limit: f32 },
    HumidityLow { value: f32, limit: f32 },
    SensorFailure,
}

impl Alert {
    pub fn message(&self, device_id: &str, location: &str) -> String {
        format!("ALERT [{device_id} @ {location}]: {self}")
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemperatureHigh { value, limit } => {
                write!(f, "temperature high {value:.1}°C (limit {limit:.1}°C)")
            }
            Self::TemperatureLow { value, limit } => {
                write!(f, "temperature low {value:.1}°C (limit {limit:.1}°C)")
            }
            Self::HumidityHigh { value, limit } => {
                write!(f, "humidity high {value:.1}% (limit {limit:.1}%)")
            }
            Self::HumidityLow { value, limit } => {
                write!(f, "humidity low {value:.1}% (limit {limit:.1}%)")
            }
            Self::SensorFailure => f.write_str("sensor read failed"),
        }
    }
}

/// Compares a valid reading against the four bounds. Every breach is reported,
/// on every call.
pub fn evaluate(reading: &SensorReading, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let temp = reading.temperature_c;
    let humidity = reading.humidity;

    if temp > thresholds.temp_high_c {
        alerts.push(Alert::TemperatureHigh {
            value: temp,
            limit: thresholds.temp_high_c,
        });
    } else if temp < thresholds.temp_low_c {
        alerts.push(Alert::TemperatureLow {
            value: temp,
            limit: thresholds.temp_low_c,
        });
    }

    if humidity > thresholds.humidity_high {
        alerts.push(Alert::HumidityHigh {
            value: humidity,
            limit: thresholds.humidity_high,
        });
    } else if humidity < thresholds.humidity_low {
        alerts.push(Alert::HumidityLow {
            value: humidity,
            limit: thresholds.humidity_low,
        });
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AlertThresholds {
        AlertThresholds::default()
    }

    #[test]
    fn readings_between_bounds_never_alert() {
        let mut temp = 10.0_f32;
        while temp <= 30.0 {
            let mut humidity = 30.0_f32;
            while humidity <= 80.0 {
                let alerts = evaluate(&SensorReading::new(temp, humidity), &thresholds());
                assert!(alerts.is_empty(), "{temp} / {humidity} alerted: {alerts:?}");
                humidity += 2.5;
            }
            temp += 0.5;
        }
    }

    #[test]
    fn raising_temperature_above_bound_alerts_high() {
        for temp in [30.1_f32, 35.0, 60.0] {
            let alerts = evaluate(&SensorReading::new(temp, 50.0), &thresholds());
            assert_eq!(alerts.len(), 1);
            assert!(matches!(alerts[0], Alert::TemperatureHigh { .. }));
            assert!(alerts[0].to_string().contains("high"));
        }
    }

    #[test]
    fn lowering_temperature_below_bound_alerts_low() {
        for temp in [9.9_f32, 0.0, -20.0] {
            let alerts = evaluate(&SensorReading::new(temp, 50.0), &thresholds());
            assert_eq!(alerts.len(), 1);
            assert!(alerts[0].to_string().contains("low"));
        }
    }

    #[test]
    fn temperature_and_humidity_breaches_are_both_reported() {
        let alerts = evaluate(&SensorReading::new(31.0, 85.0), &thresholds());
        assert_eq!(
            alerts,
            vec![
                Alert::TemperatureHigh {
                    value: 31.0,
                    limit: 30.0
                },
                Alert::HumidityHigh {
                    value: 85.0,
                    limit: 80.0
                },
            ]
        );

        let alerts = evaluate(&SensorReading::new(20.0, 12.0), &thresholds());
        assert_eq!(
            alerts,
            vec![Alert::HumidityLow {
                value: 12.0,
                limit: 30.0
            }]
        );
    }

    #[test]
    fn message_names_device_and_location() {
        let alert = Alert::TemperatureHigh {
            value: 31.26,
            limit: 30.0,
        };
        assert_eq!(
            alert.message("esp32-000000000001", "lab"),
            "ALERT [esp32-000000000001 @ lab]: temperature high 31.3°C (limit 30.0°C)"
        );
    }
}
