use crate::config::SensorFailurePolicy;

/// One temperature/humidity sample. NaN marks a failed measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub humidity: f32,
}

/// What the telemetry cycle should do with a raw sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Valid(SensorReading),
    Substituted(SensorReading),
    Failed,
}

impl SensorReading {
    pub const INVALID: Self = Self {
        temperature_c: f32::NAN,
        humidity: f32::NAN,
    };

    pub fn new(temperature_c: f32, humidity: f32) -> Self {
        Self {
            temperature_c,
            humidity,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.temperature_c.is_nan() && !self.humidity.is_nan()
    }

    pub fn rounded(&self) -> Self {
        Self {
            temperature_c: round1(self.temperature_c),
            humidity: round1(self.humidity),
        }
    }

    pub fn heat_index_c(&self) -> f32 {
        heat_index_c(self.temperature_c, self.humidity)
    }

    pub fn classify(self, policy: &SensorFailurePolicy) -> Sample {
        if self.is_valid() {
            return Sample::Valid(self);
        }

        match policy {
            SensorFailurePolicy::Substitute {
                temperature_c,
                humidity,
            } => Sample::Substituted(Self::new(*temperature_c, *humidity)),
            SensorFailurePolicy::Skip | SensorFailurePolicy::Alert => Sample::Failed,
        }
    }
}

pub fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

pub fn celsius_to_fahrenheit(temp_c: f32) -> f32 {
    temp_c * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(temp_f: f32) -> f32 {
    (temp_f - 32.0) * 5.0 / 9.0
}

/// NOAA heat index (Steadman approximation, Rothfusz regression above 79°F).
pub fn heat_index_c(temp_c: f32, humidity: f32) -> f32 {
    let t = celsius_to_fahrenheit(temp_c);
    let rh = humidity;

    let mut hi = 0.5 * (t + 61.0 + ((t - 68.0) * 1.2) + (rh * 0.094));

    if hi > 79.0 {
        hi = -42.379 + 2.049_015_2 * t + 10.143_331 * rh
            - 0.224_755_41 * t * rh
            - 0.006_837_83 * t * t
            - 0.054_817_17 * rh * rh
            + 0.001_228_74 * t * t * rh
            + 0.000_852_82 * t * rh * rh
            - 0.000_001_99 * t * t * rh * rh;

        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) * 0.25) * ((17.0 - (t - 95.0).abs()) * 0.058_82).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) * 0.1) * ((87.0 - t) * 0.2);
        }
    }

    fahrenheit_to_celsius(hi)
}
