//! Telemetry consumer side: decoding, bounded history and the tick-driven pipeline.
//!
//! 1. [`decoder`] - Tolerant payload parsing with per-field validation
//! 2. [`buffer`] - Fixed-capacity per-metric history
//! 3. [`pipeline`] - The single consumer that owns buffers and storage
//!
//! ```text
//! Ingestion queue ──► Pipeline tick ──► Decoder ──► TimeSeries + ReadingStore
//!                                   └──► DashboardView (watch channel)
//! ```

pub mod buffer;
pub mod decoder;
pub mod pipeline;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
    Gas,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Temperature, Metric::Humidity, Metric::Gas];

    /// Key of this metric in the inbound payload.
    pub fn field_name(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Gas => "gas_raw",
        }
    }

    pub fn format_value(self, value: f64) -> String {
        match self {
            Metric::Temperature => format!("{:.1} °C", value),
            Metric::Humidity => format!("{:.1} %", value),
            Metric::Gas => format!("{:.0}", value),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Placeholder shown for a metric without a valid current value.
pub const PLACEHOLDER: &str = "—";

/// Current value per metric as shown to the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readouts {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub gas: Option<f64>,
}

impl Readouts {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::Gas => self.gas,
        }
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        match metric {
            Metric::Temperature => self.temperature = value,
            Metric::Humidity => self.humidity = value,
            Metric::Gas => self.gas = value,
        }
    }

    pub fn display(&self, metric: Metric) -> String {
        match self.get(metric) {
            Some(value) => metric.format_value(value),
            None => PLACEHOLDER.to_string(),
        }
    }
}

impl fmt::Display for Readouts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "temperature {} | humidity {} | gas {}",
            self.display(Metric::Temperature),
            self.display(Metric::Humidity),
            self.display(Metric::Gas)
        )
    }
}
