use std::collections::VecDeque;

use chrono::{DateTime, Local};

use super::decoder::Reading;
use super::Metric;

/// Fixed-capacity history of one metric, oldest first.
#[derive(Debug, Clone)]
pub struct MetricBuffer {
    capacity: usize,
    entries: VecDeque<(DateTime<Local>, f64)>,
}

impl MetricBuffer {
    /// Capacities below one are raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, timestamp: DateTime<Local>, value: f64) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp, value));
    }

    /// `(age in seconds, value)` per entry, oldest first.
    pub fn snapshot(&self, now: DateTime<Local>) -> Vec<(f64, f64)> {
        self.entries
            .iter()
            .map(|(timestamp, value)| {
                let age = (now - *timestamp).num_milliseconds() as f64 / 1000.0;
                (age, *value)
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DateTime<Local>, f64)> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<(DateTime<Local>, f64)> {
        self.entries.back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One [`MetricBuffer`] per metric.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    temperature: MetricBuffer,
    humidity: MetricBuffer,
    gas: MetricBuffer,
}

/// Copied series for use outside the consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesSnapshot {
    pub temperature: Vec<(f64, f64)>,
    pub humidity: Vec<(f64, f64)>,
    pub gas: Vec<(f64, f64)>,
}

impl SeriesSnapshot {
    pub fn get(&self, metric: Metric) -> &[(f64, f64)] {
        match metric {
            Metric::Temperature => &self.temperature,
            Metric::Humidity => &self.humidity,
            Metric::Gas => &self.gas,
        }
    }
}

impl TimeSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            temperature: MetricBuffer::new(capacity),
            humidity: MetricBuffer::new(capacity),
            gas: MetricBuffer::new(capacity),
        }
    }

    pub fn get(&self, metric: Metric) -> &MetricBuffer {
        match metric {
            Metric::Temperature => &self.temperature,
            Metric::Humidity => &self.humidity,
            Metric::Gas => &self.gas,
        }
    }

    fn get_mut(&mut self, metric: Metric) -> &mut MetricBuffer {
        match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::Humidity => &mut self.humidity,
            Metric::Gas => &mut self.gas,
        }
    }

    pub fn append(&mut self, reading: &Reading) {
        self.get_mut(reading.metric)
            .append(reading.timestamp, reading.value);
    }

    pub fn snapshot(&self, now: DateTime<Local>) -> SeriesSnapshot {
        SeriesSnapshot {
            temperature: self.temperature.snapshot(now),
            humidity: self.humidity.snapshot(now),
            gas: self.gas.snapshot(now),
        }
    }

    pub fn clear(&mut self) {
        self.temperature.clear();
        self.humidity.clear();
        self.gas.clear();
    }
}
