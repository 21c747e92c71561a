use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::SourceError;
use crate::timestamp::RawTimestamp;

pub type SensorId = String;

/// Metrics drawn as chart traces. Everything else only reaches tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "temp")]
    Temperature,
    #[serde(rename = "hum")]
    Humidity,
}

impl Metric {
    pub const CHARTED: [Metric; 2] = [Metric::Temperature, Metric::Humidity];

    pub fn key(&self) -> &'static str {
        match self {
            Metric::Temperature => "temp",
            Metric::Humidity => "hum",
        }
    }
}

/// One sensor's entry in a `/data` response
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SensorReading {
    pub timestamp: RawTimestamp,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl SensorReading {
    /// Returns None when the entry is not a JSON object.
    ///
    /// Non-numeric metric values are kept as absent rather than rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut reading = SensorReading::default();
        for (key, v) in obj {
            if key == "timestamp" {
                reading.timestamp = RawTimestamp::from_value(v);
            } else {
                reading.metrics.insert(key.clone(), v.as_f64());
            }
        }
        Some(reading)
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied().flatten()
    }

    pub fn charted(&self, metric: Metric) -> Option<f64> {
        self.metric(metric.key())
    }
}

/// Parsed `/data` response: sensors in the order the source listed them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PollSnapshot {
    pub readings: Vec<(SensorId, SensorReading)>,
}

impl PollSnapshot {
    pub fn parse(value: &Value) -> Result<Self, SourceError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SourceError::Parse(format!("expected object, got {}", kind(value))))?;

        let mut readings = Vec::with_capacity(obj.len());
        for (id, entry) in obj {
            match SensorReading::from_value(entry) {
                Some(reading) => readings.push((id.clone(), reading)),
                None => log::warn!("[SYNC] Dropping malformed entry for {}: {}", id, entry),
            }
        }
        Ok(PollSnapshot { readings })
    }

    pub fn get(&self, id: &str) -> Option<&SensorReading> {
        self.readings.iter().find(|(k, _)| k == id).map(|(_, r)| r)
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// History arrays for a single charted sensor
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistorySeries {
    pub temp: Vec<Option<f64>>,
    pub hum: Vec<Option<f64>>,
    pub timestamps: Vec<RawTimestamp>,
}

impl HistorySeries {
    pub fn values(&self, metric: Metric) -> &[Option<f64>] {
        match metric {
            Metric::Temperature => &self.temp,
            Metric::Humidity => &self.hum,
        }
    }

    pub fn len(&self) -> usize {
        self.temp.len().max(self.hum.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Full `/history` snapshot, key order preserved
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistorySnapshot {
    entries: Map<String, Value>,
}

impl HistorySnapshot {
    /// Anything other than a JSON object yields an empty snapshot.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(entries) => HistorySnapshot { entries },
            other => {
                log::warn!("[SYNC] History snapshot is {}, treating as empty", kind(&other));
                HistorySnapshot::default()
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arrays for `id`. Missing or non-array fields come back empty.
    pub fn series(&self, id: &str) -> Option<HistorySeries> {
        let obj = self.entries.get(id)?.as_object()?;
        let numbers = |key: &str| -> Vec<Option<f64>> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|arr| arr.iter().map(Value::as_f64).collect())
                .unwrap_or_default()
        };
        let timestamps = obj
            .get("timestamps")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(RawTimestamp::from_value).collect())
            .unwrap_or_default();

        Some(HistorySeries {
            temp: numbers("temp"),
            hum: numbers("hum"),
            timestamps,
        })
    }

    /// Scalar fields of a reserved tile entry (power meter, host health)
    pub fn scalars(&self, id: &str) -> Option<SensorReading> {
        let entry = self.entries.get(id)?;
        SensorReading::from_value(entry)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
