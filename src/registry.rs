use std::collections::HashMap;

use crate::model::{HistorySnapshot, SensorId};

/// Ordered sensor identities and their fixed chart slots
///
/// Built once from the history snapshot. Slot `i` is the trace index of
/// `sensors()[i]` on every chart; nothing reassigns slots afterwards, since a
/// shifted index would silently write into another sensor's series.
#[derive(Clone, Debug, Default)]
pub struct SensorRegistry {
    sensors: Vec<SensorId>,
    slots: HashMap<SensorId, usize>,
    reserved: Vec<SensorId>,
}

impl SensorRegistry {
    /// Snapshot key order defines slots. Reserved ids (single-instance tiles)
    /// are kept out of the chart path.
    pub fn build(snapshot: &HistorySnapshot, reserved: &[SensorId]) -> Self {
        let mut registry = SensorRegistry {
            reserved: reserved.to_vec(),
            ..Default::default()
        };

        for id in snapshot.keys() {
            if registry.is_reserved(id) || registry.slots.contains_key(id) {
                continue;
            }
            registry.slots.insert(id.to_string(), registry.sensors.len());
            registry.sensors.push(id.to_string());
        }

        if registry.sensors.is_empty() {
            log::warn!("[SYNC] No chartable sensors in history snapshot");
        } else {
            log::info!(
                "[SYNC] Registered {} sensor(s): {}",
                registry.sensors.len(),
                registry.sensors.join(", ")
            );
        }
        registry
    }

    pub fn slot(&self, id: &str) -> Option<usize> {
        self.slots.get(id).copied()
    }

    pub fn sensors(&self) -> &[SensorId] {
        &self.sensors
    }

    pub fn sensor(&self, slot: usize) -> Option<&str> {
        self.sensors.get(slot).map(|s| s.as_str())
    }

    pub fn is_reserved(&self, id: &str) -> bool {
        self.reserved.iter().any(|r| r == id)
    }

    pub fn reserved(&self) -> &[SensorId] {
        &self.reserved
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reserved() -> Vec<SensorId> {
        vec!["Shelly".to_string(), "Pi".to_string()]
    }

    #[test]
    fn test_slots_follow_snapshot_order() {
        let snap = HistorySnapshot::from_value(json!({
            "CH1-0x77": {"temp": [], "hum": []},
            "Shelly": {"temp": 30.0, "apower": 5.0},
            "CH0-0x76": {"temp": [], "hum": []},
            "Pi": {"temp": 50.0, "cpu": 3.0}
        }));
        let reg = SensorRegistry::build(&snap, &reserved());

        assert_eq!(reg.sensors(), &["CH1-0x77".to_string(), "CH0-0x76".to_string()]);
        assert_eq!(reg.slot("CH1-0x77"), Some(0));
        assert_eq!(reg.slot("CH0-0x76"), Some(1));
        assert_eq!(reg.slot("Shelly"), None);
        assert!(reg.is_reserved("Pi"));
        assert_eq!(reg.sensor(1), Some("CH0-0x76"));
    }

    #[test]
    fn test_malformed_snapshot_gives_empty_registry() {
        let snap = HistorySnapshot::from_value(json!(null));
        let reg = SensorRegistry::build(&snap, &reserved());
        assert!(reg.is_empty());
        assert_eq!(reg.slot("anything"), None);
    }
}
