//! Home Assistant discovery bookkeeping
//!
//! Tracks which (charge point, entity) pairs have already been announced so
//! the pipeline can publish a device discovery document before the first
//! state value for each entity. Entries live for the process lifetime and
//! are only touched by the single pipeline consumer, so no locking is
//! involved.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value};

use crate::matcher::BridgeEvent;
use crate::publisher::{state_topic, status_topic};

/// One announced (or to-be-announced) entity under a charge point.
#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub connector: Option<i64>,
    pub measurand: String,
    pub unit: Option<String>,
    pub announced: bool,
}

/// Per-charge-point entity sets, keyed by entity slug for deterministic
/// component ordering in the discovery document.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    devices: HashMap<String, BTreeMap<String, DiscoveryEntry>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event's entity. Returns true when the device's discovery
    /// document must be (re)published before the state value.
    pub fn observe(&mut self, event: &BridgeEvent) -> bool {
        let (connector, measurand, unit) = match event {
            BridgeEvent::Sample(sample) => {
                (sample.connector, sample.measurand.clone(), sample.unit.clone())
            }
            BridgeEvent::Status(status) => (status.connector, "status".to_string(), None),
        };
        let entries = self.devices.entry(event.cp_id().to_string()).or_default();
        entries
            .entry(entity_slug(connector, &measurand))
            .or_insert(DiscoveryEntry {
                connector,
                measurand,
                unit,
                announced: false,
            });
        entries.values().any(|entry| !entry.announced)
    }

    /// Mark every entity of a charge point as announced, after the discovery
    /// publish for it succeeded.
    pub fn mark_announced(&mut self, cp_id: &str) {
        if let Some(entries) = self.devices.get_mut(cp_id) {
            for entry in entries.values_mut() {
                entry.announced = true;
            }
        }
    }

    /// Forget all announcements so every device is re-announced, used after
    /// a broker reconnect when the policy asks for it.
    pub fn reset_announcements(&mut self) {
        for entries in self.devices.values_mut() {
            for entry in entries.values_mut() {
                entry.announced = false;
            }
        }
    }

    /// The device-scoped discovery document for a charge point, covering
    /// every entity seen so far.
    pub fn device_config(&self, cp_id: &str, topic_prefix: &str) -> Value {
        let mut components = serde_json::Map::new();
        if let Some(entries) = self.devices.get(cp_id) {
            for (slug, entry) in entries {
                components.insert(
                    format!("{cp_id}_{slug}"),
                    component_config(cp_id, slug, entry, topic_prefix),
                );
            }
        }
        json!({
            "device": {
                "identifiers": [format!("ocpp_{cp_id}")],
                "name": cp_id,
            },
            "origin": {
                "name": "shunt-bridge",
                "sw_version": env!("CARGO_PKG_VERSION"),
            },
            "components": Value::Object(components),
        })
    }
}

fn component_config(cp_id: &str, slug: &str, entry: &DiscoveryEntry, topic_prefix: &str) -> Value {
    let state_topic = if entry.measurand == "status" {
        status_topic(topic_prefix, cp_id, entry.connector)
    } else {
        state_topic(topic_prefix, cp_id, entry.connector, &entry.measurand)
    };
    let mut component = serde_json::Map::new();
    component.insert("platform".into(), json!("sensor"));
    component.insert("name".into(), json!(entry.measurand));
    component.insert("unique_id".into(), json!(format!("{cp_id}_{slug}")));
    component.insert("state_topic".into(), json!(state_topic));
    if let Some(unit) = &entry.unit {
        component.insert("unit_of_measurement".into(), json!(unit));
    }
    if let Some((device_class, state_class)) = classify(&entry.measurand) {
        component.insert("device_class".into(), json!(device_class));
        component.insert("state_class".into(), json!(state_class));
    }
    Value::Object(component)
}

/// Map an OCPP measurand onto a Home Assistant device/state class.
fn classify(measurand: &str) -> Option<(&'static str, &'static str)> {
    if measurand.starts_with("Energy.") {
        Some(("energy", "total_increasing"))
    } else if measurand.starts_with("Power.") {
        Some(("power", "measurement"))
    } else if measurand == "SoC" {
        Some(("battery", "measurement"))
    } else if measurand.starts_with("Current.") {
        Some(("current", "measurement"))
    } else if measurand.starts_with("Voltage") {
        Some(("voltage", "measurement"))
    } else if measurand.starts_with("Temperature") {
        Some(("temperature", "measurement"))
    } else {
        None
    }
}

/// Stable lowercase key for an entity, e.g. connector 1 + Power.Active.Import
/// becomes `1_power_active_import`.
pub fn entity_slug(connector: Option<i64>, measurand: &str) -> String {
    let slug: String = measurand
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}", connector.unwrap_or(0), slug)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::matcher::{MeteringSample, StatusUpdate};

    use super::*;

    fn sample(connector: Option<i64>, measurand: &str, unit: Option<&str>) -> BridgeEvent {
        BridgeEvent::Sample(MeteringSample {
            cp_id: "CP001".to_string(),
            connector,
            measurand: measurand.to_string(),
            value: 42.0,
            unit: unit.map(str::to_string),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_first_sample_needs_announce_then_state_only() {
        let mut cache = DiscoveryCache::new();
        let event = sample(Some(1), "Power.Active.Import", Some("kW"));

        assert!(cache.observe(&event));
        cache.mark_announced("CP001");
        assert!(!cache.observe(&event));

        // A new entity on the same device forces a re-announce.
        assert!(cache.observe(&sample(Some(2), "Power.Active.Import", Some("kW"))));
    }

    #[test]
    fn test_reset_forces_reannounce() {
        let mut cache = DiscoveryCache::new();
        let event = sample(Some(1), "SoC", Some("Percent"));
        cache.observe(&event);
        cache.mark_announced("CP001");
        assert!(!cache.observe(&event));

        cache.reset_announcements();
        assert!(cache.observe(&event));
    }

    #[test]
    fn test_device_config_shape() {
        let mut cache = DiscoveryCache::new();
        cache.observe(&sample(Some(1), "Energy.Active.Import.Register", Some("Wh")));
        cache.observe(&BridgeEvent::Status(StatusUpdate {
            cp_id: "CP001".to_string(),
            connector: Some(1),
            status: "Charging".to_string(),
            timestamp: Utc::now(),
        }));

        let config = cache.device_config("CP001", "ocpp");
        assert_eq!(config["device"]["identifiers"][0], "ocpp_CP001");
        assert_eq!(config["origin"]["name"], "shunt-bridge");

        let energy = &config["components"]["CP001_1_energy_active_import_register"];
        assert_eq!(energy["platform"], "sensor");
        assert_eq!(energy["state_topic"], "ocpp/CP001/1/Energy.Active.Import.Register");
        assert_eq!(energy["unit_of_measurement"], "Wh");
        assert_eq!(energy["device_class"], "energy");
        assert_eq!(energy["state_class"], "total_increasing");

        let status = &config["components"]["CP001_1_status"];
        assert_eq!(status["state_topic"], "ocpp/CP001/1/status");
        assert!(status.get("device_class").is_none());
    }

    #[test]
    fn test_entity_slug() {
        assert_eq!(entity_slug(Some(2), "Current.Import"), "2_current_import");
        assert_eq!(entity_slug(None, "status"), "0_status");
    }
}
