//! Declarative extraction of metering data from snooped OCPP traffic
//!
//! A static rule table maps (action, direction) to an extraction kind, and
//! field access runs through ordered candidate path lists so that OCPP 1.6,
//! 2.0.1 and the common vendor dialects are handled by adding a path rather
//! than branching per protocol. A small pending map correlates CallResults
//! with the Call that asked the question, since results do not repeat the
//! action name on the wire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use shunt_relay::frame::OcppFrame;
use shunt_relay::snoop::{Direction, SnoopEvent, SnoopMessage};
use tracing::{debug, trace};

/// Default measurand for sampled values that omit one (OCPP 1.6 §7.37).
const DEFAULT_MEASURAND: &str = "Energy.Active.Import.Register";

/// Candidate paths tried in order; first hit wins.
type FieldPath = &'static [&'static str];

const CONNECTOR_PATHS: &[FieldPath] = &[&["connectorId"], &["evseId"]];
const UNIT_PATHS: &[FieldPath] = &[&["unit"], &["unitOfMeasure", "unit"]];
const STATUS_PATHS: &[FieldPath] = &[&["status"], &["connectorStatus"]];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    MeterValues,
    TransactionStart,
    TransactionStop,
    Status,
}

struct ExtractRule {
    action: &'static str,
    direction: Direction,
    kind: RuleKind,
}

static RULES: &[ExtractRule] = &[
    ExtractRule {
        action: "MeterValues",
        direction: Direction::Cp,
        kind: RuleKind::MeterValues,
    },
    ExtractRule {
        action: "StartTransaction",
        direction: Direction::Cp,
        kind: RuleKind::TransactionStart,
    },
    ExtractRule {
        action: "StopTransaction",
        direction: Direction::Cp,
        kind: RuleKind::TransactionStop,
    },
    ExtractRule {
        action: "StatusNotification",
        direction: Direction::Cp,
        kind: RuleKind::Status,
    },
];

/// One extracted measurement, ready for topic building.
#[derive(Debug, Clone, PartialEq)]
pub struct MeteringSample {
    pub cp_id: String,
    pub connector: Option<i64>,
    pub measurand: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A connector status change reported by the charge point.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub cp_id: String,
    pub connector: Option<i64>,
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Sample(MeteringSample),
    Status(StatusUpdate),
}

impl BridgeEvent {
    pub fn cp_id(&self) -> &str {
        match self {
            BridgeEvent::Sample(sample) => &sample.cp_id,
            BridgeEvent::Status(status) => &status.cp_id,
        }
    }
}

/// An outstanding Call whose result may still carry data we want.
struct PendingCall {
    cp_id: String,
    connector: Option<i64>,
    kind: RuleKind,
    created_at: Instant,
}

/// Stateful matcher; owned by the single pipeline consumer.
pub struct Matcher {
    pending: HashMap<String, PendingCall>,
    correlation_ttl: Duration,
}

impl Matcher {
    pub fn new(correlation_ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            correlation_ttl,
        }
    }

    /// Run one snoop envelope through the rule table.
    ///
    /// Non-Message events, undecodable payloads, unknown actions and frames
    /// missing the fields a rule needs all yield an empty vec.
    pub fn process(&mut self, msg: &SnoopMessage) -> Vec<BridgeEvent> {
        self.sweep();

        if msg.event != SnoopEvent::Message {
            return Vec::new();
        }
        let frame = match OcppFrame::from_value(&msg.payload) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(cp_id = %msg.cp_id, %err, "skipping undecodable snoop payload");
                return Vec::new();
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => self.process_call(msg, &unique_id, &action, &payload),
            OcppFrame::CallResult { unique_id, payload } => {
                self.correlate_result(msg, &unique_id, &payload)
            }
            OcppFrame::CallError { unique_id, .. } => {
                // An errored Call will never produce a usable result.
                self.pending.remove(&unique_id);
                Vec::new()
            }
        }
    }

    fn process_call(
        &mut self,
        msg: &SnoopMessage,
        unique_id: &str,
        action: &str,
        payload: &Value,
    ) -> Vec<BridgeEvent> {
        let rule = match RULES
            .iter()
            .find(|r| r.action == action && r.direction == msg.sender)
        {
            Some(rule) => rule,
            None => return Vec::new(),
        };

        let connector = lookup(payload, CONNECTOR_PATHS).and_then(Value::as_i64);
        match rule.kind {
            RuleKind::MeterValues => extract_meter_values(msg, connector, payload),
            RuleKind::TransactionStart => {
                self.pending.insert(
                    unique_id.to_string(),
                    PendingCall {
                        cp_id: msg.cp_id.clone(),
                        connector,
                        kind: rule.kind,
                        created_at: Instant::now(),
                    },
                );
                meter_boundary_sample(msg, connector, payload, "meterStart")
            }
            RuleKind::TransactionStop => meter_boundary_sample(msg, connector, payload, "meterStop"),
            RuleKind::Status => extract_status(msg, connector, payload),
        }
    }

    /// CallResults carry no action, so only results travelling back from the
    /// CPMS and matching a pending Call are considered.
    fn correlate_result(
        &mut self,
        msg: &SnoopMessage,
        unique_id: &str,
        payload: &Value,
    ) -> Vec<BridgeEvent> {
        if msg.sender != Direction::Cpms {
            return Vec::new();
        }
        let pending = match self.pending.remove(unique_id) {
            Some(pending) => pending,
            None => {
                debug!(unique_id, "uncorrelated CallResult dropped");
                return Vec::new();
            }
        };
        match pending.kind {
            RuleKind::TransactionStart => {
                let transaction_id = match lookup(payload, &[&["transactionId"]])
                    .and_then(numeric_value)
                {
                    Some(id) => id,
                    None => return Vec::new(),
                };
                vec![BridgeEvent::Sample(MeteringSample {
                    cp_id: pending.cp_id,
                    connector: pending.connector,
                    measurand: "TransactionId".to_string(),
                    value: transaction_id,
                    unit: None,
                    timestamp: msg.timestamp,
                })]
            }
            _ => Vec::new(),
        }
    }

    fn sweep(&mut self) {
        let ttl = self.correlation_ttl;
        self.pending
            .retain(|_, pending| pending.created_at.elapsed() < ttl);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Walk the first candidate path that resolves to a value.
fn lookup<'a>(payload: &'a Value, paths: &[FieldPath]) -> Option<&'a Value> {
    paths.iter().find_map(|path| {
        path.iter()
            .try_fold(payload, |node, key| node.get(key))
    })
}

/// Sampled values arrive as JSON numbers or as decimal strings.
fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn extract_meter_values(
    msg: &SnoopMessage,
    payload_connector: Option<i64>,
    payload: &Value,
) -> Vec<BridgeEvent> {
    let entries = match payload.get("meterValue").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    let mut events = Vec::new();
    for entry in entries {
        // Some vendors scope the connector per meter value entry rather than
        // once per payload.
        let connector = lookup(entry, CONNECTOR_PATHS)
            .and_then(Value::as_i64)
            .or(payload_connector);
        let sampled = match entry.get("sampledValue").and_then(Value::as_array) {
            Some(sampled) => sampled,
            None => continue,
        };
        for sample in sampled {
            let value = match sample.get("value").and_then(numeric_value) {
                Some(value) => value,
                None => continue,
            };
            let mut measurand = sample
                .get("measurand")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_MEASURAND)
                .to_string();
            if let Some(phase) = sample.get("phase").and_then(Value::as_str) {
                measurand.push('.');
                measurand.push_str(phase);
            }
            let unit = lookup(sample, UNIT_PATHS)
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| measurand.starts_with("Energy.").then(|| "Wh".to_string()));
            events.push(BridgeEvent::Sample(MeteringSample {
                cp_id: msg.cp_id.clone(),
                connector,
                measurand,
                value,
                unit,
                timestamp: msg.timestamp,
            }));
        }
    }
    events
}

/// `meterStart` / `meterStop` register readings bracket a transaction.
fn meter_boundary_sample(
    msg: &SnoopMessage,
    connector: Option<i64>,
    payload: &Value,
    field: &str,
) -> Vec<BridgeEvent> {
    let value = match payload.get(field).and_then(numeric_value) {
        Some(value) => value,
        None => return Vec::new(),
    };
    vec![BridgeEvent::Sample(MeteringSample {
        cp_id: msg.cp_id.clone(),
        connector,
        measurand: DEFAULT_MEASURAND.to_string(),
        value,
        unit: Some("Wh".to_string()),
        timestamp: msg.timestamp,
    })]
}

fn extract_status(
    msg: &SnoopMessage,
    connector: Option<i64>,
    payload: &Value,
) -> Vec<BridgeEvent> {
    let status = match lookup(payload, STATUS_PATHS).and_then(Value::as_str) {
        Some(status) => status,
        None => return Vec::new(),
    };
    vec![BridgeEvent::Status(StatusUpdate {
        cp_id: msg.cp_id.clone(),
        connector,
        status: status.to_string(),
        timestamp: msg.timestamp,
    })]
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(sender: Direction, raw: Value) -> SnoopMessage {
        SnoopMessage::frame(sender, "CP001", "ocpp1.6", raw)
    }

    fn call(action: &str, payload: Value) -> Value {
        json!([2, "msg-1", action, payload])
    }

    #[test]
    fn test_meter_values_three_measurands_two_connectors() {
        let payload = json!({
            "meterValue": [
                {
                    "connectorId": 1,
                    "sampledValue": [
                        {"value": "1200", "measurand": "Energy.Active.Import.Register"},
                        {"value": 7.4, "measurand": "Power.Active.Import", "unit": "kW"},
                        {"value": "16", "measurand": "Current.Import", "unitOfMeasure": {"unit": "A"}}
                    ]
                },
                {
                    "connectorId": 2,
                    "sampledValue": [
                        {"value": "800"},
                        {"value": 3.2, "measurand": "Power.Active.Import", "unit": "kW"},
                        {"value": "90", "measurand": "SoC", "unit": "Percent"}
                    ]
                }
            ]
        });
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let events = matcher.process(&envelope(Direction::Cp, call("MeterValues", payload)));
        assert_eq!(events.len(), 6);

        let samples: Vec<_> = events
            .iter()
            .map(|e| match e {
                BridgeEvent::Sample(s) => s,
                other => panic!("expected sample, got {other:?}"),
            })
            .collect();
        assert_eq!(samples[0].connector, Some(1));
        assert_eq!(samples[0].measurand, "Energy.Active.Import.Register");
        assert_eq!(samples[0].value, 1200.0);
        assert_eq!(samples[0].unit.as_deref(), Some("Wh"));
        assert_eq!(samples[1].unit.as_deref(), Some("kW"));
        assert_eq!(samples[2].unit.as_deref(), Some("A"));
        assert_eq!(samples[3].connector, Some(2));
        assert_eq!(samples[3].measurand, "Energy.Active.Import.Register");
        assert_eq!(samples[5].measurand, "SoC");
    }

    #[test]
    fn test_meter_values_phase_appended() {
        let payload = json!({
            "connectorId": 1,
            "meterValue": [{"sampledValue": [
                {"value": "230.1", "measurand": "Voltage", "phase": "L1", "unit": "V"}
            ]}]
        });
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let events = matcher.process(&envelope(Direction::Cp, call("MeterValues", payload)));
        match &events[0] {
            BridgeEvent::Sample(s) => {
                assert_eq!(s.measurand, "Voltage.L1");
                assert_eq!(s.connector, Some(1));
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_fields_yield_no_samples() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let cases = [
            call("MeterValues", json!({})),
            call("MeterValues", json!({"meterValue": [{"sampledValue": [{"context": "Sample.Periodic"}]}]})),
            call("StartTransaction", json!({"idTag": "ABC"})),
            call("StatusNotification", json!({"connectorId": 1})),
        ];
        for raw in cases {
            assert!(matcher.process(&envelope(Direction::Cp, raw)).is_empty());
        }
    }

    #[test]
    fn test_unknown_action_and_wrong_direction_ignored() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let heartbeat = call("Heartbeat", json!({}));
        assert!(matcher.process(&envelope(Direction::Cp, heartbeat)).is_empty());

        // MeterValues only ever travel CP -> CPMS.
        let meter = call("MeterValues", json!({"meterValue": [{"sampledValue": [{"value": "1"}]}]}));
        assert!(matcher.process(&envelope(Direction::Cpms, meter)).is_empty());
    }

    #[test]
    fn test_start_transaction_result_correlated() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let start = call(
            "StartTransaction",
            json!({"connectorId": 2, "idTag": "ABC", "meterStart": 100}),
        );
        let events = matcher.process(&envelope(Direction::Cp, start));
        assert_eq!(events.len(), 1);
        assert_eq!(matcher.pending_len(), 1);

        let result = json!([3, "msg-1", {"transactionId": 77, "idTagInfo": {"status": "Accepted"}}]);
        let events = matcher.process(&envelope(Direction::Cpms, result));
        match &events[0] {
            BridgeEvent::Sample(s) => {
                assert_eq!(s.measurand, "TransactionId");
                assert_eq!(s.value, 77.0);
                assert_eq!(s.connector, Some(2));
                assert_eq!(s.cp_id, "CP001");
            }
            other => panic!("expected sample, got {other:?}"),
        }
        assert_eq!(matcher.pending_len(), 0);
    }

    #[test]
    fn test_cp_side_result_not_correlated() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let start = call("StartTransaction", json!({"connectorId": 1, "meterStart": 0}));
        matcher.process(&envelope(Direction::Cp, start));

        // A result flowing CP -> CPMS answers a CPMS-originated Call and
        // must not consume the pending entry.
        let result = json!([3, "msg-1", {"transactionId": 5}]);
        assert!(matcher.process(&envelope(Direction::Cp, result)).is_empty());
        assert_eq!(matcher.pending_len(), 1);
    }

    #[test]
    fn test_correlation_expires_after_ttl() {
        let mut matcher = Matcher::new(Duration::ZERO);
        let start = call("StartTransaction", json!({"connectorId": 1, "meterStart": 0}));
        matcher.process(&envelope(Direction::Cp, start));

        let result = json!([3, "msg-1", {"transactionId": 5}]);
        assert!(matcher.process(&envelope(Direction::Cpms, result)).is_empty());
        assert_eq!(matcher.pending_len(), 0);
    }

    #[test]
    fn test_call_error_clears_pending() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let start = call("StartTransaction", json!({"connectorId": 1, "meterStart": 0}));
        matcher.process(&envelope(Direction::Cp, start));

        let error = json!([4, "msg-1", "InternalError", "boom", {}]);
        assert!(matcher.process(&envelope(Direction::Cpms, error)).is_empty());
        assert_eq!(matcher.pending_len(), 0);
    }

    #[test]
    fn test_stop_transaction_and_status() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let stop = call("StopTransaction", json!({"meterStop": "4321", "transactionId": 77}));
        let events = matcher.process(&envelope(Direction::Cp, stop));
        match &events[0] {
            BridgeEvent::Sample(s) => {
                assert_eq!(s.value, 4321.0);
                assert_eq!(s.unit.as_deref(), Some("Wh"));
                assert_eq!(s.connector, None);
            }
            other => panic!("expected sample, got {other:?}"),
        }

        let status = call("StatusNotification", json!({"evseId": 1, "connectorStatus": "Occupied"}));
        let events = matcher.process(&envelope(Direction::Cp, status));
        match &events[0] {
            BridgeEvent::Status(s) => {
                assert_eq!(s.status, "Occupied");
                assert_eq!(s.connector, Some(1));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn test_non_message_and_undecodable_skipped() {
        let mut matcher = Matcher::new(Duration::from_secs(30));
        let connection = SnoopMessage::connection("CP001", "ocpp1.6");
        assert!(matcher.process(&connection).is_empty());

        let raw = envelope(Direction::Cp, Value::String("not json".to_string()));
        assert!(matcher.process(&raw).is_empty());
    }
}
