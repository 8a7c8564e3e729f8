//! MQTT output side of the bridge
//!
//! Owns the rumqttc client and its event loop task. The event loop task
//! also watches for re-established broker sessions and reports them to the
//! pipeline so retained discovery state can be re-announced.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::matcher::{MeteringSample, StatusUpdate};

/// Notifications from the broker connection, surfaced to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The broker session came back after being lost.
    Reconnected,
}

pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    discovery_prefix: String,
}

impl MqttPublisher {
    /// Connect to the broker and start the event loop task.
    ///
    /// The returned receiver yields a [`BrokerEvent::Reconnected`] for every
    /// session the client re-establishes after the first.
    pub fn connect(config: &BridgeConfig) -> (Self, mpsc::Receiver<BrokerEvent>) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("shunt-bridge-{}", Uuid::new_v4().simple()));
        let mut options =
            MqttOptions::new(client_id, config.broker_host.clone(), config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) =
            (&config.broker_username, &config.broker_password)
        {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (broker_tx, broker_rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut sessions: u64 = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        sessions += 1;
                        if sessions == 1 {
                            info!("connected to MQTT broker");
                        } else {
                            info!(sessions, "reconnected to MQTT broker");
                            // A full pipeline stalls announcements for one
                            // event at most, so losing the nudge is fine.
                            let _ = broker_tx.try_send(BrokerEvent::Reconnected);
                        }
                    }
                    Ok(event) => debug!(?event, "mqtt event"),
                    Err(err) => {
                        warn!(%err, "mqtt connection error, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        (
            Self {
                client,
                topic_prefix: config.topic_prefix.clone(),
                discovery_prefix: config.discovery_prefix.clone(),
            },
            broker_rx,
        )
    }

    /// Publish a device discovery document, retained so consumers that start
    /// later still learn the entity set.
    pub async fn publish_device_config(
        &self,
        cp_id: &str,
        config: &Value,
    ) -> Result<(), BridgeError> {
        let topic = discovery_topic(&self.discovery_prefix, cp_id);
        self.client
            .publish(topic, QoS::AtLeastOnce, true, config.to_string())
            .await?;
        Ok(())
    }

    pub async fn publish_sample(&self, sample: &MeteringSample) -> Result<(), BridgeError> {
        let topic = state_topic(
            &self.topic_prefix,
            &sample.cp_id,
            sample.connector,
            &sample.measurand,
        );
        self.client
            .publish(topic, QoS::AtMostOnce, false, sample.value.to_string())
            .await?;
        Ok(())
    }

    pub async fn publish_status(&self, status: &StatusUpdate) -> Result<(), BridgeError> {
        let topic = status_topic(&self.topic_prefix, &status.cp_id, status.connector);
        self.client
            .publish(topic, QoS::AtMostOnce, false, status.status.clone())
            .await?;
        Ok(())
    }
}

/// `<prefix>/<cp_id>/<connector>/<measurand>`; connector 0 stands in for
/// station-level values that carry no connector id.
pub fn state_topic(prefix: &str, cp_id: &str, connector: Option<i64>, measurand: &str) -> String {
    format!("{prefix}/{cp_id}/{}/{measurand}", connector.unwrap_or(0))
}

pub fn status_topic(prefix: &str, cp_id: &str, connector: Option<i64>) -> String {
    format!("{prefix}/{cp_id}/{}/status", connector.unwrap_or(0))
}

pub fn discovery_topic(prefix: &str, cp_id: &str) -> String {
    format!("{prefix}/{cp_id}/config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_building() {
        assert_eq!(
            state_topic("ocpp", "CP001", Some(2), "Power.Active.Import"),
            "ocpp/CP001/2/Power.Active.Import"
        );
        assert_eq!(
            state_topic("ocpp", "CP001", None, "Energy.Active.Import.Register"),
            "ocpp/CP001/0/Energy.Active.Import.Register"
        );
        assert_eq!(status_topic("ocpp", "CP001", Some(1)), "ocpp/CP001/1/status");
        assert_eq!(
            discovery_topic("homeassistant/device/ocpp", "CP001"),
            "homeassistant/device/ocpp/CP001/config"
        );
    }
}
