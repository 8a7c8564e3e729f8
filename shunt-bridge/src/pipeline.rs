//! The bridge pipeline
//!
//! Wires snoop client, matcher, discovery cache and MQTT publisher together.
//! Envelopes are processed strictly serially, which keeps the matcher's
//! pending map and the discovery cache free of locking.

use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::discovery::DiscoveryCache;
use crate::error::BridgeError;
use crate::matcher::{BridgeEvent, Matcher};
use crate::publisher::{BrokerEvent, MqttPublisher};
use crate::snoop_client;

pub struct Bridge {
    config: BridgeConfig,
    matcher: Matcher,
    discovery: DiscoveryCache,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let matcher = Matcher::new(config.correlation_ttl());
        Ok(Self {
            config,
            matcher,
            discovery: DiscoveryCache::new(),
        })
    }

    /// Run the pipeline until the snoop stream ends for good.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        let (publisher, mut broker_rx) = MqttPublisher::connect(&self.config);
        let mut snoop_rx = snoop_client::spawn(
            self.config.snoop_url.clone(),
            self.config.reconnect_delay(),
            self.config.max_reconnect_delay(),
        );
        info!(snoop_url = %self.config.snoop_url, "bridge pipeline running");

        let mut broker_open = true;
        loop {
            tokio::select! {
                envelope = snoop_rx.recv() => {
                    let envelope = match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    };
                    for event in self.matcher.process(&envelope) {
                        self.handle(&publisher, event).await;
                    }
                }
                event = broker_rx.recv(), if broker_open => {
                    match event {
                        Some(BrokerEvent::Reconnected) => {
                            if self.config.reannounce_on_reconnect {
                                info!("broker session re-established, re-announcing devices");
                                self.discovery.reset_announcements();
                            }
                        }
                        None => broker_open = false,
                    }
                }
            }
        }
        Ok(())
    }

    /// Announce-then-publish for one extracted event. Failures drop the
    /// event; the next one for the same entity will retry the announcement.
    async fn handle(&mut self, publisher: &MqttPublisher, event: BridgeEvent) {
        if self.discovery.observe(&event) {
            let cp_id = event.cp_id().to_string();
            let config = self.discovery.device_config(&cp_id, &self.config.topic_prefix);
            match publisher.publish_device_config(&cp_id, &config).await {
                Ok(()) => self.discovery.mark_announced(&cp_id),
                Err(err) => {
                    warn!(%cp_id, %err, "discovery publish failed, dropping event");
                    return;
                }
            }
        }
        let result = match &event {
            BridgeEvent::Sample(sample) => publisher.publish_sample(sample).await,
            BridgeEvent::Status(status) => publisher.publish_status(status).await,
        };
        if let Err(err) = result {
            warn!(cp_id = %event.cp_id(), %err, "state publish failed, dropping event");
        }
    }
}
