// Pulsemeter Daemon - MQTT publishing with Home Assistant discovery
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! MQTT sink.
//!
//! Each meter appears in Home Assistant as a device with two sensors:
//!
//! - `{entity_id}/instantaneous_power`: `{"power": kW, "unit_of_measurement": "kW"}`
//! - `{entity_id}/accumulated_energy`: `{"energy": kWh, "unit_of_measurement": "kWh", "last_reset": ...}`
//!
//! Discovery configs go to `{prefix}/sensor/{entity_id}_{measurement}/config`,
//! retained with QoS 1, every time the broker connection is (re)established.

use crate::config::DaemonConfig;
use pulsemeter::{MeterError, Publisher, Telemetry};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POWER: &str = "instantaneous_power";
const ENERGY: &str = "accumulated_energy";

/// Requests buffered between the publisher and the event loop
const REQUEST_CAPACITY: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One outgoing MQTT message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

/// Topic layout for one meter.
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    entity_id: String,
    device_name: String,
    discovery_prefix: String,
}

impl Topics {
    pub fn new(
        entity_id: impl Into<String>,
        device_name: impl Into<String>,
        discovery_prefix: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            device_name: device_name.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    pub fn state(&self, measurement: &str) -> String {
        format!("{}/{}", self.entity_id, measurement)
    }

    fn object_id(&self, measurement: &str) -> String {
        format!("{}_{}", self.entity_id, measurement)
    }

    pub fn config(&self, measurement: &str) -> String {
        format!(
            "{}/sensor/{}/config",
            self.discovery_prefix,
            self.object_id(measurement)
        )
    }

    /// Discovery configs for the power and energy sensors.
    pub fn discovery(&self) -> Vec<Message> {
        let device = json!({
            "identifiers": [self.entity_id],
            "name": self.device_name,
        });

        let power = json!({
            "name": "Instantaneous power",
            "unit_of_measurement": "kW",
            "state_topic": self.state(POWER),
            "device_class": "power",
            "value_template": "{{ value_json.power }}",
            "unique_id": self.object_id(POWER),
            "device": device,
        });
        let energy = json!({
            "name": "Energy",
            "unit_of_measurement": "kWh",
            "state_topic": self.state(ENERGY),
            "device_class": "energy",
            "value_template": "{{ value_json.energy }}",
            "state_class": "total",
            "unique_id": self.object_id(ENERGY),
            "device": device,
        });

        vec![
            Message {
                topic: self.config(POWER),
                payload: power.to_string(),
            },
            Message {
                topic: self.config(ENERGY),
                payload: energy.to_string(),
            },
        ]
    }

    /// State messages for one report. Unknown power is sent as `null`.
    pub fn state_messages(&self, telemetry: &Telemetry) -> Vec<Message> {
        let power = json!({
            "power": telemetry.power_kw,
            "unit_of_measurement": "kW",
        });
        let energy = json!({
            "energy": telemetry.energy_kwh,
            "unit_of_measurement": "kWh",
            "last_reset": telemetry.last_reset,
        });
        vec![
            Message {
                topic: self.state(POWER),
                payload: power.to_string(),
            },
            Message {
                topic: self.state(ENERGY),
                payload: energy.to_string(),
            },
        ]
    }
}

/// Publishes reports to the broker.
///
/// Reports are refused while the broker is unreachable, so the report driver
/// keeps the history and the next report catches up.
pub struct MqttPublisher {
    client: AsyncClient,
    topics: Topics,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, topics: Topics, connected: Arc<AtomicBool>) -> Self {
        Self {
            client,
            topics,
            connected,
        }
    }
}

impl Publisher for MqttPublisher {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn publish(&mut self, telemetry: &Telemetry) -> pulsemeter::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MeterError::publish("mqtt", "not connected to broker"));
        }
        for message in self.topics.state_messages(telemetry) {
            self.client
                .try_publish(message.topic, QoS::AtMostOnce, false, message.payload)
                .map_err(|e| MeterError::publish("mqtt", e))?;
        }
        Ok(())
    }
}

/// Broker connection: the publisher half and the event loop that drives it.
pub struct MqttLink {
    pub publisher: MqttPublisher,
    pub event_loop: MqttEventLoop,
}

impl MqttLink {
    pub fn new(config: &DaemonConfig) -> Self {
        let entity_id = config.entity_id();
        let mut options = MqttOptions::new(
            format!("pulsemeter-{}", entity_id),
            config.mqtt_server.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if !config.mqtt_user.is_empty() {
            options.set_credentials(config.mqtt_user.clone(), config.mqtt_password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let topics = Topics::new(
            entity_id,
            config.device_name.clone(),
            config.mqtt_discovery_prefix.clone(),
        );
        let connected = Arc::new(AtomicBool::new(false));

        Self {
            publisher: MqttPublisher::new(client.clone(), topics.clone(), connected.clone()),
            event_loop: MqttEventLoop {
                client,
                event_loop,
                discovery: topics.discovery(),
                connected,
            },
        }
    }
}

/// Polls the broker connection and announces discovery on every connect.
pub struct MqttEventLoop {
    client: AsyncClient,
    event_loop: EventLoop,
    discovery: Vec<Message>,
    connected: Arc<AtomicBool>,
}

impl MqttEventLoop {
    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Connected to MQTT broker");
                    self.announce();
                }
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        debug!("MQTT connection failed: {}", e);
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    fn announce(&self) {
        for message in &self.discovery {
            // Queued here, sent by the next polls
            if let Err(e) = self.client.try_publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                true,
                message.payload.clone(),
            ) {
                warn!("Failed to queue discovery for {}: {}", message.topic, e);
                return;
            }
        }
        info!("Published discovery for {} sensors", self.discovery.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn topics() -> Topics {
        Topics::new("smartmeter_14", "Energy Meter", "homeassistant")
    }

    fn payload(message: &Message) -> serde_json::Value {
        serde_json::from_str(&message.payload).unwrap()
    }

    #[test]
    fn test_topic_layout() {
        let topics = topics();
        assert_eq!(topics.state(POWER), "smartmeter_14/instantaneous_power");
        assert_eq!(
            topics.config(ENERGY),
            "homeassistant/sensor/smartmeter_14_accumulated_energy/config"
        );
    }

    #[test]
    fn test_discovery_configs() {
        let messages = topics().discovery();
        assert_eq!(messages.len(), 2);

        let power = payload(&messages[0]);
        assert_eq!(power["state_topic"], "smartmeter_14/instantaneous_power");
        assert_eq!(power["device_class"], "power");
        assert_eq!(power["unit_of_measurement"], "kW");
        assert_eq!(power["unique_id"], "smartmeter_14_instantaneous_power");
        assert_eq!(power["device"]["identifiers"][0], "smartmeter_14");
        assert_eq!(power["device"]["name"], "Energy Meter");

        let energy = payload(&messages[1]);
        assert_eq!(energy["state_class"], "total");
        assert_eq!(energy["value_template"], "{{ value_json.energy }}");
    }

    #[test]
    fn test_state_messages() {
        let telemetry = Telemetry {
            energy_kwh: 0.125,
            power_kw: Some(1.5),
            last_reset: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            last_tick: None,
        };
        let messages = topics().state_messages(&telemetry);

        assert_eq!(messages[0].topic, "smartmeter_14/instantaneous_power");
        assert_eq!(payload(&messages[0])["power"], 1.5);

        let energy = payload(&messages[1]);
        assert_eq!(energy["energy"], 0.125);
        assert_eq!(energy["unit_of_measurement"], "kWh");
        assert_eq!(energy["last_reset"], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn test_unknown_power_is_null() {
        let telemetry = Telemetry {
            energy_kwh: 0.0,
            power_kw: None,
            last_reset: None,
            last_tick: None,
        };
        let messages = topics().state_messages(&telemetry);
        assert!(payload(&messages[0])["power"].is_null());
    }

    #[tokio::test]
    async fn test_publish_refused_until_connected() {
        // The event loop owns the request queue, keep it alive unpolled
        let MqttLink {
            mut publisher,
            event_loop: _event_loop,
        } = MqttLink::new(&DaemonConfig::default());
        let telemetry = Telemetry {
            energy_kwh: 0.1,
            power_kw: None,
            last_reset: None,
            last_tick: None,
        };

        assert!(publisher.publish(&telemetry).is_err());

        // Requests are only queued, so no broker is needed
        publisher.connected.store(true, Ordering::SeqCst);
        assert!(publisher.publish(&telemetry).is_ok());
    }
}
