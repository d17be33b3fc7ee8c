//
// Copyright (C) 2022 CUAVA, The University of Sydney
//
// Licensed under the Apache License, Version 2.0 (the "License")
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Telemetry egress: timestamped JSON envelopes on the message bus

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use log::debug;
use rumqttc::{Client, QoS};
use serde::Serialize;

/// Envelope published for every poll result
#[derive(Clone, Debug, Serialize)]
pub struct MessageData {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "Data")]
    pub data: serde_json::Value,
}

/// Publishes envelopes retained at QoS 1. Inverter messages go to
/// `<inverter topic>/<MessageType>`, battery messages to the battery topic.
pub struct Publisher {
    client: Client,
    inverter_topic: String,
    battery_topic: String,
}

impl Publisher {
    pub fn new(client: Client, inverter_topic: &str, battery_topic: &str) -> Publisher {
        Publisher {
            client,
            inverter_topic: inverter_topic.to_string(),
            battery_topic: battery_topic.to_string(),
        }
    }

    pub fn send_inverter_message<T: Serialize>(
        &self,
        message_type: &str,
        data: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let topic = format!("{}/{}", self.inverter_topic, message_type);
        self.send_message(&topic, message_type, data, timestamp)
    }

    pub fn send_battery_message<T: Serialize>(
        &self,
        message_type: &str,
        data: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let topic = self.battery_topic.clone();
        self.send_message(&topic, message_type, data, timestamp)
    }

    fn send_message<T: Serialize>(
        &self,
        topic: &str,
        message_type: &str,
        data: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let envelope = MessageData {
            timestamp,
            message_type: message_type.to_string(),
            data: serde_json::to_value(data).map_err(|e| Error::Mqtt(e.to_string()))?,
        };
        let payload = serde_json::to_vec(&envelope).map_err(|e| Error::Mqtt(e.to_string()))?;
        debug!("publish {} ({} bytes)", topic, payload.len());
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| Error::Mqtt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn envelope_has_the_wire_keys() {
        let envelope = MessageData {
            timestamp: Utc.with_ymd_and_hms(2023, 11, 5, 12, 30, 0).unwrap(),
            message_type: "Mode".to_string(),
            data: serde_json::json!({ "Mode": "L" }),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["MessageType"], "Mode");
        assert_eq!(value["Data"]["Mode"], "L");
        let timestamp = value["Timestamp"].as_str().unwrap();
        assert!(timestamp.starts_with("2023-11-05T12:30:00"));
    }
}
