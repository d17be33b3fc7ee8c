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

//! Daemon configuration: datalogd-conf.toml plus DLOG_* environment overrides

use crate::error::{Error, Result};
use log::info;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

const CONFIG_FILE: &str = "datalogd-conf.toml";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub inverter: InverterConfig,
    pub battery: BatteryConfig,
    pub timer: TimerConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub server: String,
    pub port: u16,
    pub clientid: String,
    pub username: String,
    pub password: String,
}

impl Default for MqttConfig {
    fn default() -> MqttConfig {
        MqttConfig {
            server: "localhost".to_string(),
            port: 1883,
            clientid: "datalogd".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InverterConfig {
    /// HID device path, e.g. /dev/hidraw0
    pub path: String,
    /// Number of stacked inverters to poll with QPGS
    pub count: u8,
    pub topic: String,
}

impl Default for InverterConfig {
    fn default() -> InverterConfig {
        InverterConfig {
            path: String::new(),
            count: 1,
            topic: "datalogd/inverter".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatteryConfig {
    /// Serial device path; battery polling is enabled iff present
    pub path: Option<String>,
    pub baud: usize,
    pub topic: String,
}

impl Default for BatteryConfig {
    fn default() -> BatteryConfig {
        BatteryConfig {
            path: None,
            baud: 1200,
            topic: "datalogd/battery".to_string(),
        }
    }
}

// Poll intervals in seconds. General status and battery status run on a
// faster loop than the slow-moving queries.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerConfig {
    pub interval: u64,
    pub status: u64,
    pub battery: u64,
}

impl Default for TimerConfig {
    fn default() -> TimerConfig {
        TimerConfig {
            interval: 30,
            status: 10,
            battery: 10,
        }
    }
}

impl Config {
    /// Load from `<dir>/datalogd-conf.toml`, then apply environment
    /// overrides. An absent file is not fatal.
    pub fn load(dir: &Path) -> Result<Config> {
        let file = dir.join(CONFIG_FILE);
        let mut config = match fs::read_to_string(&file) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", file.display(), e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("{} not found, relying on defaults and environment", file.display());
                Config::default()
            }
            Err(e) => return Err(Error::Config(format!("{}: {}", file.display(), e))),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inverter.path.is_empty() {
            return Err(Error::Config("inverter.path is required".to_string()));
        }
        Ok(())
    }

    // DLOG_ prefix, '.' replaced by '_'
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("DLOG_MQTT_SERVER") {
            self.mqtt.server = v;
        }
        if let Ok(v) = env::var("DLOG_MQTT_PORT") {
            self.mqtt.port = parse_env("DLOG_MQTT_PORT", &v)?;
        }
        if let Ok(v) = env::var("DLOG_MQTT_CLIENTID") {
            self.mqtt.clientid = v;
        }
        if let Ok(v) = env::var("DLOG_MQTT_USERNAME") {
            self.mqtt.username = v;
        }
        if let Ok(v) = env::var("DLOG_MQTT_PASSWORD") {
            self.mqtt.password = v;
        }
        if let Ok(v) = env::var("DLOG_INVERTER_PATH") {
            self.inverter.path = v;
        }
        if let Ok(v) = env::var("DLOG_INVERTER_COUNT") {
            self.inverter.count = parse_env("DLOG_INVERTER_COUNT", &v)?;
        }
        if let Ok(v) = env::var("DLOG_INVERTER_TOPIC") {
            self.inverter.topic = v;
        }
        if let Ok(v) = env::var("DLOG_BATTERY_PATH") {
            self.battery.path = Some(v);
        }
        if let Ok(v) = env::var("DLOG_BATTERY_BAUD") {
            self.battery.baud = parse_env("DLOG_BATTERY_BAUD", &v)?;
        }
        if let Ok(v) = env::var("DLOG_BATTERY_TOPIC") {
            self.battery.topic = v;
        }
        if let Ok(v) = env::var("DLOG_TIMER_INTERVAL") {
            self.timer.interval = parse_env("DLOG_TIMER_INTERVAL", &v)?;
        }
        if let Ok(v) = env::var("DLOG_TIMER_STATUS") {
            self.timer.status = parse_env("DLOG_TIMER_STATUS", &v)?;
        }
        if let Ok(v) = env::var("DLOG_TIMER_BATTERY") {
            self.timer.battery = parse_env("DLOG_TIMER_BATTERY", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid {}: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The environment is process-wide; tests touching it take this lock
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_the_daemon_contract() {
        let _env = ENV_LOCK.lock().unwrap();
        let config = Config::load(Path::new("/nonexistent")).unwrap();

        assert_eq!(config.mqtt.server, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.clientid, "datalogd");
        assert_eq!(config.inverter.count, 1);
        assert_eq!(config.inverter.topic, "datalogd/inverter");
        assert_eq!(config.battery.path, None);
        assert_eq!(config.battery.baud, 1200);
        assert_eq!(config.battery.topic, "datalogd/battery");
        assert_eq!(config.timer.interval, 30);
        assert_eq!(config.timer.status, 10);
        assert_eq!(config.timer.battery, 10);

        // No inverter path yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        let dir = env::temp_dir().join(format!("datalogd-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(CONFIG_FILE),
            "[mqtt]\nserver = \"broker.local\"\n\n[inverter]\npath = \"/dev/hidraw0\"\ncount = 2\n\n[battery]\npath = \"/dev/ttyUSB0\"\n",
        )
        .unwrap();

        let config = Config::load(&dir).unwrap();
        assert_eq!(config.mqtt.server, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.inverter.path, "/dev/hidraw0");
        assert_eq!(config.inverter.count, 2);
        assert_eq!(config.battery.path.as_deref(), Some("/dev/ttyUSB0"));
        assert!(config.validate().is_ok());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn environment_overrides_file_and_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        env::set_var("DLOG_MQTT_PORT", "8883");
        env::set_var("DLOG_INVERTER_PATH", "/dev/hidraw7");

        let config = Config::load(Path::new("/nonexistent")).unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.inverter.path, "/dev/hidraw7");

        env::remove_var("DLOG_MQTT_PORT");
        env::remove_var("DLOG_INVERTER_PATH");
    }

    #[test]
    fn malformed_environment_value_is_a_config_error() {
        let _env = ENV_LOCK.lock().unwrap();
        env::set_var("DLOG_BATTERY_BAUD", "fast");

        let result = Config::load(Path::new("/nonexistent"));
        env::remove_var("DLOG_BATTERY_BAUD");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
