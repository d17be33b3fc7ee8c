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

//! Gateway daemon: periodic device polling, MQTT egress and inbound
//! control commands

use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use datalogd::config::Config;
use datalogd::connector::{Connector, SerialConnector, UsbConnector};
use datalogd::publisher::Publisher;
use datalogd::scheduler::{self, Query};
use datalogd::slot::ConnectorSlot;
use datalogd::{axpert, pylontech, Error, OutputSourcePriority, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SET_OUTPUT_SOURCE_PRIORITY_TOPIC: &str = "inverter/cmd/setOutputSourcePriority";

#[derive(Parser, Debug)]
#[command(
    name = "datalogd",
    about = "Energy-monitoring gateway for Axpert inverters and Pylontech batteries"
)]
struct Args {
    /// Directory containing datalogd-conf.toml
    #[arg(short = 'c', long = "config-path", default_value = ".")]
    config_path: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("fatal: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = Config::load(&args.config_path)?;
    config.validate()?;

    info!("connecting to inverter at {}", config.inverter.path);
    let mut inverter = UsbConnector::new(&config.inverter.path);
    inverter.open()?;
    let inverter_slot = Arc::new(ConnectorSlot::new(Box::new(inverter)));

    let battery_slot = match &config.battery.path {
        Some(path) => {
            info!("connecting to battery at {}", path);
            let mut battery = SerialConnector::new(path, config.battery.baud);
            battery.open()?;
            Some(Arc::new(ConnectorSlot::new(Box::new(battery))))
        }
        None => None,
    };

    let mut options = MqttOptions::new(
        config.mqtt.clientid.clone(),
        config.mqtt.server.clone(),
        config.mqtt.port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if !config.mqtt.username.is_empty() {
        options.set_credentials(config.mqtt.username.clone(), config.mqtt.password.clone());
    }
    let (client, mut connection) = Client::new(options, 64);
    client
        .subscribe(SET_OUTPUT_SOURCE_PRIORITY_TOPIC, QoS::AtLeastOnce)
        .map_err(|e| Error::Mqtt(e.to_string()))?;

    let publisher = Arc::new(Publisher::new(
        client.clone(),
        &config.inverter.topic,
        &config.battery.topic,
    ));

    // Dropping the only sender closes the channel and wakes every receiver
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    // The connection loop drives publishes, acks inbound messages and
    // dispatches control commands without blocking on the transport.
    let dispatch_slot = Arc::clone(&inverter_slot);
    let dispatch_shutdown = shutdown_rx.clone();
    let connection_thread = thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("connected to broker"),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    dispatch_command(
                        &publish.topic,
                        publish.payload.as_ref(),
                        &dispatch_slot,
                        &dispatch_shutdown,
                    );
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("broker connection lost: {}", e);
                    // A closed shutdown channel means the daemon is exiting;
                    // stop retrying instead of waiting for a broker
                    if matches!(
                        dispatch_shutdown.try_recv(),
                        Err(crossbeam_channel::TryRecvError::Disconnected)
                    ) {
                        break;
                    }
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        info!("mqtt connection loop stopped");
    });

    let queries = build_queries(&config, &inverter_slot, battery_slot.as_ref());
    let pollers = scheduler::spawn_queries(queries, Arc::clone(&publisher), shutdown_rx.clone());

    let (signal_tx, signal_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .map_err(|e| Error::Config(format!("signal handler: {}", e)))?;

    let _ = signal_rx.recv();
    info!("signal received, stopping pollers");

    drop(shutdown_tx);
    for poller in pollers {
        let _ = poller.join();
    }

    // Every poller has released its transport; reclaim and close
    if let Ok(mut guard) = inverter_slot.acquire_blocking() {
        guard.close();
    }
    if let Some(slot) = &battery_slot {
        if let Ok(mut guard) = slot.acquire_blocking() {
            guard.close();
        }
    }

    let _ = client.disconnect();
    let _ = connection_thread.join();
    info!("exiting");
    Ok(())
}

fn build_queries(
    config: &Config,
    inverter_slot: &Arc<ConnectorSlot>,
    battery_slot: Option<&Arc<ConnectorSlot>>,
) -> Vec<Query> {
    let interval = Duration::from_secs(config.timer.interval);
    let status_interval = Duration::from_secs(config.timer.status);
    let inverter_count = config.inverter.count;

    let mut queries = vec![
        Query::new(
            "deviceMode",
            interval,
            Arc::clone(inverter_slot),
            |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                let mode = axpert::device_mode(c)?;
                p.send_inverter_message("Mode", &serde_json::json!({ "Mode": mode }), t)
            },
        ),
        Query::new(
            "parallelDeviceInfo",
            interval,
            Arc::clone(inverter_slot),
            move |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                for index in 0..inverter_count {
                    let info = axpert::parallel_device_info(c, index)?;
                    p.send_inverter_message("DeviceInfo", &info, t)?;
                }
                Ok(())
            },
        ),
        Query::new(
            "deviceGeneralStatus",
            status_interval,
            Arc::clone(inverter_slot),
            |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                let status = axpert::device_general_status(c)?;
                p.send_inverter_message("Status", &status, t)
            },
        ),
        Query::new(
            "deviceFlagStatus",
            interval,
            Arc::clone(inverter_slot),
            |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                let flags = axpert::device_flag_status(c)?;
                p.send_inverter_message("Flags", &flags, t)
            },
        ),
        Query::new(
            "warningStatus",
            interval,
            Arc::clone(inverter_slot),
            |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                let warnings = axpert::warning_status(c)?;
                p.send_inverter_message("Warnings", &warnings, t)
            },
        ),
        Query::new(
            "deviceRatingInfo",
            interval,
            Arc::clone(inverter_slot),
            |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                let rating = axpert::device_rating_info(c)?;
                p.send_inverter_message("RatingInfo", &rating, t)
            },
        ),
    ];

    if let Some(slot) = battery_slot {
        queries.push(Query::new(
            "batteryStatus",
            Duration::from_secs(config.timer.battery),
            Arc::clone(slot),
            |c: &mut dyn Connector, p: &Publisher, t: DateTime<Utc>| {
                let status = pylontech::get_battery_status(c, pylontech::ALL_PACKS)?;
                p.send_battery_message("BatteryStatus", &status, t)
            },
        ));
    }

    queries
}

// Inbound control messages are acked by the connection loop regardless of
// the outcome; errors are logged and discarded.
fn dispatch_command(
    topic: &str,
    payload: &[u8],
    inverter_slot: &Arc<ConnectorSlot>,
    shutdown: &Receiver<()>,
) {
    match topic {
        SET_OUTPUT_SOURCE_PRIORITY_TOPIC => {
            let payload = payload.to_vec();
            let slot = Arc::clone(inverter_slot);
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                if let Err(e) = apply_output_source_priority(&payload, &slot, &shutdown) {
                    warn!("setOutputSourcePriority: {}", e);
                }
            });
        }
        other => warn!("message on unexpected topic {}", other),
    }
}

fn apply_output_source_priority(
    payload: &[u8],
    slot: &ConnectorSlot,
    shutdown: &Receiver<()>,
) -> Result<()> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Decode("command payload is not UTF-8".to_string()))?;
    let discriminant = text
        .trim()
        .parse::<u8>()
        .map_err(|_| Error::Decode(format!("invalid priority payload {:?}", text)))?;
    let priority = OutputSourcePriority::try_from(discriminant)?;

    info!("setting output source priority to {:?}", priority);
    let mut guard = slot.acquire(shutdown)?;
    axpert::set_output_source_priority(&mut *guard, priority)
}
