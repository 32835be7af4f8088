//! Analog sensor platforms.
//!
//! `fake` reports seconds since startup, which doubles as an uptime counter.
//! `wifi_signal` samples the link quality column of `/proc/net/wireless`.

use super::{Entity, EntityCore, EntityKind, Identity, ProducerHandle, StateUpdate};
use crate::api::proto;
use crate::api::registry::Response;
use crate::cancel::CancelToken;
use crate::config;
use crate::error::{Error, Result};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sensor_state(key: u32, state: f32) -> StateUpdate {
    StateUpdate::Sensor(proto::SensorStateResponse {
        key,
        state,
        missing_state: false,
    })
}

fn require_interval(cfg: &config::Sensor) -> Result<Duration> {
    if cfg.name.is_empty() {
        return Err(Error::Config("sensor: name is required".into()));
    }
    if cfg.address != 0 {
        return Err(Error::Config("sensor: do not use address".into()));
    }
    match cfg.update_interval {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(Error::Config("sensor: update_interval is required".into())),
    }
}

/// Uptime-as-a-sensor, for wiring-free setups and tests.
pub struct FakeSensor {
    core: Arc<EntityCore>,
    producer: ProducerHandle,
}

impl FakeSensor {
    pub fn new(node_name: &str, token: &CancelToken, cfg: &config::Sensor) -> Result<Self> {
        let interval = require_interval(cfg)?;
        let identity = Identity::derive(node_name, &cfg.name, EntityKind::Sensor)?;
        let core = Arc::new(EntityCore::new(identity));
        core.publish(sensor_state(core.key(), 1.0));

        let producer = {
            let core = Arc::clone(&core);
            ProducerHandle::spawn("sensor-fake", token, move |token| {
                let start = Instant::now();
                while !token.wait_timeout(interval) {
                    core.publish(sensor_state(core.key(), start.elapsed().as_secs_f32()));
                }
            })?
        };
        Ok(FakeSensor { core, producer })
    }
}

impl Entity for FakeSensor {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn describe(&self) -> Response {
        let id = self.core.identity();
        Response::ListEntitiesSensor(proto::ListEntitiesSensorResponse {
            object_id: id.object_id.clone(),
            key: id.key,
            name: id.name.clone(),
            unique_id: id.unique_id.clone(),
            icon: "mdi:exclamation".into(),
            unit_of_measurement: String::new(),
            accuracy_decimals: 0,
            force_update: false,
            device_class: String::new(),
        })
    }

    fn close(&self) -> Result<()> {
        self.producer.stop();
        Ok(())
    }
}

/// WiFi RSSI from `/proc/net/wireless`.
pub struct WifiSignalSensor {
    core: Arc<EntityCore>,
    producer: ProducerHandle,
}

impl WifiSignalSensor {
    pub fn new(node_name: &str, token: &CancelToken, cfg: &config::Sensor) -> Result<Self> {
        let interval = require_interval(cfg)?;
        let identity = Identity::derive(node_name, &cfg.name, EntityKind::Sensor)?;
        let core = Arc::new(EntityCore::new(identity));

        // A node without a usable wifi interface fails construction rather
        // than reporting garbage forever.
        let initial = read_wifi_signal()?;
        core.publish(sensor_state(core.key(), initial));

        let producer = {
            let core = Arc::clone(&core);
            ProducerHandle::spawn("sensor-wifi-signal", token, move |token| {
                while !token.wait_timeout(interval) {
                    match read_wifi_signal() {
                        Ok(v) => core.publish(sensor_state(core.key(), v)),
                        Err(e) => {
                            // An interface that disappears does not come
                            // back by itself; stop sampling.
                            log::error!("wifi_signal read failed, stopping: {}", e);
                            return;
                        }
                    }
                }
            })?
        };
        Ok(WifiSignalSensor { core, producer })
    }
}

impl Entity for WifiSignalSensor {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn describe(&self) -> Response {
        let id = self.core.identity();
        Response::ListEntitiesSensor(proto::ListEntitiesSensorResponse {
            object_id: id.object_id.clone(),
            key: id.key,
            name: id.name.clone(),
            unique_id: id.unique_id.clone(),
            icon: "mdi:wifi".into(),
            unit_of_measurement: "dB".into(),
            accuracy_decimals: 0,
            force_update: false,
            device_class: String::new(),
        })
    }

    fn close(&self) -> Result<()> {
        self.producer.stop();
        Ok(())
    }
}

fn read_wifi_signal() -> Result<f32> {
    let raw = fs::read_to_string("/proc/net/wireless")?;
    parse_wireless(&raw)
}

/// Pick the link quality out of `/proc/net/wireless`, which looks like:
///
/// ```text
/// Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
///  face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
///   wlan0: 0000   50.  -60.  -256        0      0      0     14      0        0
/// ```
fn parse_wireless(raw: &str) -> Result<f32> {
    let lines: Vec<&str> = raw.trim().lines().collect();
    if lines.len() < 3 {
        return Err(Error::Other("no wifi interface".into()));
    }
    let items: Vec<&str> = lines[2].split_whitespace().collect();
    if items.len() != 11 {
        return Err(Error::Other("unexpected /proc/net/wireless format".into()));
    }
    let v: f32 = items[2]
        .trim_end_matches('.')
        .parse()
        .map_err(|_| Error::Other("failed to parse RSSI in /proc/net/wireless".into()))?;
    Ok(-v)
}
