//! Binary sensor platforms.
//!
//! `fake` flips between true and false on a coarse timer; `gpio` follows a
//! Linux sysfs GPIO line, with optional inversion from the pin config.

use super::{Entity, EntityCore, EntityKind, Identity, ProducerHandle, StateUpdate};
use crate::api::proto;
use crate::api::registry::Response;
use crate::cancel::CancelToken;
use crate::config;
use crate::error::{Error, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The fake platform's flip period. Coarse on purpose: slow clients (CI
/// runners included) must still observe the initial snapshot before the
/// first flip.
const FAKE_FLIP_INTERVAL: Duration = Duration::from_secs(60);

/// How often the sysfs line is sampled for edges.
const GPIO_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn binary_state(key: u32, state: bool) -> StateUpdate {
    StateUpdate::BinarySensor(proto::BinarySensorStateResponse {
        key,
        state,
        missing_state: false,
    })
}

fn describe_binary_sensor(core: &EntityCore, device_class: &str) -> Response {
    let id = core.identity();
    Response::ListEntitiesBinarySensor(proto::ListEntitiesBinarySensorResponse {
        object_id: id.object_id.clone(),
        key: id.key,
        name: id.name.clone(),
        unique_id: id.unique_id.clone(),
        device_class: device_class.to_owned(),
        is_status_binary_sensor: false,
    })
}

/// Timer-driven boolean, for wiring-free setups and tests.
pub struct FakeBinarySensor {
    core: Arc<EntityCore>,
    device_class: String,
    producer: ProducerHandle,
}

impl FakeBinarySensor {
    pub fn new(node_name: &str, token: &CancelToken, cfg: &config::BinarySensor) -> Result<Self> {
        if !cfg.pin.number.is_empty() {
            return Err(Error::Config("fake doesn't support pin number".into()));
        }
        let identity = Identity::derive(node_name, &cfg.name, EntityKind::BinarySensor)?;
        let core = Arc::new(EntityCore::new(identity));
        core.publish(binary_state(core.key(), false));

        let producer = {
            let core = Arc::clone(&core);
            ProducerHandle::spawn("binary-sensor-fake", token, move |token| {
                let mut level = false;
                while !token.wait_timeout(FAKE_FLIP_INTERVAL) {
                    level = !level;
                    core.publish(binary_state(core.key(), level));
                }
            })?
        };
        Ok(FakeBinarySensor {
            core,
            device_class: cfg.device_class.clone(),
            producer,
        })
    }
}

impl Entity for FakeBinarySensor {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn describe(&self) -> Response {
        describe_binary_sensor(&self.core, &self.device_class)
    }

    fn close(&self) -> Result<()> {
        self.producer.stop();
        Ok(())
    }
}

/// A sysfs GPIO line watched for edges by polling.
///
/// Pull-up/-down selection is accepted from the config for schema parity
/// but sysfs cannot program pulls; board-level configuration has to provide
/// them.
pub struct GpioBinarySensor {
    core: Arc<EntityCore>,
    device_class: String,
    producer: ProducerHandle,
}

impl GpioBinarySensor {
    pub fn new(node_name: &str, token: &CancelToken, cfg: &config::BinarySensor) -> Result<Self> {
        if cfg.pin.number.is_empty() {
            return Err(Error::Config("gpio requires a pin number".into()));
        }
        if !cfg.pin.mode.is_input() {
            return Err(Error::Config(format!(
                "pin mode {:?} is not usable for a binary sensor",
                cfg.pin.mode
            )));
        }
        let pin: u32 = cfg
            .pin
            .number
            .trim_start_matches("GPIO")
            .parse()
            .map_err(|_| Error::Config(format!("invalid pin number {:?}", cfg.pin.number)))?;
        let value_path = export_pin(pin)?;
        let inverted = cfg.pin.inverted;

        let identity = Identity::derive(node_name, &cfg.name, EntityKind::BinarySensor)?;
        let core = Arc::new(EntityCore::new(identity));
        let mut level = read_level(&value_path)? != inverted;
        core.publish(binary_state(core.key(), level));

        let producer = {
            let core = Arc::clone(&core);
            ProducerHandle::spawn("binary-sensor-gpio", token, move |token| {
                while !token.wait_timeout(GPIO_POLL_INTERVAL) {
                    match read_level(&value_path) {
                        Ok(raw) => {
                            let new_level = raw != inverted;
                            if new_level != level {
                                level = new_level;
                                core.publish(binary_state(core.key(), level));
                            }
                        }
                        Err(e) => {
                            // Transient bus hiccups happen; keep sampling.
                            log::warn!("gpio read failed: {}", e);
                        }
                    }
                }
            })?
        };
        Ok(GpioBinarySensor {
            core,
            device_class: cfg.device_class.clone(),
            producer,
        })
    }
}

impl Entity for GpioBinarySensor {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn describe(&self) -> Response {
        describe_binary_sensor(&self.core, &self.device_class)
    }

    fn close(&self) -> Result<()> {
        self.producer.stop();
        Ok(())
    }
}

/// Make `/sys/class/gpio/gpioN/value` available, exporting the pin and
/// setting its direction when it is not already set up.
fn export_pin(pin: u32) -> Result<PathBuf> {
    let dir = PathBuf::from(format!("/sys/class/gpio/gpio{}", pin));
    if !dir.exists() {
        fs::write("/sys/class/gpio/export", pin.to_string())
            .map_err(|e| Error::Config(format!("cannot export gpio {}: {}", pin, e)))?;
        fs::write(dir.join("direction"), "in")
            .map_err(|e| Error::Config(format!("cannot configure gpio {}: {}", pin, e)))?;
    }
    Ok(dir.join("value"))
}

fn read_level(path: &PathBuf) -> Result<bool> {
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim() == "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;

    fn fake_cfg(name: &str) -> config::BinarySensor {
        config::BinarySensor {
            platform: "fake".into(),
            name: name.into(),
            device_class: "motion".into(),
            pin: config::Pin::default(),
        }
    }

    #[test]
    fn test_fake_initial_state_and_describe() {
        let (_canceller, token) = cancel::root();
        let sensor = FakeBinarySensor::new("pi", &token, &fake_cfg("fake binary_sensor")).unwrap();
        match sensor.core().snapshot() {
            Some(StateUpdate::BinarySensor(m)) => {
                assert_eq!(m.key, 2604849794);
                assert!(!m.state);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
        match sensor.describe() {
            Response::ListEntitiesBinarySensor(m) => {
                assert_eq!(m.object_id, "fakebinary_sensor");
                assert_eq!(m.unique_id, "pibinary_sensorfakebinary_sensor");
                assert_eq!(m.device_class, "motion");
            }
            other => panic!("unexpected describe {:?}", other),
        }
        sensor.close().unwrap();
    }

    #[test]
    fn test_fake_rejects_pin() {
        let (_canceller, token) = cancel::root();
        let mut cfg = fake_cfg("x");
        cfg.pin.number = "17".into();
        assert!(FakeBinarySensor::new("pi", &token, &cfg).is_err());
    }

    #[test]
    fn test_close_is_prompt() {
        let (_canceller, token) = cancel::root();
        let sensor = FakeBinarySensor::new("pi", &token, &fake_cfg("x")).unwrap();
        let start = std::time::Instant::now();
        sensor.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_gpio_requires_input_mode() {
        let (_canceller, token) = cancel::root();
        let cfg = config::BinarySensor {
            platform: "gpio".into(),
            name: "m".into(),
            device_class: String::new(),
            pin: config::Pin {
                number: "17".into(),
                inverted: false,
                mode: config::PinMode::Output,
            },
        };
        assert!(GpioBinarySensor::new("pi", &token, &cfg).is_err());
    }

    #[test]
    fn test_gpio_requires_pin_number() {
        let (_canceller, token) = cancel::root();
        let cfg = config::BinarySensor {
            platform: "gpio".into(),
            name: "m".into(),
            device_class: String::new(),
            pin: config::Pin::default(),
        };
        assert!(GpioBinarySensor::new("pi", &token, &cfg).is_err());
    }
}
