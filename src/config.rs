//! Configuration loading from YAML
//!
//! # Configuration File Format
//!
//! The file is deliberately close to an ESPHome device YAML:
//!
//! ```yaml
//! periphhome:
//!   name: pi
//!   comment: pi device
//!
//! api:
//!   port: 6053
//!   password: "Foo"
//!
//! binary_sensor:
//!   - platform: gpio
//!     name: "Motion sensor"
//!     device_class: motion
//!     pin:
//!       number: "17"
//!       mode: INPUT_PULLUP
//!
//! sensor:
//!   - platform: wifi_signal
//!     name: "wifi signal"
//!     update_interval: 60s
//!
//! light:
//!   - platform: fake
//!     name: "desk strip"
//!
//! camera:
//!   - platform: fake
//!     name: "door camera"
//!     directory: /var/lib/periphhome/frames
//! ```
//!
//! Unknown keys anywhere in the file are rejected, so a typo fails the load
//! instead of silently disabling an entity.
//!
//! Durations accept `"250ms"`, `"60s"`, `"5m"`, `"1h"` or a bare number of
//! seconds.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default TCP port of the native API.
pub const DEFAULT_API_PORT: u16 = 6053;

/// Value for `pin.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum PinMode {
    #[default]
    #[serde(rename = "INPUT")]
    Input,
    #[serde(rename = "INPUT_PULLUP")]
    InputPullup,
    #[serde(rename = "INPUT_PULLDOWN")]
    InputPulldown,
    #[serde(rename = "ANALOG")]
    Analog,
    #[serde(rename = "OUTPUT")]
    Output,
    #[serde(rename = "OUTPUT_OPEN_DRAIN")]
    OutputOpenDrain,
}

impl PinMode {
    /// Whether the mode reads a digital level.
    pub fn is_input(self) -> bool {
        matches!(self, PinMode::Input | PinMode::InputPullup | PinMode::InputPulldown)
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Root {
    #[serde(default)]
    pub periphhome: PeriphHome,
    /// Present (even empty) enables the native API server.
    #[serde(default, deserialize_with = "api_section")]
    pub api: Option<Api>,
    #[serde(default, rename = "binary_sensor")]
    pub binary_sensors: Vec<BinarySensor>,
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<Sensor>,
    #[serde(default, rename = "light")]
    pub lights: Vec<Light>,
    #[serde(default, rename = "camera")]
    pub cameras: Vec<Camera>,
}

impl Root {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;
        Self::load_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// Validation here covers what can be checked without touching hardware;
    /// entity construction in [`crate::node::Node::new`] can still fail on
    /// platform-specific requirements.
    pub fn load_yaml(content: &str) -> Result<Self> {
        let root: Root = serde_yaml::from_str(content)?;
        root.validate()?;
        Ok(root)
    }

    fn validate(&self) -> Result<()> {
        if self.periphhome.name.len() > 63 {
            return Err(Error::Config("periphhome: name is too long".into()));
        }
        if let Some(api) = &self.api {
            // 65535 is reserved; 0 falls back to the default port.
            if api.port >= 65535 {
                return Err(Error::Config("api: port is invalid".into()));
            }
        }
        for b in &self.binary_sensors {
            if b.platform.is_empty() {
                return Err(Error::Config("binary_sensor: platform is required".into()));
            }
            if b.name.is_empty() {
                return Err(Error::Config("binary_sensor: name is required".into()));
            }
        }
        for s in &self.sensors {
            if s.platform.is_empty() {
                return Err(Error::Config("sensor: platform is required".into()));
            }
        }
        for l in &self.lights {
            if l.platform.is_empty() {
                return Err(Error::Config("light: platform is required".into()));
            }
            if l.name.is_empty() {
                return Err(Error::Config("light: name is required".into()));
            }
            if l.num_leds > 1_000_000 {
                return Err(Error::Config("light: num_leds is out of range".into()));
            }
        }
        if self.cameras.len() > 1 {
            return Err(Error::Config(
                "the ESPHome protocol currently only supports one camera per node".into(),
            ));
        }
        for c in &self.cameras {
            if c.platform.is_empty() {
                return Err(Error::Config("camera: platform is required".into()));
            }
            if c.name.is_empty() {
                return Err(Error::Config("camera: name is required".into()));
            }
            if !c.directory.is_empty() && !Path::new(&c.directory).is_absolute() {
                // When started via systemd the working directory will not
                // match, so relative spool paths are a trap.
                return Err(Error::Config("camera: directory must be an absolute path".into()));
            }
            if !matches!(c.rotation, 0 | 90 | 180 | 270) {
                return Err(Error::Config("camera: invalid rotation".into()));
            }
        }
        Ok(())
    }
}

/// The `periphhome` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeriphHome {
    /// Name shown in Home Assistant. At most 63 characters.
    #[serde(default)]
    pub name: String,
    /// Free-form note, reported through the device info reply.
    #[serde(default)]
    pub comment: String,
}

/// The `api` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Api {
    /// TCP port for the native API. 0 falls back to 6053.
    #[serde(default)]
    pub port: u32,
    /// Shared secret. Empty means no authentication; no hashing or
    /// encryption is applied either way.
    #[serde(default)]
    pub password: String,
}

impl Api {
    /// The effective TCP port.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_API_PORT
        } else {
            self.port as u16
        }
    }
}

/// `api:` with an empty body parses as YAML null; the section is still
/// present and enables the server with defaults.
fn api_section<'de, D>(deserializer: D) -> std::result::Result<Option<Api>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Api>::deserialize(deserializer)?;
    Ok(Some(raw.unwrap_or_default()))
}

/// An element of the `binary_sensor` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinarySensor {
    pub platform: String,
    pub name: String,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub pin: Pin,
}

/// A `pin` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pin {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub mode: PinMode,
}

/// An element of the `sensor` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sensor {
    pub platform: String,
    #[serde(default)]
    pub name: String,
    /// Bus address, for platforms that need one.
    #[serde(default)]
    pub address: u16,
    #[serde(default, deserialize_with = "duration_opt")]
    pub update_interval: Option<Duration>,
}

/// An element of the `light` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Light {
    pub platform: String,
    pub name: String,
    #[serde(default)]
    pub num_leds: u32,
}

/// An element of the `camera` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Camera {
    pub platform: String,
    pub name: String,
    /// Spool directory for captured frames. Must be absolute when set.
    #[serde(default)]
    pub directory: String,
    /// Image rotation in degrees: 0, 90, 180 or 270.
    #[serde(default)]
    pub rotation: u32,
}

fn duration_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(n)) => Ok(Some(Duration::from_secs(n))),
        Some(Raw::Text(s)) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse a duration like `"250ms"`, `"60s"`, `"5m"`, `"1h"` or `"90"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (value, scale_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000.0)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1000.0)
    } else {
        (s, 1000.0)
    };
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration {:?}", s));
    }
    Ok(Duration::from_secs_f64(value * scale_ms / 1000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
periphhome:
  name: pi
  comment: pi device

api:
  port: 6053
  password: \"Foo\"

binary_sensor:
  - platform: fake
    name: \"fake binary_sensor\"
    device_class: motion

camera:
  - platform: fake
    name: \"fake camera\"

light:
  - platform: fake
    name: \"fake light\"

sensor:
  - platform: fake
    name: \"fake sensor\"
    update_interval: 60s
";

    #[test]
    fn test_sample_config() {
        let cfg = Root::load_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.periphhome.name, "pi");
        assert_eq!(cfg.periphhome.comment, "pi device");
        let api = cfg.api.as_ref().unwrap();
        assert_eq!(api.effective_port(), 6053);
        assert_eq!(api.password, "Foo");
        assert_eq!(cfg.binary_sensors.len(), 1);
        assert_eq!(cfg.binary_sensors[0].device_class, "motion");
        assert_eq!(cfg.sensors[0].update_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.cameras.len(), 1);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Root::load_yaml("periphhome:\n  name: pi\n  nmae_typo: x\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_api_section_counts_as_present() {
        let cfg = Root::load_yaml("api:\n").unwrap();
        let api = cfg.api.expect("api should be present");
        assert_eq!(api.effective_port(), DEFAULT_API_PORT);
        assert!(api.password.is_empty());
    }

    #[test]
    fn test_missing_api_section() {
        let cfg = Root::load_yaml("periphhome:\n  name: pi\n").unwrap();
        assert!(cfg.api.is_none());
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(64);
        let err = Root::load_yaml(&format!("periphhome:\n  name: {}\n", long));
        assert!(err.is_err());
        let ok = Root::load_yaml(&format!("periphhome:\n  name: {}\n", &long[..63]));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_port_range() {
        assert!(Root::load_yaml("api:\n  port: 65535\n").is_err());
        assert!(Root::load_yaml("api:\n  port: 65534\n").is_ok());
        // 0 is valid and falls back to the default.
        let cfg = Root::load_yaml("api:\n  port: 0\n").unwrap();
        assert_eq!(cfg.api.unwrap().effective_port(), DEFAULT_API_PORT);
    }

    #[test]
    fn test_two_cameras_rejected() {
        let err = Root::load_yaml(
            "camera:\n  - platform: fake\n    name: a\n  - platform: fake\n    name: b\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_relative_camera_directory_rejected() {
        let err = Root::load_yaml("camera:\n  - platform: fake\n    name: a\n    directory: rel\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_rotation_rejected() {
        let err = Root::load_yaml("camera:\n  - platform: fake\n    name: a\n    rotation: 45\n");
        assert!(err.is_err());
        let ok = Root::load_yaml("camera:\n  - platform: fake\n    name: a\n    rotation: 270\n");
        assert!(ok.is_ok());
    }

    #[test]
    fn test_pin_modes() {
        let cfg = Root::load_yaml(
            "binary_sensor:\n  - platform: gpio\n    name: m\n    pin:\n      number: \"17\"\n      mode: INPUT_PULLUP\n      inverted: true\n",
        )
        .unwrap();
        let pin = &cfg.binary_sensors[0].pin;
        assert_eq!(pin.mode, PinMode::InputPullup);
        assert!(pin.inverted);
        assert!(pin.mode.is_input());
        assert!(!PinMode::Output.is_input());

        let err = Root::load_yaml(
            "binary_sensor:\n  - platform: gpio\n    name: m\n    pin:\n      mode: SIDEWAYS\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
