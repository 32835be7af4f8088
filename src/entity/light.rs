//! Light platforms.
//!
//! `fake` drives no hardware: commands are echoed straight back as the new
//! state, which is exactly what a controller needs to treat the entity as a
//! functioning on/off light.

use super::{Entity, EntityCore, EntityKind, Identity, LightCommands, StateUpdate};
use crate::api::proto;
use crate::api::registry::Response;
use crate::cancel::CancelToken;
use crate::config;
use crate::error::Result;
use std::sync::Arc;

pub struct FakeLight {
    core: Arc<EntityCore>,
}

impl FakeLight {
    pub fn new(node_name: &str, _token: &CancelToken, cfg: &config::Light) -> Result<Self> {
        let identity = Identity::derive(node_name, &cfg.name, EntityKind::Light)?;
        let core = Arc::new(EntityCore::new(identity));
        core.publish(StateUpdate::Light(proto::LightStateResponse {
            key: core.key(),
            ..Default::default()
        }));
        Ok(FakeLight { core })
    }
}

impl Entity for FakeLight {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn describe(&self) -> Response {
        let id = self.core.identity();
        Response::ListEntitiesLight(proto::ListEntitiesLightResponse {
            object_id: id.object_id.clone(),
            key: id.key,
            name: id.name.clone(),
            unique_id: id.unique_id.clone(),
            // The fake platform supports plain on/off only.
            supports_brightness: false,
            supports_rgb: false,
            supports_white_value: false,
            supports_color_temperature: false,
            min_mireds: 0.0,
            max_mireds: 0.0,
            effects: Vec::new(),
        })
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_light(&self) -> Option<&dyn LightCommands> {
        Some(self)
    }
}

impl LightCommands for FakeLight {
    fn light_command(&self, req: &proto::LightCommandRequest) -> Result<()> {
        self.core.publish(StateUpdate::Light(proto::LightStateResponse {
            key: self.core.key(),
            state: req.state,
            brightness: req.brightness,
            red: req.red,
            green: req.green,
            blue: req.blue,
            white: req.white,
            color_temperature: req.color_temperature,
            effect: req.effect.clone(),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;

    fn cfg() -> config::Light {
        config::Light {
            platform: "fake".into(),
            name: "fake light".into(),
            num_leds: 0,
        }
    }

    #[test]
    fn test_initial_state_and_describe() {
        let (_canceller, token) = cancel::root();
        let light = FakeLight::new("pi", &token, &cfg()).unwrap();
        match light.core().snapshot() {
            Some(StateUpdate::Light(m)) => {
                assert_eq!(m.key, 2124765894);
                assert!(!m.state);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
        match light.describe() {
            Response::ListEntitiesLight(m) => {
                assert_eq!(m.object_id, "fakelight");
                assert_eq!(m.unique_id, "pilightfakelight");
                assert!(!m.supports_brightness);
            }
            other => panic!("unexpected describe {:?}", other),
        }
    }

    #[test]
    fn test_command_echoes_state() {
        let (_canceller, token) = cancel::root();
        let light = FakeLight::new("pi", &token, &cfg()).unwrap();
        let sink = light.as_light().unwrap();
        sink.light_command(&proto::LightCommandRequest {
            key: 2124765894,
            has_state: true,
            state: true,
            has_brightness: true,
            brightness: 0.5,
            has_rgb: true,
            red: 1.0,
            green: 0.25,
            blue: 0.0,
            ..Default::default()
        })
        .unwrap();
        match light.core().snapshot() {
            Some(StateUpdate::Light(m)) => {
                assert!(m.state);
                assert_eq!(m.brightness, 0.5);
                assert_eq!(m.red, 1.0);
                assert_eq!(m.green, 0.25);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[test]
    fn test_other_capabilities_absent() {
        let (_canceller, token) = cancel::root();
        let light = FakeLight::new("pi", &token, &cfg()).unwrap();
        assert!(light.as_switch().is_none());
        assert!(light.as_camera().is_none());
        assert!(light.as_climate().is_none());
    }
}
