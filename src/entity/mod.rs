//! Entities: the addressable sensors and actuators a node exposes.
//!
//! Every entity owns an [`EntityCore`] holding its identity and the
//! subscription machinery. Producers (hardware threads, timers) push state
//! through [`EntityCore::publish`]; each connected client that subscribed
//! gets its own bounded queue and a dedicated sender thread draining it.
//!
//! # Snapshot-then-stream
//!
//! Registration takes the current snapshot and inserts the subscriber queue
//! under the same lock `publish` uses, so a new subscriber sees exactly one
//! snapshot followed by every later state and no earlier one.
//!
//! # Slow subscribers
//!
//! Queues are bounded at [`SUBSCRIBER_QUEUE_DEPTH`]. `publish` never blocks:
//! a queue that is full when a state arrives gets its subscriber dropped,
//! which ends that subscriber's stream. Healthy subscribers always converge
//! on the latest state.
//!
//! # Capabilities
//!
//! Rather than one wide interface where every entity stubs out every
//! command, [`Entity`] exposes per-kind capability accessors
//! ([`Entity::as_light`] and friends) returning `None` for unsupported
//! kinds; the dispatcher turns `None` into the protocol's
//! `"<name> is no <kind>"` error.

mod binary_sensor;
mod camera;
mod light;
mod sensor;

pub use binary_sensor::{FakeBinarySensor, GpioBinarySensor};
pub use camera::FakeCamera;
pub use light::FakeLight;
pub use sensor::{FakeSensor, WifiSignalSensor};

use crate::api::proto;
use crate::api::registry::Response;
use crate::cancel::{CancelToken, Canceller};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Bound of each subscriber queue.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 8;

/// The fixed set of entity kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    BinarySensor,
    Camera,
    Climate,
    Cover,
    Fan,
    Light,
    Sensor,
    Switch,
    TextSensor,
}

impl EntityKind {
    /// The tag embedded in unique ids.
    pub fn tag(self) -> &'static str {
        match self {
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Camera => "camera",
            EntityKind::Climate => "climate",
            EntityKind::Cover => "cover",
            EntityKind::Fan => "fan",
            EntityKind::Light => "light",
            EntityKind::Sensor => "sensor",
            EntityKind::Switch => "switch",
            EntityKind::TextSensor => "text_sensor",
        }
    }
}

/// Identity of an entity, fixed at construction.
#[derive(Debug, Clone)]
pub struct Identity {
    /// User-visible name from the configuration.
    pub name: String,
    pub kind: EntityKind,
    /// `name` lowercased and stripped to `[a-z0-9_-]`.
    pub object_id: String,
    /// `node_name ‖ kind_tag ‖ object_id`.
    pub unique_id: String,
    /// 32-bit hash of `object_id`, the compact on-wire address.
    pub key: u32,
}

impl Identity {
    /// Derive the identity for an entity name.
    pub fn derive(node_name: &str, name: &str, kind: EntityKind) -> Result<Identity> {
        if name.is_empty() {
            return Err(Error::BadName(name.to_owned()));
        }
        let object_id = derive_object_id(name);
        if object_id.is_empty() {
            return Err(Error::BadName(name.to_owned()));
        }
        let unique_id = format!("{}{}{}", node_name, kind.tag(), object_id);
        let key = normalize_key(fnv1_32(object_id.as_bytes()));
        Ok(Identity {
            name: name.to_owned(),
            kind,
            object_id,
            unique_id,
            key,
        })
    }
}

/// Filter a name down to `[a-z0-9_-]`, lowercasing ASCII letters and
/// dropping everything else. Note that spaces are dropped, not replaced;
/// the resulting ids feed the key hash, so this mapping is frozen.
pub(crate) fn derive_object_id(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            _ => None,
        })
        .collect()
}

/// 32-bit FNV-1 (multiply, then xor).
pub(crate) fn fnv1_32(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h = h.wrapping_mul(16_777_619);
        h ^= u32::from(b);
    }
    h
}

/// Key 0 is reserved on the client side; it is substituted with 1.
pub(crate) fn normalize_key(key: u32) -> u32 {
    if key == 0 {
        1
    } else {
        key
    }
}

/// One state broadcast, tagged by entity kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    BinarySensor(proto::BinarySensorStateResponse),
    Sensor(proto::SensorStateResponse),
    Light(proto::LightStateResponse),
    Camera(proto::CameraImageResponse),
}

impl From<StateUpdate> for Response {
    fn from(update: StateUpdate) -> Response {
        match update {
            StateUpdate::BinarySensor(m) => Response::BinarySensorState(m),
            StateUpdate::Sensor(m) => Response::SensorState(m),
            StateUpdate::Light(m) => Response::LightState(m),
            StateUpdate::Camera(m) => Response::CameraImage(m),
        }
    }
}

/// Where subscription output goes: one serialized frame writer per
/// connection.
pub trait ReplySink: Send + Sync {
    fn reply(&self, msg: Response) -> Result<()>;
}

struct SubscriberTable {
    current: Option<StateUpdate>,
    next_id: u64,
    queues: HashMap<u64, Sender<StateUpdate>>,
}

/// Identity plus the snapshot/fan-out state shared by all entity kinds.
pub struct EntityCore {
    identity: Identity,
    table: Mutex<SubscriberTable>,
}

impl EntityCore {
    pub fn new(identity: Identity) -> Self {
        EntityCore {
            identity,
            table: Mutex::new(SubscriberTable {
                current: None,
                next_id: 0,
                queues: HashMap::new(),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key(&self) -> u32 {
        self.identity.key
    }

    /// The table lock never protects anything that can be left
    /// half-updated, so a poisoned lock is still usable.
    fn table(&self) -> MutexGuard<'_, SubscriberTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The last published state, if any.
    pub fn snapshot(&self) -> Option<StateUpdate> {
        self.table().current.clone()
    }

    /// Record a new state and enqueue it to every subscriber.
    ///
    /// Runs entirely under the entity lock so registration sees a consistent
    /// cut. Never blocks: a subscriber whose queue is full is dropped.
    pub fn publish(&self, update: StateUpdate) {
        let mut table = self.table();
        table.current = Some(update.clone());
        table.queues.retain(|id, queue| match queue.try_send(update.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "{}: dropping slow subscriber {}",
                    self.identity.object_id,
                    id
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Register a subscriber: its queue plus the snapshot taken at the same
    /// instant.
    pub(crate) fn register(&self) -> (u64, Receiver<StateUpdate>, Option<StateUpdate>) {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE_DEPTH);
        let mut table = self.table();
        let id = table.next_id;
        table.next_id += 1;
        table.queues.insert(id, tx);
        (id, rx, table.current.clone())
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.table().queues.remove(&id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.table().queues.len()
    }

    /// Stream states into `sink` until cancelled or the sink fails.
    ///
    /// Blocks; callers run it on its own thread. The snapshot (when one
    /// exists) is written first, then every subsequent state.
    pub fn subscribe(&self, token: &CancelToken, sink: &dyn ReplySink) {
        let (id, rx, snapshot) = self.register();
        if let Some(snapshot) = snapshot {
            if sink.reply(snapshot.into()).is_err() {
                self.unregister(id);
                return;
            }
        }
        while let Some(update) = token.recv_or_cancelled(&rx) {
            if sink.reply(update.into()).is_err() {
                break;
            }
        }
        self.unregister(id);
    }
}

/// A closable producer thread, joined exactly once.
pub(crate) struct ProducerHandle {
    canceller: Canceller,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProducerHandle {
    /// Spawn a named producer thread running `body` with a child token.
    pub(crate) fn spawn<F>(name: &str, parent: &CancelToken, body: F) -> Result<ProducerHandle>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let (canceller, token) = parent.child();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(token))?;
        Ok(ProducerHandle {
            canceller,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the producer and wait for it to finish.
    pub(crate) fn stop(&self) {
        self.canceller.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("producer thread panicked");
            }
        }
    }
}

/// A single addressable entity.
///
/// `close` must stop and join any producer threads; it is called in reverse
/// construction order during node teardown and must be idempotent.
pub trait Entity: Send + Sync {
    fn core(&self) -> &EntityCore;

    /// The per-kind `ListEntities*Response` describing this entity.
    fn describe(&self) -> Response;

    fn close(&self) -> Result<()>;

    // Capability accessors; `None` means the kind is unsupported.
    fn as_cover(&self) -> Option<&dyn CoverCommands> {
        None
    }
    fn as_fan(&self) -> Option<&dyn FanCommands> {
        None
    }
    fn as_light(&self) -> Option<&dyn LightCommands> {
        None
    }
    fn as_switch(&self) -> Option<&dyn SwitchCommands> {
        None
    }
    fn as_climate(&self) -> Option<&dyn ClimateCommands> {
        None
    }
    fn as_camera(&self) -> Option<&dyn CameraStream> {
        None
    }
}

pub trait CoverCommands: Send + Sync {
    fn cover_command(&self, req: &proto::CoverCommandRequest) -> Result<()>;
}

pub trait FanCommands: Send + Sync {
    fn fan_command(&self, req: &proto::FanCommandRequest) -> Result<()>;
}

pub trait LightCommands: Send + Sync {
    fn light_command(&self, req: &proto::LightCommandRequest) -> Result<()>;
}

pub trait SwitchCommands: Send + Sync {
    fn switch_command(&self, req: &proto::SwitchCommandRequest) -> Result<()>;
}

pub trait ClimateCommands: Send + Sync {
    fn climate_command(&self, req: &proto::ClimateCommandRequest) -> Result<()>;
}

/// The camera delivery sub-protocol; see [`camera`](self::camera).
pub trait CameraStream: Send + Sync {
    /// Serve one `CameraImageRequest`: the current image, then, for stream
    /// requests, every new image for the stream window. Blocks.
    fn camera_stream(&self, token: &CancelToken, sink: &dyn ReplySink, req: &proto::CameraImageRequest);
}

/// Collects replies in memory; the sink used by entity unit tests.
#[cfg(test)]
pub(crate) struct RecordingSink {
    pub replies: Mutex<Vec<Response>>,
    pub fail_after: Option<usize>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn new() -> Self {
        RecordingSink {
            replies: Mutex::new(Vec::new()),
            fail_after: None,
        }
    }
}

#[cfg(test)]
impl ReplySink for RecordingSink {
    fn reply(&self, msg: Response) -> Result<()> {
        let mut replies = self.replies.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if replies.len() >= limit {
                return Err(Error::Disconnected);
            }
        }
        replies.push(msg);
        Ok(())
    }
}
