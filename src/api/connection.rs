//! One native API connection.
//!
//! A connection is a single reader loop that decodes frames and dispatches
//! them synchronously; handlers that need to outlive the dispatch
//! (subscriptions, camera streams) spawn their own threads. All outbound
//! frames funnel through one [`ConnWriter`] that serialises and writes each
//! frame in a single call, so interleaved subscription fan-out can never
//! tear a frame.
//!
//! The session runs through three phases. A fresh connection accepts only
//! `HelloRequest`; after the hello only `ConnectRequest`; a successful
//! password check unlocks the full dispatch table. On cancellation the
//! connection announces `DisconnectRequest` and gives the peer five seconds
//! to answer before the socket is dropped.

use crate::api::frame::{self, Frame};
use crate::api::proto;
use crate::api::registry::{Request, Response};
use crate::cancel::CancelToken;
use crate::entity::{Entity, EntityKind, ReplySink};
use crate::error::{Error, Result};
use crate::node::Shared;
use crossbeam_utils::sync::WaitGroup;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Granularity at which a blocked read re-checks cancellation.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a cancelled connection waits for the peer's
/// `DisconnectResponse`.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The serialised write half, shared with subscription threads.
pub(crate) struct ConnWriter {
    stream: Mutex<TcpStream>,
}

impl ReplySink for ConnWriter {
    fn reply(&self, msg: Response) -> Result<()> {
        let payload = msg.encode_payload();
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| Error::Other("writer lock poisoned".into()))?;
        frame::write_frame(&mut *stream, msg.wire_id(), &payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Greeting,
    Authenticating,
    Active,
}

/// Run one connection to completion. Spawned per accepted socket.
pub(crate) fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    token: CancelToken,
    wg: WaitGroup,
) {
    let writer = match stream.try_clone() {
        Ok(w) => Arc::new(ConnWriter {
            stream: Mutex::new(w),
        }),
        Err(e) => {
            log::error!("{}: failed to clone stream: {}", peer, e);
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
        log::error!("{}: failed to set read timeout: {}", peer, e);
        return;
    }
    let _ = stream.set_nodelay(true);

    let mut conn = Connection {
        reader: stream,
        writer,
        shared,
        token,
        wg,
        peer,
        phase: Phase::Greeting,
    };
    conn.run();
}

struct Connection {
    reader: TcpStream,
    writer: Arc<ConnWriter>,
    shared: Arc<Shared>,
    token: CancelToken,
    wg: WaitGroup,
    peer: SocketAddr,
    phase: Phase,
}

impl Connection {
    fn run(&mut self) {
        loop {
            if self.token.is_cancelled() {
                self.drain();
                return;
            }
            match frame::read_frame(&mut self.reader) {
                Ok(Some(frame)) => match self.dispatch(frame) {
                    Ok(()) => {}
                    Err(Error::Disconnected) => {
                        // Orderly goodbye after a DisconnectRequest.
                        log::debug!("{}: disconnected", self.peer);
                        return;
                    }
                    Err(e) if e.closes_connection() => {
                        log::error!("{}: {}", self.peer, e);
                        return;
                    }
                    Err(e) => log::error!("{}: {}", self.peer, e),
                },
                Ok(None) => {} // idle poll tick
                Err(Error::Disconnected) => {
                    log::debug!("{}: connection closed", self.peer);
                    return;
                }
                Err(e) => {
                    log::error!("{}: read failed: {}", self.peer, e);
                    return;
                }
            }
        }
    }

    /// Announce shutdown and give the peer a bounded chance to acknowledge.
    fn drain(&mut self) {
        if self
            .writer
            .reply(Response::DisconnectRequest(proto::DisconnectRequest {}))
            .is_err()
        {
            return;
        }
        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while Instant::now() < deadline {
            match frame::read_frame(&mut self.reader) {
                // The next frame is the acknowledgement (or close); done
                // either way.
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => {}
            }
        }
        log::debug!("{}: no disconnect acknowledgement", self.peer);
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let request = Request::decode(frame.id, &frame.payload)?;
        log::debug!("{}: {}", self.peer, request.name());
        match self.phase {
            Phase::Greeting => match request {
                Request::Hello(req) => self.on_hello(&req),
                _ => Err(Error::Protocol("expected HelloRequest")),
            },
            Phase::Authenticating => match request {
                Request::Connect(req) => self.on_connect(&req),
                _ => Err(Error::Protocol("expected ConnectRequest")),
            },
            Phase::Active => self.dispatch_active(request),
        }
    }

    fn dispatch_active(&mut self, request: Request) -> Result<()> {
        match request {
            // A well-behaved peer only sends these before authenticating,
            // but re-greeting is harmless.
            Request::Hello(req) => self.on_hello(&req),
            Request::Connect(req) => self.on_connect(&req),

            Request::Disconnect(_) => {
                self.writer
                    .reply(Response::DisconnectResponse(proto::DisconnectResponse {}))?;
                // Tell the run loop the connection is over.
                Err(Error::Disconnected)
            }
            // Acknowledgements of our own keepalive traffic.
            Request::DisconnectResponse(_) | Request::PingResponse(_) | Request::GetTimeResponse(_) => Ok(()),

            Request::Ping(_) => self.writer.reply(Response::Ping(proto::PingResponse {})),
            Request::DeviceInfo(_) => self.on_device_info(),
            Request::ListEntities(_) => self.on_list_entities(),
            Request::SubscribeStates(_) => self.on_subscribe_states(),
            Request::GetTime(_) => self.writer.reply(Response::GetTime(proto::GetTimeResponse {
                epoch_seconds: unix_time(),
            })),

            // Features this node does not carry; acknowledged by doing
            // nothing so the client session stays healthy.
            Request::SubscribeLogs(_)
            | Request::SubscribeHomeassistantServices(_)
            | Request::SubscribeHomeAssistantStates(_)
            | Request::HomeAssistantState(_) => Ok(()),

            Request::ExecuteService(_) => Err(Error::NotImplemented("ExecuteService")),

            Request::CoverCommand(req) => {
                let entity = self.entity_by_key(req.key)?;
                match entity.as_cover() {
                    Some(c) => c.cover_command(&req),
                    None => Err(no_such(entity, "cover")),
                }
            }
            Request::FanCommand(req) => {
                let entity = self.entity_by_key(req.key)?;
                match entity.as_fan() {
                    Some(f) => f.fan_command(&req),
                    None => Err(no_such(entity, "fan")),
                }
            }
            Request::LightCommand(req) => {
                let entity = self.entity_by_key(req.key)?;
                match entity.as_light() {
                    Some(l) => l.light_command(&req),
                    None => Err(no_such(entity, "light")),
                }
            }
            Request::SwitchCommand(req) => {
                let entity = self.entity_by_key(req.key)?;
                match entity.as_switch() {
                    Some(s) => s.switch_command(&req),
                    None => Err(no_such(entity, "switch")),
                }
            }
            Request::ClimateCommand(req) => {
                let entity = self.entity_by_key(req.key)?;
                match entity.as_climate() {
                    Some(c) => c.climate_command(&req),
                    None => Err(no_such(entity, "climate")),
                }
            }

            Request::CameraImage(req) => self.on_camera_image(req),
        }
    }

    fn on_hello(&mut self, req: &proto::HelloRequest) -> Result<()> {
        log::debug!("{}: hello from {:?}", self.peer, req.client_info);
        self.writer.reply(Response::Hello(proto::HelloResponse {
            api_version_major: 1,
            api_version_minor: 3,
            server_info: "periphhome".into(),
        }))?;
        if self.phase == Phase::Greeting {
            self.phase = Phase::Authenticating;
        }
        Ok(())
    }

    fn on_connect(&mut self, req: &proto::ConnectRequest) -> Result<()> {
        let expected = self
            .shared
            .cfg
            .api
            .as_ref()
            .map(|a| a.password.as_str())
            .unwrap_or("");
        let invalid = !constant_time_eq(expected.as_bytes(), req.password.as_bytes());
        self.writer
            .reply(Response::Connect(proto::ConnectResponse {
                invalid_password: invalid,
            }))?;
        if invalid {
            return Err(Error::AuthFailed);
        }
        self.phase = Phase::Active;
        Ok(())
    }

    fn on_device_info(&mut self) -> Result<()> {
        let cfg = &self.shared.cfg;
        let uses_password = cfg
            .api
            .as_ref()
            .map(|a| !a.password.is_empty())
            .unwrap_or(false);
        self.writer.reply(Response::DeviceInfo(proto::DeviceInfoResponse {
            uses_password,
            name: cfg.periphhome.name.clone(),
            mac_address: self.shared.mac.clone(),
            esphome_version: format!("PeriphHome {}", crate::VERSION),
            // The comment rides in this field; there is no compiler here.
            compilation_time: cfg.periphhome.comment.clone(),
            model: std::env::consts::OS.to_owned(),
            has_deep_sleep: false,
        }))
    }

    fn on_list_entities(&mut self) -> Result<()> {
        for entity in &self.shared.entities {
            self.writer.reply(entity.describe())?;
        }
        self.writer
            .reply(Response::ListEntitiesDone(proto::ListEntitiesDoneResponse {}))
    }

    /// Subscribe to *all* states; the protocol has no partial subscription.
    /// The spawned senders outlive this handler and end with the
    /// connection.
    fn on_subscribe_states(&mut self) -> Result<()> {
        for entity in &self.shared.entities {
            if entity.core().identity().kind == EntityKind::Camera {
                // Cameras are served through their own request.
                continue;
            }
            let entity = Arc::clone(entity);
            let writer = Arc::clone(&self.writer);
            let token = self.token.clone();
            let wg = self.wg.clone();
            thread::Builder::new()
                .name(format!("subscribe-{}", entity.core().identity().object_id))
                .spawn(move || {
                    let _wg = wg;
                    entity.core().subscribe(&token, writer.as_ref());
                })?;
        }
        Ok(())
    }

    fn on_camera_image(&mut self, req: proto::CameraImageRequest) -> Result<()> {
        // The request carries no key: the protocol allows one camera per
        // node, so the sole camera entity is found by kind.
        let Some(camera) = self
            .shared
            .entities
            .iter()
            .find(|e| e.core().identity().kind == EntityKind::Camera)
        else {
            log::error!("camera image requested but no camera is available");
            return Ok(());
        };
        let camera = Arc::clone(camera);
        let writer = Arc::clone(&self.writer);
        let token = self.token.clone();
        let wg = self.wg.clone();
        thread::Builder::new()
            .name("camera-stream".into())
            .spawn(move || {
                let _wg = wg;
                match camera.as_camera() {
                    Some(stream) => stream.camera_stream(&token, writer.as_ref(), &req),
                    None => log::error!("camera entity lacks the camera capability"),
                }
            })?;
        Ok(())
    }

    fn entity_by_key(&self, key: u32) -> Result<&Arc<dyn Entity>> {
        self.shared.lookup.get(&key).ok_or(Error::UnknownKey(key))
    }
}

fn no_such(entity: &Arc<dyn Entity>, kind: &'static str) -> Error {
    Error::NoSuchCapability {
        name: entity.core().identity().name.clone(),
        kind,
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Compare two secrets examining every byte, so timing does not reveal the
/// position of the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
