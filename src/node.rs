//! The node: entity set, native API acceptor, discovery, shutdown.
//!
//! Entities are constructed in declaration order (binary sensors, sensors,
//! lights, cameras); a failure midway closes what was already built and
//! aborts. Teardown runs in the exact reverse order: discovery first, then
//! the acceptor, then every entity, and finally a wait for all threads the
//! node ever spawned.

use crate::api::connection;
use crate::cancel::{CancelToken, Canceller};
use crate::config;
use crate::entity::{
    Entity, FakeBinarySensor, FakeCamera, FakeLight, FakeSensor, GpioBinarySensor, WifiSignalSensor,
};
use crate::error::{Error, Result};
use crate::{hostinfo, mdns};
use crossbeam_channel::{bounded, RecvTimeoutError};
use crossbeam_utils::sync::WaitGroup;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll period of the non-blocking accept loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// With this environment variable set, a shutdown taking longer than a
/// minute panics instead of hanging silently.
const SHUTDOWN_WATCHDOG_ENV: &str = "PERIPHHOME_SHUTDOWN_PANIC";

const SHUTDOWN_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Knobs that are not part of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Host to bind the API listener to. Empty means all interfaces;
    /// tests inject `127.0.0.1`, which also suppresses mDNS.
    pub bind_host: String,
}

/// State shared between the node and its connection threads.
pub(crate) struct Shared {
    pub cfg: config::Root,
    pub mac: String,
    /// Declaration order; drives list-entities replies.
    pub entities: Vec<Arc<dyn Entity>>,
    /// Command routing by on-wire key.
    pub lookup: HashMap<u32, Arc<dyn Entity>>,
}

/// A running node.
pub struct Node {
    shared: Arc<Shared>,
    mdns: Option<mdns::Advertiser>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    canceller: Canceller,
    wg: WaitGroup,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Node {
    /// Build every configured entity, bind the API listener and start
    /// advertising.
    pub fn new(parent: &CancelToken, cfg: config::Root, opts: NodeOptions) -> Result<Node> {
        let (canceller, token) = parent.child();
        let mac = hostinfo::main_mac().unwrap_or_default();

        let mut entities: Vec<Arc<dyn Entity>> = Vec::new();
        let mut lookup: HashMap<u32, Arc<dyn Entity>> = HashMap::new();

        // On any construction error, close what exists in reverse order and
        // surface the original error.
        let build = |entities: &mut Vec<Arc<dyn Entity>>,
                     lookup: &mut HashMap<u32, Arc<dyn Entity>>|
         -> Result<()> {
            let node_name = cfg.periphhome.name.clone();
            for c in &cfg.binary_sensors {
                log::info!("loading binary_sensor {}", c.platform);
                let entity: Arc<dyn Entity> = match c.platform.as_str() {
                    "fake" => Arc::new(FakeBinarySensor::new(&node_name, &token, c)?),
                    "gpio" => Arc::new(GpioBinarySensor::new(&node_name, &token, c)?),
                    other => {
                        return Err(Error::Config(format!(
                            "binary_sensor({}): unknown platform {:?}",
                            c.name, other
                        )))
                    }
                };
                add_entity(entities, lookup, entity)?;
            }
            for c in &cfg.sensors {
                log::info!("loading sensor {}", c.platform);
                let entity: Arc<dyn Entity> = match c.platform.as_str() {
                    "fake" => Arc::new(FakeSensor::new(&node_name, &token, c)?),
                    "wifi_signal" => Arc::new(WifiSignalSensor::new(&node_name, &token, c)?),
                    other => {
                        return Err(Error::Config(format!(
                            "sensor({}): unknown platform {:?}",
                            c.name, other
                        )))
                    }
                };
                add_entity(entities, lookup, entity)?;
            }
            for c in &cfg.lights {
                log::info!("loading light {}", c.platform);
                let entity: Arc<dyn Entity> = match c.platform.as_str() {
                    "fake" => Arc::new(FakeLight::new(&node_name, &token, c)?),
                    other => {
                        return Err(Error::Config(format!(
                            "light({}): unknown platform {:?}",
                            c.name, other
                        )))
                    }
                };
                add_entity(entities, lookup, entity)?;
            }
            for c in &cfg.cameras {
                log::info!("loading camera {}", c.platform);
                let entity: Arc<dyn Entity> = match c.platform.as_str() {
                    "fake" => Arc::new(FakeCamera::new(&node_name, &token, c)?),
                    other => {
                        return Err(Error::Config(format!(
                            "camera({}): unknown platform {:?}",
                            c.name, other
                        )))
                    }
                };
                add_entity(entities, lookup, entity)?;
            }
            Ok(())
        };
        if let Err(e) = build(&mut entities, &mut lookup) {
            close_entities(&entities);
            return Err(e);
        }

        let shared = Arc::new(Shared {
            cfg,
            mac,
            entities,
            lookup,
        });
        let wg = WaitGroup::new();

        // Native API server.
        let mut accept_thread = None;
        let mut local_addr = None;
        let port = match &shared.cfg.api {
            Some(api) => {
                let port = api.effective_port();
                let host = if opts.bind_host.is_empty() {
                    "0.0.0.0"
                } else {
                    opts.bind_host.as_str()
                };
                let bind = || -> std::io::Result<(TcpListener, SocketAddr)> {
                    let listener = TcpListener::bind((host, port))?;
                    let addr = listener.local_addr()?;
                    listener.set_nonblocking(true)?;
                    Ok((listener, addr))
                };
                let (listener, addr) = match bind() {
                    Ok(ok) => ok,
                    Err(e) => {
                        close_entities(&shared.entities);
                        return Err(Error::Other(format!("failed to start api server: {}", e)));
                    }
                };
                log::info!("api server listening on {}", addr);
                local_addr = Some(addr);
                let spawned = {
                    let shared = Arc::clone(&shared);
                    let token = token.clone();
                    let wg = wg.clone();
                    thread::Builder::new()
                        .name("api-accept".into())
                        .spawn(move || accept_loop(listener, shared, token, wg))
                };
                match spawned {
                    Ok(handle) => accept_thread = Some(handle),
                    Err(e) => {
                        close_entities(&shared.entities);
                        return Err(Error::Io(e));
                    }
                }
                addr.port()
            }
            None => config::DEFAULT_API_PORT,
        };

        // Discovery is skipped for overridden binds: tests run on the
        // loopback and advertising there would only trip firewalls.
        let mdns = if opts.bind_host.is_empty() {
            let hostname = hostinfo::hostname();
            let mut txt = vec![
                format!("address={}.local", hostname),
                format!("version={}", crate::VERSION),
            ];
            if !shared.mac.is_empty() {
                txt.push(format!("mac={}", shared.mac.replace(':', "")));
            }
            log::info!("advertising via mdns {:?}", txt);
            match mdns::Advertiser::start(&shared.cfg.periphhome.name, port, &txt) {
                Ok(adv) => Some(adv),
                Err(e) => {
                    close_entities(&shared.entities);
                    return Err(Error::Other(format!("failed to advertise with mdns: {}", e)));
                }
            }
        } else {
            None
        };

        Ok(Node {
            shared,
            mdns,
            accept_thread,
            local_addr,
            canceller,
            wg,
        })
    }

    /// Address the API listener is bound to, when the API is enabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shut everything down in reverse construction order and wait for all
    /// node threads. Returns the first close error encountered.
    pub fn close(mut self) -> Result<()> {
        let mut first_err = None;

        if let Some(mdns) = self.mdns.take() {
            log::info!("shutting down mdns");
            drop(mdns);
        }

        self.canceller.cancel();
        if let Some(handle) = self.accept_thread.take() {
            log::info!("shutting down api");
            if handle.join().is_err() {
                first_err.get_or_insert(Error::Other("accept thread panicked".into()));
            }
        }

        for entity in self.shared.entities.iter().rev() {
            log::info!("closing {}", entity.core().identity().name);
            if let Err(e) = entity.close() {
                first_err.get_or_insert(e);
            }
        }

        log::info!("waiting for connection threads");
        let watchdog = arm_shutdown_watchdog();
        // All other WaitGroup clones live in threads that the cancellation
        // above unblocks; this drops the last non-thread clone and waits.
        self.wg.wait();
        drop(watchdog);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn add_entity(
    entities: &mut Vec<Arc<dyn Entity>>,
    lookup: &mut HashMap<u32, Arc<dyn Entity>>,
    entity: Arc<dyn Entity>,
) -> Result<()> {
    let id = entity.core().identity();
    if let Some(existing) = lookup.get(&id.key) {
        let err = Error::Config(format!(
            "entities {:?} and {:?} hash to the same key {:#010x}; rename one",
            existing.core().identity().name,
            id.name,
            id.key,
        ));
        // The newcomer is already initialised; shut its producers down.
        let _ = entity.close();
        return Err(err);
    }
    lookup.insert(id.key, Arc::clone(&entity));
    entities.push(entity);
    Ok(())
}

fn close_entities(entities: &[Arc<dyn Entity>]) {
    for entity in entities.iter().rev() {
        if let Err(e) = entity.close() {
            log::error!("closing {}: {}", entity.core().identity().name, e);
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, token: CancelToken, wg: WaitGroup) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("new connection: {}", peer);
                let shared = Arc::clone(&shared);
                let (conn_canceller, conn_token) = token.child();
                let conn_wg = wg.clone();
                let spawned = thread::Builder::new()
                    .name(format!("api-conn-{}", peer))
                    .spawn(move || {
                        // Dropping the canceller on exit tears down any
                        // subscription threads of this connection.
                        let _conn_canceller = conn_canceller;
                        connection::handle(stream, peer, shared, conn_token, conn_wg);
                    });
                if let Err(e) = spawned {
                    log::error!("failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if token.wait_timeout(ACCEPT_POLL_INTERVAL) {
                    return;
                }
            }
            Err(e) => {
                log::error!("accept failed: {}", e);
                return;
            }
        }
    }
}

/// When enabled via the environment, panic if shutdown stalls; meant for
/// catching leaked threads in development and under systemd. Dropping the
/// returned sender disarms the watchdog.
fn arm_shutdown_watchdog() -> Option<crossbeam_channel::Sender<()>> {
    if std::env::var_os(SHUTDOWN_WATCHDOG_ENV).is_none() {
        return None;
    }
    let (disarm_tx, disarm_rx) = bounded::<()>(0);
    let _ = thread::Builder::new()
        .name("shutdown-watchdog".into())
        .spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = disarm_rx.recv_timeout(SHUTDOWN_WATCHDOG_TIMEOUT)
            {
                panic!("node shutdown took longer than {:?}", SHUTDOWN_WATCHDOG_TIMEOUT)
            }
        });
    Some(disarm_tx)
}
