//! mDNS service advertisement.
//!
//! Publishes `_esphomelib._tcp.local.` so controllers on the LAN discover
//! the node without configuration, with TXT records for the reachable
//! hostname, the implementation version and the MAC address when one was
//! found. The node suppresses advertisement for loopback test binds; see
//! [`crate::node::NodeOptions`].

use crate::error::{Error, Result};

const SERVICE_TYPE: &str = "_esphomelib._tcp";

/// A running advertisement. Dropping it withdraws the service.
pub struct Advertiser {
    // Field order matters: the service must be unregistered before the
    // responder thread goes away.
    _service: libmdns::Service,
    _responder: libmdns::Responder,
}

impl Advertiser {
    /// Start advertising `instance` (the node name) on `port`.
    pub fn start(instance: &str, port: u16, txt: &[String]) -> Result<Advertiser> {
        let responder = libmdns::Responder::new()
            .map_err(|e| Error::Other(format!("mdns responder: {}", e)))?;
        let txt: Vec<&str> = txt.iter().map(String::as_str).collect();
        let service = responder.register(SERVICE_TYPE.to_owned(), instance.to_owned(), port, &txt);
        log::info!(
            "mdns: advertising {} as {:?} on port {}",
            SERVICE_TYPE,
            instance,
            port
        );
        Ok(Advertiser {
            _service: service,
            _responder: responder,
        })
    }
}
