//! Host identity: MAC address and hostname.
//!
//! Read from `/sys/class/net` and `/proc/sys/kernel/hostname`; this daemon
//! targets Linux single-board computers, where both are always present.

use std::fs;
use std::path::Path;

/// The MAC address of the first plausible LAN interface.
///
/// Loopback and interfaces without a hardware address are skipped, as are
/// administratively down ones. Interfaces are scanned in name order, which
/// puts `eth0`/`wlan0` ahead of virtual adapters like `docker0`... mostly;
/// picking "the" address of a multi-homed host is guesswork either way.
pub fn main_mac() -> Option<String> {
    let mut names: Vec<String> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        if name == "lo" {
            continue;
        }
        let dir = Path::new("/sys/class/net").join(&name);
        let mac = match fs::read_to_string(dir.join("address")) {
            Ok(s) => s.trim().to_owned(),
            Err(_) => continue,
        };
        if mac.is_empty() || mac == "00:00:00:00:00:00" {
            continue;
        }
        if let Ok(state) = fs::read_to_string(dir.join("operstate")) {
            if state.trim() == "down" {
                continue;
            }
        }
        return Some(mac);
    }
    None
}

/// The kernel hostname, with a stable fallback.
pub fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "periphhome".to_owned())
}
