//! Install the node as a systemd service.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

const UNIT_PATH: &str = "/etc/systemd/system/periphhome.service";

/// Install the daemon to start on boot. Only systemd hosts are supported.
pub fn install(config_path: &Path) -> Result<()> {
    if !Path::new("/run/systemd/system").exists() {
        return Err(Error::Other(
            "only systemd-based systems are supported for install".into(),
        ));
    }
    let exe = std::env::current_exe()?;
    let unit = render_unit(&exe.display().to_string(), &config_path.display().to_string());

    // Write the unit with sudo so the daemon itself can run unprivileged.
    let mut tee = Command::new("sudo")
        .args(["tee", UNIT_PATH])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()?;
    tee.stdin
        .as_mut()
        .expect("stdin was piped")
        .write_all(unit.as_bytes())?;
    run_checked(&mut tee)?;

    for args in [
        &["systemctl", "daemon-reload"][..],
        &["systemctl", "enable", "periphhome.service"][..],
    ] {
        let mut cmd = Command::new("sudo").args(args).spawn()?;
        run_checked(&mut cmd)?;
    }
    println!("Run \"sudo systemctl start periphhome.service\" to start the node or reboot.");
    Ok(())
}

fn run_checked(child: &mut std::process::Child) -> Result<()> {
    let status = child.wait()?;
    if !status.success() {
        return Err(Error::Other(format!("command failed: {}", status)));
    }
    Ok(())
}

fn render_unit(exe: &str, config: &str) -> String {
    format!(
        r#"[Unit]
Description=Runs periphhome automatically upon boot
Wants=network-online.target
After=network-online.target

[Service]
User=pi
Group=pi
KillMode=mixed
Restart=always
TimeoutStopSec=20s
ExecStart={exe} {config} run
Environment=PERIPHHOME_SHUTDOWN_PANIC=1

# Allow binding to privileged ports without running as root.
AmbientCapabilities=CAP_NET_BIND_SERVICE

[Install]
WantedBy=default.target
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_contents() {
        let unit = render_unit("/usr/local/bin/periphhome", "/etc/periphhome.yaml");
        assert!(unit.contains("ExecStart=/usr/local/bin/periphhome /etc/periphhome.yaml run"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("WantedBy=default.target"));
    }
}
