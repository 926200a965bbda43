//! ICMP echo through the system `ping` binary
//!
//! Raw ICMP sockets need elevated privileges, so probes run the system binary.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// ICMP ping result
#[derive(Debug, Clone)]
pub struct PingResult {
    pub target: IpAddr,
    pub success: bool,
    pub rtt: Duration,
}

/// Sends one echo request per call
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    timeout: Duration,
}

impl IcmpPinger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(&self, target: IpAddr) -> Command {
        // `-W` takes whole seconds on Linux and milliseconds on macOS
        let wait = if cfg!(target_os = "macos") {
            self.timeout.as_millis().max(1).to_string()
        } else {
            self.timeout.as_secs().max(1).to_string()
        };

        let mut cmd = Command::new("ping");
        if target.is_ipv6() {
            cmd.arg("-6");
        }
        cmd.arg("-c")
            .arg("1")
            .arg("-W")
            .arg(wait)
            .arg(target.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Ping a host once.
    ///
    /// The child is killed if it outlives the timeout. A missing `ping` binary
    /// is an IO error; callers treat it as a failed probe.
    pub async fn ping(&self, target: IpAddr) -> std::io::Result<PingResult> {
        let start = Instant::now();
        let mut child = self.command(target).spawn()?;

        // Leave the binary a little headroom over its own wait
        let success = match tokio::time::timeout(self.timeout + Duration::from_millis(500), child.wait()).await {
            Ok(status) => status?.success(),
            Err(_) => {
                let _ = child.kill().await;
                false
            }
        };

        Ok(PingResult {
            target,
            success,
            rtt: start.elapsed(),
        })
    }
}
