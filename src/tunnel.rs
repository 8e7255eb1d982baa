//! VPN tunnel gateway
//!
//! The FTP mailbox is only reachable through a preconfigured system VPN
//! connection. Each platform brings its own command set, modeled as a
//! [`TunnelDriver`]; the [`VpnGateway`] drives whichever one was selected at
//! startup. Commands run with a bounded timeout and a timeout counts as a
//! failed command, never a crash.

use crate::config::{VpnConfig, NETWORK_TIMEOUT};
use crate::error::{PipelineError, Result};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Interval the gateway waits after a successful connect for routing to
/// stabilize before the first FTP packet.
const SETTLE_INTERVAL: Duration = Duration::from_secs(3);

/// Poll granularity of the bounded command wait.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observed tunnel state. The liveness probe runs on every connect call; the
/// tunnel can drop externally, so this is never trusted across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Unknown,
    Connected,
    Disconnected,
}

/// Per-platform command templates for the tunnel.
pub trait TunnelDriver {
    fn connect_command(&self) -> Vec<String>;
    fn disconnect_command(&self) -> Vec<String>;
    /// Liveness probe; exit status zero means the tunnel is already up.
    fn probe_command(&self) -> Vec<String>;
}

/// Windows dial-up/VPN driver (`rasdial` / `rasphone`)
pub struct RasdialDriver {
    name: String,
    username: String,
    password: String,
}

impl TunnelDriver for RasdialDriver {
    fn connect_command(&self) -> Vec<String> {
        vec![
            "rasdial".into(),
            self.name.clone(),
            self.username.clone(),
            self.password.clone(),
        ]
    }

    fn disconnect_command(&self) -> Vec<String> {
        vec!["rasphone".into(), "-h".into(), self.name.clone()]
    }

    fn probe_command(&self) -> Vec<String> {
        vec!["rasdial".into(), self.name.clone()]
    }
}

/// Linux NetworkManager driver (`nmcli`)
pub struct NmcliDriver {
    name: String,
}

impl TunnelDriver for NmcliDriver {
    fn connect_command(&self) -> Vec<String> {
        ["nmcli", "connection", "up", "id", self.name.as_str()]
            .map(String::from)
            .to_vec()
    }

    fn disconnect_command(&self) -> Vec<String> {
        ["nmcli", "connection", "down", "id", self.name.as_str()]
            .map(String::from)
            .to_vec()
    }

    fn probe_command(&self) -> Vec<String> {
        [
            "nmcli",
            "-t",
            "-f",
            "GENERAL.STATE",
            "connection",
            "show",
            "--active",
            "id",
            self.name.as_str(),
        ]
        .map(String::from)
        .to_vec()
    }
}

/// macOS driver (`networksetup`, untested upstream)
pub struct NetworksetupDriver {
    name: String,
}

impl TunnelDriver for NetworksetupDriver {
    fn connect_command(&self) -> Vec<String> {
        [
            "sudo",
            "networksetup",
            "-connectpppoeservice",
            self.name.as_str(),
        ]
        .map(String::from)
        .to_vec()
    }

    fn disconnect_command(&self) -> Vec<String> {
        [
            "sudo",
            "networksetup",
            "-disconnectpppoeservice",
            self.name.as_str(),
        ]
        .map(String::from)
        .to_vec()
    }

    fn probe_command(&self) -> Vec<String> {
        ["sudo", "networksetup", "-getinfo", self.name.as_str()]
            .map(String::from)
            .to_vec()
    }
}

/// Select the driver for the platform the binary was built for.
pub fn platform_driver(cfg: &VpnConfig) -> Result<Box<dyn TunnelDriver>> {
    if cfg!(target_os = "windows") {
        Ok(Box::new(RasdialDriver {
            name: cfg.name.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }))
    } else if cfg!(target_os = "linux") {
        Ok(Box::new(NmcliDriver {
            name: cfg.name.clone(),
        }))
    } else if cfg!(target_os = "macos") {
        Ok(Box::new(NetworksetupDriver {
            name: cfg.name.clone(),
        }))
    } else {
        Err(PipelineError::Config(
            "unsupported operating system for vpn control".to_string(),
        ))
    }
}

/// Executes tunnel commands. A seam so tests can script exit codes.
pub trait CommandRunner {
    /// Run `argv` and return its exit code; `-1` for spawn failure, timeout
    /// or a signal-terminated process.
    fn run(&mut self, argv: &[String], timeout: Duration) -> i32;
}

/// Runs commands on the host with a bounded poll-wait.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, argv: &[String], timeout: Duration) -> i32 {
        let Some((program, args)) = argv.split_first() else {
            return -1;
        };

        let mut child = match Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(command = %program, error = %e, "cannot spawn command");
                return -1;
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.code().unwrap_or(-1),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        error!(command = %program, ?timeout, "command timed out");
                        return -1;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!(command = %program, error = %e, "cannot wait on command");
                    return -1;
                }
            }
        }
    }
}

/// Network reachability gate for the whole pipeline.
pub trait Tunnel {
    /// Bring the tunnel up. Idempotent; false means unreachable, not fatal.
    fn connect(&mut self) -> bool;
    /// Tear the tunnel down. Idempotent and safe when never connected.
    fn disconnect(&mut self) -> bool;
}

pub struct VpnGateway {
    driver: Box<dyn TunnelDriver>,
    runner: Box<dyn CommandRunner>,
    timeout: Duration,
    settle: Duration,
    state: TunnelState,
}

impl VpnGateway {
    pub fn new(driver: Box<dyn TunnelDriver>) -> Self {
        Self::with_runner(driver, Box::new(SystemRunner), SETTLE_INTERVAL)
    }

    /// Construct with an injected runner and settle interval (tests).
    pub fn with_runner(
        driver: Box<dyn TunnelDriver>,
        runner: Box<dyn CommandRunner>,
        settle: Duration,
    ) -> Self {
        VpnGateway {
            driver,
            runner,
            timeout: NETWORK_TIMEOUT,
            settle,
            state: TunnelState::Unknown,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn probe(&mut self) -> bool {
        self.runner.run(&self.driver.probe_command(), self.timeout) == 0
    }
}

impl Tunnel for VpnGateway {
    fn connect(&mut self) -> bool {
        // The tunnel may have come up or dropped outside this process;
        // probe fresh on every call.
        if self.probe() {
            debug!("tunnel already up");
            self.state = TunnelState::Connected;
            return true;
        }

        let code = self.runner.run(&self.driver.connect_command(), self.timeout);
        if code == 0 {
            thread::sleep(self.settle);
            self.state = TunnelState::Connected;
            info!("tunnel connected");
            true
        } else {
            warn!(code, "tunnel connect command failed");
            false
        }
    }

    fn disconnect(&mut self) -> bool {
        let code = self
            .runner
            .run(&self.driver.disconnect_command(), self.timeout);
        self.state = TunnelState::Disconnected;
        if code == 0 {
            info!("tunnel disconnected");
            true
        } else {
            debug!(code, "tunnel disconnect command failed (may not have been up)");
            false
        }
    }
}
