use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ViewerConfig;
use crate::error::ConnectionError;

/// Upper bound for a single probe, whatever the tick interval.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
/// Slack given to a `ping` child past the probe timeout before it is killed.
const PING_GRACE: Duration = Duration::from_millis(100);

/// Host the watchdog checks on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: String,
}

impl ProbeTarget {
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port.clone(),
        }
    }
}

/// Probe timeout for a given tick interval: short enough that a probe always
/// finishes before the next tick is due.
pub fn probe_timeout(interval: Duration) -> Duration {
    interval
        .checked_mul(3)
        .map(|d| MAX_PROBE_TIMEOUT.min(d / 4))
        .unwrap_or(MAX_PROBE_TIMEOUT)
}

/// Network reachability check with a bounded timeout.
pub trait Reachability: Send + Sync {
    fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool;
}

/// TCP connect to the RTSP port.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl TcpProbe {
    /// Name lookup on a helper thread so a stalled resolver cannot hold the
    /// probe past its timeout. A stalled lookup thread is left to finish alone.
    fn resolve(host: &str, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>, ConnectionError> {
        let (tx, rx) = mpsc::channel();
        let lookup_host = host.to_string();
        thread::spawn(move || {
            let result = (lookup_host.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            let _ = tx.send(result);
        });

        let result = rx
            .recv_timeout(timeout)
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()));
        result.map_err(|source| ConnectionError::Resolve {
            host: host.to_string(),
            port,
            source,
        })
    }

    fn try_connect(target: &ProbeTarget, timeout: Duration) -> Result<SocketAddr, ConnectionError> {
        let port: u16 = target
            .port
            .trim()
            .parse()
            .map_err(|_| ConnectionError::InvalidPort(target.port.clone()))?;
        let deadline = Instant::now() + timeout;
        let addrs = Self::resolve(&target.host, port, timeout)?;
        if addrs.is_empty() {
            return Err(ConnectionError::NoAddress {
                host: target.host.clone(),
                port,
            });
        }

        let mut last_err = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(_) => return Ok(addr),
                Err(e) => last_err = Some(e),
            }
        }
        Err(ConnectionError::Resolve {
            host: target.host.clone(),
            port,
            source: last_err.unwrap_or_else(|| std::io::ErrorKind::TimedOut.into()),
        })
    }
}

impl Reachability for TcpProbe {
    fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool {
        match Self::try_connect(target, timeout) {
            Ok(addr) => {
                log::trace!("TCP probe reached {}", addr);
                true
            }
            Err(e) => {
                log::debug!("TCP probe failed: {}", e);
                false
            }
        }
    }
}

/// One ICMP echo via the system `ping`, falling back to [`TcpProbe`] when
/// `ping` is not installed or not permitted.
#[derive(Debug, Clone)]
pub struct PingProbe {
    binary: String,
}

impl Default for PingProbe {
    fn default() -> Self {
        Self {
            binary: "ping".to_string(),
        }
    }
}

impl PingProbe {
    #[cfg(test)]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
        if cfg!(windows) {
            vec![
                "-n".to_string(),
                "1".to_string(),
                "-w".to_string(),
                timeout.as_millis().max(1).to_string(),
                host.to_string(),
            ]
        } else {
            // -W takes whole seconds
            let wait_secs = timeout.as_millis().div_ceil(1000).max(1);
            vec![
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                wait_secs.to_string(),
                host.to_string(),
            ]
        }
    }

    fn run(&self, host: &str, timeout: Duration) -> Result<bool, ConnectionError> {
        let mut child = Command::new(&self.binary)
            .args(Self::ping_args(host, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(ConnectionError::Ping)?;

        // -W is rounded up to whole seconds, so ping may outlive the
        // caller's budget; it is cut off here instead.
        let deadline = Instant::now() + ping_cutoff(timeout);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status.success()),
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => {
                    log::debug!("ping to {} overran its timeout, killing", host);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(false);
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(ConnectionError::Ping(e));
                }
            }
        }
    }
}

fn ping_cutoff(timeout: Duration) -> Duration {
    timeout + PING_GRACE
}

impl Reachability for PingProbe {
    fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool {
        match self.run(&target.host, timeout) {
            Ok(reachable) => {
                if !reachable {
                    log::debug!("No ping reply from {}", target.host);
                }
                reachable
            }
            Err(e) => {
                log::warn!("{}; falling back to TCP probe", e);
                TcpProbe.probe(target, timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_probe_timeout_stays_below_interval() {
        assert_eq!(probe_timeout(Duration::from_secs(5)), MAX_PROBE_TIMEOUT);
        assert_eq!(probe_timeout(Duration::from_secs(1)), Duration::from_millis(750));
    }

    #[test]
    fn test_timeout_survives_huge_interval() {
        assert_eq!(probe_timeout(Duration::from_secs(u64::MAX)), MAX_PROBE_TIMEOUT);
        assert_eq!(probe_timeout(Duration::from_secs(u64::MAX / 3 + 1)), MAX_PROBE_TIMEOUT);
    }

    #[test]
    fn test_ping_is_cut_off_before_next_tick() {
        assert_eq!(ping_cutoff(Duration::from_millis(1500)), Duration::from_millis(1600));
        for secs in [1, 2, 5, 60, 3_600] {
            let interval = Duration::from_secs(secs);
            assert!(ping_cutoff(probe_timeout(interval)) < interval, "interval {}s", secs);
        }
    }

    #[test]
    fn test_resolve_literal_address() {
        let addrs = TcpProbe::resolve("127.0.0.1", 554, Duration::from_millis(500)).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:554".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_ping_args_round_wait_up() {
        if cfg!(windows) {
            return;
        }
        let args = PingProbe::ping_args("10.0.0.1", Duration::from_millis(1500));
        assert_eq!(args, vec!["-c", "1", "-W", "2", "10.0.0.1"]);
        let args = PingProbe::ping_args("10.0.0.1", Duration::from_millis(200));
        assert_eq!(args[3], "1");
    }

    #[test]
    fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ProbeTarget {
            host: "127.0.0.1".to_string(),
            port: port.to_string(),
        };
        assert!(TcpProbe.probe(&target, Duration::from_millis(500)));
    }

    #[test]
    fn test_tcp_probe_rejects_bad_port() {
        let target = ProbeTarget {
            host: "127.0.0.1".to_string(),
            port: "rtsp".to_string(),
        };
        assert!(!TcpProbe.probe(&target, Duration::from_millis(100)));
    }

    #[test]
    fn test_tcp_probe_closed_port_fails() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = ProbeTarget {
            host: "127.0.0.1".to_string(),
            port: port.to_string(),
        };
        assert!(!TcpProbe.probe(&target, Duration::from_millis(300)));
    }

    #[test]
    fn test_missing_ping_binary_falls_back_to_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ProbeTarget {
            host: "127.0.0.1".to_string(),
            port: port.to_string(),
        };
        let probe = PingProbe::with_binary("/nonexistent/ping-binary");
        assert!(probe.probe(&target, Duration::from_millis(500)));
    }
}
