//! 1-second TCP liveness dials ("pokes") and the loadavg probe's wire
//! format: `m1 m5 m15 ...` read from a single accept-then-close
//! connection on port 8743.

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Dial `addr` up to `attempts` times, 1 s apart, returning as soon as
/// one attempt connects. Used to confirm a freshly booted instance is
/// actually accepting connections before declaring it Serving.
pub async fn poke(addr: &str, attempts: u32) -> bool {
    for attempt in 0..attempts.max(1) {
        if timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await.map(|r| r.is_ok()).unwrap_or(false) {
            return true;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAvg {
    pub m1: f64,
    pub m5: f64,
    pub m15: f64,
}

impl LoadAvg {
    /// The controller's load gate: a Serving instance is skipped when
    /// its 1-minute load exceeds both its own 5/15-minute averages and
    /// the configured ceiling.
    pub fn overloaded(&self, max_loads: f64) -> bool {
        self.m1 > self.m5 && self.m1 > self.m15 && self.m1 > max_loads
    }
}

/// Dial the load probe at `addr` and parse the first three
/// space-separated floats of its response (the `/proc/loadavg` format).
pub async fn read_load(addr: &str) -> Option<LoadAvg> {
    let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await.ok()?.ok()?;
    let mut buf = Vec::new();
    timeout(DIAL_TIMEOUT, stream.read_to_end(&mut buf)).await.ok()?.ok()?;
    let text = String::from_utf8_lossy(&buf);
    let mut parts = text.split_whitespace();
    let m1 = parts.next()?.parse().ok()?;
    let m5 = parts.next()?.parse().ok()?;
    let m15 = parts.next()?.parse().ok()?;
    Some(LoadAvg { m1, m5, m15 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_requires_all_three_conditions() {
        let load = LoadAvg { m1: 15.0, m5: 5.0, m15: 3.0 };
        assert!(load.overloaded(10.0));

        let not_above_m5 = LoadAvg { m1: 4.0, m5: 5.0, m15: 3.0 };
        assert!(!not_above_m5.overloaded(1.0));

        let below_ceiling = LoadAvg { m1: 8.0, m5: 5.0, m15: 3.0 };
        assert!(!below_ceiling.overloaded(10.0));
    }

    #[tokio::test]
    async fn poke_fails_fast_against_a_closed_port() {
        let ok = poke("127.0.0.1:1", 1).await;
        assert!(!ok);
    }
}
