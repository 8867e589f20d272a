//! Unknown-peer quarantine.
//!
//! When a datagram arrives from an address with no session, two remediations
//! apply: a goodbye fan-out to every broker client sharing the remote IP
//! (throttled per IP) and a short drop-window on the specific address so the
//! flood does not keep hitting the lookup path while the device re-handshakes.

use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

const NOTIFY_INTERVAL: Duration = Duration::from_secs(2);
const DROP_WINDOW: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct Quarantine {
    last_notify: DashMap<IpAddr, Instant>,
    drop_until: DashMap<SocketAddr, Instant>,
}

impl Quarantine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an unknown-session datagram from `addr`. Installs the drop
    /// window and returns true when the caller should fan out a goodbye
    /// (i.e. this IP has not been notified within the throttle interval).
    pub fn note_unknown(&self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        self.drop_until.insert(addr, now + DROP_WINDOW);

        let mut should_notify = true;
        self.last_notify
            .entry(addr.ip())
            .and_modify(|last| {
                if now.duration_since(*last) < NOTIFY_INTERVAL {
                    should_notify = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        should_notify
    }

    /// Whether datagrams from `addr` are inside an active drop window.
    /// Expired windows are removed on the way out.
    pub fn should_drop(&self, addr: SocketAddr) -> bool {
        let deadline = match self.drop_until.get(&addr) {
            Some(entry) => *entry,
            None => return false,
        };
        if Instant::now() < deadline {
            return true;
        }
        self.drop_until.remove(&addr);
        false
    }

    /// Lift the drop window, e.g. once the address resolved to a session.
    pub fn clear(&self, addr: SocketAddr) {
        self.drop_until.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.5:{port}").parse().unwrap()
    }

    #[test]
    fn second_datagram_within_throttle_is_silent() {
        let q = Quarantine::new();
        assert!(q.note_unknown(addr(1000)));
        // Same IP, different port, 100ms later in wall-clock terms.
        assert!(!q.note_unknown(addr(1001)));
    }

    #[test]
    fn drop_window_applies_per_address() {
        let q = Quarantine::new();
        q.note_unknown(addr(1000));
        assert!(q.should_drop(addr(1000)));
        assert!(!q.should_drop(addr(1001)));
    }

    #[test]
    fn clear_lifts_the_window() {
        let q = Quarantine::new();
        q.note_unknown(addr(1000));
        q.clear(addr(1000));
        assert!(!q.should_drop(addr(1000)));
    }

    #[test]
    fn different_ips_notify_independently() {
        let q = Quarantine::new();
        assert!(q.note_unknown("10.0.0.5:1".parse().unwrap()));
        assert!(q.note_unknown("10.0.0.6:1".parse().unwrap()));
    }
}
