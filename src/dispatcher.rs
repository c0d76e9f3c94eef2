//! Process-wide signal dispatcher.
//!
//! Integrations publish named signals (`nmap_tracker-device-new-<entry>`,
//! `nmap_tracker-device-update-<mac>`, ...) and entity platforms connect to
//! the ones they care about. Each signal is backed by its own broadcast
//! channel, created lazily on first connect.

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Payload carried by a dispatched signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPayload {
    /// A hardware address (new / missing device).
    Mac(String),
    /// Availability flag (device updated).
    Available(bool),
}

pub struct Dispatcher {
    signals: DashMap<String, broadcast::Sender<DispatchPayload>>,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            signals: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to a signal. Only payloads sent after this call are seen.
    pub fn connect(&self, signal: &str) -> broadcast::Receiver<DispatchPayload> {
        self.signals
            .entry(signal.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send a payload to every receiver of `signal`. Returns how many
    /// receivers got it; sending to a signal nobody listens on is a no-op.
    pub fn send(&self, signal: &str, payload: DispatchPayload) -> usize {
        match self.signals.get(signal) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => {
                tracing::trace!(signal, "dispatch without listeners");
                0
            }
        }
    }

    /// Drop a signal. Connected receivers observe `RecvError::Closed`.
    pub fn disconnect(&self, signal: &str) -> bool {
        self.signals.remove(signal).is_some()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[test]
    fn test_send_without_listeners() {
        let dispatcher = Dispatcher::new(8);
        assert_eq!(dispatcher.send("nobody", DispatchPayload::Available(true)), 0);
        assert_eq!(dispatcher.signal_count(), 0);
    }

    #[test]
    fn test_connect_then_send() {
        let dispatcher = Dispatcher::new(8);
        let mut a = dispatcher.connect("sig");
        let mut b = dispatcher.connect("sig");
        let mut other = dispatcher.connect("other");

        let delivered = dispatcher.send("sig", DispatchPayload::Mac("aa:bb".into()));
        assert_eq!(delivered, 2);
        assert_eq!(a.try_recv().unwrap(), DispatchPayload::Mac("aa:bb".into()));
        assert_eq!(b.try_recv().unwrap(), DispatchPayload::Mac("aa:bb".into()));
        assert!(matches!(other.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_receivers() {
        let dispatcher = Dispatcher::new(8);
        let mut rx = dispatcher.connect("sig");
        assert!(dispatcher.disconnect("sig"));
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(!dispatcher.disconnect("sig"));
    }
}
