// src/delivery/network.rs
//! Active network classification
//!
//! The host knows whether the device is on Wi-Fi or cellular; the core only
//! asks. With `evict_on_cellular` set, flushing pauses while the network is
//! metered. An offline network pauses flushing regardless.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Unmetered,
    Metered,
    Offline,
}

impl NetworkStatus {
    fn as_u8(self) -> u8 {
        match self {
            NetworkStatus::Unmetered => 0,
            NetworkStatus::Metered => 1,
            NetworkStatus::Offline => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => NetworkStatus::Metered,
            2 => NetworkStatus::Offline,
            _ => NetworkStatus::Unmetered,
        }
    }
}

/// Reports the current network status
pub trait NetworkMonitor: Send + Sync {
    fn status(&self) -> NetworkStatus;
}

/// Network status pushed in by the host (connectivity callbacks)
#[derive(Debug)]
pub struct SharedNetworkStatus {
    status: AtomicU8,
}

impl SharedNetworkStatus {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: AtomicU8::new(status.as_u8()),
        }
    }

    pub fn set(&self, status: NetworkStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }
}

impl Default for SharedNetworkStatus {
    fn default() -> Self {
        Self::new(NetworkStatus::Unmetered)
    }
}

impl NetworkMonitor for SharedNetworkStatus {
    fn status(&self) -> NetworkStatus {
        NetworkStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_status_updates() {
        let network = SharedNetworkStatus::default();
        assert_eq!(network.status(), NetworkStatus::Unmetered);

        network.set(NetworkStatus::Metered);
        assert_eq!(network.status(), NetworkStatus::Metered);

        network.set(NetworkStatus::Offline);
        assert_eq!(network.status(), NetworkStatus::Offline);
    }
}
