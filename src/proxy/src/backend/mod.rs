pub mod monitor;

use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

bitflags! {
    /// Per-server status bits. Monitors write them under their tick; the
    /// router reads them unsynchronized. Eventual consistency is fine
    /// because routing rechecks on dispatch failure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServerStatus: u32 {
        const RUNNING           = 1 << 0;
        const MASTER            = 1 << 1;
        const SLAVE             = 1 << 2;
        const MASTER_STICKINESS = 1 << 3;
        const JOINED            = 1 << 4;
        const AUTH_ERROR        = 1 << 5;
        const MAINTENANCE       = 1 << 6;
        const STALE_STATUS      = 1 << 7;
        const NDB               = 1 << 8;
    }
}

/// One configured backend server.
pub struct Backend {
    name: String,
    address: String,
    port: u16,
    status: AtomicU32,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("status", &self.status())
            .finish()
    }
}

impl Backend {
    pub fn new(name: &str, address: &str, port: u16) -> Self {
        Backend {
            name: name.to_string(),
            address: address.to_string(),
            port,
            status: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_bits_truncate(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: ServerStatus) {
        self.status.store(status.bits(), Ordering::Relaxed);
    }

    pub fn add_status(&self, bits: ServerStatus) {
        self.status.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    pub fn clear_status(&self, bits: ServerStatus) {
        self.status.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.status().contains(ServerStatus::RUNNING)
    }

    pub fn is_usable(&self) -> bool {
        let status = self.status();
        status.contains(ServerStatus::RUNNING) && !status.contains(ServerStatus::MAINTENANCE)
    }

    pub fn is_master(&self) -> bool {
        self.is_usable() && self.status().contains(ServerStatus::MASTER)
    }

    pub fn is_slave(&self) -> bool {
        self.is_usable() && self.status().contains(ServerStatus::SLAVE)
    }
}

/// The set of backends one service routes to.
#[derive(Default, Debug)]
pub struct BackendInventory {
    backends: Vec<Arc<Backend>>,
}

impl BackendInventory {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        BackendInventory { backends }
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn master(&self) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.is_master())
    }

    pub fn slaves(&self) -> Vec<&Arc<Backend>> {
        self.backends.iter().filter(|b| b.is_slave()).collect()
    }

    pub fn usable(&self) -> Vec<&Arc<Backend>> {
        self.backends.iter().filter(|b| b.is_usable()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits_round_trip() {
        let backend = Backend::new("db1", "127.0.0.1", 3306);
        assert!(!backend.is_running());
        backend.add_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        assert!(backend.is_master());
        assert!(!backend.is_slave());

        backend.add_status(ServerStatus::MAINTENANCE);
        assert!(!backend.is_usable());
        assert!(!backend.is_master());

        backend.clear_status(ServerStatus::MAINTENANCE);
        assert!(backend.is_master());
    }

    #[test]
    fn inventory_selection() {
        let master = Arc::new(Backend::new("m", "127.0.0.1", 3306));
        master.set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        let slave = Arc::new(Backend::new("s1", "127.0.0.1", 3307));
        slave.set_status(ServerStatus::RUNNING | ServerStatus::SLAVE);
        let down = Arc::new(Backend::new("s2", "127.0.0.1", 3308));
        down.set_status(ServerStatus::SLAVE);

        let inventory = BackendInventory::new(vec![master, slave, down]);
        assert_eq!(inventory.master().unwrap().name(), "m");
        let slaves = inventory.slaves();
        assert_eq!(slaves.len(), 1);
        assert_eq!(slaves[0].name(), "s1");
        assert!(inventory.by_name("s2").is_some());
    }
}
