use crate::backend::{Backend, BackendInventory, ServerStatus};
use crate::worker::{CallAction, Callable, Worker};

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A monitor periodically refreshes the status bits of the servers it
/// watches. It runs on a dedicated worker via a repeating delayed call;
/// everyone else only ever reads the bits it publishes.
pub trait Monitor {
    fn name(&self) -> &str;
    /// One probe round over all watched servers.
    fn tick(&mut self);
}

/// Role a backend was configured with; the reachability probe cannot tell
/// masters from slaves, the configuration does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguredRole {
    Master,
    Slave,
}

/// The simplest useful monitor: a TCP connect probe. Reachable servers
/// get RUNNING plus their configured role bit, unreachable ones lose
/// everything but keep STALE_STATUS so operators can see the last known
/// role.
pub struct TcpMonitor {
    name: String,
    inventory: Arc<BackendInventory>,
    roles: Vec<(String, ConfiguredRole)>,
    connect_timeout: Duration,
}

impl TcpMonitor {
    pub fn new(
        name: &str,
        inventory: Arc<BackendInventory>,
        roles: Vec<(String, ConfiguredRole)>,
    ) -> Self {
        TcpMonitor {
            name: name.to_string(),
            inventory,
            roles,
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn configured_role(&self, backend: &Backend) -> Option<ConfiguredRole> {
        self.roles
            .iter()
            .find(|(name, _)| name == backend.name())
            .map(|(_, role)| *role)
    }

    fn probe(&self, backend: &Backend) -> bool {
        let addrs = match backend.endpoint().to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                warn!("Monitor {}: cannot resolve {}: {e}", self.name, backend.endpoint());
                return false;
            }
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.connect_timeout).is_ok())
    }

    /// Arm the repeating probe on `worker`. The returned callable cancels
    /// the monitor when handed to `Worker::cancel_dcalls`.
    pub fn start(self, worker: &mut Worker, interval: Duration) -> Callable {
        let callable = Callable::new();
        let mut monitor = self;
        info!("Monitor {} starting, interval {:?}", monitor.name, interval);
        worker.delayed_call(callable, interval, move |action, _worker| {
            if action == CallAction::Execute {
                monitor.tick();
                true
            } else {
                false
            }
        });
        callable
    }
}

impl Monitor for TcpMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self) {
        for backend in self.inventory.all() {
            let reachable = self.probe(backend);
            let previous = backend.status();

            let mut status = ServerStatus::empty();
            if reachable {
                status |= ServerStatus::RUNNING;
                match self.configured_role(backend) {
                    Some(ConfiguredRole::Master) => status |= ServerStatus::MASTER,
                    Some(ConfiguredRole::Slave) => status |= ServerStatus::SLAVE,
                    None => {}
                }
                // maintenance is operator-controlled, never cleared here
                if previous.contains(ServerStatus::MAINTENANCE) {
                    status |= ServerStatus::MAINTENANCE;
                }
            } else if previous.intersects(ServerStatus::MASTER | ServerStatus::SLAVE) {
                status |= ServerStatus::STALE_STATUS;
            }

            if status != previous {
                info!(
                    "Monitor {}: server {} changed {previous:?} -> {status:?}",
                    self.name,
                    backend.name()
                );
            } else {
                debug!("Monitor {}: server {} unchanged", self.name, backend.name());
            }
            backend.set_status(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn probe_marks_reachable_backend_running() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = Arc::new(Backend::new("m", "127.0.0.1", port));
        let inventory = Arc::new(BackendInventory::new(vec![Arc::clone(&backend)]));
        let mut monitor = TcpMonitor::new(
            "probe",
            inventory,
            vec![("m".to_string(), ConfiguredRole::Master)],
        );

        monitor.tick();
        assert!(backend.is_master());

        drop(listener);
        monitor.tick();
        assert!(!backend.is_running());
        assert!(backend.status().contains(ServerStatus::STALE_STATUS));
    }
}
