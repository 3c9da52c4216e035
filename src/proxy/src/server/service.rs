use crate::backend::BackendInventory;
use crate::router::ps::PsLogVerbosity;
use crate::router::UseSqlVariablesIn;
use crate::server::auth::Authenticator;
use crate::session::pipeline::{Filter, Router};
use crate::session::registry::SessionRegistry;
use crate::session::retention::DumpStatements;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Service-level knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub use_sql_variables_in: UseSqlVariablesIn,
    pub retain_last_statements: usize,
    pub dump_statements: DumpStatements,
    pub max_connections: usize,
    /// credentials the proxy itself uses toward backends
    pub backend_user: String,
    pub backend_password: String,
    pub ps_log_verbosity: PsLogVerbosity,
    pub delayed_retry_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            use_sql_variables_in: UseSqlVariablesIn::Master,
            retain_last_statements: 16,
            dump_statements: DumpStatements::OnError,
            max_connections: 0,
            backend_user: "proxy".to_string(),
            backend_password: String::new(),
            ps_log_verbosity: PsLogVerbosity::Warn,
            delayed_retry_timeout_ms: 1000,
        }
    }
}

/// One listening service: the ordered filter chain, the terminal router,
/// the authenticator clients face, and the backends everything routes to.
pub struct Service {
    name: String,
    config: ServiceConfig,
    filters: Vec<Arc<dyn Filter>>,
    router: Arc<dyn Router>,
    authenticator: Arc<dyn Authenticator>,
    inventory: Arc<BackendInventory>,
    sessions: Arc<SessionRegistry>,
    connections: AtomicUsize,
}

impl Service {
    pub fn new(
        name: &str,
        config: ServiceConfig,
        filters: Vec<Arc<dyn Filter>>,
        router: Arc<dyn Router>,
        authenticator: Arc<dyn Authenticator>,
        inventory: Arc<BackendInventory>,
        sessions: Arc<SessionRegistry>,
    ) -> Arc<Service> {
        Arc::new(Service {
            name: name.to_string(),
            config,
            filters,
            router,
            authenticator,
            inventory,
            sessions,
            connections: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn inventory(&self) -> &Arc<BackendInventory> {
        &self.inventory
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Admission check for a new client. The count is released through
    /// [`connection_closed`].
    pub fn admit_connection(&self) -> bool {
        let count = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        if self.config.max_connections != 0 && count > self.config.max_connections {
            self.connections.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::native::TrustAuthenticator;
    use crate::session::pipeline::{RouterSession, RoutingCapabilities, SessionCtx};

    struct NullRouter;

    impl Router for NullRouter {
        fn name(&self) -> &str {
            "null"
        }
        fn capabilities(&self) -> RoutingCapabilities {
            RoutingCapabilities::empty()
        }
        fn new_session(&self, _ctx: &mut SessionCtx<'_>) -> Option<Box<dyn RouterSession>> {
            None
        }
    }

    fn service(max_connections: usize) -> Arc<Service> {
        Service::new(
            "test",
            ServiceConfig {
                max_connections,
                ..Default::default()
            },
            Vec::new(),
            Arc::new(NullRouter),
            Arc::new(TrustAuthenticator),
            Arc::new(BackendInventory::default()),
            Arc::new(SessionRegistry::new()),
        )
    }

    #[test]
    fn connection_limit_enforced() {
        let svc = service(2);
        assert!(svc.admit_connection());
        assert!(svc.admit_connection());
        assert!(!svc.admit_connection());
        svc.connection_closed();
        assert!(svc.admit_connection());
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let svc = service(0);
        for _ in 0..100 {
            assert!(svc.admit_connection());
        }
    }
}
