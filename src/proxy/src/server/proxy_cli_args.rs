use crate::backend::monitor::ConfiguredRole;
use crate::backend::{Backend, BackendInventory};
use crate::router::UseSqlVariablesIn;
use crate::server::service::ServiceConfig;
use crate::session::retention::DumpStatements;

use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "rw-proxy",
    version = "0.1.0",
    about = "read/write splitting proxy for MySQL compatible databases."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 3310)]
    pub port: u16,
    #[clap(long, value_name = "HTTP_PORT", default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, value_name = "ENABLE REST API", default_value_t = false)]
    pub enable_rest: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    /// master backend as host:port
    #[clap(long, value_name = "MASTER")]
    pub master: Option<String>,
    /// slave backend as host:port, repeatable
    #[clap(long, value_name = "SLAVE")]
    pub slave: Vec<String>,
    #[clap(long, value_name = "BACKEND_USER", default_value = "proxy")]
    pub backend_user: String,
    #[clap(long, value_name = "BACKEND_PASSWORD", default_value = "")]
    pub backend_password: String,
    /// master | all
    #[clap(long, value_name = "USE_SQL_VARIABLES_IN", default_value = "master")]
    pub use_sql_variables_in: String,
    #[clap(long, value_name = "MAX_CONNECTIONS", default_value_t = 0)]
    pub max_connections: usize,
    #[clap(long, value_name = "RETAIN_LAST_STATEMENTS", default_value_t = 16)]
    pub retain_last_statements: usize,
    /// never | on_close | on_error
    #[clap(long, value_name = "DUMP_LAST_STATEMENTS", default_value = "on_error")]
    pub dump_last_statements: String,
    /// classifier cache target over all workers, bytes; 0 disables
    #[clap(long, value_name = "QC_CACHE_SIZE", default_value_t = 64 * 1024 * 1024)]
    pub qc_cache_size: i64,
    #[clap(long, value_name = "MONITOR_INTERVAL_MS", default_value_t = 2000)]
    pub monitor_interval_ms: u64,
}

impl ProxyServerArgs {
    pub fn use_sql_variables_in(&self) -> UseSqlVariablesIn {
        if self.use_sql_variables_in.eq_ignore_ascii_case("all") {
            UseSqlVariablesIn::All
        } else {
            UseSqlVariablesIn::Master
        }
    }

    pub fn dump_statements(&self) -> DumpStatements {
        match self.dump_last_statements.to_ascii_lowercase().as_str() {
            "on_close" => DumpStatements::OnClose,
            "on_error" => DumpStatements::OnError,
            _ => DumpStatements::Never,
        }
    }

    /// Configured backends and their roles. The master is named `master`,
    /// slaves are `slave1`, `slave2`, ... in flag order.
    pub fn backends(&self) -> (Vec<Arc<Backend>>, Vec<(String, ConfiguredRole)>) {
        let mut backends = Vec::new();
        let mut roles = Vec::new();

        if let Some(endpoint) = &self.master {
            if let Some((host, port)) = split_endpoint(endpoint) {
                backends.push(Arc::new(Backend::new("master", &host, port)));
                roles.push(("master".to_string(), ConfiguredRole::Master));
            }
        }
        for (i, endpoint) in self.slave.iter().enumerate() {
            if let Some((host, port)) = split_endpoint(endpoint) {
                let name = format!("slave{}", i + 1);
                backends.push(Arc::new(Backend::new(&name, &host, port)));
                roles.push((name, ConfiguredRole::Slave));
            }
        }
        (backends, roles)
    }

    pub fn inventory(&self) -> (Arc<BackendInventory>, Vec<(String, ConfiguredRole)>) {
        let (backends, roles) = self.backends();
        (Arc::new(BackendInventory::new(backends)), roles)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            use_sql_variables_in: self.use_sql_variables_in(),
            retain_last_statements: self.retain_last_statements,
            dump_statements: self.dump_statements(),
            max_connections: self.max_connections,
            backend_user: self.backend_user.clone(),
            backend_password: self.backend_password.clone(),
            ps_log_verbosity: Default::default(),
            delayed_retry_timeout_ms: 1000,
        }
    }
}

fn split_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_roles() {
        let args = ProxyServerArgs::parse_from([
            "rw-proxy",
            "--master",
            "127.0.0.1:3306",
            "--slave",
            "127.0.0.1:3307",
            "--slave",
            "db2:3308",
        ]);
        let (backends, roles) = args.backends();
        assert_eq!(backends.len(), 3);
        assert_eq!(backends[0].name(), "master");
        assert_eq!(backends[2].endpoint(), "db2:3308");
        assert_eq!(roles[1].1, ConfiguredRole::Slave);
    }

    #[test]
    fn variable_scope_parsing() {
        let args = ProxyServerArgs::parse_from(["rw-proxy", "--use-sql-variables-in", "ALL"]);
        assert_eq!(args.use_sql_variables_in(), UseSqlVariablesIn::All);
        let args = ProxyServerArgs::parse_from(["rw-proxy"]);
        assert_eq!(args.use_sql_variables_in(), UseSqlVariablesIn::Master);
    }

    #[test]
    fn malformed_endpoints_are_skipped() {
        let args = ProxyServerArgs::parse_from(["rw-proxy", "--master", "nonsense"]);
        let (backends, _) = args.backends();
        assert!(backends.is_empty());
    }
}
