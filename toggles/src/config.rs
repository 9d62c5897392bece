use std::net::SocketAddr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3400")]
    pub address: SocketAddr,

    /// Postgres connection string. Required unless `use_memory_store` is set.
    pub database_url: Option<String>,

    /// Keep overrides in process memory instead of Postgres. Useful for local
    /// development and tests, data does not survive a restart.
    #[envconfig(default = "false")]
    pub use_memory_store: bool,

    #[envconfig(default = "30")]
    pub cache_ttl_secs: u64,

    /// Convergence floor for sessions that miss broadcasts.
    #[envconfig(default = "60")]
    pub client_refresh_interval_secs: u64,

    #[envconfig(default = "128")]
    pub broadcast_capacity: usize,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}
