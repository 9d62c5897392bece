pub mod api;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod defaults;
pub mod env_overrides;
pub mod identity;
pub mod mutation;
pub mod prometheus;
pub mod resolver;
pub mod router;
pub mod server;
pub mod store;
