pub mod codec;
pub mod config;
pub mod dedup;
pub mod dump;
pub mod error;
pub mod etcd;
pub mod gateway;
pub mod metrics;
pub mod record;
pub mod relay;
pub mod routing;
pub mod server;
pub mod store;
pub mod trace_context;
