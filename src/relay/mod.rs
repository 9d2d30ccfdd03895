//! Consumer side: watch loop, claim, route, forward, write back.

mod client;
mod forward;
mod pool;
mod watch;

pub use client::{build_forward_client, ForwardClient};
pub use forward::{ForwardSettings, Forwarded, Forwarder};
pub use pool::WorkerPool;
pub use watch::{Disposition, WatchLoop};
