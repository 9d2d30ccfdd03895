#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use relay_tunnel::config::{self, RelayConfig};
use relay_tunnel::server::{bootstrap, runtime};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "relay-tunnel",
    about = "HTTP tunnel relayed through a watchable document store"
)]
struct Cli {
    /// Path to config file (.toml or .json); defaults apply when missing
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Logical channel both sides agree on
    #[arg(long, global = true)]
    endpoint_name: Option<String>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Accept public HTTP requests and answer them from relayed responses
    Gateway(GatewayArgs),
    /// Watch request records and forward them to local targets
    Consumer(ConsumerArgs),
    /// Gateway and consumer in one process sharing one store
    Standalone(StandaloneArgs),
}

#[derive(Clone, Copy)]
enum Mode {
    Gateway,
    Consumer,
    Standalone,
}

#[derive(Args)]
struct GatewayArgs {
    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin listen address (health/metrics)
    #[arg(long)]
    admin_listen: Option<String>,

    /// How long to wait for a response, e.g. "60s"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Log inbound requests at debug level
    #[arg(long)]
    dump: bool,
}

#[derive(Args)]
struct ConsumerArgs {
    #[command(flatten)]
    relay: RelayArgs,

    /// Log each observed record at debug level
    #[arg(long)]
    dump: bool,

    /// Admin listen address (health/metrics)
    #[arg(long)]
    admin_listen: Option<String>,
}

#[derive(Args)]
struct StandaloneArgs {
    #[command(flatten)]
    gateway: GatewayArgs,

    #[command(flatten)]
    relay: RelayArgs,
}

/// Forwarding flags shared by the consumer and standalone roles.
#[derive(Args)]
struct RelayArgs {
    #[arg(long)]
    workers: Option<usize>,

    /// Bound on one forward, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration)]
    forward_timeout: Option<Duration>,

    /// Records older than this are never forwarded, e.g. "2m"
    #[arg(long, value_parser = humantime::parse_duration)]
    expire: Option<Duration>,

    /// Skip expired records without deleting them
    #[arg(long)]
    without_cleaning: bool,

    /// Path glob; repeat together with --target, first match wins
    #[arg(long = "pattern")]
    patterns: Vec<String>,

    /// Target base URL for the --pattern at the same position
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Largest response body stored inline on the record
    #[arg(long)]
    inline_body_bytes: Option<usize>,

    /// Size of each stored chunk of a larger body
    #[arg(long)]
    chunk_bytes: Option<usize>,

    /// Log forwarded requests and responses at debug level
    #[arg(long)]
    dump_forward: bool,

    /// Largest body included in a forward dump
    #[arg(long)]
    max_dump_bytes: Option<u64>,
}

impl Role {
    fn apply(self, cfg: &mut RelayConfig) -> Result<Mode> {
        match self {
            Role::Gateway(args) => {
                args.apply(cfg);
                Ok(Mode::Gateway)
            }
            Role::Consumer(args) => {
                args.relay.apply(cfg)?;
                cfg.consumer.dump |= args.dump;
                if let Some(v) = args.admin_listen {
                    cfg.consumer.admin_listen = v;
                }
                Ok(Mode::Consumer)
            }
            Role::Standalone(args) => {
                cfg.consumer.dump |= args.gateway.dump;
                args.gateway.apply(cfg);
                args.relay.apply(cfg)?;
                Ok(Mode::Standalone)
            }
        }
    }
}

impl GatewayArgs {
    fn apply(self, cfg: &mut RelayConfig) {
        let gw = &mut cfg.gateway;
        if let Some(v) = self.listen {
            gw.listen = v;
        }
        if let Some(v) = self.admin_listen {
            gw.admin_listen = v;
        }
        if let Some(v) = self.timeout {
            gw.timeout_secs = v.as_secs_f64();
        }
        gw.dump |= self.dump;
    }
}

impl RelayArgs {
    fn apply(self, cfg: &mut RelayConfig) -> Result<()> {
        let c = &mut cfg.consumer;
        if let Some(v) = self.workers {
            c.workers = v;
        }
        if let Some(v) = self.forward_timeout {
            c.forward_timeout_secs = v.as_secs_f64();
        }
        if let Some(v) = self.expire {
            c.expire_secs = v.as_secs_f64();
        }
        if self.without_cleaning {
            c.cleaning = false;
        }
        if !self.patterns.is_empty() || !self.targets.is_empty() {
            c.targets = config::zip_targets(&self.patterns, &self.targets)?;
        }
        if let Some(v) = self.inline_body_bytes {
            c.inline_body_bytes = v;
        }
        if let Some(v) = self.chunk_bytes {
            c.chunk_bytes = v;
        }
        c.dump_forward |= self.dump_forward;
        if let Some(v) = self.max_dump_bytes {
            c.max_dump_bytes = v;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    bootstrap::init_tracing();

    let mut cfg = RelayConfig::load(&cli.config)?;
    if let Some(name) = cli.endpoint_name {
        cfg.endpoint_name = name;
    }
    let mode = cli.role.apply(&mut cfg)?;
    cfg.validate()?;
    if !matches!(mode, Mode::Standalone) {
        cfg.validate_split_role()?;
    }

    let (worker_threads, source) = runtime::worker_threads();
    tracing::info!(
        "runtime: worker threads, threads={}, source={}",
        worker_threads,
        source
    );
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let shutdown = CancellationToken::new();
        bootstrap::shutdown_on_signal(shutdown.clone());
        match mode {
            Mode::Gateway => bootstrap::run_gateway(cfg, shutdown).await,
            Mode::Consumer => bootstrap::run_consumer(cfg, shutdown).await,
            Mode::Standalone => bootstrap::run_standalone(cfg, shutdown).await,
        }
    })
}
