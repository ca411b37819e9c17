use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use relay_lite::config::{NodeConfig, RetentionPolicy};
use relay_lite::node::Node;
use relay_lite::notifier;
use relay_lite::scope;
use relay_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "relay-lite")]
#[command(version)]
#[command(about = "Leader election and shared LISTEN/NOTIFY for Postgres job queue nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a coordination node
    Server(ServerArgs),

    /// Publish a notification to every listening node
    Notify(NotifyArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Cluster name shared by every node that should elect one leader
    #[arg(long, default_value = "oban")]
    name: String,

    /// Node identifier (defaults to a random id)
    #[arg(long)]
    node: Option<String>,

    /// Schema prefix for tables and channels
    #[arg(long, default_value = "public")]
    prefix: String,

    /// Seconds between election rounds while following
    #[arg(long, default_value = "30")]
    interval_secs: u64,

    /// How many times faster the leader re-confirms
    #[arg(long, default_value = "2")]
    leader_boost: u32,

    /// Prune finished jobs older than this many seconds
    #[arg(long, conflicts_with_all = ["max_len", "no_prune"])]
    max_age: Option<u64>,

    /// Keep at most this many finished jobs
    #[arg(long, conflicts_with = "no_prune")]
    max_len: Option<u64>,

    /// Disable pruning
    #[arg(long)]
    no_prune: bool,

    /// Maximum jobs deleted per sweep
    #[arg(long, default_value = "10000")]
    prune_limit: u64,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[derive(Parser, Debug)]
struct NotifyArgs {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema prefix for channels
    #[arg(long, default_value = "public")]
    prefix: String,

    /// Restrict delivery to one node identity ("any" reaches all)
    #[arg(long)]
    ident: Option<String>,

    /// Channel short name, e.g. "insert"
    channel: String,

    /// JSON object payload
    payload: String,
}

impl ServerArgs {
    fn retention(&self) -> RetentionPolicy {
        if self.no_prune {
            RetentionPolicy::Disabled
        } else if let Some(keep) = self.max_len {
            RetentionPolicy::MaxLen(keep)
        } else if let Some(secs) = self.max_age {
            RetentionPolicy::MaxAge(secs)
        } else {
            RetentionPolicy::default()
        }
    }

    fn into_config(self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let dashboard_addr: Option<SocketAddr> = match self.dashboard_port {
            Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
            None => None,
        };
        let retention = self.retention();

        let mut config = NodeConfig::new(self.name)
            .with_prefix(self.prefix)
            .with_database_url(self.database_url)
            .with_election(Duration::from_secs(self.interval_secs), self.leader_boost)
            .with_retention(retention);
        if let Some(node) = self.node {
            config = config.with_node(node);
        }
        config.pruner.limit = self.prune_limit;
        config.dashboard_addr = dashboard_addr;
        Ok(config)
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config()?;

    tracing::info!(
        name = %config.name,
        ident = %config.ident(),
        prefix = %config.prefix,
        interval_secs = config.peer.interval.as_secs(),
        leader_boost = config.peer.leader_boost,
        retention = %config.pruner.retention,
        "Starting relay-lite node"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::start(config, shutdown).await?;
    node.join().await;
    Ok(())
}

async fn run_notify(args: NotifyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(&args.payload)?;
    if !payload.is_object() {
        return Err("payload must be a JSON object".into());
    }
    let payload = match &args.ident {
        Some(ident) => scope::scoped(payload, ident),
        None => payload,
    };

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&args.database_url)
        .await?;
    notifier::notify(&pool, &args.prefix, &args.channel, &[payload]).await?;
    println!("Notified {}", notifier::payload::qualify(&args.prefix, &args.channel));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Notify(notify_args) => run_notify(notify_args).await,
    }
}
