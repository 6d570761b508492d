use clap::{Parser, ValueEnum};
use interbank_adapters::PeerTimeouts;
use interbank_core::{BankCode, NodeConfig, PeerDirectory, PeerEndpoint, StorageConfig};
use interbank_service::{build_router, ServiceConfig, ServiceState};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "interbankd", version, about = "Interbank settlement node")]
struct Cli {
    /// Identity of this bank on the peer network, e.g. vbank.
    #[arg(long, env = "INTERBANK_BANK_CODE")]
    bank_code: String,
    /// REST socket address to bind.
    #[arg(long, default_value = "127.0.0.1:8000", env = "INTERBANK_LISTEN")]
    listen: SocketAddr,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "INTERBANK_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for accounts, payments, transfers and capital.
    #[arg(long, env = "INTERBANK_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "INTERBANK_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Peer bank as CODE=URL. Repeat for each peer; probing follows this order.
    #[arg(long = "peer", env = "INTERBANK_PEERS", value_delimiter = ',')]
    peers: Vec<PeerEndpoint>,
    /// Deadline for a settlement call to a peer.
    #[arg(long, default_value_t = 10, env = "INTERBANK_SETTLE_TIMEOUT_SECS")]
    settle_timeout_secs: u64,
    /// Deadline for an account probe.
    #[arg(long, default_value_t = 5, env = "INTERBANK_PROBE_TIMEOUT_SECS")]
    probe_timeout_secs: u64,
    /// Capital baseline used when the capital row is first created.
    #[arg(long, default_value = "3500000", env = "INTERBANK_INITIAL_CAPITAL")]
    initial_capital: Decimal,
    /// Largest |capital - total balances| still reported as balanced.
    #[arg(long, default_value = "1000", env = "INTERBANK_CAPITAL_TOLERANCE")]
    capital_tolerance: Decimal,
    /// Currency for accounts and payments that do not name one.
    #[arg(long, default_value = "RUB", env = "INTERBANK_CURRENCY")]
    currency: String,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn node_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    if cli.bank_code.trim().is_empty() {
        anyhow::bail!("--bank-code must not be empty");
    }

    let mut config = NodeConfig::new(BankCode::new(cli.bank_code.trim()));
    config.peers = PeerDirectory::new(cli.peers.clone());
    config.storage = resolve_storage(cli)?;
    config.initial_capital = cli.initial_capital;
    config.capital_tolerance = cli.capital_tolerance;
    config.default_currency = cli.currency.clone();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "interbank_service=info,interbank_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        node: node_config(&cli)?,
        timeouts: PeerTimeouts {
            probe: Duration::from_secs(cli.probe_timeout_secs),
            settle: Duration::from_secs(cli.settle_timeout_secs),
        },
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        bank = %cli.bank_code,
        peers = cli.peers.len(),
        "interbank-service REST listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}
