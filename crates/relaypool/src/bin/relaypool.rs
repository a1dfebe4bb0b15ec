use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use nostr_relaypool::{
    Filter, InMemoryRelayServer, PoolOptions, RelayPool, SubscriptionOptions, on_eose, on_event,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "relaypool", about = "Nostr relay pool client and test relay", version)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-memory relay
    Serve {
        /// Port to listen on (0 picks a free one)
        #[arg(long, default_value_t = 7777)]
        port: u16,
    },
    /// Subscribe and print stored events as JSON lines
    Req {
        /// Relay URL, repeatable
        #[arg(long = "relay")]
        relays: Vec<String>,

        /// Author pubkey (hex), repeatable
        #[arg(long = "author")]
        authors: Vec<String>,

        /// Event kind, repeatable
        #[arg(long = "kind")]
        kinds: Vec<u16>,

        #[arg(long)]
        limit: Option<u64>,

        /// Pool options TOML file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Fetch one event by id
    Get {
        id: String,

        /// Relay URL, repeatable
        #[arg(long = "relay", required = true)]
        relays: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_tracing();

    match opts.command {
        Command::Serve { port } => serve(port).await,
        Command::Req {
            relays,
            authors,
            kinds,
            limit,
            config,
        } => req(relays, authors, kinds, limit, config).await,
        Command::Get { id, relays } => get(&id, relays).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let server = InMemoryRelayServer::bind(&format!("127.0.0.1:{}", port)).await?;
    println!("{}", server.url());
    server.run().await;
    Ok(())
}

async fn req(
    relays: Vec<String>,
    authors: Vec<String>,
    kinds: Vec<u16>,
    limit: Option<u64>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let options = match &config {
        Some(path) => PoolOptions::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PoolOptions::default(),
    };
    let relays = if relays.is_empty() {
        options.relays.clone()
    } else {
        relays
    };
    if relays.is_empty() {
        bail!("no relays given; pass --relay or set relays in the config file");
    }

    let mut filter = Filter::new();
    if !authors.is_empty() {
        filter = filter.authors(authors);
    }
    if !kinds.is_empty() {
        filter = filter.kinds(kinds);
    }
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }

    let lookup_timeout = options.lookup_timeout;
    let pool = RelayPool::new(options)?;

    let (done_tx, done) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    let remaining = Arc::new(Mutex::new(relays.len()));
    let handle = pool
        .subscribe(
            vec![filter],
            Some(relays),
            on_event(|event, _, _| match serde_json::to_string(event) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to print event {}: {}", event.id, e),
            }),
            None,
            Some(on_eose(move |relay, _| {
                info!("EOSE from {}", relay);
                let mut remaining = remaining.lock();
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0
                    && let Some(tx) = done_tx.lock().take()
                {
                    let _ = tx.send(());
                }
            })),
            SubscriptionOptions::default(),
        )
        .await?;

    if tokio::time::timeout(lookup_timeout * 3, done).await.is_err() {
        warn!("Not every relay sent EOSE in time");
    }
    handle.cancel();
    pool.close().await;
    Ok(())
}

async fn get(id: &str, relays: Vec<String>) -> anyhow::Result<()> {
    let pool = RelayPool::new(PoolOptions::default())?;
    let event = pool.get_event_by_id(id, Some(relays), None).await;
    pool.close().await;
    println!("{}", serde_json::to_string_pretty(&event?)?);
    Ok(())
}
