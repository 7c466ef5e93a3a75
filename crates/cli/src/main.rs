//! CLI for the Custos relationship-based access-control service.
//!
//! Startup: load snapshot -> resolve tuple store -> rehydrate -> open mutating routes.

use clap::{Args, Parser, Subcommand};
use custos_api::{router, ApiConfig, AppState};
use custos_core::DomainStore;
use custos_engine::{derive_tuples, rehydrate, Services};
use custos_provider::audit::DEFAULT_QUEUE_CAPACITY;
use custos_provider::openfga::StoreSelector;
use custos_provider::{AuditDispatcher, Audited, MemoryTupleStore, OpenFgaClient, TupleStore};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "custos", version, about = "Relationship-based access control for dossiers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service.
    Serve(ServeArgs),

    /// Print the tuples a snapshot implies, one JSON object per line.
    Tuples {
        #[arg(long, env = "CUSTOS_DATA_FILE", default_value = "data/custos.json")]
        data_file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "CUSTOS_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    #[arg(long, env = "CUSTOS_DATA_FILE", default_value = "data/custos.json")]
    data_file: PathBuf,

    #[arg(long, env = "CUSTOS_FGA_URL", default_value = "http://127.0.0.1:8081")]
    fga_url: String,

    /// Discovered by name when absent.
    #[arg(long, env = "CUSTOS_FGA_STORE_ID")]
    fga_store_id: Option<String>,

    /// Latest model of the store when absent.
    #[arg(long, env = "CUSTOS_FGA_MODEL_ID")]
    fga_model_id: Option<String>,

    #[arg(long, env = "CUSTOS_FGA_STORE_NAME", default_value = "custos")]
    fga_store_name: String,

    #[arg(long, env = "CUSTOS_SUBJECT_HEADER", default_value = "x-forwarded-user")]
    subject_header: String,

    /// Honor `x-admin-channel: true`. The upstream proxy must strip it from
    /// end-user traffic.
    #[arg(long, env = "CUSTOS_TRUST_ADMIN_HEADER", default_value_t = false)]
    trust_admin_header: bool,

    /// Also append audit records to this NDJSON file.
    #[arg(long, env = "CUSTOS_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    #[arg(long, env = "CUSTOS_BOOTSTRAP_ATTEMPTS", default_value_t = 30)]
    bootstrap_attempts: u32,

    #[arg(long, env = "CUSTOS_BOOTSTRAP_INTERVAL_MS", default_value_t = 2000)]
    bootstrap_interval_ms: u64,

    /// Use the in-memory tuple store instead of OpenFGA.
    #[arg(long, env = "CUSTOS_MEMORY_STORE", default_value_t = false)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Tuples { data_file } => {
            let store = DomainStore::load(&data_file);
            let tuples = store.read(derive_tuples);

            let mut out = std::io::BufWriter::new(std::io::stdout().lock());
            for tuple in &tuples {
                serde_json::to_writer(&mut out, tuple)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            tracing::info!(tuples = tuples.len(), path = %data_file.display(), "derived tuples");
        }
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(DomainStore::load(&args.data_file));
    let audit = AuditDispatcher::spawn(DEFAULT_QUEUE_CAPACITY, args.audit_log.as_deref())?;

    // Rehydration goes to the raw backend so replayed tuples are not audited.
    let (backend, fga): (Arc<dyn TupleStore>, Option<Arc<OpenFgaClient>>) = if args.memory_store {
        tracing::warn!("using the in-memory tuple store; authorization state is lost on exit");
        (Arc::new(MemoryTupleStore::new()), None)
    } else {
        let client = Arc::new(OpenFgaClient::new(&args.fga_url)?);
        (client.clone(), Some(client))
    };
    let tuples: Arc<dyn TupleStore> = Arc::new(Audited::new(backend.clone(), audit));

    let state = AppState::new(
        Services::new(store.clone(), tuples.clone()),
        tuples,
        &ApiConfig {
            subject_header: args.subject_header.clone(),
            trust_admin_header: args.trust_admin_header,
        },
    )?;

    let selector = StoreSelector {
        name: args.fga_store_name.clone(),
        store_id: args.fga_store_id.clone(),
        model_id: args.fga_model_id.clone(),
    };
    let interval = Duration::from_millis(args.bootstrap_interval_ms);
    let attempts = args.bootstrap_attempts;

    let bootstrap = {
        let (state, store) = (state.clone(), store.clone());
        tokio::spawn(async move {
            let t0 = Instant::now();
            if let Some(client) = fga {
                if let Err(e) = client.resolve_with_retry(&selector, attempts, interval).await {
                    tracing::error!(error = %e, "tuple store unavailable; mutating routes stay closed");
                    return;
                }
            }

            let report = rehydrate(&store, &*backend).await;
            state.mark_ready();
            tracing::info!(
                tuples = report.total,
                failed_batches = report.failed_batches,
                elapsed_ms = t0.elapsed().as_millis(),
                "ready"
            );
        })
    };

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, data_file = %args.data_file.display(), "custos listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    bootstrap.abort();
    store.save()?;
    tracing::info!("domain snapshot saved, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
