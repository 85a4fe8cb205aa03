use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use govconnect_bus::BusClient;
use govconnect_core::config::AppConfig;
use govconnect_forwarder::{EventPublisher, Forwarder};
use govconnect_guard::{SpamGuard, SpamGuardConfig};
use govconnect_ingest::media::MediaStorage;
use govconnect_ingest::Ingest;
use govconnect_livechat::LiveChat;
use govconnect_provider::ProviderClient;
use govconnect_server::AppState;
use govconnect_session::{SessionManager, StoreTokenResolver};
use govconnect_store::Store;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pending rows finished longer than this are swept by the janitor.
const PENDING_RETENTION_HOURS: i64 = 24;
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Hard deadline for the shutdown sequence.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "govconnect-channel")]
#[command(version = VERSION)]
#[command(about = "Channel gateway between messaging providers and the AI orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (HTTP listener, bus consumers, background sweeps)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Print configuration readiness and exit
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Migrate => migrate().await,
        Commands::Status => status(),
    }
}

async fn migrate() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    Store::connect(&config.database_url).await?;
    info!("migrations applied");
    Ok(())
}

fn status() -> anyhow::Result<()> {
    match AppConfig::load() {
        Ok(config) => {
            println!("govconnect-channel {VERSION}");
            println!("  database          configured");
            println!("  rabbitmq          configured");
            println!(
                "  wa gateway        {}",
                config.wa_api_url.as_deref().unwrap_or("(unset)")
            );
            println!(
                "  wa support plane  {}",
                config.wa_support_url.as_deref().unwrap_or("(unset, degraded mode)")
            );
            println!(
                "  public base url   {}",
                config.public_channel_base_url.as_deref().unwrap_or("(unset)")
            );
            println!("  spam guard        {}", if config.spam_guard_enabled { "on" } else { "off" });
            println!("  dry run           {}", if config.wa_dry_run { "on" } else { "off" });
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration incomplete: {e}");
            std::process::exit(1);
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    info!("starting channel gateway {VERSION}");

    let store = Store::connect(&config.database_url).await?;
    let settings = store.reload_settings().await?;
    info!(
        auto_read = settings.auto_read_messages,
        typing = settings.typing_indicator,
        "settings loaded"
    );

    let guard = SpamGuard::new(SpamGuardConfig::from_app(&config));
    let gc_task = Arc::clone(&guard).spawn_gc();

    let provider = Arc::new(ProviderClient::new(
        &config,
        Arc::new(StoreTokenResolver::new(store.clone())),
    ));

    let bus = BusClient::new(&config.rabbitmq_url);
    let publisher: Arc<dyn EventPublisher> = bus.clone();

    let forwarder = Forwarder::new(
        store.clone(),
        Arc::clone(&provider),
        Arc::clone(&guard),
        Arc::clone(&publisher),
        &config,
    );
    Arc::clone(&forwarder).register_consumers(&bus).await;
    Arc::clone(&bus).start().await?;

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        Arc::clone(&provider),
        &config,
    ));
    let ingest = Ingest::new(
        store.clone(),
        Arc::clone(&guard),
        Arc::clone(&forwarder),
        MediaStorage::new(&config),
        config.default_village_id.clone(),
    );
    let livechat = Arc::new(LiveChat::new(
        store.clone(),
        Arc::clone(&provider),
        Arc::clone(&forwarder),
        Arc::clone(&guard),
        Arc::clone(&publisher),
    ));

    let janitor_store = store.clone();
    let janitor_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match janitor_store
                .sweep_finished_pending(PENDING_RETENTION_HOURS)
                .await
            {
                Ok(swept) if swept > 0 => info!(swept, "janitor swept pending rows"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "janitor sweep failed"),
            }
        }
    });

    let state = AppState {
        webhook_allowlist: Arc::new(config.webhook_allowlist()),
        config: Arc::new(config),
        store: store.clone(),
        provider,
        sessions,
        ingest,
        livechat,
        bus: Arc::clone(&bus),
    };

    govconnect_server::serve(state, shutdown_signal()).await?;

    // Drain order: retries first (nothing new reaches the bus), then the
    // bus, then the pool. Bounded by a hard deadline.
    info!("shutting down");
    let cleanup = async {
        forwarder.flush_retries();
        bus.shutdown().await;
        store.close().await;
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, cleanup).await.is_err() {
        error!("shutdown deadline exceeded, forcing exit");
    }
    gc_task.abort();
    janitor_task.abort();

    info!("channel gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "SIGTERM handler failed"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
