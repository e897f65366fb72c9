use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tubefetch::{
    account::{AccountStore, InMemoryAccountStore, QuotaLedger, SqliteAccountStore},
    api::{AppState, router},
    config::{DEFAULT_CONFIG_PATH, EnvConfig, ResolverKind, RuntimeConfig, load_runtime_config_from},
    jobs::{CoordinatorSettings, DownloadCoordinator},
    resolver::{InvidiousResolver, MetadataResolver, YtDlpResolver},
    retrieval::RetrievalStore,
    session::SessionRegistry,
    transcode::FfmpegTranscoder,
};

const DEFAULT_LOG_FILTER: &str = "tubefetch=info,backend=info";

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the tubefetch download API.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        env = "TUBEFETCH_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        help = "KEY=\"value\" settings file"
    )]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Port to bind")]
    port: Option<u16>,
    #[arg(
        long = "scratch-root",
        value_name = "PATH",
        help = "Directory holding per-job scratch scopes"
    )]
    scratch_root: Option<PathBuf>,
    #[arg(
        long = "account-db",
        value_name = "PATH",
        help = "SQLite file for accounts (in memory when unset)"
    )]
    account_db: Option<PathBuf>,
    #[arg(long = "free-limit", value_name = "N", help = "Downloads allowed per free account")]
    free_limit: Option<u32>,
    #[arg(long = "resolver", value_name = "KIND", help = "ytdlp or invidious")]
    resolver: Option<String>,
    #[arg(long = "invidious-url", value_name = "URL", help = "Base URL of the metadata API")]
    invidious_url: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Result<EnvConfig> {
        Ok(EnvConfig {
            host: self.host.clone(),
            port: self.port,
            scratch_root: self.scratch_root.clone(),
            account_db: self.account_db.clone(),
            free_limit: self.free_limit,
            resolver: self
                .resolver
                .as_deref()
                .map(str::parse::<ResolverKind>)
                .transpose()
                .context("parsing --resolver")?,
            invidious_url: self.invidious_url.clone(),
            ..EnvConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let config = load_runtime_config_from(&cli.config, cli.overrides()?)
        .with_context(|| format!("loading configuration (file {})", cli.config.display()))?;

    let store: Arc<dyn AccountStore> = match &config.account_db {
        Some(path) => Arc::new(
            SqliteAccountStore::open(path)
                .with_context(|| format!("opening account database {}", path.display()))?,
        ),
        None => {
            warn!("ACCOUNT_DB not set; accounts live in memory and vanish on restart");
            Arc::new(InMemoryAccountStore::new())
        }
    };
    let ledger = QuotaLedger::new(store, config.free_limit);
    let sessions = Arc::new(SessionRegistry::new(config.session_ttl));

    let retrieval = Arc::new(RetrievalStore::new(&config.scratch_root, config.stale_after));
    let purged = retrieval
        .purge_all()
        .with_context(|| format!("preparing scratch root {}", config.scratch_root.display()))?;
    if purged > 0 {
        info!(purged, "removed leftover scratch entries");
    }

    let coordinator = DownloadCoordinator::new(
        ledger.clone(),
        build_resolver(&config),
        Arc::new(FfmpegTranscoder::new(&config.ffmpeg_bin)),
        retrieval.clone(),
        CoordinatorSettings {
            resolve_timeout: config.resolve_timeout,
            transcode_timeout: config.transcode_timeout,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
        },
    );

    let cancel = CancellationToken::new();
    let reaper = coordinator.spawn_reaper(sessions.clone(), config.sweep_interval, cancel.clone());

    let app = router(AppState {
        ledger,
        sessions,
        coordinator,
        retrieval,
    });

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("parsing host {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(resolver = ?config.resolver, free_limit = config.free_limit, "API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    cancel.cancel();
    if let Err(err) = reaper.await {
        warn!("reaper task ended abnormally: {err}");
    }
    info!("shut down");
    Ok(())
}

fn build_resolver(config: &RuntimeConfig) -> Arc<dyn MetadataResolver> {
    match (config.resolver, config.invidious_url.as_deref()) {
        (ResolverKind::Invidious, Some(base_url)) => {
            Arc::new(InvidiousResolver::new(base_url, config.resolve_timeout))
        }
        _ => Arc::new(YtDlpResolver::new(
            &config.ytdlp_bin,
            config.ytdlp_cookies.clone(),
        )),
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}
