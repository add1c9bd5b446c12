use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use poem::Server;
use poem::listener::TcpListener;
use regex::Regex;
use tracing::info;

use acmed_rs::acme::{self, AppState};
use acmed_rs::config::Settings;
use acmed_rs::mail::Mailer;
use acmed_rs::store::memory::MemoryStore;
use acmed_rs::{ca, nonce, notifier};

#[derive(Parser, Debug)]
#[command(author, version, about = "A self-hosted ACME certificate authority", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::new(cli.config).context("failed to load configuration")?;
    settings.validate().context("invalid configuration")?;

    let store: Arc<dyn acmed_rs::store::Store> = Arc::new(MemoryStore::new());

    if settings.ca.enabled {
        let encryption_key = ca::fernet::parse_key(&settings.ca.encryption_key)?;
        ca::ensure_active_ca(
            store.as_ref(),
            settings.ca.import_dir.as_deref(),
            &encryption_key,
            settings.ca.crl_lifetime,
        )
        .await
        .context("failed to establish an active CA at startup")?;
    }

    let mailer = if settings.mail.host.trim().is_empty() {
        None
    } else {
        Some(Mailer::new(&settings.mail).context("failed to configure mail transport")?)
    };

    let target_domain_regex =
        Regex::new(&settings.acme.target_domain_regex).context("acme.target_domain_regex failed to compile")?;
    let mail_target_regex =
        Regex::new(&settings.acme.mail_target_regex).context("acme.mail_target_regex failed to compile")?;

    let listen_addr = settings.listen_addr.clone();
    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        settings,
        probe_client: acme::http01_probe::build_client(),
        mailer,
        target_domain_regex,
        mail_target_regex,
    });

    tokio::spawn(nonce::run_purge_loop(Arc::clone(&store)));
    tokio::spawn(notifier::run_crl_rebuild_loop(Arc::clone(&state)));
    tokio::spawn(notifier::run_expiry_notifier_loop(Arc::clone(&state)));

    let app = acme::routes(state);

    info!("listening on {listen_addr}");
    Server::new(TcpListener::bind(listen_addr))
        .run(app)
        .await
        .context("ACME server exited")
}
