use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use librc2::{AppConfig, MemoryDao, Rc2Dao};
use rc2_server::{AppState, LoginToken, TokenSigner};

#[derive(Parser, Debug)]
#[command(name = "rc2-server", version, about = "rc2 session broker")]
struct Args {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `listen_addr` from the config.
    #[arg(long)]
    listen: Option<String>,

    /// JSON file of users, projects, workspaces and files for the in-memory
    /// data layer.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Print a login token for this user id and exit.
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<i64>,
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rc2_server=info,librc2=info,tower_http=info".into());

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file path {} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref())
        .with_context(|| match &args.config {
            Some(path) => format!("failed to load config {}", path.display()),
            None => "invalid default config".to_string(),
        })?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    if let Some(user_id) = args.issue_token {
        let secret = config
            .auth
            .token_secret
            .as_deref()
            .context("auth.token_secret must be configured")?;
        let signer = TokenSigner::new(secret)?;
        println!("{}", signer.issue(LoginToken { id: 0, user_id })?);
        return Ok(());
    }

    let _log_guard = init_tracing(config.log_file_path.as_deref())?;

    let dao: Arc<dyn Rc2Dao> = match &args.seed {
        Some(path) => Arc::new(
            MemoryDao::load_seed(path)
                .with_context(|| format!("failed to load seed data {}", path.display()))?,
        ),
        None => {
            tracing::warn!("no seed data given, starting with an empty data store");
            Arc::new(MemoryDao::new())
        }
    };

    let state = AppState::from_config(&config, dao)?;
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    tracing::info!("rc2-server listening on {}", config.listen_addr);
    rc2_server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down");
    })
    .await
}
