//! CLI definition and process wiring for phpcs-server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthClient, CredentialStore, TideAuthClient};
use crate::config::ServiceConfig;
use crate::message::{Message, RedisConnector, Visibility};
use crate::payload::{FilePayloader, TidePayloader};
use crate::pipeline::{PhpcsAnalyzer, ProcessConfig, SourceIngester};
use crate::service::{RunMode, RunOutput, Service};
use crate::storage::FileStorage;

/// Package version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identifier stamped in at compile time.
pub const BUILD: &str = match option_env!("PHPCS_SERVER_BUILD") {
    Some(build) => build,
    None => "dev",
};

/// Response target served by the Tide payloader.
pub const TIDE_TARGET: &str = "tide";

/// Response target served by the `--output` file payloader.
pub const LOCAL_TARGET: &str = "local";

/// Queue-driven PHP_CodeSniffer audit worker.
#[derive(Parser, Debug)]
#[command(name = "phpcs-server")]
#[command(about = "Audit PHP packages with PHP_CodeSniffer and report the results")]
#[command(disable_version_flag = true)]
#[command(
    long_about = "phpcs-server pulls audit requests from a Redis queue, runs PHP_CodeSniffer over each package, stores the raw report, and posts the results to the Tide API.\n\nWith --url it audits a single package and exits instead.\n\nExample usage:\n  phpcs-server --url https://downloads.example.org/plugin.tar.gz --output ./report.json"
)]
pub struct Cli {
    /// Print version and build information, then exit.
    #[arg(long)]
    pub version: bool,

    /// Audit this source URL or path once instead of polling the queue.
    #[arg(long)]
    pub url: Option<String>,

    /// Visibility of the single audit's results (public or private).
    #[arg(long, default_value = "public")]
    pub visibility: Visibility,

    /// Also write reports to this file (response target "local").
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Version,
    Single(Message),
    Service,
}

impl Cli {
    pub fn invocation(&self) -> Invocation {
        if self.version {
            return Invocation::Version;
        }
        match &self.url {
            Some(url) => {
                let target = if self.output.is_some() {
                    LOCAL_TARGET
                } else {
                    TIDE_TARGET
                };
                Invocation::Single(Message::new(url.clone(), self.visibility, target))
            }
            None => Invocation::Service,
        }
    }
}

/// Text printed for `--version`.
pub fn version_text() -> String {
    format!("Version: {}\nBuild: {}", VERSION, BUILD)
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run.
pub async fn run() -> Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

/// Run with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> Result<()> {
    let invocation = cli.invocation();
    if invocation == Invocation::Version {
        println!("{}", version_text());
        return Ok(());
    }

    let config = ServiceConfig::from_env().context("Failed to load configuration")?;
    let credentials = CredentialStore::new();
    let auth: Arc<dyn AuthClient> = Arc::new(TideAuthClient::new(&config.tide)?);
    let process = process_config(&config, &cli, auth.clone(), credentials.clone())?;

    let mut service = Service::new(process, auth, credentials)
        .with_max_concurrent(config.max_concurrent_audits)
        .with_batch_size(config.queue.batch_size)
        .with_poll_settings(config.poll);

    let mode = match invocation {
        Invocation::Single(message) => RunMode::Single(message),
        _ => {
            config.require_queue()?;
            service = service.with_connector(Arc::new(RedisConnector::new(config.queue.clone())));
            RunMode::Service
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match service.run(mode, shutdown).await? {
        RunOutput::Single(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let Some(cause) = outcome.cause_str() {
                bail!("Audit of {} failed: {}", outcome.source_url, cause);
            }
        }
        RunOutput::Service(stats) => {
            info!(
                processed = stats.total_finished(),
                released = stats.released,
                "Shutdown complete"
            );
        }
    }
    Ok(())
}

/// Builds the pipeline configuration from the service configuration.
fn process_config(
    config: &ServiceConfig,
    cli: &Cli,
    auth: Arc<dyn AuthClient>,
    credentials: CredentialStore,
) -> Result<ProcessConfig> {
    let storage = FileStorage::new(&config.storage.root, &config.storage.bucket)?;
    let tide = TidePayloader::new(&config.tide, auth, credentials)?;
    let analyzer = PhpcsAnalyzer::new(&config.analysis.binary, &config.analysis.standard)
        .with_extensions(&config.analysis.extensions);

    let mut process = ProcessConfig::new()
        .with_ingest_temp_folder(&config.analysis.ingest_temp_folder)
        .with_analysis_temp_folder(&config.analysis.temp_folder)
        .with_storage(Arc::new(storage))
        .with_payloader(TIDE_TARGET, Arc::new(tide))
        .with_ingester(Arc::new(
            SourceIngester::new()
                .with_max_bytes(config.analysis.max_archive_bytes)
                .with_max_unpacked_bytes(config.analysis.max_unpacked_bytes),
        ))
        .with_analyzer(Arc::new(analyzer));

    if let Some(path) = &cli.output {
        process = process.with_payloader(LOCAL_TARGET, Arc::new(FilePayloader::new(path)));
    }
    Ok(process)
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.cancel();
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
    }

    info!("Termination signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("phpcs-server").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_is_service_mode() {
        let cli = parse(&[]);
        assert_eq!(cli.invocation(), Invocation::Service);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_version_wins() {
        let cli = parse(&["--version", "--url", "https://example.org/a.tar.gz"]);
        assert_eq!(cli.invocation(), Invocation::Version);
    }

    #[test]
    fn test_single_mode_targets() {
        let cli = parse(&["--url", "./plugin", "--visibility", "private"]);
        match cli.invocation() {
            Invocation::Single(message) => {
                assert_eq!(message.source_url, "./plugin");
                assert_eq!(message.visibility, Visibility::Private);
                assert_eq!(message.response_target, TIDE_TARGET);
            }
            other => panic!("expected single mode, got {:?}", other),
        }

        let cli = parse(&["--url", "./plugin", "--output", "report.json"]);
        match cli.invocation() {
            Invocation::Single(message) => assert_eq!(message.response_target, LOCAL_TARGET),
            other => panic!("expected single mode, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_visibility() {
        assert!(Cli::try_parse_from(["phpcs-server", "--visibility", "secret"]).is_err());
    }

    #[test]
    fn test_version_text() {
        let text = version_text();
        assert!(text.starts_with(&format!("Version: {}", VERSION)));
        assert!(text.contains("Build: "));
    }
}
