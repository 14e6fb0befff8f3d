//! flintlock-provider
//!
//! Command line harness around the provider core. It plays the part of the
//! provider framework: reads declared VMs and provider configuration from
//! files, runs one apply (or one `vm` data source read), and persists the
//! snapshot between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flintlock_provider::config::ProviderConfig;
use flintlock_provider::reconciler::{ReconcilerConfig, DEFAULT_MAX_CONCURRENCY};
use flintlock_provider::{ClientConfig, Diagnostics, MockTransport, Provider, RawVmConfig, VmState};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reconcile declared Flintlock microVMs.
#[derive(Debug, Parser)]
#[command(name = "flintlock-provider", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Converge the control plane to the declared VMs.
    Apply(ApplyArgs),
    /// Look one VM up on the control plane.
    Read(ReadArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Snapshot file, read before and written after the run.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Provider configuration (JSON: `authtoken`, `endpoint`).
    #[arg(long)]
    provider_config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// Declared VMs (JSON array).
    #[arg(long)]
    desired: PathBuf,

    #[command(flatten)]
    session: SessionArgs,

    /// Use an in-memory control plane instead of the configured endpoint.
    #[arg(long)]
    mock: bool,

    /// VMs reconciled concurrently.
    #[arg(long, env = "FLINTLOCK_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// VM identifier (declared or remote).
    #[arg(long)]
    id: String,

    #[command(flatten)]
    session: SessionArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the result
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let failed = match cli.command {
        Command::Apply(args) => apply(args).await?,
        Command::Read(args) => read(args).await?,
    };

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn apply(args: ApplyArgs) -> Result<bool> {
    let declared: Vec<RawVmConfig> = read_json(&args.desired)
        .with_context(|| format!("Failed to load declared VMs from {}", args.desired.display()))?;

    let Some(provider) = session(&args.session, args.mock)? else {
        return Ok(true);
    };
    let provider = provider.with_reconciler_config(ReconcilerConfig {
        max_concurrency: args.max_concurrency,
        ..Default::default()
    });

    info!(vms = declared.len(), mock = args.mock, "Applying declared VMs");

    let apply = provider.apply(&declared);
    tokio::pin!(apply);
    let result = tokio::select! {
        result = &mut apply => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            provider.cancel();
            apply.await
        }
    };

    if let Some(path) = &args.session.state {
        let json = serde_json::to_string_pretty(&result.snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write state to {}", path.display()))?;
    }

    print_diagnostics(&result.diagnostics);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "outcomes": result.outcomes,
            "diagnostics": result.diagnostics,
        }))?
    );

    Ok(result.has_error())
}

async fn read(args: ReadArgs) -> Result<bool> {
    let Some(provider) = session(&args.session, false)? else {
        return Ok(true);
    };

    let (vm, diagnostics) = provider.read_vm(&args.id).await;
    print_diagnostics(&diagnostics);
    if let Some(vm) = vm {
        println!("{}", serde_json::to_string_pretty(&vm)?);
    }

    Ok(diagnostics.has_error())
}

/// Build the provider session. `None` means configuration failed and the
/// diagnostics were already printed.
fn session(args: &SessionArgs, mock: bool) -> Result<Option<Provider>> {
    let config: ProviderConfig = match &args.provider_config {
        Some(path) => read_json(path)
            .with_context(|| format!("Failed to load provider config from {}", path.display()))?,
        None => ProviderConfig::default(),
    };

    let provider = if mock {
        let client_config = match ClientConfig::from_env(&config) {
            Ok(client_config) => client_config,
            Err(diagnostics) => {
                print_diagnostics(&diagnostics);
                return Ok(None);
            }
        };
        Provider::with_transport(Arc::new(MockTransport::new()), client_config)
    } else {
        match Provider::configure(&config, |name| std::env::var(name).ok()) {
            Ok(provider) => provider,
            Err(diagnostics) => {
                print_diagnostics(&diagnostics);
                return Ok(None);
            }
        }
    };

    let snapshot = match &args.state {
        Some(path) => load_state(path)?,
        None => BTreeMap::new(),
    };

    Ok(Some(provider.with_snapshot(snapshot)))
}

fn load_state(path: &Path) -> Result<BTreeMap<String, VmState>> {
    if !path.exists() {
        warn!(path = %path.display(), "State file not found, starting empty");
        return Ok(BTreeMap::new());
    }
    read_json(path).with_context(|| format!("Failed to load state from {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn print_diagnostics(diagnostics: &Diagnostics) {
    for diagnostic in diagnostics {
        eprintln!("{diagnostic}");
    }
}
