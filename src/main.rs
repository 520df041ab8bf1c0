//! Profile state controller binary

use std::path::PathBuf;

use clap::builder::TypedValueParser;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use profile_state::config::{ExceptionList, PolicyConfig};
use profile_state::controller::{ControllerConfig, ControllerRunner};
use profile_state::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use profile_state::DEFAULT_WORKERS;

/// Maintains derived feature labels on Kubeflow profiles and namespaces
#[derive(Parser, Debug)]
#[command(name = "profile-state-controller", version, about, long_about = None)]
struct Cli {
    /// Number of concurrent reconciliation workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS,
          value_parser = clap::value_parser!(u16).range(1..).map(usize::from))]
    workers: usize,

    /// YAML file mapping policy ids to excepted subjects
    #[arg(long, env = "EXCEPTIONS_FILE")]
    exceptions_file: Option<PathBuf>,

    /// Image reference prefix marking a restricted workload (repeatable)
    #[arg(long = "restricted-image-prefix")]
    restricted_image_prefixes: Vec<String>,

    /// Email domain treated as organisation-internal (repeatable)
    #[arg(long = "internal-domain")]
    internal_domains: Vec<String>,

    /// PVC name substring denoting protected storage (repeatable)
    #[arg(long = "protected-storage-marker")]
    protected_storage_markers: Vec<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    let policy = PolicyConfig::from_overrides(
        cli.restricted_image_prefixes,
        cli.internal_domains,
        cli.protected_storage_markers,
    );
    let exceptions = ExceptionList::load_or_empty(cli.exceptions_file.as_deref());
    info!(
        workers = cli.workers,
        restricted_image_prefixes = ?policy.restricted_image_prefixes,
        internal_domains = ?policy.internal_domains,
        protected_storage_markers = ?policy.protected_storage_markers,
        exception_subjects = exceptions.subject_count(),
        "starting profile state controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {e}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let config = ControllerConfig {
        workers: cli.workers,
        policy,
        exceptions,
    };
    ControllerRunner::new(client, config).run(shutdown).await?;

    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
    shutdown.cancel();
}
