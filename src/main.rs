use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogConfig, TurnstileConfig};
use turnstile::error::TurnstileError;
use turnstile::ratelimit::{
    ClientIdentity, CounterStore, Decision, Gatekeeper, MemoryStore, TimeoutStore,
};

/// Admission filter: reads `<address> [principal]` lines on stdin and
/// writes one JSON decision per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the policy to apply
    #[arg(short, long)]
    policy: String,
}

/// One line of output.
#[derive(Debug, Serialize)]
struct DecisionRecord {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    principal: Option<String>,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DecisionRecord {
    fn new(request: ClientIdentity, result: Result<Decision, TurnstileError>) -> Self {
        let mut record = Self {
            address: request.address,
            principal: request.principal,
            allowed: false,
            count: None,
            redirect_target: None,
            error: None,
        };

        match result {
            Ok(Decision::Allowed { count }) => {
                record.allowed = true;
                record.count = Some(count);
            }
            Ok(Decision::Denied {
                count,
                redirect_target,
            }) => {
                record.count = Some(count);
                record.redirect_target = redirect_target;
            }
            Err(e) => record.error = Some(e.to_string()),
        }

        record
    }
}

/// Parse `<address> [principal]`. Blank lines and `#` comments yield `None`.
fn parse_request_line(line: &str) -> Option<ClientIdentity> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let identity = ClientIdentity::new(fields.next()?);
    Some(match fields.next() {
        Some(principal) => identity.with_principal(principal),
        None => identity,
    })
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match args.config {
        Some(ref path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::from_env()?,
    };

    init_tracing(&config.log);

    info!("Starting Turnstile admission filter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policies = config.policy_set()?;
    info!(policies = policies.len(), "Configuration loaded");

    let memory = Arc::new(MemoryStore::new());
    let sweeper = memory.clone().spawn_sweeper(config.store.sweep_interval());
    let store = Arc::new(TimeoutStore::new(memory, config.store.operation_timeout()));

    let gatekeeper = Gatekeeper::new(store, policies);
    let policy = gatekeeper.policy(&args.policy)?;
    info!(
        policy = %args.policy,
        max_requests = policy.max_requests(),
        window = ?policy.window(),
        mode = %policy.mode(),
        "Applying policy"
    );

    let result = run_filter(
        &gatekeeper,
        &args.policy,
        BufReader::new(tokio::io::stdin()),
        &mut tokio::io::stdout(),
        shutdown_signal(),
    )
    .await;

    sweeper.abort();
    info!("Turnstile admission filter stopped");
    result
}

/// Decide each request line from `input` against the named policy and write
/// one JSON record per request to `output`, until input ends or `shutdown`
/// resolves. Lines that are not valid UTF-8 are logged and skipped.
async fn run_filter<S, R, W, F>(
    gatekeeper: &Gatekeeper<S>,
    policy: &str,
    input: R,
    output: &mut W,
    shutdown: F,
) -> anyhow::Result<()>
where
    S: CounterStore,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let mut lines = SplitStream::new(input.split(b'\n'));
    tokio::pin!(shutdown);

    loop {
        let segment = tokio::select! {
            _ = &mut shutdown => break,
            segment = lines.next() => segment,
        };

        let bytes = match segment {
            Some(bytes) => bytes?,
            None => {
                info!("Input closed");
                break;
            }
        };

        let line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Skipping input line that is not valid UTF-8");
                continue;
            }
        };

        let Some(request) = parse_request_line(&line) else {
            continue;
        };

        let result = gatekeeper.check(policy, &request).await;
        if let Err(ref e) = result {
            warn!(address = %request.address, error = %e, "Could not decide request");
        }

        let mut record = serde_json::to_string(&DecisionRecord::new(request, result))?;
        record.push('\n');
        output.write_all(record.as_bytes()).await?;
        output.flush().await?;
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
