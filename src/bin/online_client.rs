use clap::Parser;
use online_infer::InferenceError;
use online_infer::client::{OnlineClient, write_responses};
use online_infer::config::{DEFAULT_HOST, DEFAULT_PORT, default_ready_marker_path};
use online_infer::readiness::{Backoff, wait_for_marker};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "online_client")]
#[command(about = "Send actions to a running online inference server", long_about = None)]
struct Cli {
    /// Server host; defaults to the address in the ready marker
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Action file, one action per line; stdin when omitted
    #[arg(long)]
    actions: Option<PathBuf>,
    /// Response file; stdout when omitted
    #[arg(long)]
    output: Option<PathBuf>,
    /// Ready marker written by the server
    #[arg(long)]
    ready_marker: Option<PathBuf>,
}

async fn run(cli: Cli) -> Result<(), InferenceError> {
    let backoff = Backoff::default();
    let marker = cli.ready_marker.unwrap_or_else(default_ready_marker_path);
    let announced = wait_for_marker(&marker, backoff).await?;

    let addr = match (cli.host, cli.port, announced) {
        (None, None, Some(addr)) => addr.to_string(),
        (host, port, _) => format!(
            "{}:{}",
            host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port.unwrap_or(DEFAULT_PORT)
        ),
    };
    let mut client = OnlineClient::connect(&addr, backoff).await?;

    let exchange = match cli.actions {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await.map_err(|e| {
                InferenceError::Config(format!("cannot open actions {}: {}", path.display(), e))
            })?;
            client.run(BufReader::new(file)).await
        }
        None => client.run(BufReader::new(tokio::io::stdin())).await,
    };
    info!(responses = exchange.responses.len(), "done");
    // Whatever was answered is written even when the exchange was cut short.
    write_responses(&exchange.responses, cli.output.as_deref())?;
    exchange.into_result().map(|_| ())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "client failed");
            ExitCode::FAILURE
        }
    }
}
