use clap::Parser;
use online_infer::InferenceError;
use online_infer::config::OnlineConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "online_infer")]
#[command(about = "Serve online inference over a paged term cache", long_about = None)]
struct Cli {
    /// JSON config file; ONLINE_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding model.bin, manifest.bin and pages/
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Write <predicate>.txt files here once stopped
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    /// 0 picks a free port
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(cli: Cli) -> Result<OnlineConfig, InferenceError> {
    let mut config = OnlineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.cache_dir {
        config.cache.cache_dir = dir;
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = Some(dir);
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let result = match load_config(Cli::parse()) {
        Ok(config) => online_infer::server::run(config).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "online inference failed");
            ExitCode::FAILURE
        }
    }
}
