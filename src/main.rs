use clap::{Parser, ValueEnum};
use miette::Result;
use sitegate::{settings, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "sitegate",
    version,
    about = "Access-control gateway for static sites"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(
        config = %cli.config,
        host = %settings.server.host,
        port = settings.server.port,
        access_file = %settings.access_file_path().display(),
        "Loaded configuration"
    );

    web::serve(settings).await
}
