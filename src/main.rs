use std::sync::Arc;

use clap::Parser;
use config::Config;
use tracing::info;
use tvgate::create_app;
use tvgate::registry::StreamRegistry;
use tvgate::settings::Settings;
use tvgate::tuner::HttpTuner;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}", args.config);

    let streaming = Arc::new(settings.streaming);
    tokio::fs::create_dir_all(&streaming.stream_dir).await?;

    let tuner = Arc::new(HttpTuner::new(streaming.tuner_url.clone())?);
    let registry = StreamRegistry::new(streaming, tuner);

    info!("Stream slots available: {}", registry.capacity());

    let app = create_app(registry.clone());

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    registry.forced_stop_all().await;
    Ok(())
}
