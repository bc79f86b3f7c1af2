use std::sync::Arc;
use anyhow::{Context, Result};
use privd::config::{self, Config};
use privd::mdns::MdnsAnnouncer;
use privd::payload::StaticService;
use privd::registry::FsRegistry;
use privd::{takeover, ExitStatus, Host, Takeover};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; RUST_LOG overrides the verbose toggle
    let default_filter = if config::verbose_logging() {
        "privd=debug"
    } else {
        "privd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter))
        )
        .init();

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/privd/privd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let identity = config.service.identity()?;
    tracing::info!("Starting privd for {}", identity);

    let registry = Arc::new(FsRegistry::new(&config.runtime.registry_dir));

    let claimed = match takeover(
        registry.as_ref(),
        &identity,
        &config.runtime.socket_dir,
        config.runtime.takeover_timeout(),
    )
    .await?
    {
        Takeover::Deferred => {
            // Our work is done
            std::process::exit(ExitStatus::Success.code());
        }
        Takeover::Claimed(claimed) => claimed,
    };

    let announcer = Arc::new(MdnsAnnouncer::new(
        &config.discovery.interface,
        &config.discovery.address,
    )?);
    let service = Box::new(StaticService::new(
        config.payload.handle.clone(),
        config.payload.keep_alive,
    ));

    let host = Host::start(
        claimed,
        &config.service.artifact,
        registry,
        announcer,
        service,
    )
    .await?;

    let status = host.wait().await;
    tracing::info!("Exiting with {:?}", status);
    std::process::exit(status.code());
}
