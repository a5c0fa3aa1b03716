//! verge-agent: keeps a node connected to the Verge control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};

use verge_agent::library::ResourceLibrary;
use verge_agent::registry::{DeviceRegistry, MemoryRegistry};
use verge_agent::reporter::metadata::app_start_time;
use verge_agent::session;
use verge_agent::{
    AgentConfig, CredentialCell, Dispatcher, HandlerContext, HandlerRegistry, Reporter,
    SessionController,
};

#[derive(Parser)]
#[command(name = "verge-agent")]
#[command(about = "Keeps a node connected to the Verge control plane")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "verge-agent.toml")]
    config: PathBuf,

    /// Control-plane base address (overrides config file)
    #[arg(long, env = "VERGE_BASE_URL")]
    base_url: Option<String>,

    /// Node serial number (overrides config file)
    #[arg(long, env = "VERGE_SERIAL_NUMBER")]
    serial_number: Option<String>,

    /// Resource directory (overrides config file)
    #[arg(long, env = "VERGE_RESOURCE_PATH")]
    resource_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("verge_agent=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    app_start_time();

    let mut config = AgentConfig::load(&cli.config)?;
    if let Some(base_url) = cli.base_url {
        config.server.base_url = base_url;
    }
    if let Some(serial_number) = cli.serial_number {
        config.server.serial_number = serial_number;
    }
    if let Some(resource_path) = cli.resource_path {
        config.resources.path = resource_path;
    }
    config.validate()?;

    info!(
        event = "agent_starting",
        base_url = %config.server.base_url,
        serial_number = %config.server.serial_number,
        resources = %config.resources.path.display()
    );

    let http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()?;
    let credentials = CredentialCell::default();
    let registry = Arc::new(MemoryRegistry::new());
    let library = ResourceLibrary::new(&config.resources.path);

    let reporter = Arc::new(Reporter::new(
        http.clone(),
        config.server.serial_number.clone(),
        credentials.clone(),
        registry.clone(),
        registry.clone(),
        library.clone(),
    ));
    let dispatcher = Dispatcher::new(
        HandlerRegistry::standard(),
        HandlerContext::new(reporter.clone(), registry.clone(), library, http.clone()),
    );

    let session_config = config.session_config();
    let controller = session::shared_or_init(|| {
        SessionController::new(session_config, http, credentials, Arc::new(dispatcher))
    });
    controller.start();

    let shadows = spawn_periodic(
        Duration::from_secs(config.report.shadow_interval_secs),
        controller.clone(),
        {
            let reporter = reporter.clone();
            let registry = registry.clone();
            move || {
                let reporter = reporter.clone();
                let ids = registry.device_ids();
                async move {
                    if let Err(err) = reporter.report_shadows(&ids).await {
                        warn!(event = "periodic_shadow_report_failed", error = %err);
                    }
                }
            }
        },
    );
    let metadata = spawn_periodic(
        Duration::from_secs(config.report.metadata_interval_secs),
        controller.clone(),
        {
            let reporter = reporter.clone();
            move || {
                let reporter = reporter.clone();
                async move {
                    if let Err(err) = reporter.report_metadata().await {
                        warn!(event = "periodic_metadata_report_failed", error = %err);
                    }
                }
            }
        },
    );

    tokio::signal::ctrl_c().await?;
    info!(event = "agent_stopping");
    shadows.abort();
    metadata.abort();
    controller.shutdown();
    Ok(())
}

/// Runs `tick` every `period` while the session is ready.
fn spawn_periodic<F, Fut>(
    period: Duration,
    session: Arc<SessionController>,
    mut tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        if period.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !session.is_ready() {
                debug!(event = "periodic_report_skipped");
                continue;
            }
            tick().await;
        }
    })
}
