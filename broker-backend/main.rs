mod api;
mod broker;
mod config;
mod copy;
mod store;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::broker::service::Broker;
use crate::config::{Config, CopyProviderConfig};
use crate::copy::provider::CopyProvider;
use crate::copy::remote::{CopyServiceClient, RemoteCopyProvider};
use crate::copy::simulated::SimulatedCopyProvider;
use crate::store::Stores;

#[derive(Parser)]
#[command(name = "cdm-broker", about = "Copy-of-instance lifecycle broker")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Keep all state in memory instead of the data directory
        #[arg(long)]
        ephemeral: bool,
    },
    /// Print the persisted instances and bindings, then exit
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // No subcommand means serve; --help and --version still go through clap.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve { ephemeral: false }
    } else {
        Cli::parse()
    };

    let config = Config::from_env();
    match cli {
        Cli::Serve { ephemeral } => run_server(config, ephemeral).await,
        Cli::Status => {
            print_status(&config).await?;
            Ok(())
        }
    }
}

fn build_provider(config: &Config, http_client: reqwest::Client) -> Arc<dyn CopyProvider> {
    match &config.copy_provider {
        CopyProviderConfig::Remote { base_url, api_key } => {
            let client = CopyServiceClient::new(base_url.clone(), api_key.clone(), http_client);
            Arc::new(RemoteCopyProvider::new(client))
        }
        CopyProviderConfig::Simulated { ready_after_checks } => {
            tracing::warn!(
                ready_after_checks,
                "COPY_PROVIDER_URL not set, using the simulated copy provider"
            );
            Arc::new(SimulatedCopyProvider::new(*ready_after_checks))
        }
    }
}

async fn run_server(config: Config, ephemeral: bool) -> Result<(), Box<dyn Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cdm_broker=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    if let CopyProviderConfig::Remote { base_url, api_key } = &config.copy_provider {
        let client = CopyServiceClient::new(base_url.clone(), api_key.clone(), http_client.clone());
        match client.health().await {
            Ok(health) => tracing::info!(status = %health.status, "copy service reachable"),
            Err(e) => tracing::warn!(error = %e, base_url = %base_url, "copy service health check failed"),
        }
    }
    let provider = build_provider(&config, http_client);

    let stores = if ephemeral {
        tracing::info!("Starting with in-memory state (--ephemeral)");
        Stores::in_memory()
    } else {
        Stores::open(&config.data_dir)
            .await
            .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?
    };

    let broker = Broker::new(&stores, provider, config.poll.clone());
    let resumed = broker
        .provisioning
        .resume_pending()
        .await
        .context("failed to recover pending provisions")?;
    if resumed > 0 {
        tracing::info!(count = resumed, "resumed polling for in-progress provisions");
    }

    if config.broker_auth.is_none() {
        tracing::warn!("SECURITY_USER_NAME/SECURITY_USER_PASSWORD not set, broker API is unauthenticated");
    }

    let app_state = api::AppState {
        broker,
        source_instance_id: config.source_instance_id.clone(),
        auth: config.broker_auth.clone().map(Arc::new),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = config.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn print_status(config: &Config) -> Result<()> {
    let stores = Stores::open(&config.data_dir)
        .await
        .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?;

    let mut instances = stores.instances.find_all().await?;
    instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    println!("Instances ({}):", instances.len());
    for i in &instances {
        println!(
            "  {:<24} {:<12} copy={} source={}",
            i.service_instance_id,
            i.state.as_protocol_str(),
            i.copy_id.as_deref().unwrap_or("-"),
            i.source_instance_id,
        );
    }

    let mut bindings = stores.bindings.find_all().await?;
    bindings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    println!("Bindings ({}):", bindings.len());
    for b in &bindings {
        println!(
            "  {:<24} instance={} app={}",
            b.binding_id, b.service_instance_id, b.app_guid
        );
    }

    Ok(())
}
