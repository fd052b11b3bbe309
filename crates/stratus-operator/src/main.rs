//! Stratus operator binary

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use stratus_cloud::bootstrap::ScriptRenderer;
use stratus_cloud::simulated::{SimulatedCloud, SimulatedControlPlane, SimulatedFactory};
use stratus_cloud::{KubeAccess, ProviderRegistry};
use stratus_cluster::ClusterLifecycle;
use stratus_common::resources::ProviderType;
use stratus_common::store::{FileBackend, MemoryStore, Store};
use stratus_common::telemetry::{init_telemetry_with, TelemetryConfig};

use stratus_operator::{
    Cli, Commands, ConsumerConfig, EnqueueArgs, Envelope, NatsQueue, OperationConsumer,
    ProgressHub, ProgressLayer, Queue, RunArgs, StoreBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Enqueue(args) => enqueue(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let hub = Arc::new(ProgressHub::default());
    init_telemetry_with(
        TelemetryConfig {
            service_name: "stratus-operator".to_string(),
            json: !args.log_text,
            ..Default::default()
        },
        Some(ProgressLayer::new(hub.clone())),
    )?;

    let store: Arc<dyn Store> = match args.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; records are lost on exit");
            Arc::new(MemoryStore::in_memory())
        }
        StoreBackend::File => {
            info!(root = %args.store_dir.display(), "Using the file store");
            Arc::new(FileBackend::store(args.store_dir.clone()))
        }
    };

    let registry = if args.simulate {
        warn!("Simulated connectors registered for every provider");
        let cloud = SimulatedCloud::default();
        let factory = Arc::new(SimulatedFactory::new(cloud.clone()));
        ProviderType::ALL.into_iter().fold(
            ProviderRegistry::new(Arc::new(SimulatedControlPlane::new(cloud))),
            |registry, provider| registry.register(provider, factory.clone()),
        )
    } else {
        warn!("No cloud connectors are registered; every provisioning operation will fail");
        ProviderRegistry::new(Arc::new(KubeAccess))
    };

    let lifecycle = Arc::new(ClusterLifecycle::new(
        Arc::new(registry),
        Arc::new(ScriptRenderer::new()?),
        args.lifecycle_config(),
    ));

    let config: ConsumerConfig = args.consumer_config();
    let queue = NatsQueue::connect(&config).await?;
    let mirror = args.mirror_logs.then(|| queue.mirror_progress(&hub));

    let consumer = Arc::new(OperationConsumer::new(store, lifecycle).with_progress(hub));
    let (shutdown_tx, shutdown) = watch::channel(false);
    let consumers = tokio::spawn(consumer.run(Arc::new(queue), config.workers, shutdown));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, letting running operations finish");
    shutdown_tx.send(true)?;

    consumers.await??;
    if let Some(mirror) = mirror {
        mirror.abort();
    }
    Ok(())
}

async fn enqueue(args: EnqueueArgs) -> anyhow::Result<()> {
    init_telemetry_with(
        TelemetryConfig {
            service_name: "stratus-operator".to_string(),
            otlp_endpoint: None,
            json: false,
        },
        None::<tracing_subscriber::layer::Identity>,
    )?;

    let queue = NatsQueue::connect(&ConsumerConfig::from(&args.nats)).await?;
    queue
        .publish(args.intent, &Envelope::new(args.operation_id.clone()))
        .await?;
    info!(intent = %args.intent, operation_id = %args.operation_id, "Operation enqueued");
    Ok(())
}
