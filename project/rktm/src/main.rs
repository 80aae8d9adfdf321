use anyhow::Context;
use clap::Parser;
use common::NamespacedName;
use log::{info, warn};
use rktm::api::{ClusterStore, MemoryStore, Registry, XlineStore};
use rktm::cli::{Cli, Commands, effective_config};
use rktm::controllers::pipeline::logpipeline::{self, LogPipelineKind};
use rktm::controllers::pipeline::metricpipeline::{self, MetricPipelineKind};
use rktm::controllers::pipeline::tracepipeline::{self, TracePipelineKind};
use rktm::controllers::{
    ControllerManager, LogParserController, PipelineReconciler, Probers, TelemetryController,
};
use rktm::lock::ResourceCountLock;
use rktm::overrides::OverridesHandler;
use rktm::prober::{FlowHealthProber, SelfMonitorProber, WorkloadProber};
use rktm::protocol::config::{Config, StoreBackend, config_ref, load_config};
use rktm::tlscert::Validator;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // records are filtered by `log::set_max_level`, which the override config can change at runtime
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();
    log::set_max_level(log::LevelFilter::Info);

    match &cli.command {
        Commands::Start { config } => {
            load_config(&config.to_string_lossy())?;
            handle_start_command().await?;
        }
        Commands::Check { config } => {
            print!("{}", effective_config(config)?);
        }
    }

    Ok(())
}

async fn handle_start_command() -> anyhow::Result<()> {
    let cfg = config_ref().context("configuration is not loaded")?;
    log::set_max_level(cfg.default_level_filter());
    let registry = Registry::new(init_store(cfg).await?);
    let manager = Arc::new(ControllerManager::new(cfg.reconcile_timeout()));
    register_controllers(cfg, registry, manager.clone()).await?;

    manager.clone().start_resync(cfg.resync_period());
    info!(target: "rktm::main", "telemetry manager started in namespace {}", cfg.namespace);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(target: "rktm::main", "shutting down");
    manager.shutdown().await;
    Ok(())
}

async fn init_store(cfg: &Config) -> anyhow::Result<Arc<dyn ClusterStore>> {
    match cfg.store.backend {
        StoreBackend::Xline => {
            let store = XlineStore::new(&cfg.store.endpoints)
                .await
                .context("Failed to connect xline")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!(target: "rktm::main", "using in-memory store, state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn register_controllers(
    cfg: &Config,
    registry: Registry,
    manager: Arc<ControllerManager>,
) -> anyhow::Result<()> {
    let ns = cfg.namespace.as_str();
    let overrides = Arc::new(OverridesHandler::new(
        registry.clone(),
        NamespacedName::new(ns, cfg.overrides_config_map.clone()),
        cfg.default_level_filter(),
    ));
    let workloads = Arc::new(WorkloadProber::new(registry.clone()));
    let probers = Probers {
        deployment: workloads.clone(),
        daemon_set: workloads.clone(),
        flow: cfg.flow_health_probing.then(|| {
            Arc::new(SelfMonitorProber::new(
                registry.clone(),
                NamespacedName::new(ns, cfg.self_monitor_results.clone()),
            )) as Arc<dyn FlowHealthProber>
        }),
    };
    let validator = Arc::new(Validator::new(registry.clone()));
    let lock = |name: &str, max: usize| {
        ResourceCountLock::new(registry.clone(), NamespacedName::new(ns, name), max)
    };

    let trace = PipelineReconciler::new(
        TracePipelineKind::new(registry.clone(), ns, cfg.trace.clone()),
        registry.clone(),
        overrides.clone(),
        lock(tracepipeline::LOCK_NAME, cfg.trace.max_pipelines),
        probers.clone(),
        validator.clone(),
    );
    let metric = PipelineReconciler::new(
        MetricPipelineKind::new(registry.clone(), ns, cfg.metric.clone()),
        registry.clone(),
        overrides.clone(),
        lock(metricpipeline::LOCK_NAME, cfg.metric.max_pipelines),
        probers.clone(),
        validator.clone(),
    );
    let log_pipelines = PipelineReconciler::new(
        LogPipelineKind::new(registry.clone(), ns, cfg.log.clone()),
        registry.clone(),
        overrides.clone(),
        lock(logpipeline::LOCK_NAME, cfg.log.max_pipelines),
        probers.clone(),
        validator,
    );
    let parsers = LogParserController::new(
        registry.clone(),
        overrides.clone(),
        workloads,
        ns,
        cfg.log.clone(),
    );
    let telemetry = TelemetryController::new(registry, overrides, ns, cfg.flow_health_probing);

    manager.clone().register(Arc::new(trace), cfg.workers).await?;
    manager.clone().register(Arc::new(metric), cfg.workers).await?;
    manager.clone().register(Arc::new(log_pipelines), cfg.workers).await?;
    manager.clone().register(Arc::new(parsers), cfg.workers).await?;
    manager.register(Arc::new(telemetry), 1).await?;
    Ok(())
}
