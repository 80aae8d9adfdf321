use anyhow::Result;
use rktm::cli::effective_config;
use rktm::protocol::config::{StoreBackend, parse_config};
use std::path::PathBuf;
use std::time::Duration;

fn config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/config.yaml")
}

#[test]
fn test_effective_config_fills_defaults() -> Result<()> {
    let rendered = effective_config(&config_path())?;
    let cfg = parse_config(&rendered)?;
    assert_eq!(cfg.store.backend, StoreBackend::Memory);
    assert_eq!(cfg.trace.max_pipelines, 5);
    assert_eq!(cfg.resync_period(), Duration::from_secs(30));
    assert_eq!(cfg.reconcile_timeout(), Some(Duration::from_secs(20)));
    assert_eq!(cfg.default_level_filter(), log::LevelFilter::Debug);
    assert!(cfg.flow_health_probing);
    // sections left out of the file come back with their defaults
    assert_eq!(cfg.metric.gateway.name, "telemetry-metric-gateway");
    assert_eq!(cfg.telemetry_name, "default");
    Ok(())
}

#[test]
fn test_missing_config_file_is_reported() {
    let err = effective_config(&PathBuf::from("does-not-exist.yaml")).unwrap_err();
    assert!(err.to_string().contains("does-not-exist.yaml"));
}
