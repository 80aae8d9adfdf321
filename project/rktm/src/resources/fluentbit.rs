//! Fluent Bit DaemonSet and the config maps and secrets it mounts.

use crate::api::Registry;
use crate::ports;
use crate::protocol::config::LogConfig;
use crate::render::fluentbit::{
    FILES_DIR, FluentBitConfig, PARSERS_FILE, SECTIONS_DIR, TLS_DIR, make_base_config,
};
use crate::resources::{
    CHECKSUM_ANNOTATION, apply_owned, apply_owned_with, config_checksum, resource_requirements,
    selector_labels,
};
use anyhow::{Context, Result};
use common::{
    ConfigMap, ContainerPort, ContainerSpec, DaemonSet, DaemonSetSpec, LabelSelector,
    NamespacedName, NetworkPolicy, NetworkPolicySpec, ObjectMeta, OwnerReference, PodSpec,
    PodTemplateSpec, Secret, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use std::collections::BTreeMap;

/// Set by the log parser controller; survives re-application by the pipelines.
pub const PARSERS_CHECKSUM_ANNOTATION: &str = "checksum/logparser-config";
pub const MAIN_CONFIG_FILE: &str = "fluent-bit.conf";
const PARSERS_DIR: &str = "/fluent-bit/etc/dynamic-parsers/";

pub fn sections_name(daemon_set: &str) -> String {
    format!("{daemon_set}-sections")
}

pub fn files_name(daemon_set: &str) -> String {
    format!("{daemon_set}-files")
}

pub fn env_name(daemon_set: &str) -> String {
    format!("{daemon_set}-env")
}

pub fn tls_name(daemon_set: &str) -> String {
    format!("{daemon_set}-output-tls-config")
}

pub fn parsers_name(daemon_set: &str) -> String {
    format!("{daemon_set}-parsers")
}

#[derive(Debug, Clone)]
pub struct FluentBitApplyConfig<'a> {
    pub log: &'a LogConfig,
    pub namespace: &'a str,
    pub config: FluentBitConfig,
    pub allowed_ports: Vec<i32>,
}

fn meta(namespace: &str, name: &str, daemon_set: &str) -> ObjectMeta {
    let mut meta = ObjectMeta::namespaced(namespace, name);
    meta.labels = selector_labels(daemon_set);
    meta
}

fn volume(name: &str, config_map: Option<String>, secret: Option<String>, mount: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            config_map,
            secret,
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: mount.to_string(),
        },
    )
}

pub async fn apply_fluent_bit_resources(
    registry: &Registry,
    owner: &OwnerReference,
    cfg: &FluentBitApplyConfig<'_>,
) -> Result<()> {
    let ds = cfg.log.daemon_set.as_str();
    let ns = cfg.namespace;

    let main = BTreeMap::from([(MAIN_CONFIG_FILE.to_string(), make_base_config(ds))]);
    let objects: [(String, BTreeMap<String, String>); 3] = [
        (ds.to_string(), main.clone()),
        (sections_name(ds), cfg.config.sections.clone()),
        (files_name(ds), cfg.config.files.clone()),
    ];
    for (name, data) in objects {
        apply_owned(registry, ConfigMap::new(meta(ns, &name, ds), data), owner)
            .await
            .with_context(|| format!("failed to apply config map {ns}/{name}"))?;
    }
    for (name, data) in [
        (env_name(ds), cfg.config.env.clone()),
        (tls_name(ds), cfg.config.tls.clone()),
    ] {
        apply_owned(registry, Secret::new(meta(ns, &name, ds), data), owner)
            .await
            .with_context(|| format!("failed to apply secret {ns}/{name}"))?;
    }

    let mut config = main;
    config.extend(cfg.config.sections.clone());
    config.extend(cfg.config.files.clone());
    let mut secrets = cfg.config.env.clone();
    secrets.extend(cfg.config.tls.clone());
    let annotations = BTreeMap::from([(
        CHECKSUM_ANNOTATION.to_string(),
        config_checksum(&config, &secrets),
    )]);

    let (volumes, mounts): (Vec<Volume>, Vec<VolumeMount>) = [
        volume("config", Some(ds.to_string()), None, "/fluent-bit/etc/"),
        volume("dynamic", Some(sections_name(ds)), None, SECTIONS_DIR),
        volume("dynamic-parsers", Some(parsers_name(ds)), None, PARSERS_DIR),
        volume("dynamic-files", Some(files_name(ds)), None, FILES_DIR),
        volume("output-tls-config", None, Some(tls_name(ds)), TLS_DIR),
    ]
    .into_iter()
    .unzip();

    let mut template_meta = ObjectMeta::named(ds);
    template_meta.labels = selector_labels(ds);
    template_meta.annotations = annotations;
    let daemon_set = DaemonSet::new(
        meta(ns, ds, ds),
        DaemonSetSpec {
            selector: LabelSelector {
                match_labels: selector_labels(ds),
            },
            template: PodTemplateSpec {
                metadata: template_meta,
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: "fluent-bit".to_string(),
                        image: cfg.log.image.clone(),
                        args: vec![format!("--config=/fluent-bit/etc/{MAIN_CONFIG_FILE}")],
                        ports: vec![ContainerPort {
                            name: "http".to_string(),
                            container_port: ports::FLUENT_BIT_HTTP,
                            protocol: "TCP".to_string(),
                        }],
                        env_from_secret: Some(env_name(ds)),
                        resources: resource_requirements(&cfg.log.resources, 1),
                        volume_mounts: mounts,
                    }],
                    volumes,
                    priority_class_name: cfg.log.priority_class_name.clone(),
                },
            },
        },
    );
    // the parsers checksum belongs to the parser controller
    apply_owned_with(registry, daemon_set, owner, |current: &DaemonSet, desired| {
        if let Some(parsers) = current
            .spec
            .template
            .metadata
            .annotations
            .get(PARSERS_CHECKSUM_ANNOTATION)
        {
            desired
                .spec
                .template
                .metadata
                .annotations
                .insert(PARSERS_CHECKSUM_ANNOTATION.to_string(), parsers.clone());
        }
    })
    .await
    .with_context(|| format!("failed to apply daemonset {ns}/{ds}"))?;

    let metrics_name = format!("{ds}-metrics");
    let metrics = Service::new(
        meta(ns, &metrics_name, ds),
        ServiceSpec {
            selector: selector_labels(ds),
            ports: vec![
                ServicePort {
                    name: "http".to_string(),
                    port: ports::FLUENT_BIT_HTTP,
                    target_port: ports::FLUENT_BIT_HTTP,
                    protocol: "TCP".to_string(),
                },
                ServicePort {
                    name: "http-metrics".to_string(),
                    port: ports::FLUENT_BIT_EXPORTER_METRICS,
                    target_port: ports::FLUENT_BIT_EXPORTER_METRICS,
                    protocol: "TCP".to_string(),
                },
            ],
        },
    );
    apply_owned(registry, metrics, owner)
        .await
        .with_context(|| format!("failed to apply service {ns}/{metrics_name}"))?;

    let mut allowed = cfg.allowed_ports.clone();
    allowed.sort_unstable();
    allowed.dedup();
    let policy = NetworkPolicy::new(
        meta(ns, ds, ds),
        NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: selector_labels(ds),
            },
            ingress_ports: allowed,
        },
    );
    apply_owned(registry, policy, owner)
        .await
        .with_context(|| format!("failed to apply network policy {ns}/{ds}"))?;
    Ok(())
}

/// Write the parsers file and, if the DaemonSet exists, roll it when the parsers changed.
pub async fn apply_parsers(
    registry: &Registry,
    namespace: &str,
    daemon_set: &str,
    parsers: String,
) -> Result<()> {
    let name = parsers_name(daemon_set);
    let data = BTreeMap::from([(PARSERS_FILE.to_string(), parsers)]);
    let checksum = config_checksum(&data, &BTreeMap::new());
    registry
        .apply(&ConfigMap::new(meta(namespace, &name, daemon_set), data))
        .await
        .with_context(|| format!("failed to apply config map {namespace}/{name}"))?;

    registry
        .update_with::<DaemonSet, _>(&NamespacedName::new(namespace, daemon_set), |ds| {
            let annotations = &mut ds.spec.template.metadata.annotations;
            if annotations.get(PARSERS_CHECKSUM_ANNOTATION) == Some(&checksum) {
                return false;
            }
            annotations.insert(PARSERS_CHECKSUM_ANNOTATION.to_string(), checksum.clone());
            true
        })
        .await
        .with_context(|| format!("failed to annotate daemonset {namespace}/{daemon_set}"))?;
    Ok(())
}
