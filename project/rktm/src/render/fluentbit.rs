//! Fluent Bit section files for log pipelines and the parsers file for log parsers.

use crate::api::Registry;
use crate::errors::ControllerError;
use crate::render::{EnvVars, sanitize_env_name};
use crate::secretref::{get_secret_value, resolve_value};
use anyhow::Result;
use common::{HttpOutput, LogParser, LogPipeline, Resource, ValueType};
use std::collections::BTreeMap;

pub const SECTIONS_DIR: &str = "/fluent-bit/etc/dynamic/";
pub const FILES_DIR: &str = "/files/";
pub const TLS_DIR: &str = "/fluent-bit/etc/output-tls-config/";
pub const PARSERS_FILE: &str = "parsers.conf";

/// Namespaces skipped unless a pipeline opts into system logs.
const SYSTEM_NAMESPACES: [&str; 4] = ["kyma-system", "kube-system", "istio-system", "compass-system"];

/// Everything the Fluent Bit DaemonSet needs for one reconcilable set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluentBitConfig {
    /// `<pipeline>.conf` section files.
    pub sections: BTreeMap<String, String>,
    /// Files declared by pipelines, mounted under `/files/`.
    pub files: BTreeMap<String, String>,
    pub env: EnvVars,
    /// Client certificates and CAs for HTTP outputs.
    pub tls: BTreeMap<String, String>,
}

/// Main configuration file; the per-pipeline sections are pulled in via `@INCLUDE`.
pub fn make_base_config(daemon_set: &str) -> String {
    let mut out = String::new();
    out.push_str("[SERVICE]\n");
    push_entries(
        &mut out,
        &[
            ("Daemon", "Off"),
            ("Flush", "1"),
            ("Log_Level", "warn"),
            ("Parsers_File", "custom_parsers.conf"),
            ("Parsers_File", "dynamic-parsers/parsers.conf"),
            ("HTTP_Server", "On"),
            ("HTTP_Listen", "0.0.0.0"),
            ("HTTP_Port", "2020"),
            ("storage.path", "/data/flb-storage/"),
            ("storage.metrics", "on"),
        ],
    );
    out.push('\n');
    out.push_str(&format!("@INCLUDE {SECTIONS_DIR}*.conf\n"));
    out.push_str(&format!("# managed by {daemon_set}\n"));
    out
}

fn push_entries(out: &mut String, entries: &[(&str, &str)]) {
    let width = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in entries {
        out.push_str(&format!("    {key:<width$} {value}\n"));
    }
}

fn section(kind: &str, entries: &[(&str, &str)]) -> String {
    let mut out = format!("[{kind}]\n");
    push_entries(&mut out, entries);
    out.push('\n');
    out
}

/// Turn a user supplied `key value` block into entries, adding `match` unless present.
fn custom_section(kind: &str, content: &str, pipeline: &str, matcher: &str) -> String {
    let mut entries: Vec<(String, String)> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k.to_string(), v.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect();
    let has = |entries: &[(String, String)], key: &str| {
        entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    };
    if !has(&entries, "match") {
        entries.push(("match".to_string(), matcher.to_string()));
    }
    if kind == "OUTPUT" && !has(&entries, "alias") {
        entries.push(("alias".to_string(), pipeline.to_string()));
    }
    let borrowed: Vec<(&str, &str)> = entries
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    section(kind, &borrowed)
}

fn tail_paths(pipeline: &LogPipeline) -> (String, String) {
    let app = &pipeline.spec.input.application;
    let namespaces: Vec<&str> = if app.namespaces.include.is_empty() {
        vec!["*"]
    } else {
        app.namespaces.include.iter().map(String::as_str).collect()
    };
    let containers: Vec<&str> = if app.containers.include.is_empty() {
        vec!["*"]
    } else {
        app.containers.include.iter().map(String::as_str).collect()
    };
    let mut include = Vec::new();
    for ns in &namespaces {
        for container in &containers {
            include.push(format!("/var/log/containers/*_{ns}_{container}-*.log"));
        }
    }

    let mut excluded_ns: Vec<&str> = app.namespaces.exclude.iter().map(String::as_str).collect();
    if !app.namespaces.system && app.namespaces.include.is_empty() {
        excluded_ns.extend(SYSTEM_NAMESPACES);
    }
    let mut exclude: Vec<String> = excluded_ns
        .iter()
        .map(|ns| format!("/var/log/containers/*_{ns}_*-*.log"))
        .collect();
    exclude.extend(
        app.containers
            .exclude
            .iter()
            .map(|c| format!("/var/log/containers/*_*_{c}-*.log")),
    );
    // never ship our own logs back into the pipeline
    exclude.push("/var/log/containers/telemetry-fluent-bit-*_kyma-system_fluent-bit-*.log".to_string());
    (include.join(","), exclude.join(","))
}

async fn env_reference(
    registry: &Registry,
    pipeline: &str,
    what: &str,
    value: &ValueType,
    env: &mut EnvVars,
) -> Result<String> {
    let resolved = resolve_value(registry, value).await?.ok_or_else(|| {
        ControllerError::ConfigurationInvalid(format!(
            "{what} of log pipeline {pipeline} is not resolvable"
        ))
    })?;
    // inline values stay inline, secrets go through the env Secret
    if value.secret_key_ref().is_none() {
        return Ok(resolved);
    }
    let var = format!("{}_{}", sanitize_env_name(pipeline), sanitize_env_name(what));
    env.insert(var.clone(), resolved);
    Ok(format!("${{{var}}}"))
}

async fn http_output(
    registry: &Registry,
    pipeline: &str,
    http: &HttpOutput,
    env: &mut EnvVars,
    tls_files: &mut BTreeMap<String, String>,
) -> Result<String> {
    let host = env_reference(registry, pipeline, "host", &http.host, env).await?;
    let mut entries: Vec<(String, String)> = vec![
        ("name".to_string(), "http".to_string()),
        ("match".to_string(), format!("{pipeline}.*")),
        ("alias".to_string(), pipeline.to_string()),
        ("host".to_string(), host),
        (
            "port".to_string(),
            http.port.clone().unwrap_or_else(|| "443".to_string()),
        ),
        (
            "uri".to_string(),
            http.uri.clone().unwrap_or_else(|| "/".to_string()),
        ),
        (
            "format".to_string(),
            http.format.clone().unwrap_or_else(|| "json".to_string()),
        ),
    ];
    if let Some(compress) = http.compress.as_deref().filter(|c| !c.is_empty()) {
        entries.push(("compress".to_string(), compress.to_string()));
    }
    if let Some(user) = &http.user {
        let user = env_reference(registry, pipeline, "user", user, env).await?;
        entries.push(("http_user".to_string(), user));
    }
    if let Some(password) = &http.password {
        let password = env_reference(registry, pipeline, "password", password, env).await?;
        entries.push(("http_passwd".to_string(), password));
    }

    let tls = &http.tls;
    entries.push((
        "tls".to_string(),
        if tls.disabled { "off" } else { "on" }.to_string(),
    ));
    entries.push((
        "tls.verify".to_string(),
        if tls.skip_certificate_validation {
            "off"
        } else {
            "on"
        }
        .to_string(),
    ));
    if !tls.disabled {
        for (suffix, key, value) in [
            ("ca.crt", "tls.ca_file", &tls.ca),
            ("cert.crt", "tls.crt_file", &tls.cert),
            ("key.key", "tls.key_file", &tls.key),
        ] {
            let Some(value) = value else { continue };
            let Some(pem) = resolve_value(registry, value).await? else {
                return Err(ControllerError::ConfigurationInvalid(format!(
                    "tls material of log pipeline {pipeline} is not resolvable"
                ))
                .into());
            };
            let file = format!("{pipeline}-{suffix}");
            entries.push((key.to_string(), format!("{TLS_DIR}{file}")));
            tls_files.insert(file, pem);
        }
    }
    entries.push(("storage.total_limit_size".to_string(), "1G".to_string()));
    entries.push(("retry_limit".to_string(), "300".to_string()));

    let borrowed: Vec<(&str, &str)> = entries
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    Ok(section("OUTPUT", &borrowed))
}

/// Render the section file of one pipeline, collecting its env, files and TLS material.
async fn make_section(
    registry: &Registry,
    pipeline: &LogPipeline,
    cfg: &mut FluentBitConfig,
) -> Result<String> {
    let name = pipeline.name();
    let matcher = format!("{name}.*");
    let app = &pipeline.spec.input.application;
    let (include, exclude) = tail_paths(pipeline);
    let db = format!("/data/flb_{name}.db");

    let mut out = section(
        "INPUT",
        &[
            ("name", "tail"),
            ("alias", name),
            ("tag", &matcher),
            ("path", &include),
            ("exclude_path", &exclude),
            ("multiline.parser", "cri"),
            ("db", &db),
            ("storage.type", "filesystem"),
            ("read_from_head", "true"),
            ("mem_buf_limit", "5MB"),
            ("skip_long_lines", "on"),
        ],
    );
    out.push_str(&section(
        "FILTER",
        &[
            ("name", "kubernetes"),
            ("match", &matcher),
            ("merge_log", "on"),
            ("k8s-logging.parser", "on"),
            ("keep_log", "on"),
            ("annotations", if app.keep_annotations { "on" } else { "off" }),
            ("labels", if app.drop_labels { "off" } else { "on" }),
        ],
    ));
    for filter in &pipeline.spec.filters {
        if !filter.custom.trim().is_empty() {
            out.push_str(&custom_section("FILTER", &filter.custom, name, &matcher));
        }
    }

    if let Some(custom) = pipeline
        .spec
        .output
        .custom
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        out.push_str(&custom_section("OUTPUT", custom, name, &matcher));
    } else if let Some(http) = &pipeline.spec.output.http {
        out.push_str(&http_output(registry, name, http, &mut cfg.env, &mut cfg.tls).await?);
    } else {
        return Err(ControllerError::ConfigurationInvalid(format!(
            "log pipeline {name} has no output"
        ))
        .into());
    }

    for variable in &pipeline.spec.variables {
        let Some(key_ref) = &variable.value_from.secret_key_ref else {
            continue;
        };
        let value = get_secret_value(registry, key_ref).await?.ok_or_else(|| {
            ControllerError::ConfigurationInvalid(format!(
                "variable {} of log pipeline {name} is not resolvable",
                variable.name
            ))
        })?;
        cfg.env.insert(variable.name.clone(), value);
    }
    for file in &pipeline.spec.files {
        cfg.files.insert(file.name.clone(), file.content.clone());
    }
    Ok(out)
}

/// Sections for every reconcilable log pipeline.
pub async fn make_fluent_bit_config(
    registry: &Registry,
    pipelines: &[LogPipeline],
) -> Result<FluentBitConfig> {
    let mut cfg = FluentBitConfig::default();
    for pipeline in pipelines {
        let section = make_section(registry, pipeline, &mut cfg).await?;
        cfg.sections
            .insert(format!("{}.conf", pipeline.name()), section);
    }
    Ok(cfg)
}

/// One `[PARSER]` block per log parser, ordered by name.
pub fn make_parsers_config(parsers: &[LogParser]) -> String {
    let mut sorted: Vec<&LogParser> = parsers.iter().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));
    let mut out = String::new();
    for parser in sorted {
        let mut entries: Vec<(String, String)> = vec![("name".to_string(), parser.name().to_string())];
        entries.extend(
            parser
                .spec
                .parser
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .filter_map(|l| {
                    l.split_once(char::is_whitespace)
                        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
                })
                .filter(|(k, _)| !k.eq_ignore_ascii_case("name")),
        );
        let borrowed: Vec<(&str, &str)> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.push_str(&section("PARSER", &borrowed));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        FileMount, LogFilter, LogPipelineOutput, LogPipelineSpec, ObjectMeta, Secret,
        ValueFromSource, VariableRef,
    };

    fn custom_pipeline(name: &str) -> LogPipeline {
        LogPipeline::new(
            name,
            LogPipelineSpec {
                filters: vec![LogFilter {
                    custom: "name grep\nregex $kubernetes['labels']['app'] my-app".to_string(),
                }],
                output: LogPipelineOutput {
                    custom: Some("name stdout".to_string()),
                    http: None,
                },
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_custom_filter_and_output_get_pipeline_match() {
        let registry = Registry::in_memory();
        let cfg = make_fluent_bit_config(&registry, &[custom_pipeline("p1")])
            .await
            .unwrap();
        let section = cfg.sections.get("p1.conf").unwrap();
        assert!(section.starts_with("[INPUT]\n"));
        assert!(section.contains("[FILTER]\n    name  grep\n"));
        assert!(section.contains("[OUTPUT]\n    name  stdout\n    match p1.*\n    alias p1\n"));
        assert!(section.contains("/var/log/containers/*_kube-system_*-*.log"));
    }

    #[tokio::test]
    async fn test_http_output_moves_secrets_to_env() {
        let registry = Registry::in_memory();
        let mut data = BTreeMap::new();
        data.insert("host".to_string(), "logs.example.com".to_string());
        data.insert("token".to_string(), "abc".to_string());
        registry
            .apply(&Secret::new(ObjectMeta::namespaced("default", "backend"), data))
            .await
            .unwrap();

        let pipeline = LogPipeline::new(
            "my-logs",
            LogPipelineSpec {
                output: LogPipelineOutput {
                    custom: None,
                    http: Some(HttpOutput {
                        host: ValueType::from_secret("backend", "default", "host"),
                        user: Some(ValueType::inline("user")),
                        ..Default::default()
                    }),
                },
                files: vec![FileMount {
                    name: "labelmap.json".to_string(),
                    content: "{}".to_string(),
                }],
                variables: vec![VariableRef {
                    name: "TOKEN".to_string(),
                    value_from: ValueFromSource {
                        secret_key_ref: Some(common::SecretKeyRef {
                            name: "backend".to_string(),
                            namespace: "default".to_string(),
                            key: "token".to_string(),
                        }),
                    },
                }],
                ..Default::default()
            },
        );
        let cfg = make_fluent_bit_config(&registry, &[pipeline]).await.unwrap();
        let section = cfg.sections.get("my-logs.conf").unwrap();
        assert!(section.contains("${MY_LOGS_HOST}"));
        assert!(section.contains("http_user"));
        assert_eq!(cfg.env.get("MY_LOGS_HOST").unwrap(), "logs.example.com");
        assert_eq!(cfg.env.get("TOKEN").unwrap(), "abc");
        assert_eq!(cfg.files.get("labelmap.json").unwrap(), "{}");
    }

    #[test]
    fn test_parsers_are_sorted_by_name() {
        let parsers = vec![
            LogParser::new("zeta", "format regex\nregex ^(?<x>.*)$"),
            LogParser::new("alpha", "format json"),
        ];
        let out = make_parsers_config(&parsers);
        let alpha = out.find("alpha").unwrap();
        let zeta = out.find("zeta").unwrap();
        assert!(alpha < zeta);
        assert!(out.contains("    format json\n"));
    }
}
