//! Collector configuration rendering from the reconcilable pipeline set.

pub mod fluentbit;
pub mod otel;

use std::collections::BTreeMap;

/// Environment passed to a collector through its env Secret.
pub type EnvVars = BTreeMap<String, String>;

/// Uppercase `value`, replacing anything outside `[A-Z0-9]` with `_`.
pub fn sanitize_env_name(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_env_name() {
        assert_eq!(sanitize_env_name("my-pipeline.v1"), "MY_PIPELINE_V1");
    }
}
