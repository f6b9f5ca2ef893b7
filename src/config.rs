//! Engine configuration
//!
//! Defaults reproduce the literal engine behavior. Values can come from
//! YAML or from `SIMPLEFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::WorkflowError;

/// Which instances a newly started instance supersedes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceScope {
    /// One "new" instance system-wide
    #[default]
    Global,
    /// One "new" instance per (workflow, subject)
    WorkflowSubject,
}

impl std::str::FromStr for InstanceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "workflow_subject" => Ok(Self::WorkflowSubject),
            _ => Err(format!("Unknown instance scope: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instance_scope: InstanceScope,
    /// Create a node's processes (todo=true) when the instance enters it
    /// and none are open there yet.
    pub auto_fan_out: bool,
    /// Prefix for auto-assigned node codes
    pub node_code_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_scope: InstanceScope::Global,
            auto_fan_out: false,
            node_code_prefix: "N".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, WorkflowError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Defaults overridden by whichever `SIMPLEFLOW_*` variables are set.
    pub fn from_env() -> Result<Self, WorkflowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkflowError> {
        let mut config = Self::default();

        if let Some(scope) = lookup("SIMPLEFLOW_INSTANCE_SCOPE") {
            config.instance_scope = scope.parse().map_err(WorkflowError::Config)?;
        }
        if let Some(fan_out) = lookup("SIMPLEFLOW_AUTO_FAN_OUT") {
            config.auto_fan_out = match fan_out.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                other => {
                    return Err(WorkflowError::Config(format!(
                        "SIMPLEFLOW_AUTO_FAN_OUT must be true/false, got {}",
                        other
                    )))
                }
            };
        }
        if let Some(prefix) = lookup("SIMPLEFLOW_NODE_CODE_PREFIX") {
            config.node_code_prefix = prefix;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_literal_behavior() {
        let config = EngineConfig::default();
        assert_eq!(config.instance_scope, InstanceScope::Global);
        assert!(!config.auto_fan_out);
        assert_eq!(config.node_code_prefix, "N");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str("instance_scope: workflow_subject\n").unwrap();
        assert_eq!(config.instance_scope, InstanceScope::WorkflowSubject);
        assert!(!config.auto_fan_out);
        assert_eq!(config.node_code_prefix, "N");
    }

    #[test]
    fn test_env_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SIMPLEFLOW_INSTANCE_SCOPE", "workflow_subject"),
            ("SIMPLEFLOW_AUTO_FAN_OUT", "true"),
        ]
        .into();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.instance_scope, InstanceScope::WorkflowSubject);
        assert!(config.auto_fan_out);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let bad_scope = EngineConfig::from_lookup(|k| {
            (k == "SIMPLEFLOW_INSTANCE_SCOPE").then(|| "tenant".to_string())
        });
        assert!(matches!(bad_scope, Err(WorkflowError::Config(_))));

        let bad_flag = EngineConfig::from_lookup(|k| {
            (k == "SIMPLEFLOW_AUTO_FAN_OUT").then(|| "maybe".to_string())
        });
        assert!(matches!(bad_flag, Err(WorkflowError::Config(_))));
    }
}
