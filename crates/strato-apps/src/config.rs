//! Application configuration and boundary validation
//!
//! [`AppConfig`] is the raw record as it crosses the serialization boundary.
//! [`AppConfig::validate`] checks shape and constraints and produces a
//! [`ValidApp`], whose types make invalid states (both or neither of
//! command/entry-point, an unversioned image) unrepresentable downstream.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use strato_core::{ProvisionError, ProvisionResult};

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    512
}

/// Raw application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,

    /// Prefix selecting the subnets the app's tasks run in.
    pub subnet_name_prefix: String,

    #[serde(default)]
    pub cpu: Option<u32>,

    #[serde(default)]
    pub memory: Option<u32>,

    /// Image reference relative to the private registry. Must carry a
    /// version tag.
    pub image: String,

    /// Exactly one of `command` / `entry_point` must be set.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub entry_point: Option<Vec<String>>,

    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,

    #[serde(default)]
    pub secrets: Option<Vec<SecretMapping>>,

    #[serde(default)]
    pub policies: Option<Vec<PolicyGrant>>,

    /// Switched-off apps keep their declarations but run zero tasks.
    #[serde(default)]
    pub is_on: Option<bool>,

    #[serde(default)]
    pub datadog: Option<DatadogConfig>,
}

/// Environment-variable name to secret value, provisioned through the
/// secret cache and injected via `valueFrom`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretMapping {
    pub name: String,
    pub value: String,
}

/// An access grant attached to the task role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyGrant {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

/// Tracing-vendor configuration. Its presence selects the vendor log
/// driver, the vendor tracing flags on the mesh proxy, and the vendor agent
/// sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatadogConfig {
    pub api_key: String,

    #[serde(default = "default_datadog_site")]
    pub site: String,
}

fn default_datadog_site() -> String {
    "datadoghq.com".to_string()
}

impl DatadogConfig {
    /// Host the log forwarder ships to.
    pub fn log_intake_host(&self) -> String {
        format!("http-intake.logs.{}", self.site)
    }
}

/// Launch arguments: a tagged union, so exactly one of the two shapes exists
/// past validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Command(Vec<String>),
    EntryPoint(Vec<String>),
}

/// Validated application configuration.
#[derive(Debug, Clone)]
pub struct ValidApp {
    pub name: String,
    pub subnet_name_prefix: String,
    pub cpu: u32,
    pub memory: u32,
    pub image: String,
    pub version: String,
    pub launch: Launch,
    /// User-supplied variables, sorted by name.
    pub env_vars: Vec<(String, String)>,
    /// Secret mappings, sorted by name, names unique.
    pub secrets: Vec<SecretMapping>,
    pub policies: Vec<PolicyGrant>,
    pub is_on: bool,
    pub datadog: Option<DatadogConfig>,
}

impl AppConfig {
    pub fn validate(&self) -> ProvisionResult<ValidApp> {
        if self.name.is_empty() {
            return Err(ProvisionError::validation("name", "app name must not be empty"));
        }
        if self.subnet_name_prefix.is_empty() {
            return Err(ProvisionError::validation(
                "subnet_name_prefix",
                "subnet name prefix must not be empty",
            ));
        }

        let version = image_version(&self.image)?;

        let launch = match (&self.command, &self.entry_point) {
            (Some(command), None) => Launch::Command(command.clone()),
            (None, Some(entry_point)) => Launch::EntryPoint(entry_point.clone()),
            (Some(_), Some(_)) => {
                return Err(ProvisionError::validation(
                    "command",
                    "command and entry_point are mutually exclusive; set exactly one",
                ))
            }
            (None, None) => {
                return Err(ProvisionError::validation(
                    "command",
                    "one of command or entry_point is required",
                ))
            }
        };

        let mut env_vars: Vec<(String, String)> = self
            .env_vars
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        env_vars.sort_by(|a, b| a.0.cmp(&b.0));

        let mut secrets = self.secrets.clone().unwrap_or_default();
        let mut seen = HashSet::new();
        for mapping in &secrets {
            if mapping.name.is_empty() {
                return Err(ProvisionError::validation(
                    "secrets",
                    "secret mapping name must not be empty",
                ));
            }
            if !seen.insert(mapping.name.clone()) {
                return Err(ProvisionError::validation(
                    "secrets",
                    format!("duplicate secret mapping `{}`", mapping.name),
                ));
            }
        }
        secrets.sort_by(|a, b| a.name.cmp(&b.name));

        let policies = self.policies.clone().unwrap_or_default();
        for grant in &policies {
            if grant.actions.is_empty() {
                return Err(ProvisionError::validation(
                    "policies",
                    "policy grant must name at least one action",
                ));
            }
            if grant.resources.is_empty() {
                return Err(ProvisionError::validation(
                    "policies",
                    "policy grant must name at least one resource",
                ));
            }
        }

        Ok(ValidApp {
            name: self.name.clone(),
            subnet_name_prefix: self.subnet_name_prefix.clone(),
            cpu: self.cpu.unwrap_or_else(default_cpu),
            memory: self.memory.unwrap_or_else(default_memory),
            image: self.image.clone(),
            version,
            launch,
            env_vars,
            secrets,
            policies,
            is_on: self.is_on.unwrap_or(true),
            datadog: self.datadog.clone(),
        })
    }
}

/// Extract and check the version tag of an image reference.
fn image_version(image: &str) -> ProvisionResult<String> {
    let (_, tag) = image.rsplit_once(':').ok_or_else(|| {
        ProvisionError::validation(
            "image",
            format!("`{}` has no version tag; images must be pinned as repo/name:tag", image),
        )
    })?;
    if tag.is_empty() || tag == "latest" {
        return Err(ProvisionError::validation(
            "image",
            format!("`{}` is not pinned to a version tag", image),
        ));
    }
    Ok(tag.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            name: "svc".to_string(),
            subnet_name_prefix: "core-private".to_string(),
            cpu: None,
            memory: None,
            image: "repo/svc:v1.2.3".to_string(),
            command: Some(vec!["node".to_string(), "x".to_string()]),
            entry_point: None,
            env_vars: None,
            secrets: None,
            policies: None,
            is_on: None,
            datadog: None,
        }
    }

    #[test]
    fn valid_config_defaults_cpu_memory_and_is_on() {
        let app = base_config().validate().unwrap();
        assert_eq!(app.cpu, 256);
        assert_eq!(app.memory, 512);
        assert!(app.is_on);
        assert_eq!(app.version, "v1.2.3");
        assert_eq!(app.launch, Launch::Command(vec!["node".to_string(), "x".to_string()]));
    }

    #[test]
    fn both_command_and_entry_point_fail() {
        let mut config = base_config();
        config.entry_point = Some(vec!["sh".to_string()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn neither_command_nor_entry_point_fails() {
        let mut config = base_config();
        config.command = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unversioned_image_fails() {
        let mut config = base_config();
        config.image = "repo/svc".to_string();
        assert!(config.validate().is_err());

        config.image = "repo/svc:latest".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn duplicate_secret_names_fail() {
        let mut config = base_config();
        config.secrets = Some(vec![
            SecretMapping { name: "API_KEY".to_string(), value: "a".to_string() },
            SecretMapping { name: "API_KEY".to_string(), value: "b".to_string() },
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("API_KEY"));
    }

    #[test]
    fn empty_policy_grant_fails() {
        let mut config = base_config();
        config.policies = Some(vec![PolicyGrant { actions: vec![], resources: vec!["*".to_string()] }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn user_env_vars_are_sorted() {
        let mut config = base_config();
        let mut vars = HashMap::new();
        vars.insert("ZETA".to_string(), "1".to_string());
        vars.insert("ALPHA".to_string(), "2".to_string());
        config.env_vars = Some(vars);
        let app = config.validate().unwrap();
        assert_eq!(app.env_vars[0].0, "ALPHA");
        assert_eq!(app.env_vars[1].0, "ZETA");
    }

    #[test]
    fn datadog_intake_host_follows_site() {
        let config = DatadogConfig {
            api_key: "k".to_string(),
            site: "datadoghq.eu".to_string(),
        };
        assert_eq!(config.log_intake_host(), "http-intake.logs.datadoghq.eu");
    }
}
