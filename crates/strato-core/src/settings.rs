//! Configuration namespaces and stack environment identifiers

use crate::error::{ProvisionError, ProvisionResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of deployment environments a stack may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(ProvisionError::validation(
                "environment",
                format!(
                    "unknown environment `{}`, expected one of: dev, staging, production",
                    other
                ),
            )),
        }
    }
}

/// Cloud-provider configuration namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub region: String,
    pub account_id: String,
    /// Accounts this library is allowed to provision into. Empty means no
    /// restriction.
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
    /// Private container registry address. Defaults to the account registry
    /// for the configured region.
    #[serde(default)]
    pub registry_address: Option<String>,
}

impl ProviderSettings {
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.region.is_empty() {
            return Err(ProvisionError::validation("region", "region must not be empty"));
        }
        if self.account_id.is_empty() {
            return Err(ProvisionError::validation(
                "account_id",
                "account id must not be empty",
            ));
        }
        if !self.allowed_accounts.is_empty() && !self.allowed_accounts.contains(&self.account_id) {
            return Err(ProvisionError::validation(
                "account_id",
                format!("account `{}` is not in the allowed account list", self.account_id),
            ));
        }
        Ok(())
    }

    /// Registry address images are resolved against.
    pub fn registry_address(&self) -> String {
        self.registry_address.clone().unwrap_or_else(|| {
            format!("{}.dkr.ecr.{}.amazonaws.com", self.account_id, self.region)
        })
    }
}

/// Library configuration namespace: arbitrary key/value lookups with
/// required and optional getters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrarySettings {
    values: HashMap<String, String>,
}

impl LibrarySettings {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> ProvisionResult<&str> {
        self.get(key).ok_or_else(|| ProvisionError::MissingConfig {
            key: key.to_string(),
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_names() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
    }

    #[test]
    fn environment_rejects_unknown_names() {
        let err = "qa".parse::<Environment>().unwrap_err();
        assert!(err.to_string().contains("qa"));
    }

    #[test]
    fn provider_settings_enforce_account_allowlist() {
        let settings = ProviderSettings {
            region: "us-east-1".to_string(),
            account_id: "222222222222".to_string(),
            allowed_accounts: vec!["111111111111".to_string()],
            registry_address: None,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn registry_address_defaults_to_account_registry() {
        let settings = ProviderSettings {
            region: "us-east-1".to_string(),
            account_id: "111111111111".to_string(),
            allowed_accounts: vec![],
            registry_address: None,
        };
        assert_eq!(
            settings.registry_address(),
            "111111111111.dkr.ecr.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn library_settings_require_names_missing_key() {
        let settings = LibrarySettings::default();
        let err = settings.require("certificate_arn").unwrap_err();
        assert!(err.to_string().contains("certificate_arn"));
    }
}
