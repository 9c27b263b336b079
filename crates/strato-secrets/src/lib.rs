//! Secret store cache and provisioner
//!
//! Idempotent get-or-create wrapper over the managed secret store. The cache
//! is an explicit value injected into provisioners that need it, keyed by
//! logical secret name, so one provisioning pass creates at most one secret
//! resource per name. Check-then-insert runs under a single lock, making
//! concurrent provisioning of the same logical name safe.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strato_core::{Inputs, Output, ProvisionError, Stack};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SecretError {
    /// Duplicate `store` calls for an existing name are a programming error,
    /// not a retryable condition.
    #[error("Secret `{name}` already exists in this provisioning run")]
    DuplicateSecret { name: String },

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl From<SecretError> for ProvisionError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::Provision(inner) => inner,
            SecretError::DuplicateSecret { name } => ProvisionError::InvariantViolation {
                message: format!("secret `{}` stored twice in one provisioning run", name),
            },
        }
    }
}

/// A provisioned secret: logical name plus the deferred resource ARN.
#[derive(Debug, Clone)]
pub struct Secret {
    pub name: String,
    pub arn: Output<String>,
}

/// Process-wide cache of provisioned secrets for one provisioning pass.
pub struct SecretStore {
    stack: Arc<Stack>,
    cache: Mutex<HashMap<String, Secret>>,
}

impl SecretStore {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self {
            stack,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get-or-create. Repeated calls for the same logical name return the
    /// cached entry without declaring a second secret resource.
    pub fn provision(
        &self,
        name: &str,
        value: impl Into<Output<String>>,
    ) -> Result<Secret, SecretError> {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(name) {
            debug!(secret = name, "returning cached secret");
            return Ok(existing.clone());
        }
        let secret = self.declare(name, value.into())?;
        cache.insert(name.to_string(), secret.clone());
        Ok(secret)
    }

    /// Create-only. Fails fast if the logical name was already provisioned.
    pub fn store(
        &self,
        name: &str,
        value: impl Into<Output<String>>,
    ) -> Result<Secret, SecretError> {
        let mut cache = self.cache.lock();
        if cache.contains_key(name) {
            return Err(SecretError::DuplicateSecret {
                name: name.to_string(),
            });
        }
        let secret = self.declare(name, value.into())?;
        cache.insert(name.to_string(), secret.clone());
        Ok(secret)
    }

    pub fn get(&self, name: &str) -> Option<Secret> {
        self.cache.lock().get(name).cloned()
    }

    fn declare(&self, name: &str, value: Output<String>) -> Result<Secret, SecretError> {
        debug!(secret = name, "declaring secret resource");
        let resource = self.stack.declare(
            "cloud:secrets/secret",
            &format!("secret-{}", name),
            Inputs::new().set("name", self.stack.physical_name(name)),
        )?;
        self.stack.declare_with_deps(
            "cloud:secrets/secretVersion",
            &format!("secret-{}-version", name),
            Inputs::new()
                .set_output("secretId", resource.attr("id"))
                .set_output("secretString", value),
            &[&resource],
        )?;
        Ok(Secret {
            name: name.to_string(),
            arn: resource.attr("arn"),
        })
    }
}
