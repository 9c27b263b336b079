//! Object storage bucket provisioner

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strato_core::{Inputs, Output, ProvisionError, ProvisionResult, Stack};
use strato_policy::{attach_bucket_policy, PolicyDocument, PolicyStatement};
use tracing::info;

fn default_true() -> bool {
    true
}

/// Configuration for an object storage bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub versioning: bool,

    #[serde(default = "default_true")]
    pub encryption: bool,

    /// Expose objects for anonymous read. Leaves the public access block
    /// open and attaches a read policy.
    #[serde(default)]
    pub public_read: bool,
}

impl ObjectStorageConfig {
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::validation("name", "bucket name must not be empty"));
        }
        Ok(())
    }
}

/// Details for a provisioned bucket.
#[derive(Debug, Clone)]
pub struct BucketDetails {
    pub bucket_name: String,
    pub bucket_arn: Output<String>,
}

pub struct ObjectStorageProvisioner {
    stack: Arc<Stack>,
}

impl ObjectStorageProvisioner {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    pub fn provision(&self, config: &ObjectStorageConfig) -> ProvisionResult<BucketDetails> {
        config.validate()?;
        let bucket_name = self.stack.physical_name(&config.name);
        info!(bucket = %bucket_name, "provisioning object storage bucket");

        let mut inputs = Inputs::new().set("bucket", bucket_name.as_str());
        if config.versioning {
            inputs = inputs.set("versioning", json!({ "enabled": true }));
        }
        if config.encryption {
            inputs = inputs.set(
                "serverSideEncryptionConfiguration",
                json!({ "rule": { "applyServerSideEncryptionByDefault": { "sseAlgorithm": "aws:kms" } } }),
            );
        }
        let bucket = self.stack.declare("cloud:storage/bucket", &config.name, inputs)?;

        let block_public = !config.public_read;
        self.stack.declare_with_deps(
            "cloud:storage/publicAccessBlock",
            &format!("{}-public-access", config.name),
            Inputs::new()
                .set_output("bucket", bucket.attr("id"))
                .set("blockPublicAcls", block_public)
                .set("blockPublicPolicy", block_public)
                .set("ignorePublicAcls", block_public)
                .set("restrictPublicBuckets", block_public),
            &[&bucket],
        )?;

        if config.public_read {
            let read_policy = PolicyDocument::new().statement(
                PolicyStatement::allow()
                    .sid("PublicRead")
                    .any_principal()
                    .action("s3:GetObject")
                    .resource(Output::format("{}/*", vec![bucket.attr("arn")])),
            );
            attach_bucket_policy(
                &self.stack,
                &format!("{}-read-policy", config.name),
                &bucket,
                &read_policy,
            )?;
        }

        Ok(BucketDetails {
            bucket_name,
            bucket_arn: bucket.attr("arn"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::{Environment, ProviderSettings};

    fn test_stack() -> Arc<Stack> {
        Arc::new(
            Stack::new(
                "orders",
                Environment::Dev,
                ProviderSettings {
                    region: "us-east-1".to_string(),
                    account_id: "111111111111".to_string(),
                    allowed_accounts: vec![],
                    registry_address: None,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn private_bucket_blocks_public_access() {
        let stack = test_stack();
        ObjectStorageProvisioner::new(stack.clone())
            .provision(&ObjectStorageConfig {
                name: "assets".to_string(),
                versioning: true,
                encryption: true,
                public_read: false,
            })
            .unwrap();
        let block = stack.declaration("assets-public-access").unwrap();
        assert!(matches!(
            block.inputs.get("blockPublicAcls"),
            Some(strato_core::Input::Value(v)) if v == &json!(true)
        ));
        assert!(stack.declaration("assets-read-policy").is_none());
    }

    #[test]
    fn public_bucket_attaches_read_policy() {
        let stack = test_stack();
        ObjectStorageProvisioner::new(stack.clone())
            .provision(&ObjectStorageConfig {
                name: "www".to_string(),
                versioning: false,
                encryption: true,
                public_read: true,
            })
            .unwrap();
        assert!(stack.declaration("www-read-policy").is_some());
    }

    #[test]
    fn bucket_name_is_environment_scoped() {
        let stack = test_stack();
        let details = ObjectStorageProvisioner::new(stack)
            .provision(&ObjectStorageConfig {
                name: "assets".to_string(),
                versioning: true,
                encryption: true,
                public_read: false,
            })
            .unwrap();
        assert_eq!(details.bucket_name, "orders-dev-assets");
    }
}
