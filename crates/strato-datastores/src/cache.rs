//! In-memory cache cluster provisioner

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strato_core::{Inputs, Output, ProvisionError, ProvisionResult, Stack};
use strato_network::VpcDetails;
use tracing::info;

fn default_node_type() -> String {
    "cache.t3.micro".to_string()
}

fn default_replicas() -> u32 {
    1
}

fn default_port() -> u16 {
    6379
}

/// Configuration for a cache replication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub name: String,

    #[serde(default = "default_node_type")]
    pub node_type: String,

    /// Number of replica nodes behind the primary.
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub engine_version: Option<String>,
}

impl CacheConfig {
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::validation("name", "cache name must not be empty"));
        }
        if self.replicas == 0 {
            return Err(ProvisionError::validation(
                "replicas",
                "at least one replica is required for failover",
            ));
        }
        Ok(())
    }
}

/// Connection details for a provisioned cache cluster.
#[derive(Debug, Clone)]
pub struct CacheDetails {
    pub host: Output<String>,
    pub port: u16,
    pub connection_url: Output<String>,
}

pub struct CacheClusterProvisioner {
    stack: Arc<Stack>,
}

impl CacheClusterProvisioner {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    pub fn provision(&self, config: &CacheConfig, vpc: &VpcDetails) -> ProvisionResult<CacheDetails> {
        config.validate()?;
        info!(cache = %config.name, node_type = %config.node_type, "provisioning cache cluster");

        let subnet_group = self.stack.declare(
            "cloud:cache/subnetGroup",
            &format!("{}-subnets", config.name),
            Inputs::new()
                .set("name", self.stack.physical_name(&format!("{}-subnets", config.name)))
                .set_outputs("subnetIds", vpc.private_subnet_ids()),
        )?;

        let security_group = self.stack.declare(
            "cloud:network/securityGroup",
            &format!("{}-sg", config.name),
            Inputs::new()
                .set_output("vpcId", vpc.vpc_id.clone())
                .set(
                    "ingress",
                    json!([{
                        "protocol": "tcp",
                        "fromPort": config.port,
                        "toPort": config.port,
                        "cidrBlocks": [vpc.cidr_block],
                    }]),
                )
                .set(
                    "egress",
                    json!([{ "protocol": "-1", "fromPort": 0, "toPort": 0, "cidrBlocks": ["0.0.0.0/0"] }]),
                ),
        )?;

        let replication_group = self.stack.declare_with_deps(
            "cloud:cache/replicationGroup",
            &config.name,
            Inputs::new()
                .set("replicationGroupId", self.stack.physical_name(&config.name))
                .set("description", format!("{} cache", config.name))
                .set("engine", "redis")
                .set_opt("engineVersion", config.engine_version.clone())
                .set("nodeType", config.node_type.as_str())
                .set("numCacheClusters", config.replicas + 1)
                .set("port", config.port)
                .set_output("subnetGroupName", subnet_group.attr("name"))
                .set_outputs("securityGroupIds", vec![security_group.attr("id")])
                .set("atRestEncryptionEnabled", true)
                .set("transitEncryptionEnabled", true)
                .set("automaticFailoverEnabled", true),
            &[&subnet_group, &security_group],
        )?;

        let host = replication_group.attr("primaryEndpointAddress");
        let connection_url = Output::format(
            "redis://{}:{}",
            vec![host.clone(), Output::known(config.port.to_string())],
        );

        Ok(CacheDetails {
            host,
            port: config.port,
            connection_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::{Environment, ProviderSettings};
    use strato_network::{NetworkConfig, NetworkProvisioner};

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

    fn test_vpc(stack: &Arc<Stack>) -> VpcDetails {
        NetworkProvisioner::new(stack.clone())
            .provision(&NetworkConfig {
                name_prefix: "core".to_string(),
                cidr_block: "10.0.0.0/16".to_string(),
                availability_zones: vec!["us-east-1a".to_string(), "us-east-1b".to_string()],
                private_dns_name: None,
            })
            .unwrap()
    }

    fn test_config() -> CacheConfig {
        CacheConfig {
            name: "sessions".to_string(),
            node_type: default_node_type(),
            replicas: 1,
            port: default_port(),
            engine_version: None,
        }
    }

    #[tokio::test]
    async fn connection_url_wires_primary_endpoint() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        let details = CacheClusterProvisioner::new(stack)
            .provision(&test_config(), &vpc)
            .unwrap();
        let url = details.connection_url.resolve().await.unwrap();
        assert!(url.starts_with("redis://"));
        assert!(url.ends_with(":6379"));
    }

    #[test]
    fn declares_subnet_group_security_group_and_cluster() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        let before = stack.declarations().len();
        CacheClusterProvisioner::new(stack.clone())
            .provision(&test_config(), &vpc)
            .unwrap();
        assert_eq!(stack.declarations().len() - before, 3);
    }

    #[test]
    fn rejects_zero_replicas() {
        let mut config = test_config();
        config.replicas = 0;
        assert!(config.validate().is_err());
    }
}
