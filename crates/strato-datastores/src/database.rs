//! Relational database cluster provisioner

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strato_core::{Inputs, Output, ProvisionError, ProvisionResult, Stack};
use strato_network::VpcDetails;
use strato_secrets::SecretStore;
use tracing::info;

fn default_engine() -> String {
    "aurora-postgresql".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "app".to_string()
}

fn default_username() -> String {
    "app".to_string()
}

fn default_instance_class() -> String {
    "db.r6g.large".to_string()
}

fn default_instances() -> u32 {
    2
}

/// Configuration for a relational cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,

    #[serde(default = "default_engine")]
    pub engine: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_username")]
    pub username: String,

    /// Master password, stored through the secret cache so repeated
    /// provisioning never creates a second secret.
    pub master_password: String,

    #[serde(default = "default_instance_class")]
    pub instance_class: String,

    /// Writer plus readers.
    #[serde(default = "default_instances")]
    pub instances: u32,
}

impl DatabaseConfig {
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::validation("name", "database name must not be empty"));
        }
        if self.master_password.is_empty() {
            return Err(ProvisionError::validation(
                "master_password",
                "master password must not be empty",
            ));
        }
        if self.instances == 0 {
            return Err(ProvisionError::validation(
                "instances",
                "at least one instance is required",
            ));
        }
        Ok(())
    }
}

/// Connection details for a provisioned database cluster.
#[derive(Debug, Clone)]
pub struct DatabaseDetails {
    pub host: Output<String>,
    pub reader_host: Output<String>,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub secret_arn: Output<String>,
    pub connection_url: Output<String>,
}

pub struct DatabaseClusterProvisioner {
    stack: Arc<Stack>,
}

impl DatabaseClusterProvisioner {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    pub fn provision(
        &self,
        config: &DatabaseConfig,
        vpc: &VpcDetails,
        secrets: &SecretStore,
    ) -> ProvisionResult<DatabaseDetails> {
        config.validate()?;
        info!(database = %config.name, engine = %config.engine, "provisioning database cluster");

        let master_secret = secrets.provision(
            &format!("{}-master-password", config.name),
            config.master_password.as_str(),
        )?;

        let subnet_group = self.stack.declare(
            "cloud:database/subnetGroup",
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
                ),
        )?;

        let cluster = self.stack.declare_with_deps(
            "cloud:database/cluster",
            &config.name,
            Inputs::new()
                .set("clusterIdentifier", self.stack.physical_name(&config.name))
                .set("engine", config.engine.as_str())
                .set("databaseName", config.database.as_str())
                .set("masterUsername", config.username.as_str())
                .set_output("masterUserSecretArn", master_secret.arn.clone())
                .set("port", config.port)
                .set_output("dbSubnetGroupName", subnet_group.attr("name"))
                .set_outputs("vpcSecurityGroupIds", vec![security_group.attr("id")])
                .set("storageEncrypted", true),
            &[&subnet_group, &security_group],
        )?;

        for index in 0..config.instances {
            self.stack.declare_with_deps(
                "cloud:database/instance",
                &format!("{}-instance-{}", config.name, index),
                Inputs::new()
                    .set_output("clusterIdentifier", cluster.attr("id"))
                    .set("instanceClass", config.instance_class.as_str())
                    .set("engine", config.engine.as_str()),
                &[&cluster],
            )?;
        }

        let host = cluster.attr("endpoint");
        let connection_url = Output::format(
            "postgres://{}@{}:{}/{}",
            vec![
                Output::known(config.username.clone()),
                host.clone(),
                Output::known(config.port.to_string()),
                Output::known(config.database.clone()),
            ],
        );

        Ok(DatabaseDetails {
            host,
            reader_host: cluster.attr("readerEndpoint"),
            port: config.port,
            database: config.database.clone(),
            username: config.username.clone(),
            secret_arn: master_secret.arn,
            connection_url,
        })
    }
}
