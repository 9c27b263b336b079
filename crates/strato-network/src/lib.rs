//! Network foundation provisioner
//!
//! Creates the virtual network, subnet topology, service-mesh namespace and
//! private DNS namespace every other provisioner builds on. The returned
//! [`VpcDetails`] is produced once per provisioning pass and passed by shared
//! reference downstream; it is never mutated.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strato_core::{Inputs, Output, ProvisionError, ProvisionResult, Stack};
use tracing::info;

/// Network topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Prefix applied to every subnet name, e.g. `core`.
    pub name_prefix: String,
    /// VPC CIDR block, e.g. `10.0.0.0/16`.
    pub cidr_block: String,
    /// Availability zones subnets are spread over. At least two.
    pub availability_zones: Vec<String>,
    /// Private DNS namespace name. Defaults to `{name_prefix}.local`.
    #[serde(default)]
    pub private_dns_name: Option<String>,
}

impl NetworkConfig {
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.name_prefix.is_empty() {
            return Err(ProvisionError::validation(
                "name_prefix",
                "subnet name prefix must not be empty",
            ));
        }
        if self.availability_zones.len() < 2 {
            return Err(ProvisionError::validation(
                "availability_zones",
                "at least two availability zones are required",
            ));
        }
        validate_cidr(&self.cidr_block)?;
        Ok(())
    }

    fn dns_name(&self) -> String {
        self.private_dns_name
            .clone()
            .unwrap_or_else(|| format!("{}.local", self.name_prefix))
    }
}

/// Validate a CIDR block: four octets in range and a prefix length that
/// leaves room for per-AZ subnets.
fn validate_cidr(cidr: &str) -> ProvisionResult<()> {
    let pattern = Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})/(\d{1,2})$")
        .map_err(|e| ProvisionError::Configuration {
            message: format!("invalid CIDR pattern: {}", e),
        })?;
    let captures = pattern.captures(cidr).ok_or_else(|| {
        ProvisionError::validation(
            "cidr_block",
            format!("`{}` is not of the form a.b.c.d/len", cidr),
        )
    })?;
    for i in 1..=4 {
        let octet: u32 = captures[i].parse().map_err(|_| {
            ProvisionError::validation("cidr_block", format!("octet `{}` is not a number", &captures[i]))
        })?;
        if octet > 255 {
            return Err(ProvisionError::validation(
                "cidr_block",
                format!("octet {} is out of range 0-255", octet),
            ));
        }
    }
    let prefix: u32 = captures[5].parse().map_err(|_| {
        ProvisionError::validation("cidr_block", "prefix length is not a number")
    })?;
    if prefix > 28 {
        return Err(ProvisionError::validation(
            "cidr_block",
            format!("prefix length /{} leaves no room for subnets (max /28)", prefix),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetVisibility {
    Public,
    Private,
}

impl SubnetVisibility {
    fn as_str(&self) -> &'static str {
        match self {
            SubnetVisibility::Public => "public",
            SubnetVisibility::Private => "private",
        }
    }
}

/// One provisioned subnet.
#[derive(Debug, Clone)]
pub struct SubnetDetails {
    pub name: String,
    pub id: Output<String>,
    pub visibility: SubnetVisibility,
    pub availability_zone: String,
}

/// Handles to the network foundation, consumed by every other provisioner.
#[derive(Debug, Clone)]
pub struct VpcDetails {
    pub vpc_id: Output<String>,
    pub cidr_block: String,
    pub mesh_name: String,
    pub mesh_arn: Output<String>,
    pub dns_namespace_name: String,
    pub dns_namespace_id: Output<String>,
    pub subnets: Vec<SubnetDetails>,
}

impl VpcDetails {
    pub fn subnet_ids_with_prefix(&self, prefix: &str) -> Vec<Output<String>> {
        self.subnets
            .iter()
            .filter(|s| s.name.starts_with(prefix))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn private_subnet_ids(&self) -> Vec<Output<String>> {
        self.subnet_ids_by_visibility(SubnetVisibility::Private)
    }

    pub fn public_subnet_ids(&self) -> Vec<Output<String>> {
        self.subnet_ids_by_visibility(SubnetVisibility::Public)
    }

    fn subnet_ids_by_visibility(&self, visibility: SubnetVisibility) -> Vec<Output<String>> {
        self.subnets
            .iter()
            .filter(|s| s.visibility == visibility)
            .map(|s| s.id.clone())
            .collect()
    }
}

pub struct NetworkProvisioner {
    stack: Arc<Stack>,
}

impl NetworkProvisioner {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    pub fn provision(&self, config: &NetworkConfig) -> ProvisionResult<VpcDetails> {
        config.validate()?;
        info!(prefix = %config.name_prefix, cidr = %config.cidr_block, "provisioning network foundation");

        let vpc = self.stack.declare(
            "cloud:network/vpc",
            &format!("{}-vpc", config.name_prefix),
            Inputs::new()
                .set("cidrBlock", config.cidr_block.as_str())
                .set("enableDnsSupport", true)
                .set("enableDnsHostnames", true),
        )?;

        let gateway = self.stack.declare(
            "cloud:network/internetGateway",
            &format!("{}-igw", config.name_prefix),
            Inputs::new().set_output("vpcId", vpc.attr("id")),
        )?;

        let public_route_table = self.stack.declare(
            "cloud:network/routeTable",
            &format!("{}-public-rt", config.name_prefix),
            Inputs::new().set_output("vpcId", vpc.attr("id")),
        )?;
        self.stack.declare_with_deps(
            "cloud:network/route",
            &format!("{}-public-default", config.name_prefix),
            Inputs::new()
                .set_output("routeTableId", public_route_table.attr("id"))
                .set("destinationCidrBlock", "0.0.0.0/0")
                .set_output("gatewayId", gateway.attr("id")),
            &[&gateway],
        )?;

        let base = subnet_base(&config.cidr_block);
        let mut subnets = Vec::new();
        let mut block_index = 0u8;
        for az in &config.availability_zones {
            for visibility in [SubnetVisibility::Public, SubnetVisibility::Private] {
                let name = format!("{}-{}-{}", config.name_prefix, visibility.as_str(), az);
                let subnet = self.stack.declare(
                    "cloud:network/subnet",
                    &name,
                    Inputs::new()
                        .set_output("vpcId", vpc.attr("id"))
                        .set("availabilityZone", az.as_str())
                        .set("cidrBlock", format!("{}.{}.0/24", base, block_index))
                        .set("mapPublicIpOnLaunch", visibility == SubnetVisibility::Public),
                )?;
                if visibility == SubnetVisibility::Public {
                    self.stack.declare(
                        "cloud:network/routeTableAssociation",
                        &format!("{}-assoc", name),
                        Inputs::new()
                            .set_output("subnetId", subnet.attr("id"))
                            .set_output("routeTableId", public_route_table.attr("id")),
                    )?;
                }
                subnets.push(SubnetDetails {
                    name,
                    id: subnet.attr("id"),
                    visibility,
                    availability_zone: az.clone(),
                });
                block_index += 1;
            }
        }

        let mesh_name = self.stack.physical_name(&format!("{}-mesh", config.name_prefix));
        let mesh = self.stack.declare(
            "cloud:mesh/mesh",
            &format!("{}-mesh", config.name_prefix),
            Inputs::new()
                .set("name", mesh_name.as_str())
                .set("egressFilter", json!({ "type": "ALLOW_ALL" })),
        )?;

        let dns_name = config.dns_name();
        let namespace = self.stack.declare(
            "cloud:dns/privateNamespace",
            &format!("{}-dns", config.name_prefix),
            Inputs::new()
                .set("name", dns_name.as_str())
                .set_output("vpc", vpc.attr("id")),
        )?;

        self.stack.export("vpcId", vpc.attr("id"));

        Ok(VpcDetails {
            vpc_id: vpc.attr("id"),
            cidr_block: config.cidr_block.clone(),
            mesh_name,
            mesh_arn: mesh.attr("arn"),
            dns_namespace_name: dns_name,
            dns_namespace_id: namespace.attr("id"),
            subnets,
        })
    }
}

/// First two octets of the network base, used to derive per-subnet /24 blocks.
fn subnet_base(cidr: &str) -> String {
    cidr.split('.').take(2).collect::<Vec<_>>().join(".")
}
