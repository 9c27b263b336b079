//! Ingress provisioner
//!
//! Load balancer over the public subnets, an HTTPS listener with an
//! HTTP-to-HTTPS redirect, one target group and routing rule per target, and
//! optional WAF and CDN attachment in front.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strato_core::{Inputs, LibrarySettings, Output, ProvisionError, ProvisionResult, Stack};
use strato_network::VpcDetails;
use tracing::info;

const SLOW_START_MIN_S: u32 = 30;
const SLOW_START_MAX_S: u32 = 900;

fn default_deregistration_delay() -> u32 {
    30
}

/// One routed backend behind the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressTarget {
    pub name: String,

    /// Path pattern the listener rule matches, e.g. `/api/*`.
    pub path_pattern: String,

    pub port: u16,

    pub health_check_path: String,

    /// Ramp-up window for new targets. Zero disables slow start; anything
    /// else must fall in the platform's 30-900 second range.
    #[serde(default)]
    pub slow_start_s: Option<u32>,

    #[serde(default = "default_deregistration_delay")]
    pub deregistration_delay_s: u32,
}

impl IngressTarget {
    fn validate(&self) -> ProvisionResult<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::validation("name", "target name must not be empty"));
        }
        if !self.path_pattern.starts_with('/') {
            return Err(ProvisionError::validation(
                "path_pattern",
                format!("path pattern `{}` must start with `/`", self.path_pattern),
            ));
        }
        if !self.health_check_path.starts_with('/') {
            return Err(ProvisionError::validation(
                "health_check_path",
                "health check path must start with `/`",
            ));
        }
        if let Some(slow_start) = self.slow_start_s {
            if slow_start != 0 && !(SLOW_START_MIN_S..=SLOW_START_MAX_S).contains(&slow_start) {
                return Err(ProvisionError::validation(
                    "slow_start_s",
                    format!(
                        "slow start of {}s is outside the allowed {}-{}s range",
                        slow_start, SLOW_START_MIN_S, SLOW_START_MAX_S
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Ingress configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    pub name: String,

    /// Certificate for the HTTPS listener.
    pub certificate_arn: String,

    /// Web ACL to associate with the load balancer.
    #[serde(default)]
    pub waf_acl_arn: Option<String>,

    /// Put a CDN distribution in front of the load balancer.
    #[serde(default)]
    pub enable_cdn: bool,

    /// Routed backends, in rule-priority order.
    pub targets: Vec<IngressTarget>,
}

impl IngressConfig {
    /// Build the configuration from the library settings namespace:
    /// `certificate_arn` is required, `waf_acl_arn` and `enable_cdn` are
    /// optional.
    pub fn from_settings(
        name: &str,
        settings: &LibrarySettings,
        targets: Vec<IngressTarget>,
    ) -> ProvisionResult<Self> {
        Ok(Self {
            name: name.to_string(),
            certificate_arn: settings.require("certificate_arn")?.to_string(),
            waf_acl_arn: settings.get("waf_acl_arn").map(str::to_string),
            enable_cdn: settings.get("enable_cdn") == Some("true"),
            targets,
        })
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::validation("name", "ingress name must not be empty"));
        }
        if self.certificate_arn.is_empty() {
            return Err(ProvisionError::validation(
                "certificate_arn",
                "certificate ARN must not be empty",
            ));
        }
        if self.targets.is_empty() {
            return Err(ProvisionError::validation(
                "targets",
                "at least one ingress target is required",
            ));
        }
        for target in &self.targets {
            target.validate()?;
        }
        Ok(())
    }
}

/// Deferred details of the provisioned ingress.
#[derive(Debug, Clone)]
pub struct IngressDetails {
    pub alb_arn: Output<String>,
    pub alb_dns_name: Output<String>,
    /// Target name to target-group ARN, in rule-priority order.
    pub target_group_arns: Vec<(String, Output<String>)>,
}

impl IngressDetails {
    pub fn target_group_arn(&self, name: &str) -> Option<Output<String>> {
        self.target_group_arns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, arn)| arn.clone())
    }
}

pub struct IngressProvisioner {
    stack: Arc<Stack>,
}

impl IngressProvisioner {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    pub fn provision(&self, config: &IngressConfig, vpc: &VpcDetails) -> ProvisionResult<IngressDetails> {
        config.validate()?;
        info!(ingress = %config.name, targets = config.targets.len(), "provisioning ingress");

        let security_group = self.stack.declare(
            "cloud:network/securityGroup",
            &format!("{}-sg", config.name),
            Inputs::new()
                .set_output("vpcId", vpc.vpc_id.clone())
                .set(
                    "ingress",
                    json!([
                        { "protocol": "tcp", "fromPort": 80, "toPort": 80, "cidrBlocks": ["0.0.0.0/0"] },
                        { "protocol": "tcp", "fromPort": 443, "toPort": 443, "cidrBlocks": ["0.0.0.0/0"] },
                    ]),
                )
                .set(
                    "egress",
                    json!([{ "protocol": "-1", "fromPort": 0, "toPort": 0, "cidrBlocks": ["0.0.0.0/0"] }]),
                ),
        )?;

        let load_balancer = self.stack.declare(
            "cloud:loadbalancer/loadBalancer",
            &config.name,
            Inputs::new()
                .set("name", self.stack.physical_name(&config.name))
                .set("loadBalancerType", "application")
                .set_outputs("subnets", vpc.public_subnet_ids())
                .set_outputs("securityGroups", vec![security_group.attr("id")]),
        )?;

        let mut target_group_arns = Vec::with_capacity(config.targets.len());
        let mut target_groups = Vec::with_capacity(config.targets.len());
        for target in &config.targets {
            let mut inputs = Inputs::new()
                .set("name", self.stack.physical_name(&target.name))
                .set("port", target.port)
                .set("protocol", "HTTP")
                .set("targetType", "ip")
                .set_output("vpcId", vpc.vpc_id.clone())
                .set(
                    "healthCheck",
                    json!({
                        "path": target.health_check_path,
                        "interval": 15,
                        "healthyThreshold": 2,
                        "unhealthyThreshold": 2,
                    }),
                )
                .set("deregistrationDelay", target.deregistration_delay_s);
            if let Some(slow_start) = target.slow_start_s {
                inputs = inputs.set("slowStart", slow_start);
            }
            let target_group = self.stack.declare(
                "cloud:loadbalancer/targetGroup",
                &format!("{}-tg", target.name),
                inputs,
            )?;
            target_group_arns.push((target.name.clone(), target_group.attr("arn")));
            target_groups.push(target_group);
        }

        let https_listener = self.stack.declare_with_deps(
            "cloud:loadbalancer/listener",
            &format!("{}-https", config.name),
            Inputs::new()
                .set_output("loadBalancerArn", load_balancer.attr("arn"))
                .set("port", 443)
                .set("protocol", "HTTPS")
                .set("certificateArn", config.certificate_arn.as_str())
                .set_output(
                    "defaultAction",
                    target_groups[0].attr("arn").apply(|arn| {
                        json!({ "type": "forward", "targetGroupArn": arn }).to_string()
                    }),
                ),
            &[&load_balancer, &target_groups[0]],
        )?;

        self.stack.declare_with_deps(
            "cloud:loadbalancer/listener",
            &format!("{}-http-redirect", config.name),
            Inputs::new()
                .set_output("loadBalancerArn", load_balancer.attr("arn"))
                .set("port", 80)
                .set("protocol", "HTTP")
                .set(
                    "defaultAction",
                    json!({
                        "type": "redirect",
                        "redirect": { "port": "443", "protocol": "HTTPS", "statusCode": "HTTP_301" },
                    }),
                ),
            &[&load_balancer],
        )?;

        for (priority, (target, target_group)) in
            config.targets.iter().zip(&target_groups).enumerate()
        {
            self.stack.declare_with_deps(
                "cloud:loadbalancer/listenerRule",
                &format!("{}-rule", target.name),
                Inputs::new()
                    .set_output("listenerArn", https_listener.attr("arn"))
                    .set("priority", priority as u32 + 1)
                    .set("conditions", json!([{ "pathPattern": { "values": [target.path_pattern] } }]))
                    .set_output(
                        "action",
                        target_group.attr("arn").apply(|arn| {
                            json!({ "type": "forward", "targetGroupArn": arn }).to_string()
                        }),
                    ),
                &[&https_listener, target_group],
            )?;
        }

        if let Some(waf_acl_arn) = &config.waf_acl_arn {
            self.stack.declare_with_deps(
                "cloud:waf/webAclAssociation",
                &format!("{}-waf", config.name),
                Inputs::new()
                    .set_output("resourceArn", load_balancer.attr("arn"))
                    .set("webAclArn", waf_acl_arn.as_str()),
                &[&load_balancer],
            )?;
        }

        if config.enable_cdn {
            self.stack.declare_with_deps(
                "cloud:cdn/distribution",
                &format!("{}-cdn", config.name),
                Inputs::new()
                    .set("enabled", true)
                    .set_output("originDomainName", load_balancer.attr("dnsName"))
                    .set(
                        "defaultCacheBehavior",
                        json!({
                            "viewerProtocolPolicy": "redirect-to-https",
                            "allowedMethods": ["GET", "HEAD", "OPTIONS", "PUT", "POST", "PATCH", "DELETE"],
                        }),
                    ),
                &[&load_balancer],
            )?;
        }

        self.stack.export(
            &format!("{}DnsName", config.name),
            load_balancer.attr("dnsName"),
        );

        Ok(IngressDetails {
            alb_arn: load_balancer.attr("arn"),
            alb_dns_name: load_balancer.attr("dnsName"),
            target_group_arns,
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

    fn target(name: &str, pattern: &str) -> IngressTarget {
        IngressTarget {
            name: name.to_string(),
            path_pattern: pattern.to_string(),
            port: 3000,
            health_check_path: "/health".to_string(),
            slow_start_s: None,
            deregistration_delay_s: default_deregistration_delay(),
        }
    }

    fn test_config() -> IngressConfig {
        IngressConfig {
            name: "edge".to_string(),
            certificate_arn: "arn:acm:cert/edge".to_string(),
            waf_acl_arn: None,
            enable_cdn: false,
            targets: vec![target("web", "/*"), target("api", "/api/*")],
        }
    }

    #[test]
    fn provisions_target_group_and_rule_per_target() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        let details = IngressProvisioner::new(stack.clone())
            .provision(&test_config(), &vpc)
            .unwrap();
        assert_eq!(details.target_group_arns.len(), 2);
        assert!(stack.declaration("web-tg").is_some());
        assert!(stack.declaration("api-rule").is_some());
        assert!(details.target_group_arn("api").is_some());
        assert!(details.target_group_arn("missing").is_none());
    }

    #[test]
    fn rule_priorities_follow_target_order() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        IngressProvisioner::new(stack.clone())
            .provision(&test_config(), &vpc)
            .unwrap();
        let api_rule = stack.declaration("api-rule").unwrap();
        assert!(matches!(
            api_rule.inputs.get("priority"),
            Some(strato_core::Input::Value(v)) if v == &serde_json::Value::from(2)
        ));
    }

    #[test]
    fn slow_start_outside_platform_range_fails() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        let mut config = test_config();
        config.targets[0].slow_start_s = Some(10);
        let err = IngressProvisioner::new(stack).provision(&config, &vpc).unwrap_err();
        assert!(err.to_string().contains("slow_start_s"));
    }

    #[test]
    fn slow_start_zero_disables_the_ramp() {
        let mut config = test_config();
        config.targets[0].slow_start_s = Some(0);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn default_action_forwards_to_the_first_target_group() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        IngressProvisioner::new(stack.clone())
            .provision(&test_config(), &vpc)
            .unwrap();
        let listener = stack.declaration("edge-https").unwrap();
        let action = match listener.inputs.get("defaultAction").unwrap() {
            strato_core::Input::Deferred(output) => output.resolve().await.unwrap(),
            other => panic!("unexpected input shape: {:?}", other),
        };
        let action: serde_json::Value = serde_json::from_str(&action).unwrap();
        assert_eq!(action["type"], "forward");
        assert!(action["targetGroupArn"]
            .as_str()
            .unwrap()
            .contains("web-tg"));
    }

    #[test]
    fn from_settings_requires_the_certificate() {
        let empty = LibrarySettings::default();
        let err = IngressConfig::from_settings("edge", &empty, vec![target("web", "/*")])
            .unwrap_err();
        assert!(err.to_string().contains("certificate_arn"));

        let mut settings = LibrarySettings::default();
        settings.set("certificate_arn", "arn:acm:cert/edge");
        settings.set("enable_cdn", "true");
        let config =
            IngressConfig::from_settings("edge", &settings, vec![target("web", "/*")]).unwrap();
        assert!(config.enable_cdn);
        assert!(config.waf_acl_arn.is_none());
    }

    #[test]
    fn waf_and_cdn_are_optional_attachments() {
        let stack = test_stack();
        let vpc = test_vpc(&stack);
        IngressProvisioner::new(stack.clone())
            .provision(&test_config(), &vpc)
            .unwrap();
        assert!(stack.declaration("edge-waf").is_none());
        assert!(stack.declaration("edge-cdn").is_none());

        let stack = test_stack();
        let vpc = test_vpc(&stack);
        let mut config = test_config();
        config.waf_acl_arn = Some("arn:waf:acl/edge".to_string());
        config.enable_cdn = true;
        IngressProvisioner::new(stack.clone()).provision(&config, &vpc).unwrap();
        assert!(stack.declaration("edge-waf").is_some());
        assert!(stack.declaration("edge-cdn").is_some());
    }
}
