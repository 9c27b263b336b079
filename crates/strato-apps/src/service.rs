//! HTTP, gRPC and worker application provisioners
//!
//! One provisioner type dispatched over a closed kind enum. Shared steps
//! (security group, service discovery, mesh node and service, roles, task
//! definition, cluster service) live here; the kinds differ in listener
//! protocol, port override, load-balancer binding and autoscaling.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strato_core::{Inputs, Output, ProvisionError, ProvisionResult, ResourceHandle, Stack};
use strato_network::VpcDetails;
use strato_policy::{assume_role_policy, attach_role_policy, PolicyDocument, PolicyStatement};
use strato_secrets::SecretStore;
use tracing::info;

use crate::config::{AppConfig, ValidApp};
use crate::containers::{compose, ComposeRequest, ContainerDefinition, EnvVar, TracingBackend};
use crate::datadog::{fetch_log_ready_services, LogIndexClient};

const CPU_TARGET_PERCENT: f64 = 75.0;
const SCALE_IN_COOLDOWN_S: u32 = 300;
const SCALE_OUT_COOLDOWN_S: u32 = 60;
const WORKER_LISTENER_PORT: u16 = 8080;

fn default_http_port() -> u16 {
    3000
}

fn default_grpc_port() -> u16 {
    50051
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_min_capacity() -> u32 {
    1
}

fn default_max_capacity() -> u32 {
    4
}

/// Configuration for an HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub container_port: u16,

    pub health_check_path: String,

    /// Path prefixes routed to this service by the ingress.
    #[serde(default)]
    pub ingress_path_prefixes: Vec<String>,

    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Target group to attach the service to. Absent means no load-balancer
    /// binding at all.
    #[serde(skip)]
    pub alb_target_group_arn: Option<Output<String>>,
}

/// Configuration for a gRPC service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcConfig {
    #[serde(default = "default_grpc_port")]
    pub container_port: u16,

    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Application kind. Workers carry nothing beyond the base configuration.
#[derive(Debug, Clone)]
pub enum ServiceKind {
    Http(HttpConfig),
    Grpc(GrpcConfig),
    Worker,
}

impl ServiceKind {
    fn validate(&self) -> ProvisionResult<()> {
        match self {
            ServiceKind::Http(config) => {
                if !config.health_check_path.starts_with('/') {
                    return Err(ProvisionError::validation(
                        "health_check_path",
                        "health check path must start with `/`",
                    ));
                }
                for prefix in &config.ingress_path_prefixes {
                    if !prefix.starts_with('/') {
                        return Err(ProvisionError::validation(
                            "ingress_path_prefixes",
                            format!("path prefix `{}` must start with `/`", prefix),
                        ));
                    }
                }
                validate_capacity(config.min_capacity, config.max_capacity)
            }
            ServiceKind::Grpc(config) => {
                validate_capacity(config.min_capacity, config.max_capacity)
            }
            ServiceKind::Worker => Ok(()),
        }
    }

    fn listener_protocol(&self) -> &'static str {
        match self {
            ServiceKind::Http(_) => "http",
            ServiceKind::Grpc(_) => "grpc",
            ServiceKind::Worker => "tcp",
        }
    }

    /// Port exposed by the application container. Workers expose none.
    fn container_port(&self) -> Option<u16> {
        match self {
            ServiceKind::Http(config) => Some(config.container_port),
            ServiceKind::Grpc(config) => Some(config.container_port),
            ServiceKind::Worker => None,
        }
    }

    fn listener_port(&self) -> u16 {
        self.container_port().unwrap_or(WORKER_LISTENER_PORT)
    }

    fn capacity(&self) -> Option<(u32, u32)> {
        match self {
            ServiceKind::Http(config) => Some((config.min_capacity, config.max_capacity)),
            ServiceKind::Grpc(config) => Some((config.min_capacity, config.max_capacity)),
            ServiceKind::Worker => None,
        }
    }

    fn request_timeout_ms(&self) -> Option<u64> {
        match self {
            ServiceKind::Http(config) => Some(config.request_timeout_ms),
            ServiceKind::Grpc(config) => Some(config.request_timeout_ms),
            ServiceKind::Worker => None,
        }
    }
}

fn validate_capacity(min: u32, max: u32) -> ProvisionResult<()> {
    if min == 0 {
        return Err(ProvisionError::validation(
            "min_capacity",
            "minimum capacity must be at least 1",
        ));
    }
    if min > max {
        return Err(ProvisionError::validation(
            "min_capacity",
            format!("minimum capacity {} exceeds maximum {}", min, max),
        ));
    }
    Ok(())
}

/// Deferred details of a provisioned HTTP service.
#[derive(Debug, Clone)]
pub struct HttpServiceDetails {
    pub service_name: String,
    pub virtual_service_name: String,
    pub target_group_arn: Option<Output<String>>,
}

/// Deferred details of a provisioned gRPC service.
#[derive(Debug, Clone)]
pub struct GrpcServiceDetails {
    pub host: String,
    pub port: u16,
    pub virtual_service_name: String,
}

/// Details of a provisioned worker.
#[derive(Debug, Clone)]
pub struct WorkerServiceDetails {
    pub service_name: String,
}

#[derive(Debug, Clone)]
pub enum ServiceDetails {
    Http(HttpServiceDetails),
    Grpc(GrpcServiceDetails),
    Worker(WorkerServiceDetails),
}

/// Provisioner for one application of any kind.
#[derive(Debug)]
pub struct AppService {
    stack: Arc<Stack>,
    app: ValidApp,
    kind: ServiceKind,
    extra_env: Vec<EnvVar>,
}

impl AppService {
    /// Validates the configuration up front; nothing is declared until
    /// [`AppService::provision`] runs.
    pub fn new(stack: Arc<Stack>, config: &AppConfig, kind: ServiceKind) -> ProvisionResult<Self> {
        kind.validate()?;
        let app = config.validate()?;
        Ok(Self {
            stack,
            app,
            kind,
            extra_env: Vec::new(),
        })
    }

    /// Add computed environment variables (connection URLs and the like)
    /// from other provisioners. User-supplied variables still win on name
    /// collision.
    pub fn with_env(mut self, vars: Vec<EnvVar>) -> Self {
        self.extra_env.extend(vars);
        self
    }

    pub fn app(&self) -> &ValidApp {
        &self.app
    }

    pub async fn provision(
        &self,
        vpc: &VpcDetails,
        secrets: &SecretStore,
        log_index: Option<&dyn LogIndexClient>,
    ) -> ProvisionResult<ServiceDetails> {
        let app = &self.app;
        info!(app = %app.name, kind = self.kind.listener_protocol(), "provisioning application service");

        let subnets = vpc.subnet_ids_with_prefix(&app.subnet_name_prefix);
        if subnets.is_empty() {
            return Err(ProvisionError::validation(
                "subnet_name_prefix",
                format!("no subnets match prefix `{}`", app.subnet_name_prefix),
            ));
        }

        let security_group = self.stack.declare(
            "cloud:network/securityGroup",
            &format!("{}-sg", app.name),
            Inputs::new()
                .set_output("vpcId", vpc.vpc_id.clone())
                .set(
                    "ingress",
                    json!([{
                        "protocol": "tcp",
                        "fromPort": self.kind.listener_port(),
                        "toPort": self.kind.listener_port(),
                        "cidrBlocks": [vpc.cidr_block],
                    }]),
                )
                .set(
                    "egress",
                    json!([{ "protocol": "-1", "fromPort": 0, "toPort": 0, "cidrBlocks": ["0.0.0.0/0"] }]),
                ),
        )?;

        let discovery = self.stack.declare(
            "cloud:discovery/service",
            &format!("{}-discovery", app.name),
            Inputs::new()
                .set("name", app.name.as_str())
                .set_output("namespaceId", vpc.dns_namespace_id.clone())
                .set(
                    "dnsConfig",
                    json!({
                        "dnsRecords": [{ "type": "A", "ttl": 10 }],
                        "routingPolicy": "MULTIVALUE",
                    }),
                )
                .set("healthCheckCustomConfig", json!({ "failureThreshold": 1 })),
        )?;

        let virtual_node = self.declare_virtual_node(vpc)?;
        let virtual_service_name = format!("{}.{}", app.name, vpc.dns_namespace_name);
        self.stack.declare_with_deps(
            "cloud:mesh/virtualService",
            &format!("{}-virtual-service", app.name),
            Inputs::new()
                .set("meshName", vpc.mesh_name.as_str())
                .set("virtualServiceName", virtual_service_name.as_str())
                .set(
                    "spec",
                    json!({
                        "provider": {
                            "virtualNode": {
                                "virtualNodeName": self.stack.physical_name(&format!("{}-node", app.name)),
                            },
                        },
                    }),
                ),
            &[&virtual_node],
        )?;

        let secret_refs = self.provision_secrets(secrets)?;
        let datadog_api_key_arn = match &app.datadog {
            Some(datadog) => Some(
                secrets
                    .provision(
                        &format!("{}-datadog-api-key", app.name),
                        datadog.api_key.as_str(),
                    )?
                    .arn,
            ),
            None => None,
        };

        let (execution_role, task_role) =
            self.declare_roles(&secret_refs, datadog_api_key_arn.clone())?;

        let log_ready = match (log_index, &app.datadog) {
            (Some(client), Some(_)) => {
                fetch_log_ready_services(client).await.contains(&app.name)
            }
            _ => false,
        };

        let overrides = self.kind.container_port().map(|port| {
            ContainerDefinition::new(&app.name).set(
                "portMappings",
                json!([{ "containerPort": port, "protocol": "tcp" }]),
            )
        });

        let tracing = if app.datadog.is_some() {
            TracingBackend::Datadog
        } else {
            TracingBackend::Collector
        };
        let containers = compose(ComposeRequest {
            app,
            registry_address: self.stack.provider().registry_address(),
            region: self.stack.region().to_string(),
            environment: self.stack.environment().to_string(),
            virtual_node_arn: virtual_node.attr("arn"),
            tracing,
            overrides,
            secret_refs,
            datadog_api_key_arn,
            extra_env: self.extra_env.clone(),
            log_ready,
        })?;

        let task_definition = self.stack.declare_with_deps(
            "cloud:cluster/taskDefinition",
            &format!("{}-taskdef", app.name),
            Inputs::new()
                .set("family", self.stack.physical_name(&app.name))
                .set("cpu", app.cpu.to_string())
                .set("memory", app.memory.to_string())
                .set("networkMode", "awsvpc")
                .set("requiresCompatibilities", json!(["FARGATE"]))
                .set_output("executionRoleArn", execution_role.attr("arn"))
                .set_output("taskRoleArn", task_role.attr("arn"))
                .set_output("containerDefinitions", containers.render()),
            &[&execution_role, &task_role],
        )?;

        let cluster_name = self.stack.physical_name(&format!("{}-cluster", app.name));
        let cluster = self.stack.declare(
            "cloud:cluster/cluster",
            &format!("{}-cluster", app.name),
            Inputs::new().set("name", cluster_name.as_str()),
        )?;

        let service_name = self.stack.physical_name(&format!("{}-service", app.name));
        let desired_count = self.desired_count();
        let mut service_inputs = Inputs::new()
            .set("name", service_name.as_str())
            .set_output("cluster", cluster.attr("arn"))
            .set_output("taskDefinition", task_definition.attr("arn"))
            .set("desiredCount", desired_count)
            .set("launchType", "FARGATE")
            .set_outputs("subnets", subnets)
            .set_outputs("securityGroups", vec![security_group.attr("id")])
            .set("assignPublicIp", false)
            .set_output("serviceRegistryArn", discovery.attr("arn"));

        if let ServiceKind::Http(config) = &self.kind {
            if let Some(target_group) = &config.alb_target_group_arn {
                service_inputs = service_inputs.set_output(
                    "loadBalancers",
                    self.load_balancer_binding(target_group, config.container_port),
                );
            }
        }

        let service = self.stack.declare_with_deps(
            "cloud:cluster/service",
            &format!("{}-service", app.name),
            service_inputs,
            &[&cluster, &task_definition],
        )?;

        if let Some((min, max)) = self.kind.capacity() {
            self.declare_autoscaling(&cluster_name, &service_name, &service, min, max)?;
        }

        Ok(match &self.kind {
            ServiceKind::Http(config) => ServiceDetails::Http(HttpServiceDetails {
                service_name,
                virtual_service_name,
                target_group_arn: config.alb_target_group_arn.clone(),
            }),
            ServiceKind::Grpc(config) => ServiceDetails::Grpc(GrpcServiceDetails {
                host: format!("{}.{}", app.name, vpc.dns_namespace_name),
                port: config.container_port,
                virtual_service_name,
            }),
            ServiceKind::Worker => ServiceDetails::Worker(WorkerServiceDetails { service_name }),
        })
    }

    fn desired_count(&self) -> u32 {
        if !self.app.is_on {
            return 0;
        }
        match &self.kind {
            ServiceKind::Http(config) => config.min_capacity,
            ServiceKind::Grpc(config) => config.min_capacity,
            ServiceKind::Worker => 1,
        }
    }

    fn declare_virtual_node(&self, vpc: &VpcDetails) -> ProvisionResult<ResourceHandle> {
        let app = &self.app;
        let protocol = self.kind.listener_protocol();
        let port = self.kind.listener_port();

        let mut listener = json!({
            "portMapping": { "port": port, "protocol": protocol },
        });
        if let Some(timeout_ms) = self.kind.request_timeout_ms() {
            listener["timeout"] = json!({
                "perRequest": { "unit": "ms", "value": timeout_ms },
            });
            let mut health_check = json!({
                "protocol": protocol,
                "port": port,
                "healthyThreshold": 2,
                "unhealthyThreshold": 2,
                "intervalMillis": 5000,
                "timeoutMillis": 2000,
            });
            if let ServiceKind::Http(config) = &self.kind {
                health_check["path"] = json!(config.health_check_path);
            }
            listener["healthCheck"] = health_check;
        }

        self.stack.declare(
            "cloud:mesh/virtualNode",
            &format!("{}-node", app.name),
            Inputs::new()
                .set("meshName", vpc.mesh_name.as_str())
                .set(
                    "virtualNodeName",
                    self.stack.physical_name(&format!("{}-node", app.name)),
                )
                .set(
                    "spec",
                    json!({
                        "listeners": [listener],
                        "serviceDiscovery": {
                            "awsCloudMap": {
                                "namespaceName": vpc.dns_namespace_name,
                                "serviceName": app.name,
                            },
                        },
                    }),
                ),
        )
    }

    fn provision_secrets(
        &self,
        secrets: &SecretStore,
    ) -> ProvisionResult<Vec<(String, Output<String>)>> {
        let app = &self.app;
        let mut refs = Vec::with_capacity(app.secrets.len());
        for mapping in &app.secrets {
            let secret = secrets.provision(
                &format!("{}-{}", app.name, mapping.name.to_lowercase()),
                mapping.value.as_str(),
            )?;
            refs.push((mapping.name.clone(), secret.arn));
        }
        Ok(refs)
    }

    fn declare_roles(
        &self,
        secret_refs: &[(String, Output<String>)],
        datadog_api_key_arn: Option<Output<String>>,
    ) -> ProvisionResult<(ResourceHandle, ResourceHandle)> {
        let app = &self.app;

        let execution_role = self.stack.declare(
            "cloud:iam/role",
            &format!("{}-execution-role", app.name),
            Inputs::new()
                .set("name", self.stack.physical_name(&format!("{}-execution", app.name)))
                .set_output(
                    "assumeRolePolicy",
                    assume_role_policy("ecs-tasks.amazonaws.com").render(),
                ),
        )?;

        let mut execution_policy = PolicyDocument::new()
            .statement(
                PolicyStatement::allow()
                    .sid("Logs")
                    .actions(["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"])
                    .resource("*"),
            )
            .statement(
                PolicyStatement::allow()
                    .sid("RegistryPull")
                    .actions([
                        "ecr:GetAuthorizationToken",
                        "ecr:BatchGetImage",
                        "ecr:GetDownloadUrlForLayer",
                    ])
                    .resource("*"),
            );
        let mut secret_arns: Vec<Output<String>> =
            secret_refs.iter().map(|(_, arn)| arn.clone()).collect();
        if let Some(arn) = datadog_api_key_arn {
            secret_arns.push(arn);
        }
        if !secret_arns.is_empty() {
            let mut statement = PolicyStatement::allow()
                .sid("ReadSecrets")
                .action("secretsmanager:GetSecretValue");
            for arn in secret_arns {
                statement = statement.resource(arn);
            }
            execution_policy = execution_policy.statement(statement);
        }
        attach_role_policy(
            &self.stack,
            &format!("{}-execution-role-policy", app.name),
            &execution_role,
            &execution_policy,
        )?;

        let task_role = self.stack.declare(
            "cloud:iam/role",
            &format!("{}-task-role", app.name),
            Inputs::new()
                .set("name", self.stack.physical_name(&format!("{}-task", app.name)))
                .set_output(
                    "assumeRolePolicy",
                    assume_role_policy("ecs-tasks.amazonaws.com").render(),
                ),
        )?;
        if !app.policies.is_empty() {
            let mut task_policy = PolicyDocument::new();
            for grant in &app.policies {
                let mut statement = PolicyStatement::allow().actions(grant.actions.clone());
                for resource in &grant.resources {
                    statement = statement.resource(resource.as_str());
                }
                task_policy = task_policy.statement(statement);
            }
            attach_role_policy(
                &self.stack,
                &format!("{}-task-role-policy", app.name),
                &task_role,
                &task_policy,
            )?;
        }

        Ok((execution_role, task_role))
    }

    fn load_balancer_binding(
        &self,
        target_group: &Output<String>,
        container_port: u16,
    ) -> Output<String> {
        let container_name = self.app.name.clone();
        target_group.apply(move |arn| {
            json!([{
                "targetGroupArn": arn,
                "containerName": container_name,
                "containerPort": container_port,
            }])
            .to_string()
        })
    }

    fn declare_autoscaling(
        &self,
        cluster_name: &str,
        service_name: &str,
        service: &ResourceHandle,
        min_capacity: u32,
        max_capacity: u32,
    ) -> ProvisionResult<()> {
        let app = &self.app;
        let target = self.stack.declare_with_deps(
            "cloud:autoscaling/target",
            &format!("{}-scaling-target", app.name),
            Inputs::new()
                .set("minCapacity", min_capacity)
                .set("maxCapacity", max_capacity)
                .set("resourceId", format!("service/{}/{}", cluster_name, service_name))
                .set("scalableDimension", "ecs:service:DesiredCount")
                .set("serviceNamespace", "ecs"),
            &[service],
        )?;
        self.stack.declare_with_deps(
            "cloud:autoscaling/policy",
            &format!("{}-scaling-policy", app.name),
            Inputs::new()
                .set("policyType", "TargetTrackingScaling")
                .set_output("resourceId", target.attr("resourceId"))
                .set("scalableDimension", "ecs:service:DesiredCount")
                .set("serviceNamespace", "ecs")
                .set(
                    "targetTrackingScalingPolicyConfiguration",
                    json!({
                        "targetValue": CPU_TARGET_PERCENT,
                        "predefinedMetricSpecification": {
                            "predefinedMetricType": "ECSServiceAverageCPUUtilization",
                        },
                        "scaleInCooldown": SCALE_IN_COOLDOWN_S,
                        "scaleOutCooldown": SCALE_OUT_COOLDOWN_S,
                    }),
                ),
            &[&target],
        )?;
        Ok(())
    }
}
