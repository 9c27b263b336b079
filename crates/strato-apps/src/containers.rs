//! Container-definition composition and deferred serialization
//!
//! Builds the per-task container set (application container plus logging,
//! proxy and tracing sidecars) and serializes it into the single JSON string
//! the cluster's task-definition resource expects. Several fields (secret
//! ARNs, the virtual-node ARN) are deferred values, so serialization itself
//! is deferred: each container folds its ordered field list into one JSON
//! object string once everything resolves, and the set folds into one array
//! string in container order. Field order is fixed and absent fields are
//! omitted outright, so unchanged logical input always produces byte-identical
//! text and never shows up as a plan diff.

use serde_json::{json, Value};
use std::collections::HashSet;
use strato_core::{Output, ProvisionError, ProvisionResult};

use crate::config::{Launch, ValidApp};

pub const LOG_ROUTER_CONTAINER: &str = "log_router";
pub const PROXY_CONTAINER: &str = "envoy";
pub const DATADOG_AGENT_CONTAINER: &str = "datadog-agent";
pub const COLLECTOR_CONTAINER: &str = "otel-collector";

const LOG_ROUTER_IMAGE: &str = "public.ecr.aws/aws-observability/aws-for-fluent-bit:2.32.4";
const PROXY_IMAGE: &str = "public.ecr.aws/appmesh/aws-appmesh-envoy:v1.27.3.0-prod";
const DATADOG_AGENT_IMAGE: &str = "public.ecr.aws/datadog/agent:7.50.3";
const COLLECTOR_IMAGE: &str = "public.ecr.aws/aws-observability/aws-otel-collector:v0.41.1";

const PROXY_DRAIN_TIME_S: &str = "20";
const DATADOG_TRACE_PORT: u16 = 8126;
const DATADOG_STATSD_PORT: u16 = 8125;

/// One environment variable; the value may be deferred.
#[derive(Debug, Clone)]
pub struct EnvVar {
    pub name: String,
    pub value: Output<String>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<Output<String>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// De-duplicate by name with last-write-wins, then sort by name.
///
/// The combined list is walked in reverse keeping the first occurrence of
/// each name, so entries appended later (user-supplied values) win over
/// instrumentation defaults, and the final sort keeps the serialized list
/// stable between runs.
pub fn dedupe_env(defaults: Vec<EnvVar>, user: Vec<EnvVar>) -> Vec<EnvVar> {
    let combined: Vec<EnvVar> = defaults.into_iter().chain(user).collect();
    let mut seen = HashSet::new();
    let mut kept: Vec<EnvVar> = combined
        .into_iter()
        .rev()
        .filter(|var| seen.insert(var.name.clone()))
        .collect();
    kept.sort_by(|a, b| a.name.cmp(&b.name));
    kept
}

fn render_environment(vars: Vec<EnvVar>) -> Output<String> {
    let names: Vec<String> = vars.iter().map(|v| v.name.clone()).collect();
    let values: Vec<Output<String>> = vars.into_iter().map(|v| v.value).collect();
    Output::all(values).apply(move |resolved| {
        let entries: Vec<Value> = names
            .iter()
            .zip(resolved)
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        Value::Array(entries).to_string()
    })
}

fn render_secrets(mut entries: Vec<(String, Output<String>)>) -> Output<String> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let names: Vec<String> = entries.iter().map(|(n, _)| n.clone()).collect();
    let arns: Vec<Output<String>> = entries.into_iter().map(|(_, arn)| arn).collect();
    Output::all(arns).apply(move |resolved| {
        let items: Vec<Value> = names
            .iter()
            .zip(resolved)
            .map(|(name, arn)| json!({ "name": name, "valueFrom": arn }))
            .collect();
        Value::Array(items).to_string()
    })
}

/// A container field: a plain JSON value, a deferred string, or a deferred
/// pre-rendered JSON fragment that may resolve to absent.
#[derive(Debug, Clone)]
enum FieldValue {
    Literal(Value),
    Deferred(Output<String>),
    DeferredJson(Output<Option<String>>),
}

/// One container definition: a name plus ordered fields.
#[derive(Debug, Clone)]
pub struct ContainerDefinition {
    name: String,
    fields: Vec<(String, FieldValue)>,
}

impl ContainerDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, FieldValue::Literal(value.into()));
        self
    }

    pub fn set_deferred(mut self, key: &str, value: Output<String>) -> Self {
        self.insert(key, FieldValue::Deferred(value));
        self
    }

    pub fn set_deferred_json(mut self, key: &str, value: Output<Option<String>>) -> Self {
        self.insert(key, FieldValue::DeferredJson(value));
        self
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    fn insert(&mut self, key: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    /// Shallow merge: every field of `overrides` replaces the field of the
    /// same name, keeping this container's field order for existing keys.
    pub fn merge_from(&mut self, overrides: ContainerDefinition) {
        for (key, value) in overrides.fields {
            self.insert(&key, value);
        }
    }

    /// Fold the ordered fields into one JSON object string, `name` first,
    /// skipping fields that resolve to absent.
    pub fn render(&self) -> Output<String> {
        let mut parts: Vec<Output<Option<(String, String)>>> =
            Vec::with_capacity(self.fields.len() + 1);
        parts.push(Output::known(Some((
            "name".to_string(),
            Value::String(self.name.clone()).to_string(),
        ))));
        for (key, field) in &self.fields {
            let key = key.clone();
            let part = match field {
                FieldValue::Literal(value) => Output::known(Some((key, value.to_string()))),
                FieldValue::Deferred(output) => {
                    output.apply(move |text| Some((key, Value::String(text).to_string())))
                }
                FieldValue::DeferredJson(output) => {
                    output.apply(move |resolved| resolved.map(|text| (key, text)))
                }
            };
            parts.push(part);
        }
        Output::all(parts).apply(|fields| {
            let body = fields
                .into_iter()
                .flatten()
                .map(|(key, value)| format!("{}:{}", Value::String(key), value))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        })
    }
}

/// The complete container set for one task, in serialization order.
#[derive(Debug, Clone)]
pub struct ContainerSet {
    containers: Vec<ContainerDefinition>,
}

impl ContainerSet {
    fn new(containers: Vec<ContainerDefinition>) -> ProvisionResult<Self> {
        let mut seen = HashSet::new();
        for container in &containers {
            if !seen.insert(container.name.clone()) {
                return Err(ProvisionError::invariant(format!(
                    "container name `{}` is not unique within the task",
                    container.name
                )));
            }
        }
        Ok(Self { containers })
    }

    pub fn names(&self) -> Vec<&str> {
        self.containers.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Fold the containers into one JSON array string, in set order.
    pub fn render(&self) -> Output<String> {
        let rendered: Vec<Output<String>> = self.containers.iter().map(|c| c.render()).collect();
        Output::all(rendered).apply(|objects| format!("[{}]", objects.join(",")))
    }
}

/// Which tracing backend rides along with the task. Exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingBackend {
    Datadog,
    Collector,
}

/// Everything the composer needs for one task.
pub struct ComposeRequest<'a> {
    pub app: &'a ValidApp,
    pub registry_address: String,
    pub region: String,
    pub environment: String,
    /// Mesh listener this task's proxy joins. Required.
    pub virtual_node_arn: Output<String>,
    pub tracing: TracingBackend,
    /// Kind-specific overrides merged onto the application container.
    pub overrides: Option<ContainerDefinition>,
    /// Environment-variable name to provisioned secret ARN.
    pub secret_refs: Vec<(String, Output<String>)>,
    /// ARN of the vendor API key secret; required with the Datadog backend.
    pub datadog_api_key_arn: Option<Output<String>>,
    /// Computed variables from other provisioners (connection URLs etc.).
    pub extra_env: Vec<EnvVar>,
    /// Whether the vendor's log index already knows this service.
    pub log_ready: bool,
}

/// Compose the container set for one application task.
pub fn compose(request: ComposeRequest<'_>) -> ProvisionResult<ContainerSet> {
    let app = request.app;

    match request.tracing {
        TracingBackend::Datadog => {
            if app.datadog.is_none() || request.datadog_api_key_arn.is_none() {
                return Err(ProvisionError::invariant(
                    "datadog tracing sidecar requested without a datadog configuration",
                ));
            }
        }
        TracingBackend::Collector => {
            if app.datadog.is_some() {
                return Err(ProvisionError::invariant(
                    "datadog configuration present but the collector sidecar was requested",
                ));
            }
        }
    }

    let reserved = [
        LOG_ROUTER_CONTAINER,
        PROXY_CONTAINER,
        DATADOG_AGENT_CONTAINER,
        COLLECTOR_CONTAINER,
    ];
    if reserved.contains(&app.name.as_str()) {
        return Err(ProvisionError::validation(
            "name",
            format!("`{}` collides with a sidecar container name", app.name),
        ));
    }

    let mut application = application_container(&request)?;
    if let Some(overrides) = request.overrides.clone() {
        application.merge_from(overrides);
    }

    let mut containers = vec![application, log_router_container(), proxy_container(&request)];
    match request.tracing {
        TracingBackend::Datadog => containers.push(datadog_agent_container(&request)?),
        TracingBackend::Collector => containers.push(collector_container()),
    }

    ContainerSet::new(containers)
}

fn application_container(request: &ComposeRequest<'_>) -> ProvisionResult<ContainerDefinition> {
    let app = request.app;

    let mut launch_args = match &app.launch {
        Launch::Command(args) | Launch::EntryPoint(args) => args.clone(),
    };
    launch_args.push(format!("package.name={}", app.name));
    let launch_key = match &app.launch {
        Launch::Command(_) => "command",
        Launch::EntryPoint(_) => "entryPoint",
    };

    let mut defaults = vec![
        EnvVar::new("ENVIRONMENT", request.environment.as_str()),
        EnvVar::new("SERVICE_NAME", app.name.as_str()),
        EnvVar::new("SERVICE_VERSION", app.version.as_str()),
    ];
    match request.tracing {
        TracingBackend::Datadog => {
            defaults.push(EnvVar::new("DD_ENV", request.environment.as_str()));
            defaults.push(EnvVar::new("DD_SERVICE", app.name.as_str()));
            defaults.push(EnvVar::new("DD_VERSION", app.version.as_str()));
            defaults.push(EnvVar::new("DD_AGENT_HOST", "localhost"));
        }
        TracingBackend::Collector => {
            defaults.push(EnvVar::new("AWS_XRAY_DAEMON_ADDRESS", "localhost:2000"));
        }
    }
    let mut user_vars: Vec<EnvVar> = request.extra_env.clone();
    user_vars.extend(
        app.env_vars
            .iter()
            .map(|(name, value)| EnvVar::new(name.as_str(), value.as_str())),
    );
    let environment = dedupe_env(defaults, user_vars);

    let mut container = ContainerDefinition::new(&app.name)
        .set("image", format!("{}/{}", request.registry_address, app.image))
        .set("essential", true)
        .set("cpu", app.cpu)
        .set("memoryReservation", app.memory)
        .set(launch_key, json!(launch_args))
        .set_deferred_json(
            "environment",
            render_environment(environment).apply(Some),
        );

    if !request.secret_refs.is_empty() {
        container = container.set_deferred_json(
            "secrets",
            render_secrets(request.secret_refs.clone()).apply(Some),
        );
    }

    container = container.set_deferred_json("logConfiguration", log_configuration(request));

    if request.log_ready {
        container = container.set(
            "dockerLabels",
            json!({
                "com.datadoghq.ad.logs":
                    format!("[{{\"service\":\"{}\",\"source\":\"ecs\"}}]", app.name),
            }),
        );
    }

    container = container.set(
        "dependsOn",
        json!([
            { "containerName": LOG_ROUTER_CONTAINER, "condition": "HEALTHY" },
            { "containerName": PROXY_CONTAINER, "condition": "HEALTHY" },
        ]),
    );

    Ok(container)
}

fn log_configuration(request: &ComposeRequest<'_>) -> Output<Option<String>> {
    let app = request.app;
    match (&app.datadog, &request.datadog_api_key_arn) {
        (Some(datadog), Some(api_key_arn)) => {
            let host = datadog.log_intake_host();
            let service = app.name.clone();
            let tags = format!("env:{},version:{}", request.environment, app.version);
            api_key_arn.apply(move |arn| {
                Some(
                    json!({
                        "logDriver": "awsfirelens",
                        "options": {
                            "Name": "datadog",
                            "Host": host,
                            "TLS": "on",
                            "provider": "ecs",
                            "dd_service": service,
                            "dd_source": "ecs",
                            "dd_tags": tags,
                        },
                        "secretOptions": [{ "name": "apikey", "valueFrom": arn }],
                    })
                    .to_string(),
                )
            })
        }
        _ => Output::known(Some(
            json!({
                "logDriver": "awslogs",
                "options": {
                    "awslogs-group": app.name,
                    "awslogs-region": request.region,
                    "awslogs-stream-prefix": app.name,
                    "awslogs-create-group": "true",
                },
            })
            .to_string(),
        )),
    }
}

fn log_router_container() -> ContainerDefinition {
    ContainerDefinition::new(LOG_ROUTER_CONTAINER)
        .set("image", LOG_ROUTER_IMAGE)
        .set("essential", true)
        .set("memoryReservation", 64)
        .set(
            "firelensConfiguration",
            json!({ "type": "fluentbit", "options": { "enable-ecs-log-metadata": "true" } }),
        )
        .set(
            "healthCheck",
            json!({
                "command": [
                    "CMD-SHELL",
                    "echo '{\"health\": \"check\"}' | nc 127.0.0.1 8877 || exit 1",
                ],
                "interval": 5,
                "timeout": 2,
                "retries": 3,
                "startPeriod": 10,
            }),
        )
}

fn proxy_container(request: &ComposeRequest<'_>) -> ContainerDefinition {
    let mut vars = vec![
        EnvVar::new("APPMESH_RESOURCE_ARN", request.virtual_node_arn.clone()),
        EnvVar::new("LISTENER_DRAIN_WAIT_TIME_S", PROXY_DRAIN_TIME_S),
    ];
    match request.tracing {
        TracingBackend::Datadog => {
            vars.push(EnvVar::new("ENABLE_ENVOY_DATADOG_TRACING", "1"));
            vars.push(EnvVar::new(
                "DATADOG_TRACER_PORT",
                DATADOG_TRACE_PORT.to_string(),
            ));
        }
        TracingBackend::Collector => {
            vars.push(EnvVar::new("ENABLE_ENVOY_XRAY_TRACING", "1"));
        }
    }
    let environment = dedupe_env(vars, Vec::new());

    ContainerDefinition::new(PROXY_CONTAINER)
        .set("image", PROXY_IMAGE)
        .set("essential", true)
        .set("user", "1337")
        .set_deferred_json("environment", render_environment(environment).apply(Some))
        .set(
            "healthCheck",
            json!({
                "command": [
                    "CMD-SHELL",
                    "curl -s http://localhost:9901/server_info | grep state | grep -q LIVE",
                ],
                "interval": 5,
                "timeout": 2,
                "retries": 3,
                "startPeriod": 10,
            }),
        )
}

fn datadog_agent_container(
    request: &ComposeRequest<'_>,
) -> ProvisionResult<ContainerDefinition> {
    let datadog = request.app.datadog.as_ref().ok_or_else(|| {
        ProvisionError::invariant("datadog agent container requires a datadog configuration")
    })?;
    let api_key_arn = request.datadog_api_key_arn.clone().ok_or_else(|| {
        ProvisionError::invariant("datadog agent container requires the API key secret")
    })?;

    let environment = dedupe_env(
        vec![
            EnvVar::new("DD_APM_ENABLED", "true"),
            EnvVar::new("DD_APM_NON_LOCAL_TRAFFIC", "true"),
            EnvVar::new("DD_SITE", datadog.site.as_str()),
            EnvVar::new("ECS_FARGATE", "true"),
        ],
        Vec::new(),
    );

    Ok(ContainerDefinition::new(DATADOG_AGENT_CONTAINER)
        .set("image", DATADOG_AGENT_IMAGE)
        .set("essential", false)
        .set_deferred_json("environment", render_environment(environment).apply(Some))
        .set_deferred_json(
            "secrets",
            render_secrets(vec![("DD_API_KEY".to_string(), api_key_arn)]).apply(Some),
        )
        .set(
            "portMappings",
            json!([
                { "containerPort": DATADOG_TRACE_PORT, "protocol": "tcp" },
                { "containerPort": DATADOG_STATSD_PORT, "protocol": "udp" },
            ]),
        ))
}

fn collector_container() -> ContainerDefinition {
    ContainerDefinition::new(COLLECTOR_CONTAINER)
        .set("image", COLLECTOR_IMAGE)
        .set("essential", false)
        .set("command", json!(["--config=/etc/ecs/ecs-default-config.yaml"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn valid_app(datadog: bool) -> ValidApp {
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
            datadog: datadog.then(|| crate::config::DatadogConfig {
                api_key: "k".to_string(),
                site: "datadoghq.com".to_string(),
            }),
        }
        .validate()
        .unwrap()
    }

    fn request(app: &ValidApp) -> ComposeRequest<'_> {
        let tracing = if app.datadog.is_some() {
            TracingBackend::Datadog
        } else {
            TracingBackend::Collector
        };
        ComposeRequest {
            app,
            registry_address: "111111111111.dkr.ecr.us-east-1.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            environment: "dev".to_string(),
            virtual_node_arn: Output::known("arn:mesh/node".to_string()),
            tracing,
            overrides: None,
            secret_refs: Vec::new(),
            datadog_api_key_arn: app
                .datadog
                .as_ref()
                .map(|_| Output::known("arn:secret/dd".to_string())),
            extra_env: Vec::new(),
            log_ready: false,
        }
    }

    #[test]
    fn dedupe_is_last_write_wins_then_sorted() {
        let merged = dedupe_env(
            vec![
                EnvVar::new("SERVICE_NAME", "default"),
                EnvVar::new("B", "1"),
            ],
            vec![
                EnvVar::new("SERVICE_NAME", "user"),
                EnvVar::new("A", "2"),
            ],
        );
        let names: Vec<_> = merged.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "SERVICE_NAME"]);
        let winner = merged.iter().find(|v| v.name == "SERVICE_NAME").unwrap();
        assert_eq!(
            futures::executor::block_on(winner.value.resolve()).unwrap(),
            "user"
        );
    }

    #[tokio::test]
    async fn render_skips_absent_fields() {
        let container = ContainerDefinition::new("c")
            .set("essential", true)
            .set_deferred_json("secrets", Output::known(None));
        let rendered = container.render().resolve().await.unwrap();
        assert_eq!(rendered, "{\"name\":\"c\",\"essential\":true}");
    }

    #[tokio::test]
    async fn render_is_deterministic() {
        let app = valid_app(false);
        let first = compose(request(&app)).unwrap().render().resolve().await.unwrap();
        let second = compose(request(&app)).unwrap().render().resolve().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rendered_set_is_well_formed_json() {
        let app = valid_app(true);
        let rendered = compose(request(&app)).unwrap().render().resolve().await.unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        let array = parsed.as_array().unwrap();
        assert_eq!(array.len(), 4);
        for object in array {
            assert!(object.get("name").is_some());
        }
    }

    #[test]
    fn exactly_one_tracing_sidecar() {
        let with_datadog = valid_app(true);
        let names = compose(request(&with_datadog)).unwrap().names().join(",");
        assert!(names.contains(DATADOG_AGENT_CONTAINER));
        assert!(!names.contains(COLLECTOR_CONTAINER));

        let without = valid_app(false);
        let names = compose(request(&without)).unwrap().names().join(",");
        assert!(names.contains(COLLECTOR_CONTAINER));
        assert!(!names.contains(DATADOG_AGENT_CONTAINER));
    }

    #[test]
    fn datadog_sidecar_without_config_is_an_invariant_violation() {
        let app = valid_app(false);
        let mut req = request(&app);
        req.tracing = TracingBackend::Datadog;
        req.datadog_api_key_arn = Some(Output::known("arn".to_string()));
        let err = compose(req).unwrap_err();
        assert!(matches!(err, ProvisionError::InvariantViolation { .. }));
    }

    #[test]
    fn collector_with_datadog_config_is_an_invariant_violation() {
        let app = valid_app(true);
        let mut req = request(&app);
        req.tracing = TracingBackend::Collector;
        assert!(compose(req).is_err());
    }

    #[tokio::test]
    async fn overrides_win_on_field_collision() {
        let app = valid_app(false);
        let mut req = request(&app);
        req.overrides = Some(
            ContainerDefinition::new(&app.name)
                .set("portMappings", json!([{ "containerPort": 3000, "protocol": "tcp" }]))
                .set("cpu", 512),
        );
        let set = compose(req).unwrap();
        let rendered = set.render().resolve().await.unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        let application = &parsed[0];
        assert_eq!(application["cpu"], 512);
        assert_eq!(application["portMappings"][0]["containerPort"], 3000);
    }

    #[tokio::test]
    async fn launch_args_carry_package_name() {
        let app = valid_app(false);
        let rendered = compose(request(&app)).unwrap().render().resolve().await.unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        let command = parsed[0]["command"].as_array().unwrap();
        assert_eq!(command.last().unwrap(), "package.name=svc");
    }
}
