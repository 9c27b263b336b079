//! Application provisioners
//!
//! This crate composes the per-task container set (application container
//! plus logging, proxy and tracing sidecars) and provisions the HTTP, gRPC
//! and worker deployment patterns on the managed cluster-and-mesh platform.

pub mod config;
pub mod containers;
pub mod datadog;
pub mod service;

pub use config::{AppConfig, DatadogConfig, Launch, PolicyGrant, SecretMapping, ValidApp};
pub use containers::{
    compose, dedupe_env, ComposeRequest, ContainerDefinition, ContainerSet, EnvVar,
    TracingBackend, COLLECTOR_CONTAINER, DATADOG_AGENT_CONTAINER, LOG_ROUTER_CONTAINER,
    PROXY_CONTAINER,
};
pub use datadog::{fetch_log_ready_services, DatadogClient, LogIndexClient};
pub use service::{
    AppService, GrpcConfig, GrpcServiceDetails, HttpConfig, HttpServiceDetails, ServiceDetails,
    ServiceKind, WorkerServiceDetails,
};
