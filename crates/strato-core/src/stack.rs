//! Declaration facade over the orchestration engine SDK
//!
//! The engine itself (desired-state diffing, dependency-ordered execution,
//! provider plugins) is external. [`Stack`] is the surface this library
//! programs against: it records typed resource declarations in order and
//! hands back [`ResourceHandle`]s whose attributes are deferred values. An
//! attribute resolves to a symbolic reference token the engine substitutes
//! with the live value at apply time, which keeps every derived string
//! deterministic between runs.

use crate::error::{ProvisionError, ProvisionResult};
use crate::output::Output;
use crate::settings::{Environment, ProviderSettings};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// One declared resource, in declaration order.
#[derive(Debug, Clone)]
pub struct ResourceDeclaration {
    pub type_token: String,
    pub name: String,
    pub physical_name: String,
    pub inputs: Inputs,
    pub depends_on: Vec<String>,
}

/// Ordered input fields for a resource declaration.
///
/// Insertion order is preserved; the engine treats inputs as data to diff, so
/// reordering identical fields would show up as plan churn.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    fields: Vec<(String, Input)>,
}

/// A resource input: either a plain JSON value or deferred strings resolved
/// once an upstream resource exists.
#[derive(Debug, Clone)]
pub enum Input {
    Value(Value),
    Deferred(Output<String>),
    DeferredList(Vec<Output<String>>),
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.push((key.to_string(), Input::Value(value.into())));
        self
    }

    pub fn set_output(mut self, key: &str, value: Output<String>) -> Self {
        self.fields.push((key.to_string(), Input::Deferred(value)));
        self
    }

    pub fn set_outputs(mut self, key: &str, values: Vec<Output<String>>) -> Self {
        self.fields.push((key.to_string(), Input::DeferredList(values)));
        self
    }

    /// Set the field only when a value is present. Absent fields are omitted
    /// from the declaration entirely, never emitted as null.
    pub fn set_opt(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    pub fn fields(&self) -> &[(String, Input)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Input> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Handle to a declared resource. Attributes are deferred values.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    type_token: String,
    name: String,
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_token(&self) -> &str {
        &self.type_token
    }

    /// Deferred attribute of this resource. Resolves to a symbolic reference
    /// token (`${type::name#attr}`) substituted by the engine at apply time.
    pub fn attr(&self, attribute: &str) -> Output<String> {
        Output::known(format!(
            "${{{}::{}#{}}}",
            self.type_token, self.name, attribute
        ))
    }
}

/// One provisioning pass: the ordered desired-state document handed to the
/// orchestration engine.
#[derive(Debug)]
pub struct Stack {
    project: String,
    environment: Environment,
    provider: ProviderSettings,
    declarations: Mutex<Vec<ResourceDeclaration>>,
    names: Mutex<HashSet<String>>,
    exports: Mutex<Vec<(String, Output<String>)>>,
}

impl Stack {
    pub fn new(
        project: impl Into<String>,
        environment: Environment,
        provider: ProviderSettings,
    ) -> ProvisionResult<Self> {
        provider.validate()?;
        let project = project.into();
        if project.is_empty() {
            return Err(ProvisionError::validation("project", "project must not be empty"));
        }
        Ok(Self {
            project,
            environment,
            provider,
            declarations: Mutex::new(Vec::new()),
            names: Mutex::new(HashSet::new()),
            exports: Mutex::new(Vec::new()),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn provider(&self) -> &ProviderSettings {
        &self.provider
    }

    pub fn region(&self) -> &str {
        &self.provider.region
    }

    /// DNS-safe physical name for a logical resource name.
    pub fn physical_name(&self, logical: &str) -> String {
        format!(
            "{}-{}-{}",
            self.project,
            self.environment.as_str(),
            slug::slugify(logical)
        )
    }

    /// Declare a resource. Logical names are unique within one stack.
    pub fn declare(
        &self,
        type_token: &str,
        name: &str,
        inputs: Inputs,
    ) -> ProvisionResult<ResourceHandle> {
        self.declare_with_deps(type_token, name, inputs, &[])
    }

    /// Declare a resource with explicit dependencies, for edges the engine
    /// cannot infer from attribute references.
    pub fn declare_with_deps(
        &self,
        type_token: &str,
        name: &str,
        inputs: Inputs,
        depends_on: &[&ResourceHandle],
    ) -> ProvisionResult<ResourceHandle> {
        {
            let mut names = self.names.lock();
            if !names.insert(name.to_string()) {
                return Err(ProvisionError::DuplicateResource {
                    name: name.to_string(),
                });
            }
        }
        debug!(resource = type_token, name, "declaring resource");
        self.declarations.lock().push(ResourceDeclaration {
            type_token: type_token.to_string(),
            name: name.to_string(),
            physical_name: self.physical_name(name),
            inputs,
            depends_on: depends_on.iter().map(|h| h.name.clone()).collect(),
        });
        Ok(ResourceHandle {
            type_token: type_token.to_string(),
            name: name.to_string(),
        })
    }

    /// Export a stack output.
    pub fn export(&self, name: &str, value: Output<String>) {
        self.exports.lock().push((name.to_string(), value));
    }

    /// Snapshot of the declarations recorded so far, in declaration order.
    pub fn declarations(&self) -> Vec<ResourceDeclaration> {
        self.declarations.lock().clone()
    }

    /// Find a declaration by logical name.
    pub fn declaration(&self, name: &str) -> Option<ResourceDeclaration> {
        self.declarations
            .lock()
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn exports(&self) -> Vec<(String, Output<String>)> {
        self.exports.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stack() -> Stack {
        Stack::new(
            "orders",
            Environment::Staging,
            ProviderSettings {
                region: "us-east-1".to_string(),
                account_id: "111111111111".to_string(),
                allowed_accounts: vec![],
                registry_address: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn declarations_keep_order() {
        let stack = test_stack();
        stack
            .declare("cloud:network/vpc", "main", Inputs::new().set("cidrBlock", "10.0.0.0/16"))
            .unwrap();
        stack
            .declare("cloud:network/subnet", "private-a", Inputs::new())
            .unwrap();
        let declared = stack.declarations();
        assert_eq!(declared.len(), 2);
        assert_eq!(declared[0].name, "main");
        assert_eq!(declared[1].name, "private-a");
    }

    #[test]
    fn duplicate_logical_names_fail() {
        let stack = test_stack();
        stack.declare("cloud:network/vpc", "main", Inputs::new()).unwrap();
        let err = stack.declare("cloud:network/vpc", "main", Inputs::new()).unwrap_err();
        assert!(matches!(err, ProvisionError::DuplicateResource { .. }));
    }

    #[test]
    fn physical_names_carry_project_and_environment() {
        let stack = test_stack();
        assert_eq!(stack.physical_name("Cache Cluster"), "orders-staging-cache-cluster");
    }

    #[tokio::test]
    async fn attributes_resolve_to_stable_reference_tokens() {
        let stack = test_stack();
        let vpc = stack.declare("cloud:network/vpc", "main", Inputs::new()).unwrap();
        let first = vpc.attr("id").resolve().await.unwrap();
        let second = vpc.attr("id").resolve().await.unwrap();
        assert_eq!(first, "${cloud:network/vpc::main#id}");
        assert_eq!(first, second);
    }

    #[test]
    fn absent_optional_inputs_are_omitted() {
        let inputs = Inputs::new()
            .set("name", "x")
            .set_opt("description", None::<&str>);
        assert_eq!(inputs.fields().len(), 1);
    }
}
