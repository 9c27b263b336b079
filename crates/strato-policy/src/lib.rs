//! IAM policy documents and attachments
//!
//! Builds access-policy JSON through the deferred-value substrate, since
//! statement resources are usually attributes of resources that do not exist
//! yet. Rendering is deterministic: statements keep declaration order and the
//! serializer emits keys in a stable order, so an unchanged policy never
//! shows up as a plan diff.

use serde_json::{json, Map, Value};
use strato_core::{Inputs, Output, ProvisionResult, ResourceHandle, Stack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "Allow",
            Effect::Deny => "Deny",
        }
    }
}

/// Statement principal: anyone, a service, or a set of account/role ARNs.
#[derive(Debug, Clone)]
pub enum Principal {
    Any,
    Service(String),
    Aws(Vec<Output<String>>),
}

/// One policy statement. Resources may be deferred values.
#[derive(Debug, Clone)]
pub struct PolicyStatement {
    sid: Option<String>,
    effect: Effect,
    actions: Vec<String>,
    resources: Vec<Output<String>>,
    principal: Option<Principal>,
    condition: Option<Value>,
}

impl PolicyStatement {
    pub fn allow() -> Self {
        Self::with_effect(Effect::Allow)
    }

    pub fn deny() -> Self {
        Self::with_effect(Effect::Deny)
    }

    fn with_effect(effect: Effect) -> Self {
        Self {
            sid: None,
            effect,
            actions: Vec::new(),
            resources: Vec::new(),
            principal: None,
            condition: None,
        }
    }

    pub fn sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.extend(actions.into_iter().map(Into::into));
        self
    }

    pub fn resource(mut self, resource: impl Into<Output<String>>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn service_principal(mut self, service: impl Into<String>) -> Self {
        self.principal = Some(Principal::Service(service.into()));
        self
    }

    pub fn aws_principals(mut self, arns: Vec<Output<String>>) -> Self {
        self.principal = Some(Principal::Aws(arns));
        self
    }

    pub fn any_principal(mut self) -> Self {
        self.principal = Some(Principal::Any);
        self
    }

    pub fn condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    fn render(&self) -> Output<Value> {
        let sid = self.sid.clone();
        let effect = self.effect;
        let actions = self.actions.clone();
        let condition = self.condition.clone();
        let any_principal = matches!(self.principal, Some(Principal::Any));
        let service_principal = match &self.principal {
            Some(Principal::Service(service)) => Some(service.clone()),
            _ => None,
        };
        let principal_arns = match &self.principal {
            Some(Principal::Aws(arns)) => Output::all(arns.clone()),
            _ => Output::known(Vec::new()),
        };
        Output::all(self.resources.clone()).zip(&principal_arns).apply(
            move |(resources, arns)| {
                let mut statement = Map::new();
                if let Some(sid) = sid {
                    statement.insert("Sid".to_string(), json!(sid));
                }
                statement.insert("Effect".to_string(), json!(effect.as_str()));
                if any_principal {
                    statement.insert("Principal".to_string(), json!("*"));
                } else if let Some(service) = service_principal {
                    statement.insert("Principal".to_string(), json!({ "Service": service }));
                } else if !arns.is_empty() {
                    statement.insert("Principal".to_string(), json!({ "AWS": arns }));
                }
                statement.insert("Action".to_string(), json!(actions));
                if !resources.is_empty() {
                    statement.insert("Resource".to_string(), json!(resources));
                }
                if let Some(condition) = condition {
                    statement.insert("Condition".to_string(), condition);
                }
                Value::Object(statement)
            },
        )
    }
}

/// Ordered access-policy document.
#[derive(Debug, Clone, Default)]
pub struct PolicyDocument {
    statements: Vec<PolicyStatement>,
}

impl PolicyDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Render the document to its JSON wire form once every deferred
    /// resource reference has resolved.
    pub fn render(&self) -> Output<String> {
        let rendered: Vec<Output<Value>> = self.statements.iter().map(|s| s.render()).collect();
        Output::all(rendered).apply(|statements| {
            json!({
                "Version": "2012-10-17",
                "Statement": statements,
            })
            .to_string()
        })
    }
}

/// Trust policy allowing a service to assume a role.
pub fn assume_role_policy(service: &str) -> PolicyDocument {
    PolicyDocument::new().statement(
        PolicyStatement::allow()
            .service_principal(service)
            .action("sts:AssumeRole"),
    )
}

/// Attach an inline policy to a role.
pub fn attach_role_policy(
    stack: &Stack,
    name: &str,
    role: &ResourceHandle,
    document: &PolicyDocument,
) -> ProvisionResult<ResourceHandle> {
    stack.declare_with_deps(
        "cloud:iam/rolePolicy",
        name,
        Inputs::new()
            .set_output("role", role.attr("id"))
            .set_output("policy", document.render()),
        &[role],
    )
}

/// Attach an inline policy to a user.
pub fn attach_user_policy(
    stack: &Stack,
    name: &str,
    user_name: &str,
    document: &PolicyDocument,
) -> ProvisionResult<ResourceHandle> {
    stack.declare(
        "cloud:iam/userPolicy",
        name,
        Inputs::new()
            .set("user", user_name)
            .set_output("policy", document.render()),
    )
}

/// Attach a resource policy to a bucket.
pub fn attach_bucket_policy(
    stack: &Stack,
    name: &str,
    bucket: &ResourceHandle,
    document: &PolicyDocument,
) -> ProvisionResult<ResourceHandle> {
    stack.declare_with_deps(
        "cloud:storage/bucketPolicy",
        name,
        Inputs::new()
            .set_output("bucket", bucket.attr("bucket"))
            .set_output("policy", document.render()),
        &[bucket],
    )
}

/// Grant an external principal permission to invoke a function.
pub fn add_function_permission(
    stack: &Stack,
    name: &str,
    function_arn: Output<String>,
    principal: &str,
    source_arn: Option<Output<String>>,
) -> ProvisionResult<ResourceHandle> {
    let mut inputs = Inputs::new()
        .set_output("function", function_arn)
        .set("action", "lambda:InvokeFunction")
        .set("principal", principal);
    if let Some(source) = source_arn {
        inputs = inputs.set_output("sourceArn", source);
    }
    stack.declare("cloud:functions/permission", name, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
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

    #[tokio::test]
    async fn renders_deterministic_json() {
        let document = PolicyDocument::new().statement(
            PolicyStatement::allow()
                .actions(["s3:GetObject", "s3:PutObject"])
                .resource("arn:aws:s3:::my-bucket/*"),
        );
        let first = document.render().resolve().await.unwrap();
        let second = document.render().resolve().await.unwrap();
        assert_eq!(first, second);
        let parsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["Version"], "2012-10-17");
        assert_eq!(parsed["Statement"][0]["Effect"], "Allow");
    }

    #[tokio::test]
    async fn deferred_resources_appear_resolved() {
        let stack = test_stack();
        let bucket = stack
            .declare("cloud:storage/bucket", "assets", Inputs::new())
            .unwrap();
        let document = PolicyDocument::new().statement(
            PolicyStatement::allow()
                .action("s3:GetObject")
                .resource(Output::format("{}/*", vec![bucket.attr("arn")])),
        );
        let rendered = document.render().resolve().await.unwrap();
        assert!(rendered.contains("${cloud:storage/bucket::assets#arn}/*"));
    }

    #[tokio::test]
    async fn assume_role_policy_names_the_service() {
        let rendered = assume_role_policy("ecs-tasks.amazonaws.com")
            .render()
            .resolve()
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(
            parsed["Statement"][0]["Principal"]["Service"],
            "ecs-tasks.amazonaws.com"
        );
        assert_eq!(parsed["Statement"][0]["Action"][0], "sts:AssumeRole");
    }

    #[test]
    fn attachments_declare_engine_resources() {
        let stack = test_stack();
        let role = stack.declare("cloud:iam/role", "task-role", Inputs::new()).unwrap();
        let document = PolicyDocument::new()
            .statement(PolicyStatement::allow().action("logs:PutLogEvents").resource("*"));
        attach_role_policy(&stack, "task-role-policy", &role, &document).unwrap();
        let declared = stack.declaration("task-role-policy").unwrap();
        assert_eq!(declared.type_token, "cloud:iam/rolePolicy");
        assert_eq!(declared.depends_on, vec!["task-role".to_string()]);
    }
}
