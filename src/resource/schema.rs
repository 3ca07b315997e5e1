//! Resource type schemas.
//!
//! A schema fixes the set of inputs a resource type accepts, which of them
//! force a replacement when changed, and which outputs it produces. Inputs
//! that a schema does not name are rejected when the resource is declared.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Name of the implicit provider-assigned identifier output.
pub const ID_OUTPUT: &str = "id";

/// Whether a resource is owned by the deployment or only looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Created, updated and deleted by the deployment.
    Managed,
    /// Read from the provider on every run, never created or deleted.
    DataSource,
}

/// Ordering of the two halves of a replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// Create the new instance, then delete the old one.
    #[default]
    CreateBeforeDelete,
    /// Delete the old instance first (for names that must stay unique).
    DeleteBeforeCreate,
}

/// Description of one input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Whether the field must be supplied.
    pub required: bool,
    /// Whether changing the field forces a replacement.
    pub force_new: bool,
}

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Type token, e.g. `aws:ecr/Repository`.
    pub type_token: String,
    /// Managed resource or data source.
    pub class: ResourceClass,
    /// Accepted inputs.
    pub inputs: Vec<FieldSpec>,
    /// Produced outputs (excluding the implicit `id` of managed resources).
    pub outputs: Vec<String>,
    /// Default replacement ordering.
    pub replace_order: ReplaceOrder,
}

/// Registry of known resource types.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<ResourceSchema>>,
}

impl FieldSpec {
    /// A required input.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            force_new: false,
        }
    }

    /// An optional input.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            force_new: false,
        }
    }

    /// Marks the field as forcing a replacement when it changes.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }
}

impl ResourceSchema {
    /// Starts a schema for a managed resource type.
    #[must_use]
    pub fn managed(type_token: impl Into<String>) -> Self {
        Self {
            type_token: type_token.into(),
            class: ResourceClass::Managed,
            inputs: Vec::new(),
            outputs: Vec::new(),
            replace_order: ReplaceOrder::default(),
        }
    }

    /// Starts a schema for a data source.
    #[must_use]
    pub fn data_source(type_token: impl Into<String>) -> Self {
        Self {
            class: ResourceClass::DataSource,
            ..Self::managed(type_token)
        }
    }

    /// Adds an input field.
    #[must_use]
    pub fn input(mut self, field: FieldSpec) -> Self {
        self.inputs.push(field);
        self
    }

    /// Adds output fields.
    #[must_use]
    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.outputs.extend(names.iter().map(|n| (*n).to_string()));
        self
    }

    /// Sets the default replacement ordering.
    #[must_use]
    pub const fn replace_order(mut self, order: ReplaceOrder) -> Self {
        self.replace_order = order;
        self
    }

    /// Looks up an input field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.inputs.iter().find(|f| f.name == name)
    }

    /// Returns true if changing `name` forces a replacement.
    #[must_use]
    pub fn is_force_new(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.force_new)
    }

    /// Returns true for data sources.
    #[must_use]
    pub fn is_data_source(&self) -> bool {
        self.class == ResourceClass::DataSource
    }

    /// Every output name the resource exposes, including the implicit `id`.
    #[must_use]
    pub fn output_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.outputs.iter().map(String::as_str).collect();
        if self.class == ResourceClass::Managed && !names.contains(&ID_OUTPUT) {
            names.insert(0, ID_OUTPUT);
        }
        names
    }
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry preloaded with the container-service catalog.
    #[must_use]
    pub fn aws() -> Self {
        let mut registry = Self::new();
        for schema in aws_catalog() {
            registry.register(schema);
        }
        registry
    }

    /// Registers (or replaces) a schema.
    pub fn register(&mut self, schema: ResourceSchema) {
        self.schemas
            .insert(schema.type_token.clone(), Arc::new(schema));
    }

    /// Looks up a schema by type token.
    ///
    /// # Errors
    ///
    /// Returns an error if the type is unknown.
    pub fn get(&self, type_token: &str) -> Result<Arc<ResourceSchema>> {
        self.schemas.get(type_token).cloned().ok_or_else(|| {
            ConfigError::UnknownResourceType {
                type_token: type_token.to_string(),
            }
            .into()
        })
    }

    /// Number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no schema is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Resource types used by a load-balanced container service deployment.
fn aws_catalog() -> Vec<ResourceSchema> {
    vec![
        ResourceSchema::managed("aws:ecr/Repository")
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("imageTagMutability"))
            .input(FieldSpec::optional("forceDelete"))
            .outputs(&["arn", "name", "registryId", "repositoryUrl"]),
        ResourceSchema::data_source("aws:ecr/getAuthorizationToken")
            .input(FieldSpec::optional("registryId"))
            .outputs(&["userName", "password", "proxyEndpoint"]),
        ResourceSchema::managed("docker:Image")
            .input(FieldSpec::required("imageName"))
            .input(FieldSpec::required("build"))
            .input(FieldSpec::optional("registry"))
            .input(FieldSpec::optional("skipPush"))
            .outputs(&["imageName", "repoDigest", "baseImageName"]),
        ResourceSchema::data_source("aws:ec2/getVpc")
            .input(FieldSpec::optional("default"))
            .input(FieldSpec::optional("id"))
            .input(FieldSpec::optional("tags"))
            .outputs(&["id", "arn", "cidrBlock"]),
        ResourceSchema::data_source("aws:ec2/getSubnetIds")
            .input(FieldSpec::required("vpcId"))
            .outputs(&["ids"]),
        ResourceSchema::managed("aws:ec2/SecurityGroup")
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("vpcId").force_new())
            .input(FieldSpec::optional("description").force_new())
            .input(FieldSpec::optional("ingress"))
            .input(FieldSpec::optional("egress"))
            .input(FieldSpec::optional("tags"))
            .outputs(&["arn", "name"]),
        ResourceSchema::managed("aws:ecs/Cluster")
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("settings"))
            .input(FieldSpec::optional("tags"))
            .outputs(&["arn", "name"]),
        ResourceSchema::managed("aws:iam/Role")
            .input(FieldSpec::required("assumeRolePolicy"))
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("description"))
            .outputs(&["arn", "name", "uniqueId"]),
        ResourceSchema::managed("aws:cloudwatch/LogGroup")
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("retentionInDays"))
            .outputs(&["arn", "name"]),
        ResourceSchema::managed("aws:ecs/TaskDefinition")
            .input(FieldSpec::required("family").force_new())
            .input(FieldSpec::required("containerDefinitions").force_new())
            .input(FieldSpec::optional("cpu").force_new())
            .input(FieldSpec::optional("memory").force_new())
            .input(FieldSpec::optional("networkMode").force_new())
            .input(FieldSpec::optional("requiresCompatibilities").force_new())
            .input(FieldSpec::optional("executionRoleArn").force_new())
            .input(FieldSpec::optional("taskRoleArn").force_new())
            .outputs(&["arn", "arnWithoutRevision", "family", "revision"]),
        ResourceSchema::managed("aws:iam/RolePolicyAttachment")
            .input(FieldSpec::required("role").force_new())
            .input(FieldSpec::required("policyArn").force_new())
            .replace_order(ReplaceOrder::DeleteBeforeCreate),
        ResourceSchema::managed("aws:lb/LoadBalancer")
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("loadBalancerType").force_new())
            .input(FieldSpec::optional("internal").force_new())
            .input(FieldSpec::optional("securityGroups"))
            .input(FieldSpec::optional("subnets"))
            .outputs(&["arn", "dnsName", "zoneId"]),
        ResourceSchema::managed("aws:lb/TargetGroup")
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("port").force_new())
            .input(FieldSpec::optional("protocol").force_new())
            .input(FieldSpec::optional("targetType").force_new())
            .input(FieldSpec::optional("vpcId").force_new())
            .input(FieldSpec::optional("healthCheck"))
            .outputs(&["arn", "name"]),
        ResourceSchema::managed("aws:lb/Listener")
            .input(FieldSpec::required("loadBalancerArn").force_new())
            .input(FieldSpec::required("defaultActions"))
            .input(FieldSpec::optional("port"))
            .input(FieldSpec::optional("protocol"))
            .outputs(&["arn"]),
        ResourceSchema::managed("aws:ecs/Service")
            .input(FieldSpec::required("cluster").force_new())
            .input(FieldSpec::required("taskDefinition"))
            .input(FieldSpec::optional("name").force_new())
            .input(FieldSpec::optional("desiredCount"))
            .input(FieldSpec::optional("launchType").force_new())
            .input(FieldSpec::optional("networkConfiguration"))
            .input(FieldSpec::optional("loadBalancers").force_new())
            .outputs(&["name"]),
    ]
}
