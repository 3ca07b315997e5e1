//! Per-run deployment context.
//!
//! Programs receive a [`DeploymentContext`] and declare resources against it.
//! There is no process-wide "current stack": everything a program touches is
//! reached through the context it was handed.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::StackConfig;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::output::Output;
use crate::resource::{Inputs, ResourceHandle, ResourceNode, ResourceOptions, SchemaRegistry};

/// Collects declarations for one project stack.
#[derive(Debug)]
pub struct DeploymentContext {
    project: String,
    stack: String,
    config: StackConfig,
    schemas: SchemaRegistry,
    graph: DependencyGraph,
    exports: BTreeMap<String, Output<Value>>,
}

/// A validated set of declarations, ready to plan.
#[derive(Debug)]
pub struct Deployment {
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Validated dependency graph.
    pub graph: DependencyGraph,
    /// Stack outputs, by export name.
    pub exports: BTreeMap<String, Output<Value>>,
}

impl DeploymentContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        stack: impl Into<String>,
        config: StackConfig,
        schemas: SchemaRegistry,
    ) -> Self {
        Self {
            project: project.into(),
            stack: stack.into(),
            config,
            schemas,
            graph: DependencyGraph::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Stack name.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Program configuration values.
    #[must_use]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Declares a resource.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown type, inputs the type does not accept,
    /// a duplicate logical name, or a reference to an undeclared resource.
    pub fn declare(
        &mut self,
        type_token: &str,
        name: &str,
        inputs: Inputs,
        options: ResourceOptions,
    ) -> Result<ResourceHandle> {
        let schema = self.schemas.get(type_token)?;
        let node = ResourceNode::new(name, schema, inputs, options)?;
        let handle = node.handle();
        self.graph.declare(node)?;
        Ok(handle)
    }

    /// Looks up a previously declared resource.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<ResourceHandle> {
        self.graph
            .index_of(name)
            .map(|index| self.graph.node(index).handle())
    }

    /// Publishes a stack output.
    pub fn export<T>(&mut self, name: impl Into<String>, value: &Output<T>)
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(export = %name, "Registered stack output");
        let json = value.try_apply(|v| serde_json::to_value(v).map_err(|e| e.to_string()));
        self.exports.insert(name, json);
    }

    /// Validates the graph and hands the declarations over for planning.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit dependency is unknown or the graph has
    /// a cycle.
    pub fn finish(mut self) -> Result<Deployment> {
        self.graph.validate()?;
        info!(
            project = %self.project,
            stack = %self.stack,
            resources = self.graph.len(),
            edges = self.graph.edge_count(),
            "Deployment graph validated"
        );
        Ok(Deployment {
            project: self.project,
            stack: self.stack,
            graph: self.graph,
            exports: self.exports,
        })
    }
}

impl Deployment {
    /// A deployment declaring nothing; planning it against a snapshot deletes
    /// every recorded resource.
    #[must_use]
    pub fn empty(project: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stack: stack.into(),
            graph: DependencyGraph::new(),
            exports: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::chain_registry;

    #[test]
    fn test_declare_and_finish() {
        let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), chain_registry());
        let registry = ctx
            .declare("test:Registry", "Registry", Inputs::new().set("name", "repo"), ResourceOptions::new())
            .expect("registry");
        ctx.declare(
            "test:Image",
            "Image",
            Inputs::new()
                .set("repository", registry.output("url").expect("url"))
                .set("context", "./app"),
            ResourceOptions::new(),
        )
        .expect("image");
        assert!(ctx.resource("Image").is_some());

        let deployment = ctx.finish().expect("valid");
        assert_eq!(deployment.graph.len(), 2);
        assert_eq!(deployment.graph.dependencies(1), vec![0]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), chain_registry());
        let err = ctx
            .declare("test:Nope", "x", Inputs::new(), ResourceOptions::new())
            .expect_err("unknown type");
        assert!(err.is_structural());
    }

    #[test]
    fn test_missing_required_config_fails_before_declaring() {
        let ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), chain_registry());
        assert!(ctx.config().require("message").is_err());
    }

    #[test]
    fn test_export_of_literal_output() {
        let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), chain_registry());
        ctx.export("answer", &Output::known(42_u32));
        let deployment = ctx.finish().expect("valid");
        assert_eq!(deployment.exports["answer"].peek(), Some(Ok(serde_json::json!(42))));
    }
}
