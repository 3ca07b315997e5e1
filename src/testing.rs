//! Fixtures shared by unit tests.

use std::sync::Arc;

use serde_json::json;

use crate::config::StackConfig;
use crate::context::{Deployment, DeploymentContext};
use crate::graph::DependencyGraph;
use crate::resource::{
    FieldSpec, Input, Inputs, ResourceHandle, ResourceNode, ResourceOptions, ResourceSchema,
    SchemaRegistry,
};

/// A schema with one optional free-form input per dependency slot.
pub fn thing_schema() -> Arc<ResourceSchema> {
    Arc::new(
        ResourceSchema::managed("test:Thing")
            .input(FieldSpec::optional("label"))
            .input(FieldSpec::optional("after"))
            .input(FieldSpec::optional("name").force_new())
            .outputs(&["value"]),
    )
}

/// Declares a `test:Thing` consuming the `value` output of every resource in `after`.
pub fn declare_thing(graph: &mut DependencyGraph, name: &str, after: &[&str]) -> ResourceHandle {
    let refs: Vec<Input> = after
        .iter()
        .map(|dep| {
            let index = graph.index_of(dep).expect("dependency declared");
            Input::from(graph.node(index).outputs["value"].clone())
        })
        .collect();
    let mut inputs = Inputs::new().set("label", name);
    if !refs.is_empty() {
        inputs = inputs.set("after", Input::Array(refs));
    }
    let node = ResourceNode::new(name, thing_schema(), inputs, ResourceOptions::new())
        .expect("valid node");
    let handle = node.handle();
    graph.declare(node).expect("declared");
    handle
}

/// Schemas for the registry, image and service chain.
pub fn chain_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(
        ResourceSchema::managed("test:Registry")
            .input(FieldSpec::required("name").force_new())
            .outputs(&["url"]),
    );
    registry.register(
        ResourceSchema::managed("test:Image")
            .input(FieldSpec::required("repository"))
            .input(FieldSpec::required("context"))
            .input(FieldSpec::optional("tag"))
            .outputs(&["imageName"]),
    );
    registry.register(
        ResourceSchema::managed("test:Service")
            .input(FieldSpec::required("image"))
            .outputs(&["endpoint"]),
    );
    registry
}

/// Builds the `Registry -> Image -> Service` deployment.
pub fn chain_deployment(build_context: &str) -> Deployment {
    let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), chain_registry());
    let registry = ctx
        .declare("test:Registry", "Registry", Inputs::new().set("name", "repo"), ResourceOptions::new())
        .expect("registry");
    let image = ctx
        .declare(
            "test:Image",
            "Image",
            Inputs::new()
                .set("repository", registry.output("url").expect("url"))
                .set("context", build_context)
                .set("tag", "tag"),
            ResourceOptions::new(),
        )
        .expect("image");
    let service = ctx
        .declare(
            "test:Service",
            "Service",
            Inputs::new().set("image", image.output("imageName").expect("imageName")),
            ResourceOptions::new(),
        )
        .expect("service");
    ctx.export("endpoint", &service.output("endpoint").expect("endpoint"));
    ctx.finish().expect("valid deployment")
}

/// Provider outputs used by the chain scenario.
pub fn chain_outputs(type_token: &str, inputs: &serde_json::Map<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    let mut outputs = serde_json::Map::new();
    match type_token {
        "test:Registry" => {
            outputs.insert("url".into(), json!("acct.dkr/repo"));
        }
        "test:Image" => {
            let repo = inputs["repository"].as_str().unwrap_or_default();
            let tag = inputs["tag"].as_str().unwrap_or("latest");
            outputs.insert("imageName".into(), json!(format!("{repo}:{tag}")));
        }
        "test:Service" => {
            outputs.insert("endpoint".into(), json!("http://svc.local"));
        }
        _ => {}
    }
    outputs
}
