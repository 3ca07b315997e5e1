//! Declared resources and their inputs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ConfigError, GraphError, Result};
use crate::output::{Output, OutputFailure, OutputRef};

use super::schema::{ReplaceOrder, ResourceSchema};

/// Property bag exchanged with providers.
pub type PropertyMap = Map<String, Value>;

/// Key marking an output reference inside a declared-input template.
pub const REF_MARKER: &str = "$ref";

/// Key carrying an output's attached keys inside a declared-input template.
pub const KEY_MARKER: &str = "$key";

/// A desired input value: literal, lazily resolved, or a structure mixing both.
#[derive(Debug, Clone)]
pub enum Input {
    /// A value known at declaration time.
    Literal(Value),
    /// A value produced by another resource.
    Output(Output<Value>),
    /// An object whose members may themselves be outputs.
    Object(Vec<(String, Input)>),
    /// An array whose elements may themselves be outputs.
    Array(Vec<Input>),
}

/// Why an input could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    /// At least one referenced output is not settled yet.
    Pending(Vec<OutputRef>),
    /// A referenced output failed.
    Failed(OutputFailure),
}

/// Builder for a resource's inputs.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    entries: BTreeMap<String, Input>,
}

/// Per-resource options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceOptions {
    /// Extra dependencies by logical name. May name resources declared later.
    pub depends_on: Vec<String>,
    /// Overrides the schema's replacement ordering.
    pub replace_order: Option<ReplaceOrder>,
    /// Refuse to delete or replace this resource.
    pub protect: bool,
}

/// A declared infrastructure object.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Logical name, unique within the graph.
    pub name: String,
    /// Resource type description.
    pub schema: Arc<ResourceSchema>,
    /// Desired inputs.
    pub inputs: BTreeMap<String, Input>,
    /// Cells this node resolves once its provider call returns.
    pub outputs: BTreeMap<String, Output<Value>>,
    /// Options.
    pub options: ResourceOptions,
}

/// Handle returned to programs after declaring a resource.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    name: String,
    outputs: BTreeMap<String, Output<Value>>,
}

impl Input {
    /// Builds an object input from `(key, input)` pairs.
    #[must_use]
    pub fn object<K, I>(entries: impl IntoIterator<Item = (K, I)>) -> Self
    where
        K: Into<String>,
        I: Into<Self>,
    {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds an array input.
    #[must_use]
    pub fn array<I: Into<Self>>(items: impl IntoIterator<Item = I>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }

    /// Every output this input refers to.
    #[must_use]
    pub fn refs(&self) -> BTreeSet<OutputRef> {
        let mut refs = BTreeSet::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs(&self, refs: &mut BTreeSet<OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Output(output) => refs.extend(output.refs().iter().cloned()),
            Self::Object(entries) => entries.iter().for_each(|(_, v)| v.collect_refs(refs)),
            Self::Array(items) => items.iter().for_each(|v| v.collect_refs(refs)),
        }
    }

    /// The declared form of the input, used for diffing.
    ///
    /// Literals, and outputs already known without any reference, appear as
    /// themselves. Other outputs appear as `{"$ref": ["resource.field", ...]}`
    /// plus `"$key": [...]` when the output was [keyed](Output::keyed), so the
    /// template changes when a literal, a key or the set of references changes.
    #[must_use]
    pub fn declared(&self) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Output(output) => {
                if output.refs().is_empty() {
                    if let Some(Ok(value)) = output.peek() {
                        return value;
                    }
                }
                let refs: Vec<Value> = output
                    .refs()
                    .iter()
                    .map(|r| Value::String(r.to_string()))
                    .collect();
                let mut marker = Map::new();
                marker.insert(REF_MARKER.to_string(), Value::Array(refs));
                if !output.keys().is_empty() {
                    marker.insert(KEY_MARKER.to_string(), Value::Array(output.keys().to_vec()));
                }
                Value::Object(marker)
            }
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.declared()))
                    .collect(),
            ),
            Self::Array(items) => Value::Array(items.iter().map(Self::declared).collect()),
        }
    }

    /// Resolves the input from already-settled outputs, without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Unresolved::Failed`] for the first failed output, or
    /// [`Unresolved::Pending`] listing outputs that have not settled.
    pub fn resolve_now(&self) -> std::result::Result<Value, Unresolved> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Output(output) => match output.peek() {
                Some(Ok(value)) => Ok(value),
                Some(Err(failure)) => Err(Unresolved::Failed(failure)),
                None => Err(Unresolved::Pending(output.refs().iter().cloned().collect())),
            },
            Self::Object(entries) => {
                let mut object = Map::new();
                for (key, input) in entries {
                    object.insert(key.clone(), input.resolve_now()?);
                }
                Ok(Value::Object(object))
            }
            Self::Array(items) => items
                .iter()
                .map(Self::resolve_now)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Literal(Value::String(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Self::Literal(Value::Bool(value))
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<u16> for Input {
    fn from(value: u16) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<u32> for Input {
    fn from(value: u32) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl<T> From<Output<T>> for Input
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn from(output: Output<T>) -> Self {
        Self::Output(output.try_apply(|v| serde_json::to_value(v).map_err(|e| e.to_string())))
    }
}

impl<T> From<&Output<T>> for Input
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn from(output: &Output<T>) -> Self {
        Self::from(output.clone())
    }
}

impl Output<Value> {
    /// Views a JSON output as a string, failing if it holds another type.
    #[must_use]
    pub fn string(&self) -> Output<String> {
        self.try_apply(|value| match value {
            Value::String(s) => Ok(s),
            other => Err(format!("expected a string output, got {other}")),
        })
    }
}

impl Inputs {
    /// Creates an empty input set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an input.
    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    /// Consumes the builder.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, Input> {
        self.entries
    }
}

impl<K: Into<String>> FromIterator<(K, Input)> for Inputs {
    fn from_iter<I: IntoIterator<Item = (K, Input)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl ResourceOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Overrides the replacement ordering.
    #[must_use]
    pub const fn replace_order(mut self, order: ReplaceOrder) -> Self {
        self.replace_order = Some(order);
        self
    }

    /// Marks the resource as protected.
    #[must_use]
    pub const fn protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }
}

impl ResourceNode {
    /// Creates a node, checking its inputs against the schema.
    ///
    /// # Errors
    ///
    /// Returns an error for inputs the schema does not declare, or required
    /// inputs that are missing.
    pub fn new(
        name: impl Into<String>,
        schema: Arc<ResourceSchema>,
        inputs: Inputs,
        options: ResourceOptions,
    ) -> Result<Self> {
        let name = name.into();
        let inputs = inputs.into_map();

        if let Some(unknown) = inputs.keys().find(|k| schema.field(k).is_none()) {
            return Err(ConfigError::UnknownInput {
                resource: name,
                type_token: schema.type_token.clone(),
                field: unknown.clone(),
            }
            .into());
        }
        if let Some(missing) = schema
            .inputs
            .iter()
            .find(|f| f.required && !inputs.contains_key(&f.name))
        {
            return Err(ConfigError::MissingInput {
                resource: name,
                type_token: schema.type_token.clone(),
                field: missing.name.clone(),
            }
            .into());
        }

        let outputs = schema
            .output_names()
            .into_iter()
            .map(|field| {
                (
                    field.to_string(),
                    Output::pending(OutputRef::new(name.clone(), field)),
                )
            })
            .collect();

        Ok(Self {
            name,
            schema,
            inputs,
            outputs,
            options,
        })
    }

    /// Type token of the node.
    #[must_use]
    pub fn type_token(&self) -> &str {
        &self.schema.type_token
    }

    /// Logical names of the resources whose outputs this node consumes.
    #[must_use]
    pub fn referenced_resources(&self) -> BTreeSet<String> {
        self.inputs
            .values()
            .flat_map(Input::refs)
            .map(|r| r.resource)
            .collect()
    }

    /// Declared-input templates for every input.
    #[must_use]
    pub fn declared_inputs(&self) -> BTreeMap<String, Value> {
        self.inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.declared()))
            .collect()
    }

    /// Resolves every input from settled outputs.
    ///
    /// # Errors
    ///
    /// Returns the first input that could not be resolved.
    pub fn resolve_inputs(&self) -> std::result::Result<PropertyMap, Unresolved> {
        let mut resolved = PropertyMap::new();
        for (key, input) in &self.inputs {
            resolved.insert(key.clone(), input.resolve_now()?);
        }
        Ok(resolved)
    }

    /// The replacement ordering in effect for this node.
    #[must_use]
    pub fn replace_order(&self) -> ReplaceOrder {
        self.options
            .replace_order
            .unwrap_or(self.schema.replace_order)
    }

    /// Resolves output cells from provider results.
    ///
    /// Outputs the provider did not return resolve to `null`. Returns the
    /// names of such missing outputs.
    pub fn resolve_outputs(&self, id: Option<&str>, values: &PropertyMap) -> Vec<String> {
        let mut missing = Vec::new();
        for (field, cell) in &self.outputs {
            let value = match (field.as_str(), id) {
                (super::schema::ID_OUTPUT, Some(id)) if !self.schema.is_data_source() => {
                    Value::String(id.to_string())
                }
                _ => values.get(field).cloned().unwrap_or_else(|| {
                    missing.push(field.clone());
                    Value::Null
                }),
            };
            // Cells of a node are settled by exactly one task, once.
            let _ = cell.resolve(value);
        }
        missing
    }

    /// Fails every output cell with `failure`.
    pub fn fail_outputs(&self, failure: &OutputFailure) {
        for cell in self.outputs.values() {
            let _ = cell.fail(failure.clone());
        }
    }

    /// Handle for programs.
    #[must_use]
    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle {
            name: self.name.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

impl ResourceHandle {
    /// Logical name of the resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns an output cell of the resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource type has no such output.
    pub fn output(&self, field: &str) -> Result<Output<Value>> {
        self.outputs.get(field).cloned().ok_or_else(|| {
            GraphError::UnknownOutput {
                resource: self.name.clone(),
                field: field.to_string(),
            }
            .into()
        })
    }

    /// The provider-assigned identifier (or a data source's `id` output).
    ///
    /// # Errors
    ///
    /// Returns an error if the resource exposes no `id`.
    pub fn id(&self) -> Result<Output<Value>> {
        self.output(super::schema::ID_OUTPUT)
    }
}
