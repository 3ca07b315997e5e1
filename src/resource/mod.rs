//! Resource declarations.
//!
//! This module provides:
//! - Resource type schemas and the built-in catalog
//! - Declared resource nodes with their inputs and output cells
//! - Handles returned to deployment programs

mod node;
mod schema;

pub use node::{
    Input, Inputs, PropertyMap, ResourceHandle, ResourceNode, ResourceOptions, Unresolved,
    KEY_MARKER, REF_MARKER,
};
pub use schema::{
    FieldSpec, ID_OUTPUT, ReplaceOrder, ResourceClass, ResourceSchema, SchemaRegistry,
};
