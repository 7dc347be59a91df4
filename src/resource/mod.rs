//! Resource model for the reconciliation engine.
//!
//! This module holds the typed representation of declared resources:
//! - The tagged attribute tree and its structural diff
//! - Resource descriptors and their references
//! - Per-type schemas loaded as configuration data

mod attributes;
mod descriptor;
mod schema;

pub use attributes::{
    diff_maps, map_from_json, map_to_json, normalize_path, resolve_path, AttributeChange,
    AttributeMap, AttributeValue, PathMatch,
};
pub use descriptor::{DescriptorSource, Reference, ResourceDescriptor, DEPENDS_ON};
pub use schema::{ResourceSchema, SchemaRegistry};
