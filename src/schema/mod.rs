//! Schema - entity descriptions and the registry built from them

pub mod entity;
pub mod registry;

pub use entity::{EntityDef, ExternalTag, FieldDef, FieldKind, Relation};
pub use registry::{EntityDescriptor, Foreign, Link, Reference, SchemaRegistry};
