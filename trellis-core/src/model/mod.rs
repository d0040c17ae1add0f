//! Graph Model
//!
//! The uniform type and property view laid over tracked instances. Types
//! are declared with [`TypeDef`], frozen by [`SchemaBuilder::build`], and
//! addressed afterwards by the dense [`TypeId`] and [`PropertyId`] handles.

mod schema;
mod types;
mod value;

pub use schema::{PropertyDef, Schema, SchemaBuilder, TypeDef, TypeProvider};
pub use types::{GraphProperty, GraphType, PropertyId, PropertyKind, TypeId};
pub use value::{Value, ValueConverter};
