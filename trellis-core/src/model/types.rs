//! Types and properties of the graph model.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::value::ValueConverter;

/// Dense identifier of a [`GraphType`] within its [`Schema`](super::Schema).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense identifier of a [`GraphProperty`] within its schema.
///
/// Inherited properties keep the id of their declaration, so a property seen
/// through a subtype is the same property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(pub(crate) u32);

impl PropertyId {
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyId({})", self.0)
    }
}

/// A type in the graph model.
///
/// Types form a single-inheritance tree. The property table lists inherited
/// properties first, in the base type's order, followed by the type's own
/// declarations, so a property's [`GraphProperty::index`] is its position in
/// this table for every type that has it.
#[derive(Debug)]
pub struct GraphType {
    pub(crate) id: TypeId,
    pub(crate) name: String,
    pub(crate) base: Option<TypeId>,
    pub(crate) root: TypeId,
    pub(crate) subtypes: Vec<TypeId>,
    pub(crate) properties: IndexMap<String, PropertyId>,
    pub(crate) own_start: usize,
    pub(crate) attributes: IndexMap<String, String>,
}

impl GraphType {
    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<TypeId> {
        self.base
    }

    /// The top of this type's inheritance chain. Instance ids are unique
    /// per root type.
    pub fn root(&self) -> TypeId {
        self.root
    }

    /// Direct subtypes.
    pub fn subtypes(&self) -> &[TypeId] {
        &self.subtypes
    }

    /// Look up a declared or inherited property by name.
    pub fn property(&self, name: &str) -> Option<PropertyId> {
        self.properties.get(name).copied()
    }

    /// All properties, inherited first.
    pub fn properties(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.properties.values().copied()
    }

    /// Properties declared by this type itself.
    pub fn own_properties(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.properties.values().skip(self.own_start).copied()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// What a property holds.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    /// A scalar payload.
    Value {
        converter: Option<Arc<dyn ValueConverter>>,
    },
    /// One or many instances of `target`.
    Reference {
        target: TypeId,
        is_list: bool,
        /// Crosses a scope boundary: children keep no back-pointer to the
        /// parent through this property.
        is_boundary: bool,
    },
}

/// A property of a [`GraphType`].
#[derive(Debug)]
pub struct GraphProperty {
    pub(crate) id: PropertyId,
    pub(crate) declaring_type: TypeId,
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) kind: PropertyKind,
    pub(crate) is_static: bool,
    pub(crate) is_read_only: bool,
    pub(crate) attributes: IndexMap<String, String>,
}

impl GraphProperty {
    pub fn id(&self) -> PropertyId {
        self.id
    }

    pub fn declaring_type(&self) -> TypeId {
        self.declaring_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the property table of the declaring type and of every
    /// type derived from it.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_value(&self) -> bool {
        matches!(self.kind, PropertyKind::Value { .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, PropertyKind::Reference { .. })
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, PropertyKind::Reference { is_list: true, .. })
    }

    /// Public mutators reject writes; replay does not.
    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn is_boundary(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::Reference {
                is_boundary: true,
                ..
            }
        )
    }

    /// Target type of a reference property.
    pub fn target(&self) -> Option<TypeId> {
        match self.kind {
            PropertyKind::Reference { target, .. } => Some(target),
            PropertyKind::Value { .. } => None,
        }
    }

    pub(crate) fn converter(&self) -> Option<&Arc<dyn ValueConverter>> {
        match &self.kind {
            PropertyKind::Value { converter } => converter.as_ref(),
            PropertyKind::Reference { .. } => None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}
