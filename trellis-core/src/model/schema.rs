//! Schema Construction
//!
//! A [`Schema`] is the immutable set of types a context works against. It is
//! built once through [`SchemaBuilder`] and shared behind an `Arc`, so several
//! contexts (one per thread or per request) can use the same model. The
//! schema also owns the compiled path cache, which is safe to share because
//! compiled paths carry no per-context state.
//!
//! # Type Providers
//!
//! The builder does not need to be told about every type up front. Any name
//! referenced as a base type or as a reference target that was not declared
//! is requested from the registered [`TypeProvider`]s when the schema is
//! built. Providers are asked in registration order until one answers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::debug;

use super::types::{GraphProperty, GraphType, PropertyId, PropertyKind, TypeId};
use super::value::ValueConverter;
use crate::error::{GraphError, GraphResult};
use crate::path::{self, PathDefinition, PathId};

/// Supplies type definitions on demand.
pub trait TypeProvider: Send + Sync {
    /// Return the definition of `name`, or `None` if this provider does not
    /// know the type.
    fn create_graph_type(&self, name: &str) -> Option<TypeDef>;
}

#[derive(Debug, Clone)]
enum PropertyDefKind {
    Value {
        converter: Option<Arc<dyn ValueConverter>>,
    },
    Reference {
        target: String,
        is_list: bool,
        is_boundary: bool,
    },
}

/// Declaration of one property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    name: String,
    kind: PropertyDefKind,
    is_static: bool,
    is_read_only: bool,
    attributes: IndexMap<String, String>,
}

impl PropertyDef {
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyDefKind::Value { converter: None },
            is_static: false,
            is_read_only: false,
            attributes: IndexMap::new(),
        }
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::reference_kind(name.into(), target.into(), false)
    }

    pub fn list(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::reference_kind(name.into(), target.into(), true)
    }

    fn reference_kind(name: String, target: String, is_list: bool) -> Self {
        Self {
            name,
            kind: PropertyDefKind::Reference {
                target,
                is_list,
                is_boundary: false,
            },
            is_static: false,
            is_read_only: false,
            attributes: IndexMap::new(),
        }
    }

    /// Attach a converter. Ignored on reference properties.
    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        if let PropertyDefKind::Value { converter: slot } = &mut self.kind {
            *slot = Some(converter);
        }
        self
    }

    /// Reject writes through the public mutators. Replay still writes.
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Mark the reference as crossing a scope boundary.
    pub fn boundary(mut self) -> Self {
        if let PropertyDefKind::Reference { is_boundary, .. } = &mut self.kind {
            *is_boundary = true;
        }
        self
    }

    /// Store one value per context instead of one per instance.
    pub fn make_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Declaration of one type.
#[derive(Debug, Clone)]
pub struct TypeDef {
    name: String,
    base: Option<String>,
    properties: Vec<PropertyDef>,
    attributes: IndexMap<String, String>,
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            properties: Vec::new(),
            attributes: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn value(self, name: impl Into<String>) -> Self {
        self.property(PropertyDef::value(name))
    }

    pub fn reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.property(PropertyDef::reference(name, target))
    }

    pub fn list(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.property(PropertyDef::list(name, target))
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Collects type declarations and produces a [`Schema`].
#[derive(Default)]
pub struct SchemaBuilder {
    types: IndexMap<String, TypeDef>,
    providers: Vec<Box<dyn TypeProvider>>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider consulted for undeclared type names.
    pub fn with_provider(mut self, provider: Box<dyn TypeProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Add a type. Adding a name twice extends the earlier declaration.
    pub fn add(&mut self, def: TypeDef) -> GraphResult<&mut Self> {
        let TypeDef {
            name,
            base,
            properties,
            attributes,
        } = def;
        if let Some(base) = base {
            self.set_base(&name, &base)?;
        }
        let entry = self
            .types
            .entry(name.clone())
            .or_insert_with(|| TypeDef::new(name));
        entry.properties.extend(properties);
        entry.attributes.extend(attributes);
        Ok(self)
    }

    /// Set the base type of `type_name`. A type's base can be set once;
    /// repeating the same base is accepted, a different one is not.
    pub fn set_base(&mut self, type_name: &str, base: &str) -> GraphResult<()> {
        let entry = self
            .types
            .entry(type_name.to_string())
            .or_insert_with(|| TypeDef::new(type_name));
        match &entry.base {
            Some(existing) if existing != base => Err(GraphError::DuplicateBaseType {
                type_name: type_name.to_string(),
                existing: existing.clone(),
                requested: base.to_string(),
            }),
            _ => {
                entry.base = Some(base.to_string());
                Ok(())
            }
        }
    }

    /// Resolve every referenced type, lay out property tables and freeze the
    /// result.
    pub fn build(mut self) -> GraphResult<Arc<Schema>> {
        self.resolve_missing()?;

        let ids: HashMap<String, TypeId> = self
            .types
            .keys()
            .enumerate()
            .map(|(index, name)| (name.clone(), TypeId(index as u32)))
            .collect();

        let order = self.base_first_order(&ids)?;

        let mut types: Vec<Option<GraphType>> = (0..self.types.len()).map(|_| None).collect();
        let mut properties: Vec<GraphProperty> = Vec::new();

        for type_id in order {
            let (name, def) = self
                .types
                .get_index(type_id.index())
                .ok_or_else(|| GraphError::UnknownType(format!("#{}", type_id.raw())))?;
            let base = def.base.as_ref().map(|base| ids[base]);

            let (mut table, root) = match base {
                Some(base) => {
                    let base_type = types[base.index()]
                        .as_ref()
                        .ok_or_else(|| GraphError::UnknownType(name.clone()))?;
                    (base_type.properties.clone(), base_type.root)
                }
                None => (IndexMap::new(), type_id),
            };
            let own_start = table.len();

            for property in &def.properties {
                if table.contains_key(&property.name) {
                    return Err(GraphError::DuplicateProperty {
                        type_name: name.clone(),
                        property: property.name.clone(),
                    });
                }
                let kind = match &property.kind {
                    PropertyDefKind::Value { converter } => PropertyKind::Value {
                        converter: converter.clone(),
                    },
                    PropertyDefKind::Reference {
                        target,
                        is_list,
                        is_boundary,
                    } => PropertyKind::Reference {
                        target: ids[target],
                        is_list: *is_list,
                        is_boundary: *is_boundary,
                    },
                };
                let id = PropertyId(properties.len() as u32);
                properties.push(GraphProperty {
                    id,
                    declaring_type: type_id,
                    name: property.name.clone(),
                    index: table.len(),
                    kind,
                    is_static: property.is_static,
                    is_read_only: property.is_read_only,
                    attributes: property.attributes.clone(),
                });
                table.insert(property.name.clone(), id);
            }

            types[type_id.index()] = Some(GraphType {
                id: type_id,
                name: name.clone(),
                base,
                root,
                subtypes: Vec::new(),
                properties: table,
                own_start,
                attributes: def.attributes.clone(),
            });
        }

        let mut types: Vec<GraphType> = types.into_iter().flatten().collect();
        for index in 0..types.len() {
            if let Some(base) = types[index].base {
                let id = types[index].id;
                types[base.index()].subtypes.push(id);
            }
        }

        debug!(
            types = types.len(),
            properties = properties.len(),
            "schema built"
        );

        Ok(Arc::new(Schema {
            by_name: ids,
            types,
            properties,
            paths: DashMap::new(),
            next_path: AtomicU32::new(0),
        }))
    }

    fn resolve_missing(&mut self) -> GraphResult<()> {
        loop {
            let missing: Vec<String> = {
                let mut seen = HashSet::new();
                self.types
                    .values()
                    .flat_map(|def| {
                        def.base.iter().cloned().chain(def.properties.iter().filter_map(
                            |property| match &property.kind {
                                PropertyDefKind::Reference { target, .. } => Some(target.clone()),
                                PropertyDefKind::Value { .. } => None,
                            },
                        ))
                    })
                    .filter(|name| !self.types.contains_key(name) && seen.insert(name.clone()))
                    .collect()
            };
            if missing.is_empty() {
                return Ok(());
            }
            for name in missing {
                let def = self
                    .providers
                    .iter()
                    .find_map(|provider| provider.create_graph_type(&name))
                    .ok_or_else(|| GraphError::UnknownType(name.clone()))?;
                if def.name != name {
                    return Err(GraphError::UnknownType(name));
                }
                self.add(def)?;
            }
        }
    }

    /// Order types so that every base precedes its subtypes.
    fn base_first_order(&self, ids: &HashMap<String, TypeId>) -> GraphResult<Vec<TypeId>> {
        let mut order = Vec::with_capacity(self.types.len());
        let mut placed = vec![false; self.types.len()];
        for (name, _) in &self.types {
            let mut chain = Vec::new();
            let mut current = Some(name.as_str());
            while let Some(type_name) = current {
                let id = ids[type_name];
                if placed[id.index()] {
                    break;
                }
                if chain.contains(&id) {
                    return Err(GraphError::InheritanceCycle(type_name.to_string()));
                }
                chain.push(id);
                current = self.types[type_name].base.as_deref();
            }
            for id in chain.into_iter().rev() {
                placed[id.index()] = true;
                order.push(id);
            }
        }
        Ok(order)
    }
}

/// The frozen graph model.
#[derive(Debug)]
pub struct Schema {
    types: Vec<GraphType>,
    by_name: HashMap<String, TypeId>,
    properties: Vec<GraphProperty>,
    paths: DashMap<(TypeId, String), Arc<PathDefinition>>,
    next_path: AtomicU32,
}

impl Schema {
    pub fn type_by_name(&self, name: &str) -> Option<&GraphType> {
        self.by_name.get(name).map(|id| &self.types[id.index()])
    }

    pub fn resolve_type(&self, name: &str) -> GraphResult<&GraphType> {
        self.type_by_name(name)
            .ok_or_else(|| GraphError::UnknownType(name.to_string()))
    }

    pub fn graph_type(&self, id: TypeId) -> &GraphType {
        &self.types[id.index()]
    }

    pub fn types(&self) -> impl Iterator<Item = &GraphType> {
        self.types.iter()
    }

    pub fn property(&self, id: PropertyId) -> &GraphProperty {
        &self.properties[id.index()]
    }

    /// Find a declared or inherited property of `type_id` by name.
    pub fn property_of(&self, type_id: TypeId, name: &str) -> GraphResult<&GraphProperty> {
        let graph_type = self.graph_type(type_id);
        graph_type
            .property(name)
            .map(|id| self.property(id))
            .ok_or_else(|| GraphError::UnknownProperty {
                type_name: graph_type.name.clone(),
                property: name.to_string(),
            })
    }

    /// Whether `sub` is `base` or derives from it.
    pub fn is_a(&self, sub: TypeId, base: TypeId) -> bool {
        let mut current = Some(sub);
        while let Some(id) = current {
            if id == base {
                return true;
            }
            current = self.types[id.index()].base;
        }
        false
    }

    /// Every type derived from `type_id`, nearest first.
    pub fn descendants(&self, type_id: TypeId) -> Vec<TypeId> {
        let mut result = Vec::new();
        let mut index = 0;
        result.extend_from_slice(&self.types[type_id.index()].subtypes);
        while index < result.len() {
            let subtypes = &self.types[result[index].index()].subtypes;
            result.extend_from_slice(subtypes);
            index += 1;
        }
        result
    }

    /// Compile `text` against `root`, or return the cached compilation.
    pub fn path(&self, root: TypeId, text: &str) -> GraphResult<Arc<PathDefinition>> {
        let key = (root, text.to_string());
        if let Some(cached) = self.paths.get(&key) {
            return Ok(Arc::clone(cached.value()));
        }
        let id = PathId(self.next_path.fetch_add(1, Ordering::Relaxed));
        let compiled = Arc::new(path::compile(self, root, text, id)?);
        Ok(Arc::clone(self.paths.entry(key).or_insert(compiled).value()))
    }

    pub fn path_by_name(&self, root: &str, text: &str) -> GraphResult<Arc<PathDefinition>> {
        let root = self.resolve_type(root)?.id;
        self.path(root, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> Arc<Schema> {
        let mut builder = SchemaBuilder::new();
        builder
            .add(TypeDef::new("Entity").value("name"))
            .unwrap()
            .add(TypeDef::new("Order").extends("Entity").list("items", "Item"))
            .unwrap()
            .add(TypeDef::new("Item").extends("Entity").value("price"))
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn property_indices_continue_base_numbering() {
        let schema = shop();
        let order = schema.type_by_name("Order").unwrap();
        let item = schema.type_by_name("Item").unwrap();

        let name = schema.property_of(order.id(), "name").unwrap();
        assert_eq!(name.index(), 0);
        assert_eq!(schema.property_of(order.id(), "items").unwrap().index(), 1);
        assert_eq!(schema.property_of(item.id(), "price").unwrap().index(), 1);

        // Inherited properties are the same property.
        assert_eq!(order.property("name"), item.property("name"));
        assert_eq!(order.own_properties().count(), 1);
    }

    #[test]
    fn inheritance_queries() {
        let schema = shop();
        let entity = schema.type_by_name("Entity").unwrap().id();
        let order = schema.type_by_name("Order").unwrap().id();
        assert!(schema.is_a(order, entity));
        assert!(!schema.is_a(entity, order));
        assert_eq!(schema.graph_type(order).root(), entity);
        assert_eq!(schema.descendants(entity).len(), 2);
    }

    #[test]
    fn base_type_is_set_at_most_once() {
        let mut builder = SchemaBuilder::new();
        builder.set_base("Order", "Entity").unwrap();
        builder.set_base("Order", "Entity").unwrap();
        let err = builder.set_base("Order", "Document").unwrap_err();
        assert!(matches!(err, GraphError::DuplicateBaseType { .. }));
    }

    #[test]
    fn redeclared_property_is_rejected() {
        let mut builder = SchemaBuilder::new();
        builder
            .add(TypeDef::new("Entity").value("name"))
            .unwrap()
            .add(TypeDef::new("Order").extends("Entity").value("name"))
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(GraphError::DuplicateProperty { .. })
        ));
    }

    #[test]
    fn inheritance_cycle_is_rejected() {
        let mut builder = SchemaBuilder::new();
        builder.set_base("A", "B").unwrap();
        builder.set_base("B", "A").unwrap();
        assert!(matches!(
            builder.build(),
            Err(GraphError::InheritanceCycle(_))
        ));
    }

    #[test]
    fn read_only_applies_to_every_kind() {
        let mut builder = SchemaBuilder::new();
        builder
            .add(
                TypeDef::new("Order")
                    .property(PropertyDef::value("created").read_only())
                    .property(PropertyDef::reference("owner", "Order").read_only())
                    .property(PropertyDef::list("parts", "Order").read_only())
                    .value("code"),
            )
            .unwrap();
        let schema = builder.build().unwrap();
        let order = schema.type_by_name("Order").unwrap().id();
        for name in ["created", "owner", "parts"] {
            assert!(schema.property_of(order, name).unwrap().is_read_only(), "{name}");
        }
        assert!(!schema.property_of(order, "code").unwrap().is_read_only());
    }

    struct Catalog;

    impl TypeProvider for Catalog {
        fn create_graph_type(&self, name: &str) -> Option<TypeDef> {
            (name == "Product").then(|| TypeDef::new("Product").value("sku"))
        }
    }

    #[test]
    fn providers_supply_undeclared_targets() {
        let mut builder = SchemaBuilder::new().with_provider(Box::new(Catalog));
        builder
            .add(TypeDef::new("Line").reference("product", "Product"))
            .unwrap();
        let schema = builder.build().unwrap();
        let product = schema.type_by_name("Product").unwrap();
        assert!(product.property("sku").is_some());

        let mut builder = SchemaBuilder::new().with_provider(Box::new(Catalog));
        builder
            .add(TypeDef::new("Line").reference("vendor", "Vendor"))
            .unwrap();
        assert!(matches!(builder.build(), Err(GraphError::UnknownType(_))));
    }
}
