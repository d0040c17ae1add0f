//! Property access.
//!
//! Public getters initialize the instance and record the first read of each
//! property; public setters enforce read-only flags and run converters, then
//! hand over to the `write_*` primitives that replay also uses.

use std::sync::Arc;

use super::GraphContext;
use crate::error::{GraphError, GraphResult};
use crate::event::{GraphEvent, ListChangeEvent, ListItem, PropertyGetEvent, ReferenceChangeEvent, ValueChangeEvent};
use crate::instance::{GraphReference, InstanceId};
use crate::model::{GraphProperty, PropertyId, Schema, TypeId, Value};

impl GraphContext {
    /// Resolve `name` on the instance's type and check its kind.
    fn typed_property<'s>(
        &self,
        schema: &'s Schema,
        handle: InstanceId,
        name: &str,
        expected: &'static str,
    ) -> GraphResult<&'s GraphProperty> {
        let type_id = self.instance(handle)?.type_id;
        let property = schema.property_of(type_id, name)?;
        let matches = match expected {
            "value" => property.is_value(),
            "list" => property.is_list(),
            _ => property.is_reference() && !property.is_list(),
        };
        if !matches {
            return Err(GraphError::PropertyKind {
                type_name: schema.graph_type(type_id).name().to_string(),
                property: name.to_string(),
                expected,
            });
        }
        Ok(property)
    }

    fn check_writable(schema: &Schema, property: &GraphProperty) -> GraphResult<()> {
        if property.is_read_only() {
            return Err(GraphError::ReadOnlyProperty {
                type_name: schema.graph_type(property.declaring_type()).name().to_string(),
                property: property.name().to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_target(&self, child: InstanceId, target: TypeId) -> GraphResult<()> {
        let actual = self.instance(child)?.type_id;
        if self.schema.is_a(actual, target) {
            return Ok(());
        }
        Err(GraphError::TypeMismatch {
            expected: self.schema.graph_type(target).name().to_string(),
            actual: self.schema.graph_type(actual).name().to_string(),
        })
    }

    fn track_read(&mut self, handle: InstanceId, property: &GraphProperty) -> GraphResult<()> {
        let instance = self.instance_mut(handle)?;
        let first = instance.accessed.set(property.index());
        if first && self.config.track_reads {
            let event = PropertyGetEvent {
                instance: self.instance_ref(handle)?,
                property: property.name().to_string(),
            };
            self.raise(GraphEvent::PropertyGet(event));
        }
        Ok(())
    }

    // Values

    pub fn get_value(&mut self, handle: InstanceId, name: &str) -> GraphResult<Value> {
        let schema = Arc::clone(&self.schema);
        let property = self.typed_property(&schema, handle, name, "value")?;
        self.ensure_initialized(handle)?;
        self.track_read(handle, property)?;
        Ok(self.stored_value(handle, property))
    }

    /// Read a value without initializing the instance or recording the read.
    pub fn peek_value(&self, handle: InstanceId, name: &str) -> GraphResult<Value> {
        let schema = Arc::clone(&self.schema);
        let property = self.typed_property(&schema, handle, name, "value")?;
        Ok(self.stored_value(handle, property))
    }

    fn stored_value(&self, handle: InstanceId, property: &GraphProperty) -> Value {
        if property.is_static() {
            return self.statics.get(&property.id()).cloned().unwrap_or_default();
        }
        self.instances[handle.index()].values[property.index()].clone()
    }

    pub fn set_value(&mut self, handle: InstanceId, name: &str, value: impl Into<Value>) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let property = self.typed_property(&schema, handle, name, "value")?;
        Self::check_writable(&schema, property)?;
        let value = match property.converter() {
            Some(converter) => converter.convert(value.into())?,
            None => value.into(),
        };
        self.write_value(handle, property.id(), value)
    }

    /// Store a value and raise `ValueChange`. No read-only check and no
    /// conversion.
    pub(crate) fn write_value(&mut self, handle: InstanceId, property: PropertyId, value: Value) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let property = schema.property(property);
        self.with_scope(|ctx| {
            ctx.ensure_initialized(handle)?;
            let old_value = if property.is_static() {
                ctx.statics.insert(property.id(), value.clone()).unwrap_or_default()
            } else {
                let slot = &mut ctx.instance_mut(handle)?.values[property.index()];
                std::mem::replace(slot, value.clone())
            };
            ctx.notify_observers(handle, property.id());
            let event = ValueChangeEvent {
                instance: ctx.instance_ref(handle)?,
                property: property.name().to_string(),
                old_value,
                new_value: value,
            };
            ctx.raise(GraphEvent::ValueChange(event));
            Ok(())
        })
    }

    // Scalar references

    pub fn get_reference(&mut self, handle: InstanceId, name: &str) -> GraphResult<Option<InstanceId>> {
        let schema = Arc::clone(&self.schema);
        let property = self.typed_property(&schema, handle, name, "reference")?;
        self.ensure_initialized(handle)?;
        self.track_read(handle, property)?;
        Ok(self.current_children(handle, property.id()).first().copied())
    }

    pub fn set_reference(&mut self, handle: InstanceId, name: &str, child: Option<InstanceId>) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let property = self.typed_property(&schema, handle, name, "reference")?;
        Self::check_writable(&schema, property)?;
        self.write_reference(handle, property.id(), child)
    }

    /// Replace the target of a scalar reference and raise `ReferenceChange`.
    /// The edge index is updated before the event goes out.
    pub(crate) fn write_reference(
        &mut self,
        handle: InstanceId,
        property: PropertyId,
        child: Option<InstanceId>,
    ) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let property = schema.property(property);
        if let (Some(child), Some(target)) = (child, property.target()) {
            self.check_target(child, target)?;
        }
        self.with_scope(|ctx| {
            ctx.ensure_initialized(handle)?;
            if let Some(child) = child {
                ctx.ensure_initialized(child)?;
            }
            let old = ctx.current_children(handle, property.id()).first().copied();
            if old != child {
                if let Some(old) = old {
                    ctx.remove_reference(GraphReference::new(property.id(), handle, old));
                }
                if let Some(child) = child {
                    ctx.add_reference(handle, property.id(), child, false, None)?;
                }
            }
            let event = ReferenceChangeEvent {
                instance: ctx.instance_ref(handle)?,
                property: property.name().to_string(),
                old_value: old.map(|old| ctx.instance_ref(old)).transpose()?,
                new_value: child.map(|child| ctx.instance_ref(child)).transpose()?,
            };
            ctx.raise(GraphEvent::ReferenceChange(event));
            Ok(())
        })
    }

    fn current_children(&self, handle: InstanceId, property: PropertyId) -> Vec<InstanceId> {
        self.instances[handle.index()]
            .out_references
            .get(property)
            .map(|edge| edge.child)
            .collect()
    }

    // Lists

    pub fn get_list(&mut self, handle: InstanceId, name: &str) -> GraphResult<Vec<InstanceId>> {
        let schema = Arc::clone(&self.schema);
        let property = self.typed_property(&schema, handle, name, "list")?;
        self.ensure_initialized(handle)?;
        self.track_read(handle, property)?;
        Ok(self.current_children(handle, property.id()))
    }

    /// Append `child`. Returns `false` if it is already in the list.
    pub fn list_add(&mut self, handle: InstanceId, name: &str, child: InstanceId) -> GraphResult<bool> {
        self.list_insert(handle, name, usize::MAX, child)
    }

    /// Insert `child` at `index` (clamped). Returns `false` if it is already
    /// in the list.
    pub fn list_insert(&mut self, handle: InstanceId, name: &str, index: usize, child: InstanceId) -> GraphResult<bool> {
        let schema = Arc::clone(&self.schema);
        let property = self.writable_list(&schema, handle, name)?;
        let edge = GraphReference::new(property, handle, child);
        if self.instance(handle)?.out_references.contains(&edge) {
            return Ok(false);
        }
        self.apply_list_change(handle, property, &[], &[(index, child)])?;
        Ok(true)
    }

    /// Remove `child`. Returns `false` if it was not in the list.
    pub fn list_remove(&mut self, handle: InstanceId, name: &str, child: InstanceId) -> GraphResult<bool> {
        let schema = Arc::clone(&self.schema);
        let property = self.writable_list(&schema, handle, name)?;
        let edge = GraphReference::new(property, handle, child);
        if !self.instance(handle)?.out_references.contains(&edge) {
            return Ok(false);
        }
        self.apply_list_change(handle, property, &[child], &[])?;
        Ok(true)
    }

    /// Make the list hold exactly `items`: missing ones are appended in the
    /// given order, extra ones removed. Raises a single `ListChange`.
    pub fn list_replace(&mut self, handle: InstanceId, name: &str, items: &[InstanceId]) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let property = self.writable_list(&schema, handle, name)?;
        let current = self.current_children(handle, property);
        let remove: Vec<InstanceId> = current.iter().copied().filter(|item| !items.contains(item)).collect();
        let mut insert: Vec<(usize, InstanceId)> = Vec::new();
        for &item in items {
            if !current.contains(&item) && !insert.iter().any(|(_, existing)| *existing == item) {
                insert.push((usize::MAX, item));
            }
        }
        self.apply_list_change(handle, property, &remove, &insert)
    }

    fn writable_list(&self, schema: &Schema, handle: InstanceId, name: &str) -> GraphResult<PropertyId> {
        let property = self.typed_property(schema, handle, name, "list")?;
        Self::check_writable(schema, property)?;
        self.ensure_usable(handle)?;
        Ok(property.id())
    }

    /// Remove then insert list items, raising one `ListChange` that records
    /// each item's position.
    pub(crate) fn apply_list_change(
        &mut self,
        handle: InstanceId,
        property: PropertyId,
        remove: &[InstanceId],
        insert: &[(usize, InstanceId)],
    ) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let property = schema.property(property);
        if let Some(target) = property.target() {
            for &(_, child) in insert {
                self.check_target(child, target)?;
            }
        }

        self.with_scope(|ctx| {
            ctx.ensure_initialized(handle)?;
            for &(_, child) in insert {
                ctx.ensure_initialized(child)?;
            }

            let out = &ctx.instance(handle)?.out_references;
            let mut removals: Vec<(usize, InstanceId)> = remove
                .iter()
                .filter_map(|&child| {
                    out.position(&GraphReference::new(property.id(), handle, child))
                        .map(|position| (position, child))
                })
                .collect();
            removals.sort_unstable_by(|a, b| b.0.cmp(&a.0));
            for &(_, child) in &removals {
                ctx.remove_reference(GraphReference::new(property.id(), handle, child));
            }

            let mut insertions = insert.to_vec();
            insertions.sort_by_key(|&(index, _)| index);
            let mut added = Vec::new();
            for (index, child) in insertions {
                if ctx.add_reference(handle, property.id(), child, false, Some(index))? {
                    let edge = GraphReference::new(property.id(), handle, child);
                    let landed = ctx.instance(handle)?.out_references.position(&edge).unwrap_or(index);
                    added.push(ListItem {
                        instance: ctx.instance_ref(child)?,
                        index: landed,
                    });
                }
            }

            let mut removed = Vec::with_capacity(removals.len());
            for &(index, child) in removals.iter().rev() {
                removed.push(ListItem {
                    instance: ctx.instance_ref(child)?,
                    index,
                });
            }

            let event = ListChangeEvent {
                instance: ctx.instance_ref(handle)?,
                property: property.name().to_string(),
                added,
                removed,
            };
            ctx.raise(GraphEvent::ListChange(event));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use crate::config::ContextConfig;
    use crate::event::{EventKind, GraphEvent};
    use crate::model::{PropertyDef, SchemaBuilder, TypeDef, Value, ValueConverter};
    use crate::{GraphContext, GraphError, GraphResult};

    #[derive(Debug)]
    struct Upper;

    impl ValueConverter for Upper {
        fn convert(&self, value: Value) -> GraphResult<Value> {
            match value {
                Value::Text(text) => Ok(Value::Text(text.to_uppercase())),
                other => Ok(other),
            }
        }
    }

    fn schema() -> Arc<crate::model::Schema> {
        let mut builder = SchemaBuilder::new();
        builder
            .add(
                TypeDef::new("Order")
                    .property(PropertyDef::value("code").converter(Arc::new(Upper)))
                    .property(PropertyDef::value("created").read_only())
                    .property(PropertyDef::value("currency").make_static())
                    .reference("customer", "Customer")
                    .list("lines", "Line"),
            )
            .unwrap()
            .add(TypeDef::new("Customer").value("name"))
            .unwrap()
            .add(TypeDef::new("Line").value("qty"))
            .unwrap();
        builder.build().unwrap()
    }

    fn events(ctx: &mut GraphContext) -> Rc<RefCell<Vec<GraphEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        ctx.subscribe(move |_, event| sink.borrow_mut().push(event.clone()));
        seen
    }

    #[test]
    fn converter_runs_on_set() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        ctx.set_value(order, "code", "a-1").unwrap();
        assert_eq!(ctx.peek_value(order, "code").unwrap(), Value::from("A-1"));
    }

    #[test]
    fn read_only_rejected_publicly() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        assert!(matches!(
            ctx.set_value(order, "created", 1),
            Err(GraphError::ReadOnlyProperty { .. })
        ));
        assert_eq!(ctx.peek_value(order, "created").unwrap(), Value::Null);
    }

    #[test]
    fn static_values_are_shared_by_instances() {
        let mut ctx = GraphContext::new(schema());
        let first = ctx.create("Order").unwrap();
        let second = ctx.create("Order").unwrap();
        ctx.set_value(first, "currency", "EUR").unwrap();
        assert_eq!(ctx.get_value(second, "currency").unwrap(), Value::from("EUR"));
    }

    #[test]
    fn no_op_write_still_raises() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        let seen = events(&mut ctx);
        ctx.set_value(order, "code", Value::Null).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].is_valid());
    }

    #[test]
    fn untracked_reads_when_disabled() {
        let config = ContextConfig {
            track_reads: false,
            ..ContextConfig::default()
        };
        let mut ctx = GraphContext::with_config(schema(), config);
        let order = ctx.create("Order").unwrap();
        let seen = events(&mut ctx);
        ctx.get_value(order, "code").unwrap();
        assert!(seen.borrow().is_empty());
        assert!(ctx.instance(order).unwrap().is_accessed(0));
    }

    #[test]
    fn reference_type_is_checked() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        assert!(matches!(
            ctx.set_reference(order, "customer", Some(line)),
            Err(GraphError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn reference_change_carries_old_and_new() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        let alice = ctx.create("Customer").unwrap();
        let bob = ctx.create("Customer").unwrap();
        ctx.set_reference(order, "customer", Some(alice)).unwrap();
        let seen = events(&mut ctx);
        ctx.set_reference(order, "customer", Some(bob)).unwrap();
        assert_eq!(ctx.get_reference(order, "customer").unwrap(), Some(bob));
        assert!(ctx.references_in(alice).unwrap().is_empty());

        let seen = seen.borrow();
        let GraphEvent::ReferenceChange(change) = &seen[0] else {
            panic!("expected a reference change, got {:?}", seen[0]);
        };
        assert_eq!(change.old_value.as_ref().map(|r| r.id.as_str()), Some("?2"));
        assert_eq!(change.new_value.as_ref().map(|r| r.id.as_str()), Some("?3"));
    }

    #[test]
    fn duplicate_list_add_is_a_silent_no_op() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        assert!(ctx.list_add(order, "lines", line).unwrap());
        let seen = events(&mut ctx);
        assert!(!ctx.list_add(order, "lines", line).unwrap());
        assert!(seen.borrow().is_empty());
        assert_eq!(ctx.get_list(order, "lines").unwrap(), vec![line]);
    }

    #[test]
    fn list_change_records_positions() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        let lines: Vec<_> = (0..3).map(|_| ctx.create("Line").unwrap()).collect();
        for &line in &lines {
            ctx.list_add(order, "lines", line).unwrap();
        }
        let extra = ctx.create("Line").unwrap();
        let seen = events(&mut ctx);

        ctx.list_insert(order, "lines", 1, extra).unwrap();
        ctx.list_remove(order, "lines", lines[2]).unwrap();

        assert_eq!(ctx.get_list(order, "lines").unwrap(), vec![lines[0], extra, lines[1]]);
        let seen = seen.borrow();
        let kinds: Vec<_> = seen.iter().take(2).map(GraphEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::ListChange, EventKind::ListChange]);
        let (GraphEvent::ListChange(insert), GraphEvent::ListChange(remove)) = (&seen[0], &seen[1]) else {
            panic!("expected list changes");
        };
        assert_eq!(insert.added[0].index, 1);
        assert_eq!(remove.removed[0].index, 3);
    }

    #[test]
    fn replace_diffs_membership() {
        let mut ctx = GraphContext::new(schema());
        let order = ctx.create("Order").unwrap();
        let a = ctx.create("Line").unwrap();
        let b = ctx.create("Line").unwrap();
        let c = ctx.create("Line").unwrap();
        ctx.list_replace(order, "lines", &[a, b]).unwrap();
        let seen = events(&mut ctx);
        ctx.list_replace(order, "lines", &[b, c]).unwrap();

        assert_eq!(ctx.get_list(order, "lines").unwrap(), vec![b, c]);
        let seen = seen.borrow();
        let GraphEvent::ListChange(change) = &seen[0] else {
            panic!("expected a list change");
        };
        assert_eq!(change.removed.len(), 1);
        assert_eq!(change.added.len(), 1);
    }
}
