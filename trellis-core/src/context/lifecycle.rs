//! Instance lifecycle: allocation, initialization, deletion and saving.

use std::sync::Arc;

use tracing::debug;

use super::GraphContext;
use crate::error::{GraphError, GraphResult};
use crate::event::{CustomEvent, DeleteEvent, GraphEvent, IdChange, InitEvent, SaveEvent};
use crate::instance::{GraphInstance, InstanceId, InstanceState};
use crate::model::{GraphType, Value};

impl GraphContext {
    /// Create a new instance with a fresh placeholder id. Raises `InitNew`.
    pub fn create(&mut self, type_name: &str) -> GraphResult<InstanceId> {
        let schema = Arc::clone(&self.schema);
        let graph_type = schema.resolve_type(type_name)?;
        let id = self.next_placeholder_id();
        let handle = self.allocate(graph_type, id, InstanceState::Live);
        self.ensure_initialized(handle)?;
        Ok(handle)
    }

    /// Create an instance under a given id, used when replaying a foreign
    /// `InitNew`. Falls back to a fresh placeholder if the id is taken.
    pub(crate) fn create_with_id(&mut self, type_name: &str, id: &str) -> GraphResult<InstanceId> {
        let schema = Arc::clone(&self.schema);
        let graph_type = schema.resolve_type(type_name)?;
        let id = if self.find(type_name, id).is_some() {
            let fresh = self.next_placeholder_id();
            debug!(type_name, id, fresh = %fresh, "placeholder id taken, using a fresh one");
            fresh
        } else {
            self.note_placeholder(id);
            id.to_string()
        };
        let handle = self.allocate(graph_type, id, InstanceState::Live);
        self.ensure_initialized(handle)?;
        Ok(handle)
    }

    /// Register a persisted instance with its stored values. No events are
    /// raised; the first later access raises `InitExisting`.
    pub fn load<'a>(
        &mut self,
        type_name: &str,
        id: &str,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> GraphResult<InstanceId> {
        let schema = Arc::clone(&self.schema);
        let handle = match self.find(type_name, id) {
            Some(handle) => handle,
            None => {
                let graph_type = schema.resolve_type(type_name)?;
                self.allocate(graph_type, id.to_string(), InstanceState::Live)
            }
        };
        self.ensure_usable(handle)?;
        let type_id = self.instance(handle)?.type_id;

        for (name, value) in values {
            let property = schema.property_of(type_id, name)?;
            if !property.is_value() {
                return Err(GraphError::PropertyKind {
                    type_name: type_name.to_string(),
                    property: name.to_string(),
                    expected: "value",
                });
            }
            if property.is_static() {
                self.statics.insert(property.id(), value);
            } else {
                self.instance_mut(handle)?.values[property.index()] = value;
            }
        }

        let instance = self.instance_mut(handle)?;
        if instance.state == InstanceState::Unresolved {
            instance.state = InstanceState::Live;
        }
        Ok(handle)
    }

    /// Register an instance known only by type and id. It stays unresolved
    /// until first accessed.
    pub fn placeholder(&mut self, type_name: &str, id: &str) -> GraphResult<InstanceId> {
        if let Some(handle) = self.find(type_name, id) {
            return Ok(handle);
        }
        let schema = Arc::clone(&self.schema);
        let graph_type = schema.resolve_type(type_name)?;
        self.note_placeholder(id);
        Ok(self.allocate(graph_type, id.to_string(), InstanceState::Unresolved))
    }

    fn allocate(&mut self, graph_type: &GraphType, id: String, state: InstanceState) -> InstanceId {
        let handle = InstanceId(self.instances.len() as u32);
        let placeholder = self.config.is_placeholder(&id);
        let mut instance = GraphInstance::new(
            handle,
            graph_type.id(),
            graph_type.name(),
            id.clone(),
            placeholder,
            graph_type.property_count(),
        );
        instance.state = state;
        self.index.insert((graph_type.root(), id), handle);
        self.instances.push(instance);
        handle
    }

    fn next_placeholder_id(&mut self) -> String {
        self.next_placeholder += 1;
        format!("{}{}", self.config.placeholder_prefix, self.next_placeholder)
    }

    /// Keep the counter ahead of placeholder ids that arrive from elsewhere.
    fn note_placeholder(&mut self, id: &str) {
        let counter = id
            .strip_prefix(self.config.placeholder_prefix.as_str())
            .and_then(|suffix| suffix.parse::<u64>().ok());
        if let Some(counter) = counter {
            self.next_placeholder = self.next_placeholder.max(counter);
        }
    }

    /// Materialize an instance on first access, raising `InitNew` or
    /// `InitExisting` exactly once.
    pub(crate) fn ensure_initialized(&mut self, handle: InstanceId) -> GraphResult<()> {
        let instance = self.instance_mut(handle)?;
        match instance.state {
            InstanceState::Deleted => {
                return Err(GraphError::InstanceDeleted {
                    type_name: instance.type_name.clone(),
                    id: instance.id.clone(),
                })
            }
            InstanceState::Unresolved => instance.state = InstanceState::Live,
            InstanceState::Live => {}
        }
        if instance.initialized {
            return Ok(());
        }
        instance.initialized = true;
        let init = InitEvent {
            instance: instance.to_ref(),
        };
        let event = if instance.placeholder {
            GraphEvent::InitNew(init)
        } else {
            GraphEvent::InitExisting(init)
        };
        self.raise(event);
        Ok(())
    }

    /// Undo creation: detach the instance and return it to the unresolved
    /// state under the same id.
    pub(crate) fn unresolve(&mut self, handle: InstanceId) -> GraphResult<()> {
        self.with_scope(|ctx| {
            ctx.detach(handle)?;
            let instance = ctx.instance_mut(handle)?;
            instance.reset();
            debug!(instance = %instance.to_ref(), "instance unresolved");
            Ok(())
        })
    }

    /// Detach every edge and mark the slot deleted.
    pub(crate) fn destroy(&mut self, handle: InstanceId) -> GraphResult<()> {
        self.ensure_usable(handle)?;
        self.with_scope(|ctx| {
            ctx.detach(handle)?;
            let instance = ctx.instance_mut(handle)?;
            instance.state = InstanceState::Deleted;
            instance.pending_delete = false;
            debug!(instance = %instance.to_ref(), "instance deleted");
            Ok(())
        })
    }

    /// Flag an instance for deletion when the recording transaction commits.
    pub fn delete(&mut self, handle: InstanceId) -> GraphResult<()> {
        self.set_pending_delete(handle, true)
    }

    pub fn undelete(&mut self, handle: InstanceId) -> GraphResult<()> {
        self.set_pending_delete(handle, false)
    }

    pub(crate) fn set_pending_delete(&mut self, handle: InstanceId, pending: bool) -> GraphResult<()> {
        self.with_scope(|ctx| {
            ctx.ensure_initialized(handle)?;
            let instance = ctx.instance_mut(handle)?;
            if instance.pending_delete == pending {
                return Ok(());
            }
            instance.pending_delete = pending;
            let event = DeleteEvent {
                instance: instance.to_ref(),
                is_pending_delete: pending,
            };
            ctx.raise(GraphEvent::Delete(event));
            Ok(())
        })
    }

    /// Assign real ids and raise a `Save` event rooted at `root`.
    pub fn save(&mut self, root: InstanceId, assignments: &[(InstanceId, String)]) -> GraphResult<()> {
        self.ensure_usable(root)?;
        for (handle, _) in assignments {
            self.ensure_usable(*handle)?;
        }
        self.with_scope(|ctx| {
            let root_ref = ctx.instance_ref(root)?;
            let mut id_changes = Vec::new();
            for (handle, new_id) in assignments {
                let instance = ctx.instance(*handle)?;
                if instance.id == *new_id {
                    continue;
                }
                id_changes.push(IdChange {
                    type_name: instance.type_name.clone(),
                    old_id: instance.id.clone(),
                    new_id: new_id.clone(),
                });
                ctx.assign_id(*handle, new_id.clone())?;
            }
            debug!(root = %root_ref, ids = id_changes.len(), "save");
            ctx.raise(GraphEvent::Save(SaveEvent::new(root_ref, id_changes)));
            Ok(())
        })
    }

    /// Change the id of an instance. Placeholder ids stay registered as
    /// aliases; a replaced real id is released.
    pub(crate) fn assign_id(&mut self, handle: InstanceId, new_id: String) -> GraphResult<()> {
        let placeholder = self.config.is_placeholder(&new_id);
        let schema = Arc::clone(&self.schema);
        let instance = self.instance_mut(handle)?;
        let root = schema.graph_type(instance.type_id).root();
        let old_id = std::mem::replace(&mut instance.id, new_id.clone());
        let was_placeholder = std::mem::replace(&mut instance.placeholder, placeholder);

        if !was_placeholder && old_id != new_id {
            self.index.remove(&(root, old_id));
        }
        if placeholder {
            self.note_placeholder(&new_id);
        }
        self.index.insert((root, new_id), handle);
        Ok(())
    }

    /// Raise a domain-specific event. Transacted ones are recorded and
    /// replayed through the handler registered under `name`.
    pub fn raise_custom(
        &mut self,
        handle: InstanceId,
        name: impl Into<String>,
        data: serde_json::Value,
        transacted: bool,
    ) -> GraphResult<()> {
        let name = name.into();
        self.with_scope(|ctx| {
            ctx.ensure_initialized(handle)?;
            let event = CustomEvent {
                instance: ctx.instance_ref(handle)?,
                name,
                data,
                transacted,
            };
            ctx.raise(GraphEvent::Custom(event));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::event::EventKind;
    use crate::instance::InstanceState;
    use crate::model::{SchemaBuilder, TypeDef, Value};
    use crate::{GraphContext, GraphError};

    fn context() -> GraphContext {
        let mut builder = SchemaBuilder::new();
        builder
            .add(TypeDef::new("Order").value("code").list("lines", "Line"))
            .unwrap()
            .add(TypeDef::new("Line").value("qty"))
            .unwrap();
        GraphContext::new(builder.build().unwrap())
    }

    fn kinds(ctx: &mut GraphContext) -> Rc<RefCell<Vec<EventKind>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        ctx.subscribe(move |_, event| sink.borrow_mut().push(event.kind()));
        seen
    }

    #[test]
    fn placeholder_ids_are_unique_and_never_reused() {
        let mut ctx = context();
        let first = ctx.create("Order").unwrap();
        let second = ctx.create("Order").unwrap();
        assert_eq!(ctx.instance(first).unwrap().id(), "?1");
        assert_eq!(ctx.instance(second).unwrap().id(), "?2");

        // A foreign placeholder moves the counter past itself.
        ctx.placeholder("Order", "?9").unwrap();
        let third = ctx.create("Order").unwrap();
        assert_eq!(ctx.instance(third).unwrap().id(), "?10");
    }

    #[test]
    fn loaded_instance_initializes_as_existing_on_first_access() {
        let mut ctx = context();
        let seen = kinds(&mut ctx);
        let order = ctx.load("Order", "7", [("code", Value::from("A-7"))]).unwrap();
        assert!(seen.borrow().is_empty());

        assert_eq!(ctx.get_value(order, "code").unwrap(), Value::from("A-7"));
        assert_eq!(ctx.get_value(order, "code").unwrap(), Value::from("A-7"));
        assert_eq!(
            *seen.borrow(),
            vec![EventKind::InitExisting, EventKind::PropertyGet]
        );
    }

    #[test]
    fn unresolved_placeholder_becomes_live_on_access() {
        let mut ctx = context();
        let line = ctx.placeholder("Line", "12").unwrap();
        assert_eq!(ctx.instance(line).unwrap().state(), InstanceState::Unresolved);
        ctx.set_value(line, "qty", Value::from(2)).unwrap();
        assert_eq!(ctx.instance(line).unwrap().state(), InstanceState::Live);
    }

    #[test]
    fn delete_toggles_once_per_transition() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let seen = kinds(&mut ctx);
        ctx.delete(order).unwrap();
        ctx.delete(order).unwrap();
        ctx.undelete(order).unwrap();
        assert_eq!(*seen.borrow(), vec![EventKind::Delete, EventKind::Delete]);
        assert!(!ctx.instance(order).unwrap().is_pending_delete());
    }

    #[test]
    fn destroyed_instance_rejects_access() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        ctx.list_add(order, "lines", line).unwrap();

        ctx.destroy(line).unwrap();
        assert!(ctx.get_list(order, "lines").unwrap().is_empty());
        assert!(matches!(
            ctx.get_value(line, "qty"),
            Err(GraphError::InstanceDeleted { .. })
        ));
    }

    #[test]
    fn save_keeps_placeholder_alias() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        ctx.save(order, &[(order, "42".to_string())]).unwrap();

        let instance = ctx.instance(order).unwrap();
        assert_eq!(instance.id(), "42");
        assert!(!instance.is_new());
        assert_eq!(ctx.find("Order", "42"), Some(order));
        assert_eq!(ctx.find("Order", "?1"), Some(order));
    }
}
