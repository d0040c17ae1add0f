//! Reference index maintenance.
//!
//! Every edge lives in the parent's out-index and, unless its property is a
//! scope boundary or the child is cached, in the child's in-index. All edge
//! changes go through [`GraphContext::add_reference`] and
//! [`GraphContext::remove_reference`] so the two sides never disagree.

use std::sync::Arc;

use super::GraphContext;
use crate::error::{GraphError, GraphResult};
use crate::instance::{GraphReference, InstanceId, ReferenceIndex};
use crate::model::PropertyId;

impl GraphContext {
    /// Insert the edge `(property, parent, child)`, at `position` for lists.
    /// Returns `false` if the edge already existed. Loading edges do not
    /// notify path observers.
    pub(crate) fn add_reference(
        &mut self,
        parent: InstanceId,
        property: PropertyId,
        child: InstanceId,
        is_loading: bool,
        position: Option<usize>,
    ) -> GraphResult<bool> {
        self.instance(child)?;
        let edge = GraphReference::new(property, parent, child);
        let out = &mut self.instance_mut(parent)?.out_references;
        let inserted = match position {
            Some(position) => out.insert_at(position, edge),
            None => out.insert(edge),
        };
        if !inserted {
            return Ok(false);
        }

        let boundary = self.schema.property(property).is_boundary();
        let target = &mut self.instances[child.index()];
        if !boundary && !target.cached {
            target.in_references.insert(edge);
        }
        if !is_loading {
            self.notify_observers(parent, property);
        }
        Ok(true)
    }

    /// Remove an edge from both indices, returning its former position in the
    /// parent's bucket. Observers are always notified.
    pub(crate) fn remove_reference(&mut self, edge: GraphReference) -> Option<usize> {
        let position = self
            .instances
            .get_mut(edge.parent.index())
            .and_then(|parent| parent.out_references.remove(&edge));
        if let Some(child) = self.instances.get_mut(edge.child.index()) {
            child.in_references.remove(&edge);
        }
        self.notify_observers(edge.parent, edge.property);
        position
    }

    /// Remove every edge touching `handle`, in either direction.
    pub(crate) fn detach(&mut self, handle: InstanceId) -> GraphResult<()> {
        let instance = self.instance(handle)?;
        let edges: Vec<GraphReference> = instance
            .out_references
            .iter()
            .chain(instance.in_references.iter())
            .copied()
            .collect();
        for edge in edges {
            self.remove_reference(edge);
        }
        Ok(())
    }

    /// Add an edge read from storage. No events are raised and path
    /// observers are not notified.
    pub fn load_reference(&mut self, parent: InstanceId, property: &str, child: InstanceId) -> GraphResult<()> {
        let schema = Arc::clone(&self.schema);
        let parent_type = self.instance(parent)?.type_id;
        let property = schema.property_of(parent_type, property)?;
        let Some(target) = property.target() else {
            return Err(GraphError::PropertyKind {
                type_name: schema.graph_type(parent_type).name().to_string(),
                property: property.name().to_string(),
                expected: "reference",
            });
        };
        self.check_target(child, target)?;

        if !property.is_list() {
            let existing: Vec<GraphReference> = self
                .instance(parent)?
                .out_references
                .get(property.id())
                .filter(|edge| edge.child != child)
                .copied()
                .collect();
            for edge in existing {
                self.remove_reference(edge);
            }
        }
        self.add_reference(parent, property.id(), child, true, None)?;
        Ok(())
    }

    /// Edges leaving `handle`.
    pub fn references_out(&self, handle: InstanceId) -> GraphResult<&ReferenceIndex> {
        Ok(&self.instance(handle)?.out_references)
    }

    /// Edges arriving at `handle`. Boundary properties and cached instances
    /// are not tracked here.
    pub fn references_in(&self, handle: InstanceId) -> GraphResult<&ReferenceIndex> {
        Ok(&self.instance(handle)?.in_references)
    }
}
