use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::{GraphEvent, Transacted};
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceRef;
use crate::transaction::GraphTransaction;

/// A placeholder id replaced by a real one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdChange {
    pub type_name: String,
    pub old_id: String,
    pub new_id: String,
}

impl IdChange {
    pub fn old_ref(&self) -> InstanceRef {
        InstanceRef::new(self.type_name.clone(), self.old_id.clone())
    }

    pub fn new_ref(&self) -> InstanceRef {
        InstanceRef::new(self.type_name.clone(), self.new_id.clone())
    }
}

/// Persistence barrier.
///
/// `added`, `modified` and `deleted` are filled in per recording log from the
/// events it holds since its previous save, so two logs recording the same
/// save may carry different sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveEvent {
    pub instance: InstanceRef,
    pub id_changes: Vec<IdChange>,
    pub added: Vec<InstanceRef>,
    pub modified: Vec<InstanceRef>,
    pub deleted: Vec<InstanceRef>,
}

impl SaveEvent {
    pub fn new(instance: InstanceRef, id_changes: Vec<IdChange>) -> Self {
        Self {
            instance,
            id_changes,
            added: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Classify every instance touched in `log` after its last save.
    pub(crate) fn stamp(&mut self, log: &[GraphEvent]) {
        let start = log
            .iter()
            .rposition(|event| matches!(event, GraphEvent::Save(_)))
            .map_or(0, |position| position + 1);

        let mut added = IndexSet::new();
        let mut modified = IndexSet::new();
        let mut deleted = IndexSet::new();
        for event in &log[start..] {
            match event {
                GraphEvent::InitNew(init) => {
                    added.insert(init.instance.clone());
                }
                GraphEvent::Delete(delete) if delete.is_pending_delete => {
                    deleted.insert(delete.instance.clone());
                }
                GraphEvent::Delete(delete) => {
                    deleted.shift_remove(&delete.instance);
                }
                GraphEvent::ValueChange(_) | GraphEvent::ReferenceChange(_) | GraphEvent::ListChange(_) => {
                    modified.insert(event.instance().clone());
                }
                _ => {}
            }
        }

        let transient: Vec<InstanceRef> = added.intersection(&deleted).cloned().collect();
        for instance in &transient {
            added.shift_remove(instance);
            deleted.shift_remove(instance);
            modified.shift_remove(instance);
        }
        modified.retain(|instance| !added.contains(instance) && !deleted.contains(instance));

        self.added = added.into_iter().collect();
        self.modified = modified.into_iter().collect();
        self.deleted = deleted.into_iter().collect();
    }
}

impl Transacted for SaveEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        let root = transaction.ensure_instance(context, &self.instance)?;
        let assignments = self
            .id_changes
            .iter()
            .map(|change| Ok((transaction.ensure_instance(context, &change.old_ref())?, change.new_id.clone())))
            .collect::<GraphResult<Vec<_>>>()?;
        context.save(root, &assignments)
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        for change in self.id_changes.iter().rev() {
            let handle = transaction.ensure_instance(context, &change.new_ref())?;
            context.assign_id(handle, change.old_id.clone())?;
        }
        Ok(())
    }
}
