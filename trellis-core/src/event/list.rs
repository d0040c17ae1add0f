use serde::{Deserialize, Serialize};

use super::Transacted;
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::{InstanceId, InstanceRef};
use crate::transaction::GraphTransaction;

/// An item added to or removed from a list, with its position.
///
/// Removed items carry the index they occupied before the change; added
/// items the index they landed at. Replaying removals descending and
/// insertions ascending restores the exact order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub instance: InstanceRef,
    pub index: usize,
}

/// Items were added to and/or removed from a list reference property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListChangeEvent {
    pub instance: InstanceRef,
    pub property: String,
    pub added: Vec<ListItem>,
    pub removed: Vec<ListItem>,
}

impl ListChangeEvent {
    pub fn is_valid(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Fold `later` into this change. An item added here and removed later
    /// cancels out.
    pub fn merge(&self, later: &ListChangeEvent) -> Option<ListChangeEvent> {
        if self.instance != later.instance || self.property != later.property {
            return None;
        }
        let mut added = self.added.clone();
        let mut removed = self.removed.clone();
        for item in &later.removed {
            match added.iter().position(|a| a.instance == item.instance) {
                Some(position) => {
                    added.remove(position);
                }
                None => removed.push(item.clone()),
            }
        }
        added.extend(later.added.iter().cloned());
        Some(ListChangeEvent {
            instance: self.instance.clone(),
            property: self.property.clone(),
            added,
            removed,
        })
    }

    fn apply(
        &self,
        context: &mut GraphContext,
        transaction: &mut GraphTransaction,
        remove: &[ListItem],
        insert: &[ListItem],
    ) -> GraphResult<()> {
        let handle = transaction.ensure_instance(context, &self.instance)?;
        let property = context.property_id(handle, &self.property)?;
        let remove = remove
            .iter()
            .map(|item| transaction.ensure_instance(context, &item.instance))
            .collect::<GraphResult<Vec<InstanceId>>>()?;
        let insert = insert
            .iter()
            .map(|item| Ok((item.index, transaction.ensure_instance(context, &item.instance)?)))
            .collect::<GraphResult<Vec<(usize, InstanceId)>>>()?;
        context.apply_list_change(handle, property, &remove, &insert)
    }
}

impl Transacted for ListChangeEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        self.apply(context, transaction, &self.removed, &self.added)
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        self.apply(context, transaction, &self.added, &self.removed)
    }
}
