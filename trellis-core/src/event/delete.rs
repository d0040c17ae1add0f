use serde::{Deserialize, Serialize};

use super::Transacted;
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceRef;
use crate::transaction::GraphTransaction;

/// The pending-delete flag of an instance was toggled.
///
/// Nothing is destroyed until the owning transaction commits, so the flag can
/// be flipped back by rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEvent {
    pub instance: InstanceRef,
    pub is_pending_delete: bool,
}

impl Transacted for DeleteEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        let handle = transaction.ensure_instance(context, &self.instance)?;
        context.set_pending_delete(handle, self.is_pending_delete)
    }

    fn commit(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        if !self.is_pending_delete {
            return Ok(());
        }
        let handle = transaction.ensure_instance(context, &self.instance)?;
        // A later undelete in the same log leaves the flag cleared.
        if context.instance(handle)?.is_pending_delete() {
            context.destroy(handle)?;
        }
        Ok(())
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        let handle = transaction.ensure_instance(context, &self.instance)?;
        context.set_pending_delete(handle, !self.is_pending_delete)
    }
}
