use serde::{Deserialize, Serialize};

use super::Transacted;
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::{InstanceRef, InstanceState};
use crate::transaction::GraphTransaction;

/// First access of an instance. Raised as `InitNew` for instances that still
/// carry a placeholder id and as `InitExisting` for persisted ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitEvent {
    pub instance: InstanceRef,
}

impl Transacted for InitEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        let handle = match transaction.mapped(&self.instance) {
            Some(handle) => handle,
            None => match context.find(&self.instance.type_name, &self.instance.id) {
                // A slot left behind by an earlier rollback is revived in place.
                Some(handle) if context.instance(handle)?.state() == InstanceState::Unresolved => handle,
                _ => context.create_with_id(&self.instance.type_name, &self.instance.id)?,
            },
        };
        context.ensure_initialized(handle)?;
        transaction.register(self.instance.clone(), handle);
        Ok(())
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        let handle = transaction.ensure_instance(context, &self.instance)?;
        context.unresolve(handle)
    }
}
