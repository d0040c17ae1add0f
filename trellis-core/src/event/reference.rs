use serde::{Deserialize, Serialize};

use super::Transacted;
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceRef;
use crate::transaction::GraphTransaction;

/// A scalar reference property changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceChangeEvent {
    pub instance: InstanceRef,
    pub property: String,
    pub old_value: Option<InstanceRef>,
    pub new_value: Option<InstanceRef>,
}

impl ReferenceChangeEvent {
    pub fn is_valid(&self) -> bool {
        self.old_value != self.new_value
    }

    pub fn merge(&self, later: &ReferenceChangeEvent) -> Option<ReferenceChangeEvent> {
        if self.instance != later.instance || self.property != later.property {
            return None;
        }
        Some(ReferenceChangeEvent {
            instance: self.instance.clone(),
            property: self.property.clone(),
            old_value: self.old_value.clone(),
            new_value: later.new_value.clone(),
        })
    }

    fn apply(
        &self,
        context: &mut GraphContext,
        transaction: &mut GraphTransaction,
        target: Option<&InstanceRef>,
    ) -> GraphResult<()> {
        let handle = transaction.ensure_instance(context, &self.instance)?;
        let property = context.property_id(handle, &self.property)?;
        let child = target
            .map(|target| transaction.ensure_instance(context, target))
            .transpose()?;
        context.write_reference(handle, property, child)
    }
}

impl Transacted for ReferenceChangeEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        self.apply(context, transaction, self.new_value.as_ref())
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        self.apply(context, transaction, self.old_value.as_ref())
    }
}
