use serde::{Deserialize, Serialize};

use super::Transacted;
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceRef;
use crate::transaction::GraphTransaction;

/// Domain-specific notification with an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub instance: InstanceRef,
    pub name: String,
    pub data: serde_json::Value,
    pub transacted: bool,
}

/// Replay behaviour for transacted custom events, registered on a context
/// under the event name.
pub trait CustomHandler {
    fn perform(&self, context: &mut GraphContext, event: &CustomEvent) -> GraphResult<()>;

    fn commit(&self, _context: &mut GraphContext, _event: &CustomEvent) -> GraphResult<()> {
        Ok(())
    }

    fn rollback(&self, context: &mut GraphContext, event: &CustomEvent) -> GraphResult<()>;
}

impl Transacted for CustomEvent {
    fn perform(&self, context: &mut GraphContext, _transaction: &mut GraphTransaction) -> GraphResult<()> {
        match context.custom_handler(&self.name) {
            Some(handler) => handler.perform(context, self),
            None => Ok(()),
        }
    }

    fn commit(&self, context: &mut GraphContext, _transaction: &mut GraphTransaction) -> GraphResult<()> {
        match context.custom_handler(&self.name) {
            Some(handler) => handler.commit(context, self),
            None => Ok(()),
        }
    }

    fn rollback(&self, context: &mut GraphContext, _transaction: &mut GraphTransaction) -> GraphResult<()> {
        match context.custom_handler(&self.name) {
            Some(handler) => handler.rollback(context, self),
            None => Ok(()),
        }
    }
}
