use serde::{Deserialize, Serialize};

use super::Transacted;
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceRef;
use crate::model::Value;
use crate::transaction::GraphTransaction;

/// First read of a property on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyGetEvent {
    pub instance: InstanceRef,
    pub property: String,
}

/// A scalar property changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChangeEvent {
    pub instance: InstanceRef,
    pub property: String,
    pub old_value: Value,
    pub new_value: Value,
}

impl ValueChangeEvent {
    pub fn is_valid(&self) -> bool {
        self.old_value != self.new_value
    }

    /// Keep the earliest old value and the latest new value.
    pub fn merge(&self, later: &ValueChangeEvent) -> Option<ValueChangeEvent> {
        if self.instance != later.instance || self.property != later.property {
            return None;
        }
        Some(ValueChangeEvent {
            instance: self.instance.clone(),
            property: self.property.clone(),
            old_value: self.old_value.clone(),
            new_value: later.new_value.clone(),
        })
    }

    fn apply(&self, context: &mut GraphContext, transaction: &mut GraphTransaction, value: &Value) -> GraphResult<()> {
        let handle = transaction.ensure_instance(context, &self.instance)?;
        let property = context.property_id(handle, &self.property)?;
        context.write_value(handle, property, value.clone())
    }
}

impl Transacted for ValueChangeEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        self.apply(context, transaction, &self.new_value)
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        self.apply(context, transaction, &self.old_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(old: Value, new: Value) -> ValueChangeEvent {
        ValueChangeEvent {
            instance: InstanceRef::new("Order", "1"),
            property: "total".to_string(),
            old_value: old,
            new_value: new,
        }
    }

    #[test]
    fn validity_is_null_aware() {
        assert!(!change(Value::Null, Value::Null).is_valid());
        assert!(change(Value::Null, Value::from(0)).is_valid());
        assert!(!change(Value::from(3), Value::from(3)).is_valid());
    }

    #[test]
    fn merge_back_to_start_is_invalid() {
        let merged = change(Value::from(1), Value::from(2))
            .merge(&change(Value::from(2), Value::from(1)))
            .unwrap();
        assert!(!merged.is_valid());
    }

    #[test]
    fn different_instances_do_not_merge() {
        let mut other = change(Value::from(2), Value::from(3));
        other.instance = InstanceRef::new("Order", "2");
        assert!(change(Value::from(1), Value::from(2)).merge(&other).is_none());
    }
}
