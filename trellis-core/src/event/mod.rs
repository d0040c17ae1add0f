//! Graph Events
//!
//! Every semantic change to a tracked instance is described by exactly one
//! [`GraphEvent`]. Events are broadcast to subscribers as they are raised,
//! appended to every recording transaction, and carry enough data (old and
//! new values, added and removed items) to be replayed or inverted later,
//! possibly against a different context.
//!
//! # Kinds
//!
//! | Kind | Transacted | Merges |
//! |---|---|---|
//! | `InitNew` | yes | no |
//! | `InitExisting` | no | no |
//! | `PropertyGet` | no | no |
//! | `ValueChange` | yes | with the next change of the same property |
//! | `ReferenceChange` | yes | with the next change of the same property |
//! | `ListChange` | yes | with the next change of the same list |
//! | `Delete` | yes | no |
//! | `Save` | yes | no (a barrier) |
//! | `Custom` | when flagged | no |
//!
//! Events identify instances by [`InstanceRef`] (type name plus id), never by
//! arena handle, so a recorded log can be serialized and performed elsewhere.
//!
//! # Validity
//!
//! Raising always broadcasts, even when a write did not change anything,
//! because subscribers may depend on the notification itself. Whether an
//! event changed anything is reported by [`GraphEvent::is_valid`] and only
//! consulted when a log is condensed.

mod custom;
mod delete;
mod init;
mod list;
mod reference;
mod save;
mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use custom::{CustomEvent, CustomHandler};
pub use delete::DeleteEvent;
pub use init::InitEvent;
pub use list::{ListChangeEvent, ListItem};
pub use reference::ReferenceChangeEvent;
pub use save::{IdChange, SaveEvent};
pub use value::{PropertyGetEvent, ValueChangeEvent};

use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceRef;
use crate::transaction::GraphTransaction;

/// Replay contract of events that can be recorded in a transaction.
pub trait Transacted {
    /// Apply the change again.
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction)
        -> GraphResult<()>;

    /// Finalize the change once the transaction is accepted.
    fn commit(&self, _context: &mut GraphContext, _transaction: &mut GraphTransaction) -> GraphResult<()> {
        Ok(())
    }

    /// Undo the change.
    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction)
        -> GraphResult<()>;
}

/// Discriminant of a [`GraphEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InitNew,
    InitExisting,
    PropertyGet,
    ValueChange,
    ReferenceChange,
    ListChange,
    Delete,
    Save,
    Custom,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::InitNew => "init-new",
            EventKind::InitExisting => "init-existing",
            EventKind::PropertyGet => "property-get",
            EventKind::ValueChange => "value-change",
            EventKind::ReferenceChange => "reference-change",
            EventKind::ListChange => "list-change",
            EventKind::Delete => "delete",
            EventKind::Save => "save",
            EventKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// One semantic change to one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphEvent {
    InitNew(InitEvent),
    InitExisting(InitEvent),
    PropertyGet(PropertyGetEvent),
    ValueChange(ValueChangeEvent),
    ReferenceChange(ReferenceChangeEvent),
    ListChange(ListChangeEvent),
    Delete(DeleteEvent),
    Save(SaveEvent),
    Custom(CustomEvent),
}

impl GraphEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GraphEvent::InitNew(_) => EventKind::InitNew,
            GraphEvent::InitExisting(_) => EventKind::InitExisting,
            GraphEvent::PropertyGet(_) => EventKind::PropertyGet,
            GraphEvent::ValueChange(_) => EventKind::ValueChange,
            GraphEvent::ReferenceChange(_) => EventKind::ReferenceChange,
            GraphEvent::ListChange(_) => EventKind::ListChange,
            GraphEvent::Delete(_) => EventKind::Delete,
            GraphEvent::Save(_) => EventKind::Save,
            GraphEvent::Custom(_) => EventKind::Custom,
        }
    }

    /// The instance the event belongs to.
    pub fn instance(&self) -> &InstanceRef {
        match self {
            GraphEvent::InitNew(event) | GraphEvent::InitExisting(event) => &event.instance,
            GraphEvent::PropertyGet(event) => &event.instance,
            GraphEvent::ValueChange(event) => &event.instance,
            GraphEvent::ReferenceChange(event) => &event.instance,
            GraphEvent::ListChange(event) => &event.instance,
            GraphEvent::Delete(event) => &event.instance,
            GraphEvent::Save(event) => &event.instance,
            GraphEvent::Custom(event) => &event.instance,
        }
    }

    /// Name of the property the event is about, if any.
    pub fn property(&self) -> Option<&str> {
        match self {
            GraphEvent::PropertyGet(event) => Some(&event.property),
            GraphEvent::ValueChange(event) => Some(&event.property),
            GraphEvent::ReferenceChange(event) => Some(&event.property),
            GraphEvent::ListChange(event) => Some(&event.property),
            _ => None,
        }
    }

    /// Whether transactions record this event.
    pub fn is_transacted(&self) -> bool {
        self.transacted().is_some()
    }

    pub fn transacted(&self) -> Option<&dyn Transacted> {
        match self {
            GraphEvent::InitNew(event) => Some(event),
            GraphEvent::ValueChange(event) => Some(event),
            GraphEvent::ReferenceChange(event) => Some(event),
            GraphEvent::ListChange(event) => Some(event),
            GraphEvent::Delete(event) => Some(event),
            GraphEvent::Save(event) => Some(event),
            GraphEvent::Custom(event) if event.transacted => Some(event),
            _ => None,
        }
    }

    /// Whether the event describes an actual change.
    pub fn is_valid(&self) -> bool {
        match self {
            GraphEvent::ValueChange(event) => event.is_valid(),
            GraphEvent::ReferenceChange(event) => event.is_valid(),
            GraphEvent::ListChange(event) => event.is_valid(),
            _ => true,
        }
    }

    /// Combine this event with the one immediately following it. Returns
    /// `None` when the two cannot be merged.
    pub fn merge(&self, later: &GraphEvent) -> Option<GraphEvent> {
        match (self, later) {
            (GraphEvent::ValueChange(earlier), GraphEvent::ValueChange(later)) => {
                earlier.merge(later).map(GraphEvent::ValueChange)
            }
            (GraphEvent::ReferenceChange(earlier), GraphEvent::ReferenceChange(later)) => {
                earlier.merge(later).map(GraphEvent::ReferenceChange)
            }
            (GraphEvent::ListChange(earlier), GraphEvent::ListChange(later)) => {
                earlier.merge(later).map(GraphEvent::ListChange)
            }
            _ => None,
        }
    }
}

impl Transacted for GraphEvent {
    fn perform(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        match self.transacted() {
            Some(event) => event.perform(context, transaction),
            None => Ok(()),
        }
    }

    fn commit(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        match self.transacted() {
            Some(event) => event.commit(context, transaction),
            None => Ok(()),
        }
    }

    fn rollback(&self, context: &mut GraphContext, transaction: &mut GraphTransaction) -> GraphResult<()> {
        match self.transacted() {
            Some(event) => event.rollback(context, transaction),
            None => Ok(()),
        }
    }
}

impl fmt::Display for GraphEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.property() {
            Some(property) => write!(f, "{} {}.{}", self.kind(), self.instance(), property),
            None => write!(f, "{} {}", self.kind(), self.instance()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    fn change(property: &str, old: &str, new: &str) -> GraphEvent {
        GraphEvent::ValueChange(ValueChangeEvent {
            instance: InstanceRef::new("Order", "1"),
            property: property.to_string(),
            old_value: Value::from(old),
            new_value: Value::from(new),
        })
    }

    #[test]
    fn transacted_classification() {
        let init = InitEvent {
            instance: InstanceRef::new("Order", "1"),
        };
        assert!(GraphEvent::InitNew(init.clone()).is_transacted());
        assert!(!GraphEvent::InitExisting(init).is_transacted());
        assert!(change("name", "a", "b").is_transacted());

        let custom = CustomEvent {
            instance: InstanceRef::new("Order", "1"),
            name: "audit".to_string(),
            data: serde_json::Value::Null,
            transacted: false,
        };
        assert!(!GraphEvent::Custom(custom).is_transacted());
    }

    #[test]
    fn merge_only_matching_kinds() {
        let first = change("name", "A", "B");
        let second = change("name", "B", "C");
        assert_eq!(first.merge(&second), Some(change("name", "A", "C")));

        assert_eq!(first.merge(&change("code", "x", "y")), None);

        let delete = GraphEvent::Delete(DeleteEvent {
            instance: InstanceRef::new("Order", "1"),
            is_pending_delete: true,
        });
        assert_eq!(first.merge(&delete), None);
    }

    #[test]
    fn display_names_kind_and_property() {
        assert_eq!(change("name", "a", "b").to_string(), "value-change Order|1.name");
    }
}
