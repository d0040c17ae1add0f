//! Transactions
//!
//! A [`GraphTransaction`] is an ordered log of transacted events plus a map
//! from placeholder references to the instances they resolved to. While
//! recording, the context appends every transacted event it raises.
//!
//! # Replay
//!
//! - `perform` replays events in recorded order inside one scope.
//! - `commit` and `rollback` run in reverse order, so children settle before
//!   their ancestors.
//! - A failure stops the replay where it happened. Events already applied
//!   stay applied; the scope is still closed and recording still stopped.
//!
//! # Placeholders
//!
//! Events refer to instances by type name and id. Real ids are looked up in
//! the context. Placeholder ids are meaningful only to the context that
//! issued them: they resolve through the log's map, filled from `InitNew`
//! events, and otherwise through the context the log was recorded in. A log
//! replayed anywhere else fails with `UnresolvedInstance`.
//!
//! # Example
//!
//! ```ignore
//! let mut tx = ctx.begin_transaction();
//! ctx.set_value(order, "code", "A-1")?;
//! tx.rollback(&mut ctx)?;
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{ContextId, GraphContext, Recorder};
use crate::error::{GraphError, GraphResult};
use crate::event::{GraphEvent, Transacted};
use crate::instance::{InstanceId, InstanceRef};

/// A recorded, replayable sequence of events.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GraphTransaction {
    events: Vec<GraphEvent>,
    #[serde(skip)]
    instances: HashMap<InstanceRef, InstanceId>,
    #[serde(skip)]
    context: Option<ContextId>,
    #[serde(skip)]
    origin: Option<ContextId>,
    #[serde(skip)]
    recorder: Option<Recorder>,
}

impl GraphTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// An inactive, unbound log holding `events`.
    pub fn from_events(events: Vec<GraphEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn events(&self) -> &[GraphEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether the log is currently recording.
    pub fn is_active(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    // Recording

    /// Start appending the context's transacted events.
    pub fn record(&mut self, context: &mut GraphContext) -> GraphResult<()> {
        if self.is_active() {
            return Err(GraphError::TransactionActive);
        }
        if self.context.is_some_and(|bound| bound != context.id()) {
            return Err(GraphError::ContextMismatch);
        }
        self.context = Some(context.id());
        self.origin.get_or_insert(context.id());
        self.recorder = Some(context.start_recording());
        debug!(events = self.events.len(), "transaction recording");
        Ok(())
    }

    /// Stop recording and take over what the context collected. Does nothing
    /// on an inactive log.
    pub fn stop(&mut self, context: &mut GraphContext) -> GraphResult<()> {
        if self.recorder.is_none() {
            return Ok(());
        }
        if self.context != Some(context.id()) {
            return Err(GraphError::ContextMismatch);
        }
        let Some(recorder) = self.recorder.take() else {
            return Ok(());
        };
        let recorded = context.stop_recording(&recorder);
        for event in &recorded {
            if let GraphEvent::InitNew(init) = event {
                if let Some(handle) = context.find(&init.instance.type_name, &init.instance.id) {
                    self.instances.insert(init.instance.clone(), handle);
                }
            }
        }
        debug!(recorded = recorded.len(), total = self.events.len() + recorded.len(), "transaction stopped");
        self.events.extend(recorded);
        Ok(())
    }

    // Resolution

    pub(crate) fn mapped(&self, instance: &InstanceRef) -> Option<InstanceId> {
        self.instances.get(instance).copied()
    }

    pub(crate) fn register(&mut self, instance: InstanceRef, handle: InstanceId) {
        self.instances.insert(instance, handle);
    }

    /// Resolve an event's instance reference in `context`.
    pub fn ensure_instance(&mut self, context: &mut GraphContext, instance: &InstanceRef) -> GraphResult<InstanceId> {
        if let Some(handle) = self.mapped(instance) {
            return Ok(handle);
        }
        if context.config().is_placeholder(&instance.id) {
            let handle = (self.origin == Some(context.id()))
                .then(|| context.find(&instance.type_name, &instance.id))
                .flatten()
                .ok_or_else(|| GraphError::unresolved(&instance.type_name, &instance.id))?;
            self.register(instance.clone(), handle);
            return Ok(handle);
        }
        match context.find(&instance.type_name, &instance.id) {
            Some(handle) => Ok(handle),
            None => context.placeholder(&instance.type_name, &instance.id),
        }
    }

    /// Handles are per context: replaying elsewhere starts a fresh map.
    fn bind(&mut self, context: &GraphContext) {
        if self.context != Some(context.id()) {
            if self.context.is_some() {
                self.instances.clear();
            }
            self.context = Some(context.id());
        }
    }

    // Replay

    /// Re-apply every event in recorded order inside a single scope.
    pub fn perform(&mut self, context: &mut GraphContext) -> GraphResult<()> {
        if self.is_active() {
            return Err(GraphError::TransactionActive);
        }
        self.bind(context);
        debug!(events = self.events.len(), "transaction perform");
        let token = context.enter_scope();
        let result = self.replay(context);
        context.exit_scope(token);
        result
    }

    /// Replay this log, then run `operation`, and return a new log holding
    /// only what the operation and its deferred cascades raised.
    pub fn perform_with(
        &mut self,
        context: &mut GraphContext,
        operation: impl FnOnce(&mut GraphContext) -> GraphResult<()>,
    ) -> GraphResult<GraphTransaction> {
        if self.is_active() {
            return Err(GraphError::TransactionActive);
        }
        self.bind(context);
        let mut next = GraphTransaction::new();

        let token = context.enter_scope();
        let result = self.replay(context).and_then(|()| {
            self.chain(&mut next);
            next.record(context)?;
            operation(context)
        });
        context.exit_scope(token);
        next.stop(context)?;
        result.map(|()| next)
    }

    fn replay(&mut self, context: &mut GraphContext) -> GraphResult<()> {
        let events = std::mem::take(&mut self.events);
        let result = events.iter().try_for_each(|event| event.perform(context, self));
        self.events = events;
        result
    }

    /// Stop recording and finalize every event, last first.
    pub fn commit(&mut self, context: &mut GraphContext) -> GraphResult<()> {
        self.stop(context)?;
        self.bind(context);
        debug!(events = self.events.len(), "transaction commit");
        self.unwind(context, |event, context, transaction| event.commit(context, transaction))
    }

    /// Stop recording and undo every event, last first.
    pub fn rollback(&mut self, context: &mut GraphContext) -> GraphResult<()> {
        self.stop(context)?;
        self.bind(context);
        debug!(events = self.events.len(), "transaction rollback");
        self.unwind(context, |event, context, transaction| event.rollback(context, transaction))
    }

    fn unwind(
        &mut self,
        context: &mut GraphContext,
        step: impl Fn(&GraphEvent, &mut GraphContext, &mut GraphTransaction) -> GraphResult<()>,
    ) -> GraphResult<()> {
        let events = std::mem::take(&mut self.events);
        let token = context.enter_scope();
        let result = events.iter().rev().try_for_each(|event| step(event, context, self));
        context.exit_scope(token);
        self.events = events;
        result
    }

    // Composition

    /// Merge adjacent changes to the same property and drop events that no
    /// longer change anything.
    pub fn condense(&mut self) {
        let before = self.events.len();
        let mut condensed: Vec<GraphEvent> = Vec::with_capacity(before);
        for event in std::mem::take(&mut self.events).into_iter().rev() {
            // `condensed` is built back to front: its last entry follows `event`.
            let merged = condensed.last().and_then(|later| event.merge(later));
            match merged {
                Some(merged) => {
                    condensed.pop();
                    if merged.is_valid() {
                        condensed.push(merged);
                    }
                }
                None if event.is_valid() => condensed.push(event),
                None => {}
            }
        }
        condensed.reverse();
        self.events = condensed;
        debug!(before, after = self.events.len(), "transaction condensed");
    }

    /// Hand this log's placeholder map to the log that follows it.
    pub fn chain(&self, next: &mut GraphTransaction) {
        for (instance, handle) in &self.instances {
            next.instances.entry(instance.clone()).or_insert(*handle);
        }
        if next.context.is_none() {
            next.context = self.context;
        }
        if next.origin.is_none() {
            next.origin = self.origin;
        }
    }

    /// Concatenate logs recorded side by side into one.
    pub fn combine(logs: impl IntoIterator<Item = GraphTransaction>) -> GraphResult<GraphTransaction> {
        let mut combined = GraphTransaction::new();
        for log in logs {
            if log.is_active() {
                return Err(GraphError::CombineRejected {
                    reason: "a log is still recording".to_string(),
                });
            }
            match (combined.context, log.context) {
                (Some(left), Some(right)) if left != right => {
                    return Err(GraphError::CombineRejected {
                        reason: "logs belong to different contexts".to_string(),
                    })
                }
                (None, right) => combined.context = right,
                _ => {}
            }
            if combined.origin.is_none() {
                combined.origin = log.origin;
            }
            combined.instances.extend(log.instances);
            combined.events.extend(log.events);
        }
        Ok(combined)
    }

    /// Append an inactive log recorded after this one.
    pub fn append(&mut self, other: GraphTransaction) -> GraphResult<()> {
        if self.is_active() || other.is_active() {
            return Err(GraphError::TransactionActive);
        }
        if let (Some(left), Some(right)) = (self.context, other.context) {
            if left != right {
                return Err(GraphError::ContextMismatch);
            }
        }
        if self.context.is_none() {
            self.context = other.context;
        }
        if self.origin.is_none() {
            self.origin = other.origin;
        }
        for (instance, handle) in other.instances {
            self.instances.entry(instance).or_insert(handle);
        }
        self.events.extend(other.events);
        Ok(())
    }

    // Encoding

    pub fn to_msgpack(&self) -> GraphResult<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|err| GraphError::Encoding(err.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> GraphResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|err| GraphError::Encoding(err.to_string()))
    }
}

impl GraphContext {
    /// A new log, already recording this context.
    pub fn begin_transaction(&mut self) -> GraphTransaction {
        GraphTransaction {
            context: Some(self.id()),
            origin: Some(self.id()),
            recorder: Some(self.start_recording()),
            ..GraphTransaction::default()
        }
    }

    /// Record into a guard that rolls back when dropped unfinished.
    pub fn transaction(&mut self) -> TransactionScope<'_> {
        let transaction = self.begin_transaction();
        TransactionScope {
            context: self,
            transaction: Some(transaction),
        }
    }
}

/// A recording transaction tied to a borrowed context.
///
/// Dereferences to the context so mutations go through the guard. Dropping
/// it without calling [`commit`](Self::commit), [`rollback`](Self::rollback)
/// or [`complete`](Self::complete) rolls the changes back.
pub struct TransactionScope<'a> {
    context: &'a mut GraphContext,
    transaction: Option<GraphTransaction>,
}

impl TransactionScope<'_> {
    /// Commit and return the finished log.
    pub fn commit(mut self) -> GraphResult<GraphTransaction> {
        let mut transaction = self.transaction.take().unwrap_or_default();
        transaction.commit(self.context)?;
        Ok(transaction)
    }

    /// Roll back and return the log.
    pub fn rollback(mut self) -> GraphResult<GraphTransaction> {
        let mut transaction = self.transaction.take().unwrap_or_default();
        transaction.rollback(self.context)?;
        Ok(transaction)
    }

    /// Stop recording and return the log without committing or rolling back.
    pub fn complete(mut self) -> GraphResult<GraphTransaction> {
        let mut transaction = self.transaction.take().unwrap_or_default();
        transaction.stop(self.context)?;
        Ok(transaction)
    }
}

impl Deref for TransactionScope<'_> {
    type Target = GraphContext;

    fn deref(&self) -> &GraphContext {
        &*self.context
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut GraphContext {
        &mut *self.context
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if let Some(mut transaction) = self.transaction.take() {
            if let Err(err) = transaction.rollback(self.context) {
                warn!(%err, "implicit rollback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{InitEvent, ValueChangeEvent};
    use crate::model::{SchemaBuilder, TypeDef, Value};

    fn context() -> GraphContext {
        let mut builder = SchemaBuilder::new();
        builder
            .add(TypeDef::new("Order").value("code").list("lines", "Line"))
            .unwrap()
            .add(TypeDef::new("Line").value("qty"))
            .unwrap();
        GraphContext::new(builder.build().unwrap())
    }

    fn change(id: &str, old: i64, new: i64) -> GraphEvent {
        GraphEvent::ValueChange(ValueChangeEvent {
            instance: InstanceRef::new("Line", id),
            property: "qty".to_string(),
            old_value: Value::from(old),
            new_value: Value::from(new),
        })
    }

    #[test]
    fn only_transacted_events_are_recorded() {
        let mut ctx = context();
        let order = ctx.load("Order", "1", [("code", Value::from("A"))]).unwrap();
        let mut tx = ctx.begin_transaction();
        ctx.get_value(order, "code").unwrap();
        ctx.set_value(order, "code", "B").unwrap();
        tx.stop(&mut ctx).unwrap();

        let kinds: Vec<_> = tx.events().iter().map(GraphEvent::to_string).collect();
        assert_eq!(kinds, vec!["value-change Order|1.code"]);
    }

    #[test]
    fn record_twice_is_rejected() {
        let mut ctx = context();
        let mut tx = ctx.begin_transaction();
        assert_eq!(tx.record(&mut ctx), Err(GraphError::TransactionActive));

        let mut other = context();
        tx.stop(&mut ctx).unwrap();
        assert_eq!(tx.record(&mut other), Err(GraphError::ContextMismatch));
    }

    #[test]
    fn condense_merges_runs_and_drops_no_ops() {
        let mut tx = GraphTransaction::from_events(vec![
            change("1", 1, 2),
            change("1", 2, 3),
            change("2", 5, 6),
            change("2", 6, 5),
            change("1", 3, 3),
        ]);
        tx.condense();
        assert_eq!(tx.events(), &[change("1", 1, 3)]);
    }

    #[test]
    fn placeholder_without_mapping_is_unresolved() {
        let mut ctx = context();
        let mut tx = GraphTransaction::from_events(vec![change("?5", 0, 1)]);
        assert_eq!(
            tx.perform(&mut ctx),
            Err(GraphError::UnresolvedInstance {
                type_name: "Line".to_string(),
                id: "?5".to_string()
            })
        );
    }

    #[test]
    fn instances_created_before_recording_roll_back() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();

        let mut tx = ctx.begin_transaction();
        ctx.list_add(order, "lines", line).unwrap();
        ctx.set_value(line, "qty", 2).unwrap();
        tx.rollback(&mut ctx).unwrap();

        assert_eq!(ctx.peek_value(line, "qty").unwrap(), Value::Null);
        assert!(ctx.get_list(order, "lines").unwrap().is_empty());

        tx.perform(&mut ctx).unwrap();
        assert_eq!(ctx.peek_value(line, "qty").unwrap(), Value::from(2));
        assert_eq!(ctx.get_list(order, "lines").unwrap(), vec![line]);
    }

    #[test]
    fn foreign_placeholders_stay_unresolved() {
        let mut ctx = context();
        let line = ctx.create("Line").unwrap();
        let mut tx = ctx.begin_transaction();
        ctx.set_value(line, "qty", 2).unwrap();
        tx.stop(&mut ctx).unwrap();

        let mut other = context();
        other.create("Line").unwrap();
        let mut decoded = GraphTransaction::from_msgpack(&tx.to_msgpack().unwrap()).unwrap();
        assert!(matches!(
            decoded.perform(&mut other),
            Err(GraphError::UnresolvedInstance { .. })
        ));
    }

    #[test]
    fn perform_failure_keeps_earlier_effects() {
        let mut ctx = context();
        let mut tx = GraphTransaction::from_events(vec![
            GraphEvent::InitNew(InitEvent {
                instance: InstanceRef::new("Line", "?1"),
            }),
            change("?1", 0, 4),
            change("?9", 0, 1),
        ]);
        assert!(tx.perform(&mut ctx).is_err());
        let line = ctx.find("Line", "?1").unwrap();
        assert_eq!(ctx.peek_value(line, "qty").unwrap(), Value::from(4));
        assert_eq!(tx.len(), 3);
        assert_eq!(ctx.scope_depth(), 0);
    }

    #[test]
    fn combine_rejects_active_and_foreign_logs() {
        let mut first = context();
        let mut second = context();
        let active = first.begin_transaction();
        assert!(matches!(
            GraphTransaction::combine([active]),
            Err(GraphError::CombineRejected { .. })
        ));

        let mut left = first.begin_transaction();
        left.stop(&mut first).unwrap();
        let mut right = second.begin_transaction();
        right.stop(&mut second).unwrap();
        assert!(matches!(
            GraphTransaction::combine([left, right]),
            Err(GraphError::CombineRejected { .. })
        ));
    }

    #[test]
    fn msgpack_round_trip_is_unbound() {
        let mut ctx = context();
        let mut tx = ctx.begin_transaction();
        let line = ctx.create("Line").unwrap();
        ctx.set_value(line, "qty", 3).unwrap();
        tx.stop(&mut ctx).unwrap();

        let decoded = GraphTransaction::from_msgpack(&tx.to_msgpack().unwrap()).unwrap();
        assert_eq!(decoded.events(), tx.events());
        assert!(!decoded.is_active());
        assert_eq!(decoded.context(), None);
    }
}
