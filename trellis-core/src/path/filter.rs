//! Graph filters.
//!
//! A filter keeps the union of several paths' reachable sets for one root.
//! Path changes only mark it dirty; the set is recomputed once, after the
//! outermost scope exits, and the handler hears about the difference.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::debug;

use super::{PathChange, PathDefinition, PathSubscription};
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceId;

/// Identity of a filter within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

/// Difference between two consecutive results of a filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChange {
    pub added: Vec<InstanceId>,
    pub removed: Vec<InstanceId>,
}

type FilterHandler = Box<dyn FnMut(&mut GraphContext, &FilterChange)>;

struct FilterState {
    root: InstanceId,
    paths: Vec<Arc<PathDefinition>>,
    subscriptions: Vec<PathSubscription>,
    instances: IndexSet<InstanceId>,
    dirty: bool,
    on_changed: Option<FilterHandler>,
}

#[derive(Default)]
pub(crate) struct FilterRegistry {
    filters: HashMap<FilterId, FilterState>,
    next: u64,
}

impl GraphContext {
    /// Track everything reachable from `root` along any of `paths`.
    pub fn create_filter(
        &mut self,
        root: InstanceId,
        paths: &[&str],
        on_changed: impl FnMut(&mut GraphContext, &FilterChange) + 'static,
    ) -> GraphResult<FilterId> {
        let root_type = self.instance(root)?.type_id;
        let paths = paths
            .iter()
            .map(|text| self.schema.path(root_type, text))
            .collect::<GraphResult<Vec<_>>>()?;
        let instances = self.filter_union(&paths, root)?;

        self.filters.next += 1;
        let id = FilterId(self.filters.next);
        let subscriptions = paths
            .iter()
            .map(|path| self.subscribe_path(path, move |ctx, change| ctx.filter_path_changed(id, change)))
            .collect();
        self.filters.filters.insert(
            id,
            FilterState {
                root,
                paths,
                subscriptions,
                instances,
                dirty: false,
                on_changed: Some(Box::new(on_changed)),
            },
        );
        Ok(id)
    }

    /// Current result of a filter, root included.
    pub fn filter_instances(&self, id: FilterId) -> Option<&IndexSet<InstanceId>> {
        self.filters.filters.get(&id).map(|state| &state.instances)
    }

    pub fn dispose_filter(&mut self, id: FilterId) -> bool {
        let Some(state) = self.filters.filters.remove(&id) else {
            return false;
        };
        for subscription in state.subscriptions {
            self.unsubscribe_path(subscription);
        }
        true
    }

    fn filter_union(&self, paths: &[Arc<PathDefinition>], root: InstanceId) -> GraphResult<IndexSet<InstanceId>> {
        let mut union = IndexSet::new();
        for path in paths {
            union.extend(self.get_graph(path, root)?);
        }
        Ok(union)
    }

    fn filter_path_changed(&mut self, id: FilterId, change: &PathChange) {
        let Some(state) = self.filters.filters.get_mut(&id) else {
            return;
        };
        if change.root != state.root || state.dirty {
            return;
        }
        state.dirty = true;
        self.on_scope_exit(move |ctx| ctx.refresh_filter(id));
    }

    fn refresh_filter(&mut self, id: FilterId) {
        let Some(state) = self.filters.filters.get_mut(&id) else {
            return;
        };
        state.dirty = false;
        let (root, paths) = (state.root, state.paths.clone());

        let current = match self.filter_union(&paths, root) {
            Ok(current) => current,
            Err(err) => {
                debug!(%err, "filter root no longer reachable");
                IndexSet::new()
            }
        };
        let Some(state) = self.filters.filters.get_mut(&id) else {
            return;
        };
        let change = FilterChange {
            added: current.difference(&state.instances).copied().collect(),
            removed: state.instances.difference(&current).copied().collect(),
        };
        if change.added.is_empty() && change.removed.is_empty() {
            return;
        }
        state.instances = current;
        debug!(added = change.added.len(), removed = change.removed.len(), "filter changed");

        let Some(mut handler) = state.on_changed.take() else {
            return;
        };
        handler(self, &change);
        if let Some(state) = self.filters.filters.get_mut(&id) {
            state.on_changed = Some(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::model::{SchemaBuilder, TypeDef};

    fn context() -> GraphContext {
        let mut builder = SchemaBuilder::new();
        builder
            .add(TypeDef::new("Order").list("lines", "Line").reference("customer", "Customer"))
            .unwrap()
            .add(TypeDef::new("Line").value("qty"))
            .unwrap()
            .add(TypeDef::new("Customer").value("name"))
            .unwrap();
        GraphContext::new(builder.build().unwrap())
    }

    #[test]
    fn reports_exact_difference_once_per_batch() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let kept = ctx.create("Line").unwrap();
        let dropped = ctx.create("Line").unwrap();
        ctx.list_add(order, "lines", kept).unwrap();
        ctx.list_add(order, "lines", dropped).unwrap();

        let changes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&changes);
        let filter = ctx
            .create_filter(order, &["lines", "customer"], move |_, change| sink.borrow_mut().push(change.clone()))
            .unwrap();
        assert_eq!(ctx.filter_instances(filter).unwrap().len(), 3);

        let (added, customer) = ctx.with_scope(|ctx| {
            let added = ctx.create("Line").unwrap();
            ctx.list_add(order, "lines", added).unwrap();
            ctx.list_remove(order, "lines", dropped).unwrap();
            let customer = ctx.create("Customer").unwrap();
            ctx.set_reference(order, "customer", Some(customer)).unwrap();
            (added, customer)
        });

        let changes = changes.borrow();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added, vec![added, customer]);
        assert_eq!(changes[0].removed, vec![dropped]);
    }

    #[test]
    fn value_changes_do_not_fire_when_set_is_stable() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        ctx.list_add(order, "lines", line).unwrap();

        let fired = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&fired);
        let filter = ctx
            .create_filter(order, &["lines.qty"], move |_, _| *sink.borrow_mut() += 1)
            .unwrap();
        ctx.set_value(line, "qty", 4).unwrap();
        assert_eq!(*fired.borrow(), 0);

        assert!(ctx.dispose_filter(filter));
        assert!(ctx.filter_instances(filter).is_none());
    }
}
