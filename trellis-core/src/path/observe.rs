//! Path subscriptions and change propagation.
//!
//! Compiled paths are shared, but which paths are being watched is per
//! context. The registry maps each observed property to the steps interested
//! in it. A path's steps are registered when it gains its first subscriber
//! and removed with its last.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;
use tracing::trace;

use super::{PathDefinition, PathId, StepIndex};
use crate::context::GraphContext;
use crate::error::GraphResult;
use crate::instance::InstanceId;
use crate::model::PropertyId;
use crate::subscriber::{SubscriptionId, Subscribers};

/// Delivered to path subscribers once per affected root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChange {
    pub path: PathId,
    pub root: InstanceId,
}

/// Handle returned by [`GraphContext::subscribe_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSubscription {
    path: PathId,
    id: SubscriptionId,
}

impl PathSubscription {
    pub fn path(&self) -> PathId {
        self.path
    }
}

type PathHandler = Box<dyn FnMut(&mut GraphContext, &PathChange)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepRef {
    path: PathId,
    step: StepIndex,
}

struct PathState {
    definition: Arc<PathDefinition>,
    handlers: Subscribers<PathHandler>,
}

#[derive(Default)]
pub(crate) struct PathRegistry {
    states: HashMap<PathId, PathState>,
    observers: HashMap<PropertyId, SmallVec<[StepRef; 4]>>,
    dirty: IndexSet<(PathId, InstanceId)>,
    flush_scheduled: bool,
}

impl PathRegistry {
    fn register_steps(&mut self, definition: &PathDefinition) {
        for (step, details) in definition.steps.iter().enumerate() {
            self.observers.entry(details.property).or_default().push(StepRef {
                path: definition.id,
                step,
            });
        }
    }

    fn unregister_steps(&mut self, path: PathId) {
        self.observers.retain(|_, steps| {
            steps.retain(|step| step.path != path);
            !steps.is_empty()
        });
        self.dirty.retain(|(dirty, _)| *dirty != path);
    }
}

impl GraphContext {
    /// Compile `text` against the type named `type_name`.
    pub fn path(&self, type_name: &str, text: &str) -> GraphResult<Arc<PathDefinition>> {
        self.schema.path_by_name(type_name, text)
    }

    /// Every instance reachable from `root` along `path`, root included.
    pub fn get_graph(&self, path: &PathDefinition, root: InstanceId) -> GraphResult<IndexSet<InstanceId>> {
        self.instance(root)?;
        let mut reached = IndexSet::new();
        reached.insert(root);
        let mut visited = HashSet::new();
        for &step in &path.first {
            self.walk_forward(path, step, root, &mut reached, &mut visited);
        }
        Ok(reached)
    }

    /// Like [`get_graph`](Self::get_graph) without the root itself.
    pub fn get_instances(&self, path: &PathDefinition, root: InstanceId) -> GraphResult<IndexSet<InstanceId>> {
        let mut reached = self.get_graph(path, root)?;
        reached.shift_remove(&root);
        Ok(reached)
    }

    fn step_matches(&self, path: &PathDefinition, step: StepIndex, instance: InstanceId) -> bool {
        let details = &path.steps[step];
        let type_id = self.instances[instance.index()].type_id;
        let declaring = self.schema.property(details.property).declaring_type();
        self.schema.is_a(type_id, declaring)
            && details.filter.map_or(true, |filter| self.schema.is_a(type_id, filter))
    }

    fn walk_forward(
        &self,
        path: &PathDefinition,
        step: StepIndex,
        instance: InstanceId,
        reached: &mut IndexSet<InstanceId>,
        visited: &mut HashSet<(StepIndex, InstanceId)>,
    ) {
        if !visited.insert((step, instance)) || !self.step_matches(path, step, instance) {
            return;
        }
        let details = &path.steps[step];
        if !self.schema.property(details.property).is_reference() {
            return;
        }
        for edge in self.instances[instance.index()].out_references.get(details.property) {
            let child = edge.child;
            let child_type = self.instances[child.index()].type_id;
            if details.target.is_some_and(|target| !self.schema.is_a(child_type, target)) {
                continue;
            }
            reached.insert(child);
            for &next in &details.next {
                self.walk_forward(path, next, child, reached, visited);
            }
        }
    }

    /// Call `handler` whenever the part of the graph `path` covers changes
    /// below some root.
    pub fn subscribe_path(
        &mut self,
        path: &Arc<PathDefinition>,
        handler: impl FnMut(&mut GraphContext, &PathChange) + 'static,
    ) -> PathSubscription {
        let state = self.paths.states.entry(path.id).or_insert_with(|| PathState {
            definition: Arc::clone(path),
            handlers: Subscribers::default(),
        });
        let first = state.handlers.is_empty();
        let id = state.handlers.insert(Box::new(handler));
        if first {
            self.paths.register_steps(path);
            trace!(path = path.text(), "path observed");
        }
        PathSubscription { path: path.id, id }
    }

    pub fn unsubscribe_path(&mut self, subscription: PathSubscription) -> bool {
        let Some(state) = self.paths.states.get_mut(&subscription.path) else {
            return false;
        };
        let removed = state.handlers.remove(subscription.id);
        if state.handlers.is_empty() {
            self.paths.states.remove(&subscription.path);
            self.paths.unregister_steps(subscription.path);
        }
        removed
    }

    /// Property `property` of `instance` changed. Walk back from every step
    /// observing it and mark the roots reached as dirty.
    pub(crate) fn notify_observers(&mut self, instance: InstanceId, property: PropertyId) {
        let Some(steps) = self.paths.observers.get(&property) else {
            return;
        };
        if instance.index() >= self.instances.len() {
            return;
        }
        let steps = steps.clone();

        let mut marked = false;
        for step in steps {
            let Some(state) = self.paths.states.get(&step.path) else {
                continue;
            };
            let definition = Arc::clone(&state.definition);
            let mut roots = IndexSet::new();
            let mut visited = HashSet::new();
            self.walk_back(&definition, step.step, instance, &mut roots, &mut visited);
            for root in roots {
                marked |= self.paths.dirty.insert((step.path, root));
            }
        }

        if marked && !self.paths.flush_scheduled {
            self.paths.flush_scheduled = true;
            self.on_scope_exit(GraphContext::flush_paths);
        }
    }

    fn walk_back(
        &self,
        path: &PathDefinition,
        step: StepIndex,
        instance: InstanceId,
        roots: &mut IndexSet<InstanceId>,
        visited: &mut HashSet<(StepIndex, InstanceId)>,
    ) {
        if !visited.insert((step, instance)) || !self.step_matches(path, step, instance) {
            return;
        }
        let type_id = self.instances[instance.index()].type_id;
        let Some(previous) = path.steps[step].previous else {
            if self.schema.is_a(type_id, path.root) {
                roots.insert(instance);
            }
            return;
        };
        let previous_step = &path.steps[previous];
        if previous_step.target.is_some_and(|target| !self.schema.is_a(type_id, target)) {
            return;
        }
        for edge in self.instances[instance.index()].in_references.get(previous_step.property) {
            self.walk_back(path, previous, edge.parent, roots, visited);
        }
    }

    /// Deliver every dirty `(path, root)` pair once.
    fn flush_paths(&mut self) {
        self.paths.flush_scheduled = false;
        let dirty: Vec<(PathId, InstanceId)> = self.paths.dirty.drain(..).collect();
        trace!(changes = dirty.len(), "path flush");

        for (path, root) in dirty {
            let Some(state) = self.paths.states.get(&path) else {
                continue;
            };
            let change = PathChange { path, root };
            for id in state.handlers.snapshot() {
                let Some(mut handler) = self.paths.states.get_mut(&path).and_then(|state| state.handlers.take(id)) else {
                    continue;
                };
                handler(self, &change);
                if let Some(state) = self.paths.states.get_mut(&path) {
                    state.handlers.restore(id, handler);
                }
            }
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
            .add(TypeDef::new("Order").value("code").list("lines", "Line"))
            .unwrap()
            .add(TypeDef::new("Line").value("qty").reference("product", "Product"))
            .unwrap()
            .add(TypeDef::new("Product").value("name"))
            .unwrap();
        GraphContext::new(builder.build().unwrap())
    }

    fn recorder(ctx: &mut GraphContext, path: &Arc<PathDefinition>) -> Rc<RefCell<Vec<InstanceId>>> {
        let roots = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&roots);
        ctx.subscribe_path(path, move |_, change| sink.borrow_mut().push(change.root));
        roots
    }

    #[test]
    fn shared_product_notifies_every_order() {
        let mut ctx = context();
        let product = ctx.create("Product").unwrap();
        let mut orders = Vec::new();
        for _ in 0..2 {
            let order = ctx.create("Order").unwrap();
            let line = ctx.create("Line").unwrap();
            ctx.list_add(order, "lines", line).unwrap();
            ctx.set_reference(line, "product", Some(product)).unwrap();
            orders.push(order);
        }
        let path = ctx.path("Order", "lines.product.name").unwrap();
        let roots = recorder(&mut ctx, &path);

        ctx.set_value(product, "name", "widget").unwrap();
        assert_eq!(*roots.borrow(), orders);
    }

    #[test]
    fn batched_changes_deliver_once_per_root() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        ctx.list_add(order, "lines", line).unwrap();
        let path = ctx.path("Order", "lines.qty").unwrap();
        let roots = recorder(&mut ctx, &path);

        ctx.with_scope(|ctx| {
            ctx.set_value(line, "qty", 1).unwrap();
            ctx.set_value(line, "qty", 2).unwrap();
            let extra = ctx.create("Line").unwrap();
            ctx.list_add(order, "lines", extra).unwrap();
        });
        assert_eq!(*roots.borrow(), vec![order]);
    }

    #[test]
    fn unrelated_properties_do_not_notify() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        ctx.list_add(order, "lines", line).unwrap();
        let path = ctx.path("Order", "lines.qty").unwrap();
        let roots = recorder(&mut ctx, &path);

        ctx.set_value(order, "code", "x").unwrap();
        let stray = ctx.create("Line").unwrap();
        ctx.set_value(stray, "qty", 3).unwrap();
        assert!(roots.borrow().is_empty());
    }

    #[test]
    fn last_unsubscribe_stops_observation() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let path = ctx.path("Order", "code").unwrap();
        let roots = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&roots);
        let subscription = ctx.subscribe_path(&path, move |_, _| *sink.borrow_mut() += 1);

        ctx.set_value(order, "code", "a").unwrap();
        assert!(ctx.unsubscribe_path(subscription));
        ctx.set_value(order, "code", "b").unwrap();

        assert_eq!(*roots.borrow(), 1);
        assert!(ctx.paths.observers.is_empty());
    }

    #[test]
    fn forward_materialization_excludes_unreached() {
        let mut ctx = context();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("Line").unwrap();
        let product = ctx.create("Product").unwrap();
        ctx.list_add(order, "lines", line).unwrap();
        ctx.set_reference(line, "product", Some(product)).unwrap();

        let lines = ctx.path("Order", "lines").unwrap();
        assert_eq!(ctx.get_graph(&lines, order).unwrap().len(), 2);
        let deep = ctx.path("Order", "lines.product").unwrap();
        let reached: Vec<_> = ctx.get_instances(&deep, order).unwrap().into_iter().collect();
        assert_eq!(reached, vec![line, product]);
    }
}
