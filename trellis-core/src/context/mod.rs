//! Graph Context
//!
//! The context is the central coordinator: it owns the instance arena, the
//! id index, the event subscribers, the active transaction recorders, the
//! scope stack and the path registry. Every read and write goes through it.
//!
//! # How It Works
//!
//! 1. Instances are allocated in the arena on `create`, `load` or
//!    `placeholder`, and indexed by `(root type, id)`.
//!
//! 2. The first access to an instance initializes it, raising `InitNew` or
//!    `InitExisting`.
//!
//! 3. A mutation opens a scope, updates the arena and the reference indices,
//!    notifies path observers, and raises the describing event.
//!
//! 4. Raising appends the event to every recording transaction, then calls
//!    each subscriber in subscription order.
//!
//! 5. When the outermost scope closes, deferred work (path flushes, filter
//!    recomputation) runs.
//!
//! # Threading
//!
//! A context is single-threaded and re-entrant: handlers get `&mut
//! GraphContext` and may mutate the graph. The [`Schema`] behind it is shared
//! across threads, as is the lock guarding cached instances.

mod access;
mod lifecycle;
mod references;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::ContextConfig;
use crate::error::{GraphError, GraphResult};
use crate::event::{CustomHandler, GraphEvent};
use crate::instance::{GraphInstance, InstanceId, InstanceRef, InstanceState};
use crate::model::{PropertyId, Schema, TypeId, Value};
use crate::path::{FilterRegistry, PathRegistry};
use crate::scope::ScopeStack;
use crate::subscriber::{SubscriptionId, Subscribers};

/// Identity of a context, used to bind transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Buffer a recording transaction owns. The context keeps only a weak
/// handle, so dropping the transaction ends the recording.
pub(crate) type Recorder = Rc<RefCell<Vec<GraphEvent>>>;

/// Callback invoked for every raised event that passes its type filter.
pub type EventCallback = Box<dyn FnMut(&mut GraphContext, &GraphEvent)>;

struct EventHandler {
    filter: Option<TypeId>,
    callback: EventCallback,
}

/// An object graph under change tracking.
pub struct GraphContext {
    pub(crate) id: ContextId,
    pub(crate) schema: Arc<Schema>,
    pub(crate) config: ContextConfig,
    pub(crate) instances: Vec<GraphInstance>,
    pub(crate) index: HashMap<(TypeId, String), InstanceId>,
    pub(crate) next_placeholder: u64,
    pub(crate) statics: HashMap<PropertyId, Value>,
    pub(crate) scopes: ScopeStack,
    pub(crate) paths: PathRegistry,
    pub(crate) filters: FilterRegistry,
    subscribers: Subscribers<EventHandler>,
    pending: HashMap<SubscriptionId, VecDeque<GraphEvent>>,
    recorders: Vec<Weak<RefCell<Vec<GraphEvent>>>>,
    custom_handlers: HashMap<String, Rc<dyn CustomHandler>>,
    shared_lock: Arc<Mutex<()>>,
}

impl GraphContext {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_config(schema, ContextConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, config: ContextConfig) -> Self {
        Self::with_shared_lock(schema, config, Arc::new(Mutex::new(())))
    }

    /// Create a context that shares cached instances with other contexts
    /// guarded by `lock`.
    pub fn with_shared_lock(schema: Arc<Schema>, config: ContextConfig, lock: Arc<Mutex<()>>) -> Self {
        let id = ContextId::next();
        debug!(context = ?id, types = schema.types().count(), "context created");
        Self {
            id,
            schema,
            config,
            instances: Vec::new(),
            index: HashMap::new(),
            next_placeholder: 0,
            statics: HashMap::new(),
            scopes: ScopeStack::default(),
            paths: PathRegistry::default(),
            filters: FilterRegistry::default(),
            subscribers: Subscribers::default(),
            pending: HashMap::new(),
            recorders: Vec::new(),
            custom_handlers: HashMap::new(),
            shared_lock: lock,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    // Lookup

    pub fn instance(&self, handle: InstanceId) -> GraphResult<&GraphInstance> {
        self.instances
            .get(handle.index())
            .ok_or(GraphError::UnknownInstance(handle))
    }

    pub(crate) fn instance_mut(&mut self, handle: InstanceId) -> GraphResult<&mut GraphInstance> {
        self.instances
            .get_mut(handle.index())
            .ok_or(GraphError::UnknownInstance(handle))
    }

    /// Every slot of the arena, deleted ones included.
    pub fn instances(&self) -> impl Iterator<Item = &GraphInstance> {
        self.instances.iter()
    }

    /// Find an instance by type name and current or former id.
    pub fn find(&self, type_name: &str, id: &str) -> Option<InstanceId> {
        let root = self.schema.type_by_name(type_name)?.root();
        self.index.get(&(root, id.to_string())).copied()
    }

    /// Like [`find`](Self::find), failing with `UnresolvedInstance`.
    pub fn resolve(&self, instance: &InstanceRef) -> GraphResult<InstanceId> {
        self.find(&instance.type_name, &instance.id)
            .ok_or_else(|| GraphError::unresolved(&instance.type_name, &instance.id))
    }

    pub fn instance_ref(&self, handle: InstanceId) -> GraphResult<InstanceRef> {
        Ok(self.instance(handle)?.to_ref())
    }

    pub fn property_id(&self, handle: InstanceId, name: &str) -> GraphResult<PropertyId> {
        let type_id = self.instance(handle)?.type_id;
        Ok(self.schema.property_of(type_id, name)?.id())
    }

    /// Whether `handle` is of type `type_name` or derived from it.
    pub fn is_a(&self, handle: InstanceId, type_name: &str) -> GraphResult<bool> {
        let type_id = self.instance(handle)?.type_id;
        let base = self.schema.resolve_type(type_name)?.id();
        Ok(self.schema.is_a(type_id, base))
    }

    pub(crate) fn ensure_usable(&self, handle: InstanceId) -> GraphResult<()> {
        let instance = self.instance(handle)?;
        if instance.state == InstanceState::Deleted {
            return Err(GraphError::InstanceDeleted {
                type_name: instance.type_name.clone(),
                id: instance.id.clone(),
            });
        }
        Ok(())
    }

    // Subscribers

    /// Receive every raised event.
    pub fn subscribe(&mut self, handler: impl FnMut(&mut GraphContext, &GraphEvent) + 'static) -> SubscriptionId {
        self.subscribers.insert(EventHandler {
            filter: None,
            callback: Box::new(handler),
        })
    }

    /// Receive events of instances of `type_name` or its subtypes.
    pub fn subscribe_type(
        &mut self,
        type_name: &str,
        handler: impl FnMut(&mut GraphContext, &GraphEvent) + 'static,
    ) -> GraphResult<SubscriptionId> {
        let filter = self.schema.resolve_type(type_name)?.id();
        Ok(self.subscribers.insert(EventHandler {
            filter: Some(filter),
            callback: Box::new(handler),
        }))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    // Raising

    /// Record and broadcast `event` inside its own scope.
    pub(crate) fn raise(&mut self, event: GraphEvent) {
        let token = self.enter_scope();
        trace!(kind = %event.kind(), instance = %event.instance(), "event raised");
        self.record(&event);
        self.dispatch(&event);
        self.exit_scope(token);
    }

    fn record(&mut self, event: &GraphEvent) {
        if self.recorders.is_empty() || !event.is_transacted() {
            return;
        }
        self.recorders.retain(|recorder| recorder.strong_count() > 0);
        for recorder in self.recorders.iter().filter_map(Weak::upgrade) {
            let mut log = recorder.borrow_mut();
            let mut entry = event.clone();
            if let GraphEvent::Save(save) = &mut entry {
                save.stamp(&log);
            }
            log.push(entry);
        }
    }

    fn dispatch(&mut self, event: &GraphEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        for id in self.subscribers.snapshot() {
            if self.subscribers.is_running(id) {
                // Delivered by the frame running the handler once it returns.
                self.pending.entry(id).or_default().push_back(event.clone());
                continue;
            }
            let Some(mut handler) = self.subscribers.take(id) else {
                continue;
            };
            self.deliver(&mut handler, event);
            while self.subscribers.contains(id) {
                let Some(queued) = self.pending.get_mut(&id).and_then(VecDeque::pop_front) else {
                    break;
                };
                self.deliver(&mut handler, &queued);
            }
            self.pending.remove(&id);
            self.subscribers.restore(id, handler);
        }
    }

    fn deliver(&mut self, handler: &mut EventHandler, event: &GraphEvent) {
        let matches = match handler.filter {
            None => true,
            Some(filter) => self
                .schema
                .type_by_name(&event.instance().type_name)
                .is_some_and(|source| self.schema.is_a(source.id(), filter)),
        };
        if matches {
            (handler.callback)(self, event);
        }
    }

    // Recording

    pub(crate) fn start_recording(&mut self) -> Recorder {
        let recorder = Recorder::default();
        self.recorders.retain(|recorder| recorder.strong_count() > 0);
        self.recorders.push(Rc::downgrade(&recorder));
        trace!(recorders = self.recorders.len(), "recording started");
        recorder
    }

    pub(crate) fn stop_recording(&mut self, recorder: &Recorder) -> Vec<GraphEvent> {
        let handle = Rc::downgrade(recorder);
        self.recorders
            .retain(|active| active.strong_count() > 0 && !active.ptr_eq(&handle));
        let events = std::mem::take(&mut *recorder.borrow_mut());
        trace!(events = events.len(), "recording stopped");
        events
    }

    /// Number of transactions currently recording.
    pub fn recording_count(&self) -> usize {
        self.recorders.iter().filter(|recorder| recorder.strong_count() > 0).count()
    }

    // Custom events

    pub fn register_custom_handler(&mut self, name: impl Into<String>, handler: Rc<dyn CustomHandler>) {
        self.custom_handlers.insert(name.into(), handler);
    }

    pub(crate) fn custom_handler(&self, name: &str) -> Option<Rc<dyn CustomHandler>> {
        self.custom_handlers.get(name).cloned()
    }

    // Shared instances

    /// Mark an instance as shared with other contexts. Its in-references are
    /// dropped and never tracked again.
    pub fn mark_cached(&mut self, handle: InstanceId) -> GraphResult<()> {
        let instance = self.instance_mut(handle)?;
        instance.cached = true;
        instance.in_references.clear();
        Ok(())
    }

    /// Lock a cached instance before mutating it. Returns `None` for
    /// instances private to this context.
    pub fn lock(&self, handle: InstanceId) -> GraphResult<Option<parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()>>> {
        if self.instance(handle)?.cached {
            Ok(Some(self.shared_lock.lock_arc()))
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("id", &self.id)
            .field("instances", &self.instances.len())
            .field("subscribers", &self.subscribers.len())
            .field("recorders", &self.recording_count())
            .field("scope_depth", &self.scopes.depth())
            .finish()
    }
}
