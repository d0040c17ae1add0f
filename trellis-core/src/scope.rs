//! Event Scopes
//!
//! An event scope brackets one logical unit of mutation. Scopes nest: every
//! mutator and every raised event opens one, and callers can open their own
//! around a batch of changes.
//!
//! # Exit Handlers
//!
//! Handlers registered with [`GraphContext::on_scope_exit`] attach to the
//! innermost open scope. When a scope closes while it still has a parent,
//! its handlers move to the parent instead of firing. They only run when the
//! outermost scope closes, so a cascade of changes caused by one mutation is
//! fully settled before anything that waits for "batch done" reacts.
//!
//! Running a handler may mutate the graph, which opens and closes scopes of
//! its own and may queue further handlers. The drain loop re-reads the queue
//! on every iteration until it is empty.
//!
//! # Implementation
//!
//! The stack lives on the context rather than in thread-local storage. Each
//! [`ScopeToken`] records the frame it opened so mismatched exits are caught
//! in debug builds.

use std::collections::VecDeque;

use tracing::{error, trace};

use crate::context::GraphContext;

/// Callback run when the outermost scope closes.
pub type ExitHandler = Box<dyn FnOnce(&mut GraphContext)>;

/// Proof of having entered a scope. Pass it back to exit.
#[must_use = "a scope must be exited with GraphContext::exit_scope"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken {
    id: u64,
    depth: usize,
}

struct ScopeFrame {
    id: u64,
    exited: Vec<ExitHandler>,
}

/// The scope stack and the queue of handlers ready to fire.
#[derive(Default)]
pub(crate) struct ScopeStack {
    frames: Vec<ScopeFrame>,
    next_id: u64,
    ready: VecDeque<ExitHandler>,
    draining: bool,
}

impl ScopeStack {
    pub(crate) fn enter(&mut self) -> ScopeToken {
        self.next_id += 1;
        self.frames.push(ScopeFrame {
            id: self.next_id,
            exited: Vec::new(),
        });
        let token = ScopeToken {
            id: self.next_id,
            depth: self.frames.len(),
        };
        trace!(depth = token.depth, "scope entered");
        token
    }

    /// Pop the frame opened by `token`. Returns `true` when that was the
    /// outermost scope and its handlers are now queued to fire.
    pub(crate) fn exit(&mut self, token: ScopeToken) -> bool {
        let Some(frame) = self.frames.pop() else {
            error!(depth = token.depth, "scope exited with no open scope");
            return false;
        };
        debug_assert_eq!(
            frame.id, token.id,
            "scope mismatch: exiting {:?} but innermost frame is {}",
            token, frame.id
        );
        trace!(depth = token.depth, handlers = frame.exited.len(), "scope exited");

        match self.frames.last_mut() {
            Some(parent) => {
                parent.exited.extend(frame.exited);
                false
            }
            None => {
                self.ready.extend(frame.exited);
                true
            }
        }
    }

    /// Attach `handler` to the innermost scope. Returns `false` when no scope
    /// is open, in which case the handler is queued to fire right away.
    pub(crate) fn on_exit(&mut self, handler: ExitHandler) -> bool {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.exited.push(handler);
                true
            }
            None => {
                self.ready.push_back(handler);
                false
            }
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Start draining. Returns `false` if a drain is already running further
    /// up the stack, which will pick up anything queued now.
    pub(crate) fn begin_drain(&mut self) -> bool {
        !std::mem::replace(&mut self.draining, true)
    }

    pub(crate) fn next_ready(&mut self) -> Option<ExitHandler> {
        let next = self.ready.pop_front();
        if next.is_none() {
            self.draining = false;
        }
        next
    }
}

impl GraphContext {
    /// Open a scope. Every call must be paired with [`exit_scope`](Self::exit_scope).
    pub fn enter_scope(&mut self) -> ScopeToken {
        self.scopes.enter()
    }

    /// Close the scope opened by `token`. Closing the outermost scope fires
    /// every exit handler registered inside it.
    pub fn exit_scope(&mut self, token: ScopeToken) {
        if self.scopes.exit(token) {
            self.drain_exit_handlers();
        }
    }

    /// Run `operation` inside a scope.
    pub fn with_scope<R>(&mut self, operation: impl FnOnce(&mut GraphContext) -> R) -> R {
        let token = self.enter_scope();
        let result = operation(self);
        self.exit_scope(token);
        result
    }

    /// Run `handler` when the outermost open scope closes, or now if no scope
    /// is open.
    pub fn on_scope_exit(&mut self, handler: impl FnOnce(&mut GraphContext) + 'static) {
        if !self.scopes.on_exit(Box::new(handler)) {
            self.drain_exit_handlers();
        }
    }

    /// Depth of the scope stack; zero when no scope is open.
    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    fn drain_exit_handlers(&mut self) {
        if !self.scopes.begin_drain() {
            return;
        }
        while let Some(handler) = self.scopes.next_ready() {
            handler(self);
        }
    }
}
