//! Trellis Core
//!
//! This crate provides a change-tracking engine for object graphs. It
//! implements:
//!
//! - A typed metadata model (types, value and reference properties)
//! - Instances with bidirectional reference indices
//! - A closed taxonomy of change events with replay semantics
//! - Transactions that record, replay, commit, roll back and compose
//! - Event scopes that batch notifications until a unit of work settles
//! - Property paths that notify subscribers when anything along them changes
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `model`: schema, types, properties and values
//! - `instance`: arena handles, instances and the reference index
//! - `event`: the event enum and the replay contract
//! - `context`: the instance arena, mutators and event dispatch
//! - `scope`: nested event scopes with deferred exit handlers
//! - `transaction`: recorded event logs
//! - `path`: path compilation, observation and graph filters
//!
//! # Example
//!
//! ```rust
//! use trellis_core::model::{SchemaBuilder, TypeDef};
//! use trellis_core::GraphContext;
//!
//! let mut builder = SchemaBuilder::new();
//! builder
//!     .add(TypeDef::new("Order").value("code").list("lines", "Line"))?
//!     .add(TypeDef::new("Line").value("qty"))?;
//! let mut ctx = GraphContext::new(builder.build()?);
//!
//! let order = ctx.create("Order")?;
//! let line = ctx.create("Line")?;
//!
//! let mut tx = ctx.begin_transaction();
//! ctx.list_add(order, "lines", line)?;
//! ctx.set_value(line, "qty", 2)?;
//! tx.rollback(&mut ctx)?;
//!
//! assert!(ctx.get_list(order, "lines")?.is_empty());
//! # Ok::<(), trellis_core::GraphError>(())
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod instance;
pub mod model;
pub mod path;
pub mod scope;
pub mod subscriber;
pub mod transaction;

pub use config::ContextConfig;
pub use context::{ContextId, EventCallback, GraphContext};
pub use error::{GraphError, GraphResult};
pub use event::{EventKind, GraphEvent, Transacted};
pub use instance::{InstanceId, InstanceRef};
pub use path::{FilterChange, FilterId, PathChange, PathDefinition, PathSubscription};
pub use scope::ScopeToken;
pub use subscriber::SubscriptionId;
pub use transaction::{GraphTransaction, TransactionScope};
