//! Error Types
//!
//! Every fallible operation in the crate returns [`GraphResult`]. Errors that
//! describe programmer mistakes (a second base type, recording an already
//! recording log) are still returned rather than raised as panics, and are
//! always detected before any state is touched.

use thiserror::Error;

use crate::instance::InstanceId;

/// Errors produced by the model, the event engine and the path compiler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// The path text cannot be resolved against its root type.
    #[error("invalid path `{path}` on {root_type}: {reason}")]
    InvalidPath {
        root_type: String,
        path: String,
        reason: String,
    },

    /// An event refers to a placeholder id the transaction cannot map.
    #[error("unresolved instance {type_name}|{id}")]
    UnresolvedInstance { type_name: String, id: String },

    /// A type was given a second, different base type.
    #[error("type {type_name} already derives from {existing}, cannot derive from {requested}")]
    DuplicateBaseType {
        type_name: String,
        existing: String,
        requested: String,
    },

    /// The transaction is already recording.
    #[error("transaction is already recording")]
    TransactionActive,

    /// The transaction is bound to a different context.
    #[error("transaction belongs to a different context")]
    ContextMismatch,

    /// Transactions could not be combined.
    #[error("cannot combine transactions: {reason}")]
    CombineRejected { reason: String },

    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("type {0} derives from itself")]
    InheritanceCycle(String),

    #[error("type {type_name} has no property `{property}`")]
    UnknownProperty { type_name: String, property: String },

    #[error("type {type_name} declares `{property}` more than once")]
    DuplicateProperty { type_name: String, property: String },

    /// The property exists but is of the wrong kind for the operation.
    #[error("property {type_name}.{property} is not a {expected} property")]
    PropertyKind {
        type_name: String,
        property: String,
        expected: &'static str,
    },

    #[error("property {type_name}.{property} is read-only")]
    ReadOnlyProperty { type_name: String, property: String },

    /// An instance was assigned to a property whose type it does not derive from.
    #[error("{actual} is not assignable to {expected}")]
    TypeMismatch { expected: String, actual: String },

    #[error("unknown instance handle {0}")]
    UnknownInstance(InstanceId),

    #[error("instance {type_name}|{id} has been deleted")]
    InstanceDeleted { type_name: String, id: String },

    /// A value converter rejected the assigned value.
    #[error("cannot convert value for {property}: {reason}")]
    Conversion { property: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl GraphError {
    pub(crate) fn invalid_path(
        root_type: impl Into<String>,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidPath {
            root_type: root_type.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unresolved(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self::UnresolvedInstance {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type GraphResult<T> = Result<T, GraphError>;
