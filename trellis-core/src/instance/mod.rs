//! Instances and the Reference Index
//!
//! Instances live in an arena owned by the [`GraphContext`](crate::GraphContext)
//! and are addressed by [`InstanceId`] handles, so the bidirectional
//! parent/child indices never form ownership cycles. Deleting an instance
//! marks its slot rather than freeing it.

mod id;
mod node;
mod references;

pub use id::{InstanceId, InstanceRef};
pub use node::{GraphInstance, InstanceState};
pub use references::{Edges, GraphReference, ReferenceIndex};
